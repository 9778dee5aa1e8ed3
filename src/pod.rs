// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reading data out of a traced process' address space.

use anyhow::{ensure, Context, Result};
use nix::unistd::Pid;
use std::{
    any::type_name,
    ffi::CString,
    fs::{self, File},
    mem::{size_of, MaybeUninit},
    num::NonZeroU8,
    os::unix::fs::FileExt,
    path::PathBuf,
    ptr,
};

/// Access to the memory of traced processes. Implementations must be usable from any thread;
/// policy decisions are made on daemon worker threads, not on the thread that stopped the tracee.
pub trait ProcessMemory: Send + Sync {
    /// Fills `buf` with the bytes starting at `addr` in the address space of `pid`.
    fn read(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// The working directory of `pid`, if it is known.
    fn cwd(&self, _pid: Pid) -> Option<PathBuf> {
        None
    }

    /// The path open as file descriptor `fd` in `pid`, if it is known.
    fn fd_path(&self, _pid: Pid, _fd: i32) -> Option<PathBuf> {
        None
    }
}

/// A trait promising that the type is "plain old data," that is, it's copyable and any bit pattern
/// of the correct size is a valid value of the type.
///
/// Examples of types that are *not* Pod:
///
/// - `String`: This owns memory, so is not `Copy`
/// - `NonZeroU8`: Not every bit pattern is a valid `NonZeroU8`
/// - `(u8, u16)`: Writes to the padding bytes result in UB.
pub unsafe trait Pod: Copy + Sized {}

unsafe impl Pod for u64 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for u16 {}
unsafe impl<const N: usize> Pod for [u8; N] {}

/// Reads a `Pod` type from the tracee's memory.
pub fn read_pod<T: Pod>(mem: &dyn ProcessMemory, pid: Pid, addr: u64) -> Result<T> {
    let bytes = read_bytes(mem, pid, addr, size_of::<T>() as u64).with_context(|| {
        format!(
            "Failed to read {} from address {:016x}",
            type_name::<T>(),
            addr
        )
    })?;
    let mut value = MaybeUninit::<T>::uninit();
    ensure!(bytes.len() == size_of::<T>(), "Short read of {}", type_name::<T>());

    // UNSAFE: bytes is valid to read from and value is valid to write to by the given amount, as
    // checked above. Since we're using u8 as ptr::copy's T, any alignment is OK.
    unsafe {
        ptr::copy(bytes.as_ptr(), value.as_mut_ptr() as *mut u8, bytes.len());
    }

    // UNSAFE: value gets initialized to particular bytes by the above ptr::copy. We know these
    // bytes must be valid, because T impls Pod, which requires that any bit pattern is valid.
    Ok(unsafe { value.assume_init() })
}

/// Reads multiple copies of a `Pod` type from the tracee's memory. Returns an infinite-length
/// iterator; use `.take()` to get the length you want if it is statically known, or
/// `.take_while()` or a similar method if not.
pub fn read_pods<T: Pod>(
    mem: &dyn ProcessMemory,
    pid: Pid,
    mut addr: u64,
) -> impl Iterator<Item = Result<T>> + '_ {
    std::iter::repeat_with(move || {
        let value = read_pod(mem, pid, addr);
        addr = addr.wrapping_add(size_of::<T>() as u64);
        value
    })
}

/// Reads a `Vec<u8>` from the tracee's memory.
///
/// The resulting vector has exactly `len` items.
pub fn read_bytes(mem: &dyn ProcessMemory, pid: Pid, addr: u64, len: u64) -> Result<Vec<u8>> {
    let mut out = vec![0; len as usize];
    if len != 0 {
        mem.read(pid, addr, &mut out)
            .with_context(|| format!("Failed to read {} bytes from address {:016x}", len, addr))?;
    }
    Ok(out)
}

/// Reads a `CString` from the tracee's memory, giving up after `limit` bytes without a NUL.
///
/// Reads are done in chunks that never cross a page boundary, so a string that ends just before
/// an unmapped page can still be read.
pub fn read_cstring(mem: &dyn ProcessMemory, pid: Pid, addr: u64, limit: usize) -> Result<CString> {
    const PAGE_SIZE: u64 = 4096;
    const CHUNK: u64 = 256;

    let mut out = Vec::new();
    let mut next = addr;
    while out.len() < limit {
        // Shrink the chunk on failure; the string may end right before unreadable memory.
        let mut len = (PAGE_SIZE - (next % PAGE_SIZE)).min(CHUNK) as usize;
        let chunk = loop {
            let mut chunk = vec![0; len];
            match mem.read(pid, next, &mut chunk) {
                Ok(()) => break chunk,
                Err(err) if len == 1 => {
                    return Err(err)
                        .with_context(|| format!("Failed to read string from address {:016x}", addr))
                }
                Err(_) => len /= 2,
            }
        };
        match chunk.iter().position(|&byte| byte == 0) {
            Some(nul) => {
                out.extend_from_slice(&chunk[..nul]);
                break;
            }
            None => out.extend_from_slice(&chunk),
        }
        next = next.wrapping_add(chunk.len() as u64);
    }
    out.truncate(limit);

    // The chunks were cut at the first NUL, so none remain.
    let out = out.into_iter().filter_map(NonZeroU8::new).collect::<Vec<_>>();
    Ok(CString::from(out))
}

/// Reads through `/proc/<pid>/mem`. The kernel allows this for the tracer from any of its threads.
#[derive(Debug, Default)]
pub struct ProcMem;

impl ProcessMemory for ProcMem {
    fn read(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let path = format!("/proc/{}/mem", pid);
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path))?;
        file.read_exact_at(buf, addr)
            .with_context(|| format!("Failed to read {} at offset {:016x}", path, addr))
    }

    fn cwd(&self, pid: Pid) -> Option<PathBuf> {
        fs::read_link(format!("/proc/{}/cwd", pid)).ok()
    }

    fn fd_path(&self, pid: Pid, fd: i32) -> Option<PathBuf> {
        if fd < 0 {
            return None;
        }
        fs::read_link(format!("/proc/{}/fd/{}", pid, fd)).ok()
    }
}


#[cfg(test)]
mod tests {
    use super::{read_cstring, read_pod, read_pods, testing::FakeMemory};
    use anyhow::Result;
    use nix::unistd::Pid;

    #[test]
    fn cstring_stops_at_nul_and_limit() {
        let pid = Pid::from_raw(40);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"/etc/passwd\0garbage");
        let path = read_cstring(&mem, pid, 0x1000, 1024).unwrap();
        assert_eq!(path.as_bytes(), b"/etc/passwd");

        let short = read_cstring(&mem, pid, 0x1000, 4).unwrap();
        assert_eq!(short.as_bytes(), b"/etc");
    }

    #[test]
    fn cstring_read_fails_on_unmapped_memory() {
        let mem = FakeMemory::default();
        assert!(read_cstring(&mem, Pid::from_raw(41), 0xdead_0000, 1024).is_err());
    }

    #[test]
    fn pods_read_consecutive_words() {
        let pid = Pid::from_raw(42);
        let mem = FakeMemory::default();
        mem.map_words(pid, 0x2000, &[7, 8, 0]);
        let words = read_pods::<u64>(&mem, pid, 0x2000)
            .take(3)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(words, vec![7, 8, 0]);
        assert_eq!(read_pod::<u32>(&mem, pid, 0x2008).unwrap(), 8);
    }
}
