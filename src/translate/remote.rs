// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Translations that follow pointers into the traced process.

use super::{
    print::print_sockdom,
    structures::{sockaddr_in, sockaddr_in6, SOCKADDR_MAX, SUN_PATH_OFFSET},
    RenderContext, MAX_RENDER_LEN,
};
use crate::{
    abi::Abi,
    errors::TranslationReadError,
    pod::{read_bytes, read_cstring, read_pod, read_pods},
};
use bstr::BString;
use std::{
    ffi::OsStr,
    mem::size_of,
    net::{Ipv4Addr, Ipv6Addr},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::PathBuf,
};

/// The longest path we fetch.
pub const MAXPATHLEN: usize = 1024;

/// The longest argv line we build, NUL included.
pub const ARGV_LINE_MAX: usize = MAX_RENDER_LEN;

fn read_failed(translation: &'static str, addr: u64, err: anyhow::Error) -> TranslationReadError {
    log::trace!("{} translation failed: {:#}", translation, err);
    TranslationReadError { translation, addr }
}

/// The dirfd that stands for the working directory in the `*at` calls, on both ABIs.
pub const AT_FDCWD: i32 = -100;

fn read_path(ctx: &RenderContext, addr: u64) -> Result<Vec<u8>, TranslationReadError> {
    Ok(read_cstring(ctx.memory, ctx.pid, addr, MAXPATHLEN)
        .map_err(|err| read_failed("filename", addr, err))?
        .into_bytes())
}

fn join(dir: PathBuf, name: &[u8]) -> BString {
    BString::from(dir.join(OsStr::from_bytes(name)).into_os_string().into_vec())
}

/// Fetches a path. Relative paths are made absolute against the process' working directory when
/// that is known, so that policies can match on absolute names.
pub fn translate_filename(ctx: &RenderContext, addr: u64) -> Result<BString, TranslationReadError> {
    let name = read_path(ctx, addr)?;
    if !name.is_empty() && !name.starts_with(b"/") {
        if let Some(cwd) = ctx.memory.cwd(ctx.pid) {
            return Ok(join(cwd, &name));
        }
    }
    Ok(BString::from(name))
}

/// Fetches a path that is relative to the directory open as `dirfd`. A relative path whose
/// directory can't be found is unavailable; it is never resolved against the working directory
/// instead.
pub fn translate_at_filename(
    ctx: &RenderContext,
    dirfd: Option<u64>,
    addr: u64,
) -> Result<BString, TranslationReadError> {
    let dirfd = match dirfd {
        Some(dirfd) => dirfd as i32,
        None => return Err(TranslationReadError { translation: "filename", addr }),
    };
    if dirfd == AT_FDCWD {
        return translate_filename(ctx, addr);
    }
    let name = read_path(ctx, addr)?;
    if name.is_empty() || name.starts_with(b"/") {
        return Ok(BString::from(name));
    }
    match ctx.memory.fd_path(ctx.pid, dirfd) {
        Some(dir) => Ok(join(dir, &name)),
        None => {
            log::trace!("No directory for fd {} of {}", dirfd, ctx.pid);
            Err(TranslationReadError { translation: "filename", addr })
        }
    }
}

/// Fetches a NULL-terminated array of string pointers and joins the strings with single spaces.
/// The line is cut short at `ARGV_LINE_MAX - 1` bytes.
pub fn translate_argv(ctx: &RenderContext, addr: u64) -> Result<BString, TranslationReadError> {
    let mut line = Vec::new();
    for (i, ptr) in read_pods::<u64>(ctx.memory, ctx.pid, addr).enumerate() {
        let ptr = ptr.map_err(|err| read_failed("argv", addr + 8 * i as u64, err))?;
        if ptr == 0 {
            break;
        }
        let arg = read_cstring(ctx.memory, ctx.pid, ptr, ARGV_LINE_MAX)
            .map_err(|err| read_failed("argv", ptr, err))?;
        if !line.is_empty() {
            line.push(b' ');
        }
        line.extend_from_slice(arg.as_bytes());
        if line.len() >= ARGV_LINE_MAX - 1 {
            line.truncate(ARGV_LINE_MAX - 1);
            break;
        }
    }
    Ok(BString::from(line))
}

/// Decodes a socket address into `inet-[addr]:port`, `inet6-[addr]:port`, a unix socket path, or
/// the family name for anything else. `len` is the address length argument, when there is one.
pub fn translate_sockaddr(
    ctx: &RenderContext,
    abi: Abi,
    addr: u64,
    len: Option<u64>,
) -> Result<BString, TranslationReadError> {
    let len = len.unwrap_or(SOCKADDR_MAX).min(SOCKADDR_MAX);
    if len < 2 {
        return Ok(BString::from(format!("<short sockaddr: {}>", len)));
    }

    let head: [u8; 2] =
        read_pod(ctx.memory, ctx.pid, addr).map_err(|err| read_failed("sockaddr", addr, err))?;
    let family = if abi.sockaddr_has_len() {
        head[1] as i32
    } else {
        u16::from_le_bytes(head) as i32
    };

    let text = if family == abi.af_inet() && len >= size_of::<sockaddr_in>() as u64 {
        let sin: sockaddr_in = read_pod(ctx.memory, ctx.pid, addr)
            .map_err(|err| read_failed("sockaddr", addr, err))?;
        format!(
            "inet-[{}]:{}",
            Ipv4Addr::from(sin.sin_addr.s_addr),
            u16::from_be_bytes(sin.sin_port)
        )
    } else if family == abi.af_inet6() && len >= size_of::<sockaddr_in6>() as u64 {
        let sin6: sockaddr_in6 = read_pod(ctx.memory, ctx.pid, addr)
            .map_err(|err| read_failed("sockaddr", addr, err))?;
        format!(
            "inet6-[{}]:{}",
            Ipv6Addr::from(sin6.sin6_addr.s6_addr),
            u16::from_be_bytes(sin6.sin6_port)
        )
    } else if family == abi.af_unix() {
        let path = read_bytes(
            ctx.memory,
            ctx.pid,
            addr + SUN_PATH_OFFSET,
            len - SUN_PATH_OFFSET,
        )
        .map_err(|err| read_failed("sockaddr", addr, err))?;
        return Ok(unix_path(&path));
    } else {
        print_sockdom(family, abi)
    };
    Ok(BString::from(text))
}

fn unix_path(path: &[u8]) -> BString {
    match path.split_first() {
        None => BString::from("<unnamed socket>"),
        // Linux abstract namespace
        Some((0, name)) if name.iter().any(|&byte| byte != 0) => {
            let end = name.iter().position(|&byte| byte == 0).unwrap_or(name.len());
            let mut out = b"@".to_vec();
            out.extend_from_slice(&name[..end]);
            BString::from(out)
        }
        Some(_) => {
            let end = path.iter().position(|&byte| byte == 0).unwrap_or(path.len());
            if end == 0 {
                BString::from("<unnamed socket>")
            } else {
                BString::from(&path[..end])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        translate_argv, translate_at_filename, translate_filename, translate_sockaddr, AT_FDCWD,
        ARGV_LINE_MAX,
    };
    use crate::{abi::Abi, pod::testing::FakeMemory, translate::RenderContext};
    use nix::unistd::Pid;
    use std::collections::HashMap;

    fn with_ctx<T>(mem: &FakeMemory, pid: Pid, f: impl FnOnce(&RenderContext) -> T) -> T {
        let names = HashMap::new();
        let ctx = RenderContext {
            pid,
            memory: mem,
            processes: &names,
        };
        f(&ctx)
    }

    #[test]
    fn argv_joins_strings_with_spaces() {
        let pid = Pid::from_raw(200);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"ls\0");
        mem.map(pid, 0x2000, b"-l\0");
        mem.map_words(pid, 0x3000, &[0x1000, 0x2000, 0]);
        let line = with_ctx(&mem, pid, |ctx| translate_argv(ctx, 0x3000)).unwrap();
        assert_eq!(line, "ls -l");
    }

    #[test]
    fn argv_is_bounded() {
        let pid = Pid::from_raw(201);
        let mem = FakeMemory::default();
        let long = vec![b'a'; 1500];
        let mut with_nul = long.clone();
        with_nul.push(0);
        mem.map(pid, 0x1000, &with_nul);
        mem.map_words(pid, 0x9000, &[0x1000, 0x1000, 0x1000, 0]);
        let line = with_ctx(&mem, pid, |ctx| translate_argv(ctx, 0x9000)).unwrap();
        assert_eq!(line.len(), ARGV_LINE_MAX - 1);
    }

    #[test]
    fn argv_fails_on_bad_pointer() {
        let pid = Pid::from_raw(202);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"ls\0");
        mem.map_words(pid, 0x3000, &[0x1000, 0xbad0_0000, 0]);
        let err = with_ctx(&mem, pid, |ctx| translate_argv(ctx, 0x3000)).unwrap_err();
        assert_eq!(err.addr, 0xbad0_0000);
    }

    #[test]
    fn relative_filenames_are_joined_to_cwd() {
        let pid = Pid::from_raw(203);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"notes.txt\0");
        mem.map(pid, 0x2000, b"/etc/motd\0");
        assert_eq!(
            with_ctx(&mem, pid, |ctx| translate_filename(ctx, 0x1000)).unwrap(),
            "notes.txt"
        );
        mem.set_cwd(pid, "/home/user");
        assert_eq!(
            with_ctx(&mem, pid, |ctx| translate_filename(ctx, 0x1000)).unwrap(),
            "/home/user/notes.txt"
        );
        assert_eq!(
            with_ctx(&mem, pid, |ctx| translate_filename(ctx, 0x2000)).unwrap(),
            "/etc/motd"
        );
    }

    #[test]
    fn at_filenames_resolve_against_their_dirfd() {
        let pid = Pid::from_raw(205);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"shadow\0");
        mem.map(pid, 0x2000, b"/etc/motd\0");
        mem.set_cwd(pid, "/tmp");
        let at = |dirfd: i64, addr| {
            with_ctx(&mem, pid, |ctx| translate_at_filename(ctx, Some(dirfd as u64), addr))
        };

        // openat(3, "shadow") with fd 3 unknown: never the working directory
        assert!(at(3, 0x1000).is_err());
        mem.set_fd(pid, 3, "/etc");
        assert_eq!(at(3, 0x1000).unwrap(), "/etc/shadow");
        assert_eq!(at(AT_FDCWD as i64, 0x1000).unwrap(), "/tmp/shadow");
        // Absolute paths ignore the dirfd
        assert_eq!(at(7, 0x2000).unwrap(), "/etc/motd");
        assert!(with_ctx(&mem, pid, |ctx| translate_at_filename(ctx, None, 0x1000)).is_err());
    }

    #[test]
    fn sockaddrs() {
        let pid = Pid::from_raw(204);
        let mem = FakeMemory::default();
        // Linux sockaddr_in for 127.0.0.1:8080
        let mut sin = vec![2, 0, 0x1f, 0x90, 127, 0, 0, 1];
        sin.extend_from_slice(&[0; 8]);
        mem.map(pid, 0x1000, &sin);
        // BSD sockaddr_un with sun_len and sun_family
        mem.map(pid, 0x2000, b"\x10\x01/tmp/sock\0\0\0\0");
        // Linux abstract unix socket
        mem.map(pid, 0x3000, b"\x01\x00\0hidden");
        // Linux netlink
        mem.map(pid, 0x4000, &[16, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        with_ctx(&mem, pid, |ctx| {
            assert_eq!(
                translate_sockaddr(ctx, Abi::Linux, 0x1000, Some(16)).unwrap(),
                "inet-[127.0.0.1]:8080"
            );
            assert_eq!(
                translate_sockaddr(ctx, Abi::Netbsd, 0x2000, Some(15)).unwrap(),
                "/tmp/sock"
            );
            assert_eq!(
                translate_sockaddr(ctx, Abi::Linux, 0x3000, Some(9)).unwrap(),
                "@hidden"
            );
            assert_eq!(
                translate_sockaddr(ctx, Abi::Linux, 0x4000, Some(12)).unwrap(),
                "AF_NETLINK"
            );
            assert_eq!(
                translate_sockaddr(ctx, Abi::Linux, 0x4000, Some(1)).unwrap(),
                "<short sockaddr: 1>"
            );
            assert!(translate_sockaddr(ctx, Abi::Linux, 0x8000, Some(16)).is_err());
        });
    }
}
