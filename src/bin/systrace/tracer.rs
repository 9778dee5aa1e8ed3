// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Drives the traced processes with ptrace, running every syscall entry past the engine.

use anyhow::{bail, Context, Result};
use bstr::BString;
use nix::{
    errno::Errno,
    libc::{SYS_execve, SYS_execveat},
    sys::{
        ptrace::{self, Event},
        signal::Signal,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use std::{
    collections::{HashMap, HashSet},
    ffi::{CString, OsStr},
    fmt,
    fs::{self, File},
    io::Read,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    sync::Arc,
};
use systrace::{
    engine::{Interceptor, Verdict},
    pod::{read_cstring, ProcMem},
};

/// A syscall number no kernel has; the call fails with `ENOSYS` without doing anything.
const DENIED_SYSCALL: u64 = 0x7fff_ffff_ffff_ffff;

#[derive(Debug)]
enum OnExit {
    Fail(i32),
    Report {
        seqnr: u16,
        code: i32,
        args: [u64; 6],
    },
}

#[derive(Debug, Default)]
struct Tracee {
    in_syscall: bool,
    on_exit: Option<OnExit>,
    /// The path given to the last `execve`, for telling scripts from their interpreter.
    exec_path: Option<CString>,
}

/// How the root process ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Killed(Signal),
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Exited(code) => write!(f, "exited with status {}", code),
            ChildStatus::Killed(signal) => write!(f, "was killed by {:?}", signal),
        }
    }
}

pub struct Tracer {
    engine: Arc<Interceptor>,
    tracees: HashMap<Pid, Tracee>,
    /// New children that stopped before their parent's fork event arrived. They stay stopped until
    /// it does, so that none of their syscalls go by unseen.
    early: HashSet<Pid>,
    /// New children whose initial SIGSTOP hasn't arrived yet.
    expected: HashSet<Pid>,
}

impl Tracer {
    pub fn new(engine: Arc<Interceptor>) -> Tracer {
        Tracer {
            engine,
            tracees: HashMap::new(),
            early: HashSet::new(),
            expected: HashSet::new(),
        }
    }

    /// Runs `root`, which must be stopped and set up for tracing, and everything it spawns, until
    /// they have all exited.
    pub fn run(mut self, root: Pid) -> Result<ChildStatus> {
        self.tracees.insert(root, Tracee::default());
        resume(root, None)?;

        let mut status = None;
        while !self.tracees.is_empty() {
            let wait = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(wait) => wait,
                Err(Errno::ECHILD) => break,
                Err(err) => return Err(err).context("Failed to wait for traced processes"),
            };
            log::trace!("{:?}", wait);

            match wait {
                WaitStatus::PtraceSyscall(pid) => {
                    self.syscall_stop(pid)?;
                    resume(pid, None)?;
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    self.event(pid, event)?;
                    resume(pid, None)?;
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if !self.tracees.contains_key(&pid) => {
                    log::trace!("{} stopped before its parent's fork event", pid);
                    self.early.insert(pid);
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.expected.remove(&pid) => {
                    resume(pid, None)?;
                }
                WaitStatus::Stopped(pid, signal) => resume(pid, Some(signal))?,
                WaitStatus::Exited(pid, code) => {
                    self.exited(pid);
                    if pid == root {
                        status = Some(ChildStatus::Exited(code));
                    }
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    self.exited(pid);
                    if pid == root {
                        status = Some(ChildStatus::Killed(signal));
                    }
                }
                _ => {}
            }
        }

        match status {
            Some(status) => Ok(status),
            None => bail!("Lost track of {} before it exited", root),
        }
    }

    fn syscall_stop(&mut self, pid: Pid) -> Result<()> {
        let mut regs = ptrace::getregs(pid)
            .with_context(|| format!("Failed to get registers of {} at a syscall", pid))?;
        let tracee = self.tracees.entry(pid).or_default();
        tracee.in_syscall = !tracee.in_syscall;

        if tracee.in_syscall {
            let code = regs.orig_rax as i32;
            let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
            tracee.exec_path = exec_path_arg(regs.orig_rax, &args)
                .and_then(|addr| read_cstring(&ProcMem, pid, addr, 4096).ok());
            match self.engine.intercept(pid, code, &args) {
                Verdict::Permit {
                    report,
                    seteuid,
                    setegid,
                } => {
                    if seteuid.is_some() || setegid.is_some() {
                        log::warn!(
                            "Can't change the credentials of {}; running syscall {} as is",
                            pid,
                            code
                        );
                    }
                    tracee.on_exit = report.map(|seqnr| OnExit::Report { seqnr, code, args });
                }
                Verdict::Deny { errno } => {
                    log::debug!("Denying syscall {} of {} with errno {}", code, pid, errno);
                    regs.orig_rax = DENIED_SYSCALL;
                    ptrace::setregs(pid, regs)
                        .with_context(|| format!("Failed to deny syscall {} of {}", code, pid))?;
                    tracee.on_exit = Some(OnExit::Fail(errno));
                }
            }
        } else {
            match tracee.on_exit.take() {
                Some(OnExit::Fail(errno)) => {
                    regs.rax = (-(errno as i64)) as u64;
                    ptrace::setregs(pid, regs)
                        .with_context(|| format!("Failed to set the errno of {}", pid))?;
                }
                Some(OnExit::Report { seqnr, code, args }) => {
                    self.engine.report_result(
                        pid,
                        seqnr,
                        code,
                        &args,
                        [regs.rax, regs.rdx],
                        syscall_errno(regs.rax),
                    );
                }
                None => {}
            }
        }
        Ok(())
    }

    fn event(&mut self, pid: Pid, event: i32) -> Result<()> {
        if event == Event::PTRACE_EVENT_FORK as i32
            || event == Event::PTRACE_EVENT_VFORK as i32
            || event == Event::PTRACE_EVENT_CLONE as i32
        {
            let child = ptrace::getevent(pid)
                .with_context(|| format!("Failed to get the new child of {}", pid))?;
            let child = Pid::from_raw(child as i32);
            self.engine.fork(pid, child);
            self.tracees.insert(child, Tracee::default());
            if self.early.remove(&child) {
                resume(child, None)?;
            } else {
                self.expected.insert(child);
            }
        } else if event == Event::PTRACE_EVENT_EXEC as i32 {
            let path = fs::read_link(format!("/proc/{}/exe", pid))
                .with_context(|| format!("Failed to find what {} executed", pid))?;
            log::debug!("{} executed {}", pid, path.display());
            self.engine
                .execve(pid, BString::from(path.into_os_string().into_vec()));

            let exec_path = self
                .tracees
                .get_mut(&pid)
                .and_then(|tracee| tracee.exec_path.take());
            if let Some(exec_path) = exec_path {
                let exec_path = PathBuf::from(OsStr::from_bytes(exec_path.as_bytes()));
                if is_script(pid, &exec_path) {
                    log::debug!("{} is running the script {}", pid, exec_path.display());
                    self.engine.script_name(
                        pid,
                        BString::from(exec_path.into_os_string().into_vec()),
                    );
                }
            }
        }
        Ok(())
    }

    fn exited(&mut self, pid: Pid) {
        log::debug!("{} exited", pid);
        self.tracees.remove(&pid);
        self.expected.remove(&pid);
        self.engine.exit(pid);
    }
}

/// Lets a stopped process continue until its next syscall stop. A process that died in the
/// meantime is reported by `waitpid` later.
fn resume(pid: Pid, signal: Option<Signal>) -> Result<()> {
    match ptrace::syscall(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to resume {}", pid)),
    }
}

/// The address of the path argument, if `nr` is one of the exec calls.
fn exec_path_arg(nr: u64, args: &[u64; 6]) -> Option<u64> {
    let nr = nr as i64;
    if nr == SYS_execve {
        Some(args[0])
    } else if nr == SYS_execveat {
        Some(args[1])
    } else {
        None
    }
}

/// Whether `path`, as seen by `pid`, starts with a `#!` line.
fn is_script(pid: Pid, path: &Path) -> bool {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(&format!("/proc/{}/cwd", pid)).join(path)
    };
    let mut magic = [0; 2];
    File::open(&path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map_or(false, |()| &magic == b"#!")
}

/// The errno a syscall failed with, or 0 if it succeeded.
fn syscall_errno(rax: u64) -> i32 {
    let rax = rax as i64;
    if (-4095..0).contains(&rax) {
        -rax as i32
    } else {
        0
    }
}

/// Waits until the child process receives a SIGTRAP. If the child process stops for a different
/// reason, errors out.
pub fn wait_for_sigtrap(pid: Pid) -> Result<()> {
    log::trace!("Waiting for child to receive a SIGTRAP...");
    match waitpid(Some(pid), None) {
        Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => Ok(()),
        Ok(s) => bail!("Child stopped with status {:?}", s),
        Err(err) => Err(err).context("Failed to wait for child to get a SIGTRAP"),
    }
}

#[cfg(test)]
mod tests {
    use super::{exec_path_arg, syscall_errno, ChildStatus, DENIED_SYSCALL};
    use nix::{
        libc::{SYS_execve, SYS_execveat, SYS_open},
        sys::signal::Signal,
    };

    #[test]
    fn exec_path_argument() {
        let args = [0x10, 0x20, 0x30, 0, 0, 0];
        assert_eq!(exec_path_arg(SYS_execve as u64, &args), Some(0x10));
        assert_eq!(exec_path_arg(SYS_execveat as u64, &args), Some(0x20));
        assert_eq!(exec_path_arg(SYS_open as u64, &args), None);
        assert_eq!(exec_path_arg(DENIED_SYSCALL, &args), None);
    }

    #[test]
    fn errno_from_return_value() {
        assert_eq!(syscall_errno(3), 0);
        assert_eq!(syscall_errno((-13i64) as u64), 13);
        assert_eq!(syscall_errno((-4095i64) as u64), 4095);
        // mmap can return addresses that look negative
        assert_eq!(syscall_errno(0xffff_8000_0000_0000), 0);
    }

    #[test]
    fn status_display() {
        assert_eq!(ChildStatus::Exited(0).to_string(), "exited with status 0");
        assert_eq!(
            ChildStatus::Killed(Signal::SIGKILL).to_string(),
            "was killed by SIGKILL"
        );
    }
}
