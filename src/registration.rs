// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Which syscalls are intercepted, how their arguments are rendered, and which policy names they
//! are filed under.
//!
//! The tables are built from catalogs: JSON documents listing platforms, syscall numbers, and per
//! syscall the argument translations and alias. One catalog is built in; the run file
//! may name another, which is registered after it.

use crate::{
    abi::Abi,
    alias::{AliasHandle, AliasTable},
    errors::{RegistrationError, UnknownSyscall},
    translate::{RenderContext, RenderedArg, Translation, TranslationTable},
    SyscallKey,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    fs::File,
    io::BufReader,
    path::Path,
};

const BUILTIN_CATALOG: &str = include_str!("catalog.json");

#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    /// The constant set each platform's arguments are decoded with.
    #[serde(default)]
    pub platforms: BTreeMap<String, Abi>,

    /// Syscall numbers, per platform.
    #[serde(default)]
    pub numbers: BTreeMap<String, BTreeMap<i32, String>>,

    #[serde(default)]
    pub syscalls: Vec<CatalogSyscall>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogSyscall {
    pub platform: String,
    pub name: String,

    /// Translation tags by argument index.
    #[serde(default)]
    pub args: BTreeMap<usize, String>,

    /// The policy name the syscall is filed under, if not its own.
    #[serde(default)]
    pub alias: Option<SyscallKey>,

    /// Arguments whose translation can re-derive the alias target.
    #[serde(default)]
    pub determined_by: Vec<usize>,
}

impl Catalog {
    pub fn builtin() -> Result<Catalog> {
        serde_json::from_str(BUILTIN_CATALOG).context("Failed to parse the built-in catalog")
    }

    pub fn from_path(path: &Path) -> Result<Catalog> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open catalog {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse catalog {}", path.display()))
    }
}

/// Syscall numbers to names, per platform.
#[derive(Debug, Default)]
pub struct SyscallNames {
    by_code: HashMap<String, HashMap<i32, String>>,
    by_name: HashMap<SyscallKey, i32>,
}

impl SyscallNames {
    pub fn new() -> SyscallNames {
        SyscallNames::default()
    }

    pub fn insert(&mut self, platform: &str, code: i32, name: &str) {
        self.by_code
            .entry(platform.to_string())
            .or_default()
            .insert(code, name.to_string());
        self.by_name.insert(SyscallKey::new(platform, name), code);
    }

    pub fn name(&self, platform: &str, code: i32) -> Result<&str, UnknownSyscall> {
        self.by_code
            .get(platform)
            .and_then(|codes| codes.get(&code))
            .map(String::as_str)
            .ok_or_else(|| UnknownSyscall {
                platform: platform.to_string(),
                code,
            })
    }

    pub fn code(&self, platform: &str, name: &str) -> Option<i32> {
        self.by_name.get(&SyscallKey::new(platform, name)).copied()
    }

    /// Adds the host's own syscall numbers as the `linux` platform.
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn add_host_linux(&mut self) {
        use nix::libc::*;

        let host: &[(c_long, &str)] = &[
            (SYS_read, "read"),
            (SYS_write, "write"),
            (SYS_open, "open"),
            (SYS_close, "close"),
            (SYS_stat, "stat"),
            (SYS_fstat, "fstat"),
            (SYS_lstat, "lstat"),
            (SYS_poll, "poll"),
            (SYS_lseek, "lseek"),
            (SYS_mmap, "mmap"),
            (SYS_mprotect, "mprotect"),
            (SYS_munmap, "munmap"),
            (SYS_brk, "brk"),
            (SYS_rt_sigaction, "rt_sigaction"),
            (SYS_rt_sigprocmask, "rt_sigprocmask"),
            (SYS_rt_sigreturn, "rt_sigreturn"),
            (SYS_ioctl, "ioctl"),
            (SYS_pread64, "pread64"),
            (SYS_pwrite64, "pwrite64"),
            (SYS_readv, "readv"),
            (SYS_writev, "writev"),
            (SYS_access, "access"),
            (SYS_pipe, "pipe"),
            (SYS_select, "select"),
            (SYS_sched_yield, "sched_yield"),
            (SYS_mremap, "mremap"),
            (SYS_madvise, "madvise"),
            (SYS_dup, "dup"),
            (SYS_dup2, "dup2"),
            (SYS_nanosleep, "nanosleep"),
            (SYS_getpid, "getpid"),
            (SYS_socket, "socket"),
            (SYS_connect, "connect"),
            (SYS_accept, "accept"),
            (SYS_sendto, "sendto"),
            (SYS_recvfrom, "recvfrom"),
            (SYS_sendmsg, "sendmsg"),
            (SYS_recvmsg, "recvmsg"),
            (SYS_shutdown, "shutdown"),
            (SYS_bind, "bind"),
            (SYS_listen, "listen"),
            (SYS_getsockname, "getsockname"),
            (SYS_getpeername, "getpeername"),
            (SYS_socketpair, "socketpair"),
            (SYS_setsockopt, "setsockopt"),
            (SYS_getsockopt, "getsockopt"),
            (SYS_clone, "clone"),
            (SYS_fork, "fork"),
            (SYS_vfork, "vfork"),
            (SYS_execve, "execve"),
            (SYS_exit, "exit"),
            (SYS_wait4, "wait4"),
            (SYS_kill, "kill"),
            (SYS_uname, "uname"),
            (SYS_fcntl, "fcntl"),
            (SYS_flock, "flock"),
            (SYS_fsync, "fsync"),
            (SYS_truncate, "truncate"),
            (SYS_ftruncate, "ftruncate"),
            (SYS_getdents, "getdents"),
            (SYS_getcwd, "getcwd"),
            (SYS_chdir, "chdir"),
            (SYS_fchdir, "fchdir"),
            (SYS_rename, "rename"),
            (SYS_mkdir, "mkdir"),
            (SYS_rmdir, "rmdir"),
            (SYS_creat, "creat"),
            (SYS_link, "link"),
            (SYS_unlink, "unlink"),
            (SYS_symlink, "symlink"),
            (SYS_readlink, "readlink"),
            (SYS_chmod, "chmod"),
            (SYS_fchmod, "fchmod"),
            (SYS_chown, "chown"),
            (SYS_fchown, "fchown"),
            (SYS_lchown, "lchown"),
            (SYS_umask, "umask"),
            (SYS_gettimeofday, "gettimeofday"),
            (SYS_getrlimit, "getrlimit"),
            (SYS_getuid, "getuid"),
            (SYS_getgid, "getgid"),
            (SYS_setuid, "setuid"),
            (SYS_setgid, "setgid"),
            (SYS_geteuid, "geteuid"),
            (SYS_getegid, "getegid"),
            (SYS_setpgid, "setpgid"),
            (SYS_getppid, "getppid"),
            (SYS_getpgrp, "getpgrp"),
            (SYS_setsid, "setsid"),
            (SYS_setreuid, "setreuid"),
            (SYS_setregid, "setregid"),
            (SYS_getgroups, "getgroups"),
            (SYS_setgroups, "setgroups"),
            (SYS_setresuid, "setresuid"),
            (SYS_getresuid, "getresuid"),
            (SYS_setresgid, "setresgid"),
            (SYS_getresgid, "getresgid"),
            (SYS_sigaltstack, "sigaltstack"),
            (SYS_statfs, "statfs"),
            (SYS_fstatfs, "fstatfs"),
            (SYS_prctl, "prctl"),
            (SYS_arch_prctl, "arch_prctl"),
            (SYS_chroot, "chroot"),
            (SYS_sync, "sync"),
            (SYS_gettid, "gettid"),
            (SYS_futex, "futex"),
            (SYS_sched_getaffinity, "sched_getaffinity"),
            (SYS_set_tid_address, "set_tid_address"),
            (SYS_getdents64, "getdents64"),
            (SYS_clock_gettime, "clock_gettime"),
            (SYS_clock_getres, "clock_getres"),
            (SYS_clock_nanosleep, "clock_nanosleep"),
            (SYS_exit_group, "exit_group"),
            (SYS_tgkill, "tgkill"),
            (SYS_openat, "openat"),
            (SYS_mkdirat, "mkdirat"),
            (SYS_fchownat, "fchownat"),
            (SYS_newfstatat, "newfstatat"),
            (SYS_unlinkat, "unlinkat"),
            (SYS_renameat, "renameat"),
            (SYS_linkat, "linkat"),
            (SYS_symlinkat, "symlinkat"),
            (SYS_readlinkat, "readlinkat"),
            (SYS_fchmodat, "fchmodat"),
            (SYS_faccessat, "faccessat"),
            (SYS_pselect6, "pselect6"),
            (SYS_ppoll, "ppoll"),
            (SYS_set_robust_list, "set_robust_list"),
            (SYS_pipe2, "pipe2"),
            (SYS_dup3, "dup3"),
            (SYS_accept4, "accept4"),
            (SYS_prlimit64, "prlimit64"),
            (SYS_getrandom, "getrandom"),
        ];
        for &(code, name) in host {
            self.insert("linux", code as i32, name);
        }
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub fn add_host_linux(&mut self) {
        log::debug!("No host syscall numbers for this target");
    }
}

/// A call with every bound argument rendered, and the policy name it is decided under.
#[derive(Clone, Debug)]
pub struct RenderedCall {
    pub syscall: SyscallKey,
    /// The alias target for this call, or the syscall itself when it has no alias.
    pub policy: SyscallKey,
    pub args: Vec<RenderedArg>,
}

impl RenderedCall {
    /// The rendered values of the arguments with the given translation tag.
    pub fn values<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.args
            .iter()
            .filter(move |arg| arg.name == tag)
            .map(|arg| arg.value.as_str())
    }
}

impl fmt::Display for RenderedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.syscall)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", arg.name, arg.value)?;
        }
        f.write_str(")")?;
        if self.policy != self.syscall {
            write!(f, " as {}", self.policy)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    platforms: HashMap<String, Abi>,
    syscalls: HashSet<SyscallKey>,
    translations: TranslationTable,
    aliases: AliasTable,
    names: SyscallNames,
}

impl Registry {
    /// An empty registry that knows the host's syscall numbers.
    pub fn new() -> Registry {
        let mut registry = Registry::default();
        registry.names.add_host_linux();
        registry
    }

    /// The built-in catalog, followed by `extra` if given.
    pub fn builtin(extra: Option<&Path>) -> Result<Registry> {
        let mut catalogs = vec![Catalog::builtin()?];
        if let Some(path) = extra {
            catalogs.push(Catalog::from_path(path)?);
        }
        Ok(Registry::from_catalogs(&catalogs)?)
    }

    pub fn from_catalogs(catalogs: &[Catalog]) -> Result<Registry, RegistrationError> {
        let mut registry = Registry::new();
        for catalog in catalogs {
            registry.register_catalog(catalog)?;
        }
        log::debug!(
            "Registered {} syscalls on {} platforms",
            registry.syscalls.len(),
            registry.platforms.len()
        );
        Ok(registry)
    }

    /// Registers everything in one catalog. A syscall listed twice in the same catalog is an
    /// error; a syscall an earlier catalog already registered is re-registered.
    pub fn register_catalog(&mut self, catalog: &Catalog) -> Result<(), RegistrationError> {
        for (platform, &abi) in &catalog.platforms {
            self.register_platform(platform, abi)?;
        }
        for (platform, codes) in &catalog.numbers {
            for (&code, name) in codes {
                self.names.insert(platform, code, name);
            }
        }

        let mut seen = HashSet::new();
        for entry in &catalog.syscalls {
            let key = SyscallKey::new(&entry.platform, &entry.name);
            if !seen.insert(key.clone()) {
                return Err(RegistrationError::new(
                    &entry.platform,
                    &entry.name,
                    "listed twice in one catalog",
                ));
            }

            if self.syscalls.contains(&key) {
                log::info!("Re-registering {}", key);
            } else {
                self.register_syscall(&entry.platform, &entry.name)?;
            }
            for (&index, tag) in &entry.args {
                self.register_translation(&entry.platform, &entry.name, index, tag)?;
            }

            let alias = match &entry.alias {
                Some(alias) => alias,
                None if entry.determined_by.is_empty() => continue,
                None => {
                    return Err(RegistrationError::new(
                        &entry.platform,
                        &entry.name,
                        "determined_by without an alias",
                    ))
                }
            };
            let handle = match self.aliases.handle(&entry.platform, &entry.name) {
                Some(handle) => {
                    self.aliases.switch(
                        &entry.platform,
                        &entry.name,
                        &alias.platform,
                        &alias.name,
                    );
                    handle
                }
                None => self.register_alias(
                    &entry.platform,
                    &entry.name,
                    &alias.platform,
                    &alias.name,
                )?,
            };
            for &index in &entry.determined_by {
                if self
                    .translations
                    .get(&entry.platform, &entry.name, index)
                    .is_none()
                {
                    return Err(RegistrationError::new(
                        &entry.platform,
                        &entry.name,
                        format!("alias determined by unbound argument {}", index),
                    ));
                }
                self.alias_add_determining_translation(handle, index);
            }
        }
        Ok(())
    }

    pub fn register_platform(&mut self, platform: &str, abi: Abi) -> Result<(), RegistrationError> {
        match self.platforms.get(platform) {
            Some(&old) if old != abi => Err(RegistrationError::new(
                platform,
                "*",
                format!("platform already uses the {:?} ABI", old),
            )),
            _ => {
                self.platforms.insert(platform.to_string(), abi);
                Ok(())
            }
        }
    }

    /// Marks a syscall as intercepted.
    pub fn register_syscall(&mut self, platform: &str, name: &str) -> Result<(), RegistrationError> {
        self.platform_abi(platform, name)?;
        if !self.syscalls.insert(SyscallKey::new(platform, name)) {
            return Err(RegistrationError::new(platform, name, "already registered"));
        }
        log::trace!("Registered {}-{}", platform, name);
        Ok(())
    }

    /// Binds the translation named by `tag` to argument `index` of a registered syscall.
    pub fn register_translation(
        &mut self,
        platform: &str,
        name: &str,
        index: usize,
        tag: &str,
    ) -> Result<(), RegistrationError> {
        let abi = self.platform_abi(platform, name)?;
        if !self.syscalls.contains(&SyscallKey::new(platform, name)) {
            return Err(RegistrationError::new(
                platform,
                name,
                "translation for a syscall that isn't registered",
            ));
        }
        let translation = Translation::from_tag(tag, abi).ok_or_else(|| {
            RegistrationError::new(platform, name, format!("unknown translation {:?}", tag))
        })?;
        self.translations.register(platform, name, index, translation);
        Ok(())
    }

    pub fn register_alias(
        &mut self,
        src_platform: &str,
        src_name: &str,
        dst_platform: &str,
        dst_name: &str,
    ) -> Result<AliasHandle, RegistrationError> {
        self.platform_abi(src_platform, src_name)?;
        self.platform_abi(dst_platform, dst_name)?;
        self.aliases
            .new_alias(src_platform, src_name, dst_platform, dst_name)
    }

    pub fn alias_add_determining_translation(&mut self, handle: AliasHandle, index: usize) {
        self.aliases.add_determining_translation(handle, index);
    }

    fn platform_abi(&self, platform: &str, name: &str) -> Result<Abi, RegistrationError> {
        self.platforms
            .get(platform)
            .copied()
            .ok_or_else(|| RegistrationError::new(platform, name, "unknown platform"))
    }

    pub fn abi(&self, platform: &str) -> Option<Abi> {
        self.platforms.get(platform).copied()
    }

    pub fn is_registered(&self, key: &SyscallKey) -> bool {
        self.syscalls.contains(key)
    }

    pub fn names(&self) -> &SyscallNames {
        &self.names
    }

    pub fn translations(&self) -> &TranslationTable {
        &self.translations
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Renders every bound argument of a call and works out the policy name it falls under.
    pub fn render_call(
        &self,
        platform: &str,
        name: &str,
        args: &[u64],
        ctx: &RenderContext,
    ) -> RenderedCall {
        let syscall = SyscallKey::new(platform, name);
        let args = self.translations.render_args(platform, name, args, ctx);
        let policy = self
            .aliases
            .resolve(&syscall, &args)
            .unwrap_or_else(|| syscall.clone());
        RenderedCall {
            syscall,
            policy,
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, Registry};
    use crate::{
        abi::Abi,
        pod::testing::FakeMemory,
        translate::{RenderContext, UNAVAILABLE},
        SyscallKey,
    };
    use nix::unistd::Pid;
    use std::collections::HashMap;

    fn catalog(json: &str) -> Catalog {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn builtin_catalog_loads() {
        let registry = Registry::builtin(None).unwrap();
        assert_eq!(registry.abi("native"), Some(Abi::Netbsd));
        assert_eq!(registry.abi("linux"), Some(Abi::Linux));
        assert!(registry.is_registered(&SyscallKey::new("native", "open")));
        assert!(registry.is_registered(&SyscallKey::new("linux", "openat")));
        assert_eq!(registry.names().name("native", 5).unwrap(), "open");
        assert_eq!(registry.names().code("native", "execve"), Some(59));
        assert!(registry.names().name("native", 100_000).is_err());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn host_numbers() {
        let registry = Registry::new();
        assert_eq!(
            registry
                .names()
                .name("linux", nix::libc::SYS_openat as i32)
                .unwrap(),
            "openat"
        );
        assert_eq!(registry.names().code("linux", "read"), Some(0));
    }

    #[test]
    fn read_only_open_is_filed_under_fsread() {
        let registry = Registry::builtin(None).unwrap();
        let pid = Pid::from_raw(300);
        let mem = FakeMemory::default();
        mem.map(pid, 0x1000, b"/etc/passwd\0");
        let names = HashMap::new();
        let ctx = RenderContext {
            pid,
            memory: &mem,
            processes: &names,
        };

        // O_RDONLY
        let call = registry.render_call("native", "open", &[0x1000, 0, 0], &ctx);
        assert_eq!(call.values("filename").collect::<Vec<_>>(), ["/etc/passwd"]);
        assert_eq!(call.values("oflags").collect::<Vec<_>>(), ["ro"]);
        assert_eq!(call.policy, SyscallKey::new("native", "fsread"));

        // O_WRONLY|O_CREAT
        let call = registry.render_call("native", "open", &[0x1000, 0x201, 0o644], &ctx);
        assert_eq!(call.values("oflags").collect::<Vec<_>>(), ["woc"]);
        assert_eq!(call.policy, SyscallKey::new("native", "fswrite"));

        // openat(AT_FDCWD, "/etc/passwd", O_RDONLY) on Linux decides on its third argument
        let call = registry.render_call("linux", "openat", &[-100i64 as u64, 0x1000, 0, 0], &ctx);
        assert_eq!(call.policy, SyscallKey::new("native", "fsread"));
        assert_eq!(
            call.to_string(),
            "linux-openat(filename: /etc/passwd, oflags: ro, mode: 0) as native-fsread"
        );

        // openat(3, "passwd", O_RDONLY) names a file under whatever fd 3 is
        mem.map(pid, 0x2000, b"passwd\0");
        mem.set_cwd(pid, "/home/user");
        let call = registry.render_call("linux", "openat", &[3, 0x2000, 0, 0], &ctx);
        assert_eq!(call.values("filename").collect::<Vec<_>>(), [UNAVAILABLE]);
        mem.set_fd(pid, 3, "/etc");
        let call = registry.render_call("linux", "openat", &[3, 0x2000, 0, 0], &ctx);
        assert_eq!(call.values("filename").collect::<Vec<_>>(), ["/etc/passwd"]);

        // No alias
        let call = registry.render_call("native", "getpid", &[], &ctx);
        assert_eq!(call.policy, call.syscall);
        assert!(call.args.is_empty());
    }

    #[test]
    fn registration_errors_are_reported() {
        let unknown_platform = catalog(
            r#"{ "syscalls": [ { "platform": "plan9", "name": "open" } ] }"#,
        );
        assert!(Registry::from_catalogs(&[unknown_platform]).is_err());

        let unknown_tag = catalog(
            r#"{ "platforms": { "native": "netbsd" },
                 "syscalls": [ { "platform": "native", "name": "open", "args": { "0": "path" } } ] }"#,
        );
        let err = Registry::from_catalogs(&[unknown_tag]).unwrap_err();
        assert_eq!(err.name, "open");

        let duplicate = catalog(
            r#"{ "platforms": { "native": "netbsd" },
                 "syscalls": [ { "platform": "native", "name": "open" },
                               { "platform": "native", "name": "open" } ] }"#,
        );
        assert!(Registry::from_catalogs(&[duplicate]).is_err());

        let unbound = catalog(
            r#"{ "platforms": { "native": "netbsd" },
                 "syscalls": [ { "platform": "native", "name": "open",
                                 "alias": { "platform": "native", "name": "fswrite" },
                                 "determined_by": [1] } ] }"#,
        );
        assert!(Registry::from_catalogs(&[unbound]).is_err());

        let mut registry = Registry::builtin(None).unwrap();
        assert!(registry.register_syscall("native", "open").is_err());
        assert!(registry
            .register_alias("native", "open", "native", "fsread")
            .is_err());
        assert!(registry
            .register_platform("native", Abi::Linux)
            .is_err());
        assert!(registry
            .register_translation("native", "nosuchcall", 0, "filename")
            .is_err());
    }

    #[test]
    fn later_catalog_overrides() {
        let extra = catalog(
            r#"{ "syscalls": [ { "platform": "native", "name": "kill",
                                 "args": { "1": "number" } },
                               { "platform": "native", "name": "chdir",
                                 "args": { "0": "filename" },
                                 "alias": { "platform": "native", "name": "fsread" } } ] }"#,
        );
        let registry = Registry::from_catalogs(&[Catalog::builtin().unwrap(), extra]).unwrap();
        assert_eq!(
            registry.translations().get("native", "kill", 1).map(|t| t.name()),
            Some("number")
        );
        assert_eq!(
            registry.aliases().lookup("native", "chdir"),
            Some(SyscallKey::new("native", "fsread"))
        );
    }
}
