// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Printers for scalar arguments. These see values the traced process chose, so every one of
//! them handles every possible input.

use super::ProcessNames;
use crate::abi::{lookup, Abi};
use nix::unistd::{Gid, Group, Pid, Uid, User};

/// `ro`, `wo`, `rw` or `--` for the access mode, then one letter per interesting flag.
pub fn print_oflags(flags: i32, abi: Abi) -> String {
    let known = abi.open_flags();
    let accmode = flags & known.accmode;
    let mut out = String::from(if accmode == known.rdonly {
        "ro"
    } else if accmode == known.wronly {
        "wo"
    } else if accmode == known.rdwr {
        "rw"
    } else {
        "--"
    });

    for (bit, letter) in [
        (known.nonblock, 'n'),
        (known.append, 'a'),
        (known.creat, 'c'),
        (known.trunc, 't'),
    ] {
        if flags & bit != 0 {
            out.push(letter);
        }
    }
    out
}

pub fn print_modeflags(mode: i32) -> String {
    format!("{:o}", mode as u32 & 0o7777)
}

pub fn print_uname(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => format!("<unknown>: {}", uid),
    }
}

pub fn print_gname(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => format!("<unknown>: {}", gid),
    }
}

/// Renders the pid argument of kill(2) and friends, including its process group forms.
pub fn print_pidname(processes: &dyn ProcessNames, pid: i32) -> String {
    match pid {
        0 => "<own process group>".to_string(),
        -1 => "<every process: -1>".to_string(),
        pid if pid > 0 => processes
            .process_name(Pid::from_raw(pid))
            .unwrap_or_else(|| "<unknown>".to_string()),
        pid => {
            let name = pid
                .checked_neg()
                .and_then(|group| processes.process_name(Pid::from_raw(group)))
                .unwrap_or_else(|| "unknown".to_string());
            format!("<process group: {}>", name)
        }
    }
}

pub fn print_signame(sig: i32, abi: Abi) -> String {
    match lookup(abi.signals(), sig) {
        Some(name) => name.to_string(),
        None => format!("<unknown>: {}", sig),
    }
}

pub fn print_fcntlcmd(cmd: i32, abi: Abi) -> String {
    match lookup(abi.fcntl_commands(), cmd) {
        Some(name) => name.to_string(),
        None => format!("<unknown>: {}", cmd),
    }
}

/// Decomposes a protection mask into `|`-joined names, testing and clearing one known bit at a
/// time. Bits nobody knows about end up in a trailing `<unknown:0x..>`.
pub fn print_memprot(prot: i32, abi: Abi) -> String {
    if prot == 0 {
        return "PROT_NONE".to_string();
    }

    let mut rest = prot as u32;
    let mut parts = Vec::new();
    while rest != 0 {
        match abi
            .prot_bits()
            .iter()
            .find(|(bit, _)| rest & (*bit as u32) != 0)
        {
            Some((bit, name)) => {
                parts.push(name.to_string());
                rest &= !(*bit as u32);
            }
            None => {
                parts.push(format!("<unknown:0x{:x}>", rest));
                rest = 0;
            }
        }
    }
    parts.join("|")
}

pub fn print_sockdom(domain: i32, abi: Abi) -> String {
    match lookup(abi.socket_domains(), domain) {
        Some(name) => name.to_string(),
        None => format!("unknown_{}", domain),
    }
}

/// The socket type, followed by any type flags (`SOCK_NONBLOCK`, `SOCK_CLOEXEC`).
pub fn print_socktype(ty: i32, abi: Abi) -> String {
    let flags = abi.socket_type_flags();
    let base = ty & !(flags.nonblock | flags.cloexec);
    let mut out = match lookup(abi.socket_types(), base) {
        Some(name) => name.to_string(),
        None => format!("unknown_{}", base),
    };
    if ty & flags.nonblock != 0 {
        out.push_str("|SOCK_NONBLOCK");
    }
    if ty & flags.cloexec != 0 {
        out.push_str("|SOCK_CLOEXEC");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn oflags() {
        assert_eq!(print_oflags(0, Abi::Netbsd), "ro");
        assert_eq!(print_oflags(0x1 | 0x200 | 0x400, Abi::Netbsd), "woct");
        assert_eq!(print_oflags(0x2 | 0x4 | 0x8, Abi::Netbsd), "rwna");
        assert_eq!(print_oflags(0x3, Abi::Netbsd), "--");
        // O_WRONLY|O_CREAT|O_TRUNC on Linux
        assert_eq!(print_oflags(0o1101, Abi::Linux), "woct");
        assert_eq!(print_oflags(-1, Abi::Linux), "--nact");
    }

    #[test]
    fn signames() {
        assert_eq!(print_signame(9, Abi::Netbsd), "SIGKILL");
        assert_eq!(print_signame(9, Abi::Linux), "SIGKILL");
        assert_eq!(print_signame(999, Abi::Netbsd), "<unknown>: 999");
        assert_eq!(print_signame(-3, Abi::Linux), "<unknown>: -3");
        assert_eq!(print_signame(30, Abi::Netbsd), "SIGUSR1");
        assert_eq!(print_signame(30, Abi::Linux), "SIGPWR");
    }

    #[test]
    fn fcntl_commands() {
        assert_eq!(print_fcntlcmd(2, Abi::Netbsd), "F_SETFD");
        assert_eq!(print_fcntlcmd(1030, Abi::Linux), "F_DUPFD_CLOEXEC");
        assert_eq!(print_fcntlcmd(1030, Abi::Netbsd), "<unknown>: 1030");
    }

    #[test]
    fn socket_domains_and_types() {
        assert_eq!(print_sockdom(24, Abi::Netbsd), "AF_INET6");
        assert_eq!(print_sockdom(10, Abi::Linux), "AF_INET6");
        assert_eq!(print_sockdom(77, Abi::Linux), "unknown_77");
        assert_eq!(print_socktype(1, Abi::Linux), "SOCK_STREAM");
        assert_eq!(
            print_socktype(2 | 0o2000000 | 0o4000, Abi::Linux),
            "SOCK_DGRAM|SOCK_NONBLOCK|SOCK_CLOEXEC"
        );
        assert_eq!(print_socktype(99, Abi::Netbsd), "unknown_99");
    }

    #[test]
    fn memprot_decomposes_known_and_unknown_bits() {
        assert_eq!(print_memprot(0, Abi::Netbsd), "PROT_NONE");
        assert_eq!(print_memprot(0x1 | 0x4, Abi::Netbsd), "PROT_READ|PROT_EXEC");
        assert_eq!(
            print_memprot(0x2 | 0x30, Abi::Linux),
            "PROT_WRITE|<unknown:0x30>"
        );
        assert_eq!(print_memprot(-1, Abi::Linux).split('|').count(), 4);
    }

    #[test]
    fn memprot_round_trips_known_bits() {
        for prot in 0..0x40 {
            let rendered = print_memprot(prot, Abi::Netbsd);
            let parsed = rendered
                .split('|')
                .filter_map(|part| {
                    Abi::Netbsd
                        .prot_bits()
                        .iter()
                        .find(|(_, name)| *name == part)
                        .map(|(bit, _)| *bit)
                })
                .fold(0, |acc, bit| acc | bit);
            assert_eq!(parsed, prot & 0x7, "{}", rendered);
            let names = rendered.split('|').collect::<HashSet<_>>();
            assert_eq!(names.len(), rendered.split('|').count());
        }
    }

    #[test]
    fn pidnames() {
        let mut names = HashMap::new();
        names.insert(Pid::from_raw(77), "sshd".to_string());
        assert_eq!(print_pidname(&names, 77), "sshd");
        assert_eq!(print_pidname(&names, 78), "<unknown>");
        assert_eq!(print_pidname(&names, 0), "<own process group>");
        assert_eq!(print_pidname(&names, -1), "<every process: -1>");
        assert_eq!(print_pidname(&names, -77), "<process group: sshd>");
        assert_eq!(print_pidname(&names, i32::MIN), "<process group: unknown>");
    }

    #[test]
    fn modes_and_ids() {
        assert_eq!(print_modeflags(0o644), "644");
        assert_eq!(print_modeflags(0o104755), "4755");
        assert_eq!(print_uname(987_654_321), "<unknown>: 987654321");
        assert_eq!(print_gname(987_654_321), "<unknown>: 987654321");
    }
}
