// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The constant sets of the ABIs we know how to decode. Values are spelled out rather than taken
//! from `libc`, since the tracer has to decode an ABI other than the host's.

use serde::{Deserialize, Serialize};

/// Defines a `&[(i32, &str)]` table whose names are the stringified identifiers.
macro_rules! name_table {
    ($table:ident { $($value:expr => $name:ident),* $(,)? }) => {
        pub const $table: &[(i32, &str)] = &[$(($value, stringify!($name))),*];
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Abi {
    Netbsd,
    Linux,
}

/// The open(2) flag bits that show up in a rendered flag word.
#[derive(Debug)]
pub struct OpenFlags {
    pub accmode: i32,
    pub rdonly: i32,
    pub wronly: i32,
    pub rdwr: i32,
    pub nonblock: i32,
    pub append: i32,
    pub creat: i32,
    pub trunc: i32,
}

/// The bits of the socket(2) type argument that are flags rather than the type.
#[derive(Debug)]
pub struct SockTypeFlags {
    pub nonblock: i32,
    pub cloexec: i32,
}

impl Abi {
    pub fn open_flags(self) -> &'static OpenFlags {
        match self {
            Abi::Netbsd => &netbsd::OPEN_FLAGS,
            Abi::Linux => &linux::OPEN_FLAGS,
        }
    }

    pub fn signals(self) -> &'static [(i32, &'static str)] {
        match self {
            Abi::Netbsd => netbsd::SIGNALS,
            Abi::Linux => linux::SIGNALS,
        }
    }

    pub fn fcntl_commands(self) -> &'static [(i32, &'static str)] {
        match self {
            Abi::Netbsd => netbsd::FCNTL_COMMANDS,
            Abi::Linux => linux::FCNTL_COMMANDS,
        }
    }

    pub fn socket_domains(self) -> &'static [(i32, &'static str)] {
        match self {
            Abi::Netbsd => netbsd::SOCKET_DOMAINS,
            Abi::Linux => linux::SOCKET_DOMAINS,
        }
    }

    pub fn socket_types(self) -> &'static [(i32, &'static str)] {
        SOCKET_TYPES
    }

    pub fn socket_type_flags(self) -> &'static SockTypeFlags {
        match self {
            Abi::Netbsd => &netbsd::SOCK_TYPE_FLAGS,
            Abi::Linux => &linux::SOCK_TYPE_FLAGS,
        }
    }

    /// Protection bits, in the order they are tested when decomposing a mask.
    pub fn prot_bits(self) -> &'static [(i32, &'static str)] {
        PROT_BITS
    }

    pub fn af_unix(self) -> i32 {
        1
    }

    pub fn af_inet(self) -> i32 {
        2
    }

    pub fn af_inet6(self) -> i32 {
        match self {
            Abi::Netbsd => 24,
            Abi::Linux => 10,
        }
    }

    /// Whether a `sockaddr` starts with a length byte before the family byte (4.4BSD layout)
    /// rather than with a 16-bit family.
    pub fn sockaddr_has_len(self) -> bool {
        matches!(self, Abi::Netbsd)
    }
}

/// Looks `value` up in a name table.
pub fn lookup(table: &[(i32, &'static str)], value: i32) -> Option<&'static str> {
    table
        .iter()
        .find(|(known, _)| *known == value)
        .map(|(_, name)| *name)
}

name_table!(SOCKET_TYPES {
    1 => SOCK_STREAM,
    2 => SOCK_DGRAM,
    3 => SOCK_RAW,
    4 => SOCK_RDM,
    5 => SOCK_SEQPACKET,
});

name_table!(PROT_BITS {
    0x1 => PROT_READ,
    0x2 => PROT_WRITE,
    0x4 => PROT_EXEC,
});

pub mod netbsd {
    use super::{OpenFlags, SockTypeFlags};

    pub const OPEN_FLAGS: OpenFlags = OpenFlags {
        accmode: 0x3,
        rdonly: 0x0,
        wronly: 0x1,
        rdwr: 0x2,
        nonblock: 0x4,
        append: 0x8,
        creat: 0x200,
        trunc: 0x400,
    };

    pub const SOCK_TYPE_FLAGS: SockTypeFlags = SockTypeFlags {
        nonblock: 0x2000_0000,
        cloexec: 0x1000_0000,
    };

    name_table!(SIGNALS {
        1 => SIGHUP,
        2 => SIGINT,
        3 => SIGQUIT,
        4 => SIGILL,
        5 => SIGTRAP,
        6 => SIGABRT,
        7 => SIGEMT,
        8 => SIGFPE,
        9 => SIGKILL,
        10 => SIGBUS,
        11 => SIGSEGV,
        12 => SIGSYS,
        13 => SIGPIPE,
        14 => SIGALRM,
        15 => SIGTERM,
        16 => SIGURG,
        17 => SIGSTOP,
        18 => SIGTSTP,
        19 => SIGCONT,
        20 => SIGCHLD,
        21 => SIGTTIN,
        22 => SIGTTOU,
        23 => SIGIO,
        24 => SIGXCPU,
        25 => SIGXFSZ,
        26 => SIGVTALRM,
        27 => SIGPROF,
        28 => SIGWINCH,
        29 => SIGINFO,
        30 => SIGUSR1,
        31 => SIGUSR2,
        32 => SIGPWR,
    });

    name_table!(FCNTL_COMMANDS {
        0 => F_DUPFD,
        1 => F_GETFD,
        2 => F_SETFD,
        3 => F_GETFL,
        4 => F_SETFL,
        5 => F_GETOWN,
        6 => F_SETOWN,
        7 => F_GETLK,
        8 => F_SETLK,
        9 => F_SETLKW,
        10 => F_CLOSEM,
        11 => F_MAXFD,
        12 => F_DUPFD_CLOEXEC,
    });

    name_table!(SOCKET_DOMAINS {
        0 => AF_UNSPEC,
        1 => AF_UNIX,
        2 => AF_INET,
        3 => AF_IMPLINK,
        4 => AF_PUP,
        5 => AF_CHAOS,
        6 => AF_NS,
        7 => AF_ISO,
        8 => AF_ECMA,
        9 => AF_DATAKIT,
        10 => AF_CCITT,
        11 => AF_SNA,
        12 => AF_DECnet,
        13 => AF_DLI,
        14 => AF_LAT,
        15 => AF_HYLINK,
        16 => AF_APPLETALK,
        17 => AF_ROUTE,
        18 => AF_LINK,
        20 => AF_COIP,
        21 => AF_CNT,
        23 => AF_IPX,
        24 => AF_INET6,
        26 => AF_ISDN,
        27 => AF_NATM,
        28 => AF_ARP,
        31 => AF_BLUETOOTH,
    });
}

pub mod linux {
    use super::{OpenFlags, SockTypeFlags};

    pub const OPEN_FLAGS: OpenFlags = OpenFlags {
        accmode: 0o3,
        rdonly: 0o0,
        wronly: 0o1,
        rdwr: 0o2,
        nonblock: 0o4000,
        append: 0o2000,
        creat: 0o100,
        trunc: 0o1000,
    };

    pub const SOCK_TYPE_FLAGS: SockTypeFlags = SockTypeFlags {
        nonblock: 0o4000,
        cloexec: 0o2000000,
    };

    name_table!(SIGNALS {
        1 => SIGHUP,
        2 => SIGINT,
        3 => SIGQUIT,
        4 => SIGILL,
        5 => SIGTRAP,
        6 => SIGABRT,
        7 => SIGBUS,
        8 => SIGFPE,
        9 => SIGKILL,
        10 => SIGUSR1,
        11 => SIGSEGV,
        12 => SIGUSR2,
        13 => SIGPIPE,
        14 => SIGALRM,
        15 => SIGTERM,
        16 => SIGSTKFLT,
        17 => SIGCHLD,
        18 => SIGCONT,
        19 => SIGSTOP,
        20 => SIGTSTP,
        21 => SIGTTIN,
        22 => SIGTTOU,
        23 => SIGURG,
        24 => SIGXCPU,
        25 => SIGXFSZ,
        26 => SIGVTALRM,
        27 => SIGPROF,
        28 => SIGWINCH,
        29 => SIGIO,
        30 => SIGPWR,
        31 => SIGSYS,
    });

    name_table!(FCNTL_COMMANDS {
        0 => F_DUPFD,
        1 => F_GETFD,
        2 => F_SETFD,
        3 => F_GETFL,
        4 => F_SETFL,
        5 => F_GETLK,
        6 => F_SETLK,
        7 => F_SETLKW,
        8 => F_SETOWN,
        9 => F_GETOWN,
        10 => F_SETSIG,
        11 => F_GETSIG,
        1024 => F_SETLEASE,
        1025 => F_GETLEASE,
        1030 => F_DUPFD_CLOEXEC,
    });

    name_table!(SOCKET_DOMAINS {
        0 => AF_UNSPEC,
        1 => AF_UNIX,
        2 => AF_INET,
        3 => AF_AX25,
        4 => AF_IPX,
        5 => AF_APPLETALK,
        6 => AF_NETROM,
        7 => AF_BRIDGE,
        8 => AF_ATMPVC,
        9 => AF_X25,
        10 => AF_INET6,
        11 => AF_ROSE,
        12 => AF_DECnet,
        15 => AF_KEY,
        16 => AF_NETLINK,
        17 => AF_PACKET,
        31 => AF_BLUETOOTH,
        40 => AF_VSOCK,
    });
}
