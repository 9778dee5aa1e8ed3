// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Socket address layouts, as they sit in the traced process' memory. The first two bytes are
//! either a 16-bit family (Linux) or a length byte and a family byte (4.4BSD); everything after
//! them lines up in both.

use crate::pod::Pod;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct in_addr {
    /// Network byte order.
    pub s_addr: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sockaddr_in {
    pub sin_head: [u8; 2],
    /// Network byte order.
    pub sin_port: [u8; 2],
    pub sin_addr: in_addr,
    pub sin_zero: [u8; 8],
}

unsafe impl Pod for sockaddr_in {}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct in6_addr {
    pub s6_addr: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct sockaddr_in6 {
    pub sin6_head: [u8; 2],
    /// Network byte order.
    pub sin6_port: [u8; 2],
    pub sin6_flowinfo: [u8; 4],
    pub sin6_addr: in6_addr,
    pub sin6_scope_id: [u8; 4],
}

unsafe impl Pod for sockaddr_in6 {}

/// The longest `sockaddr` we read; `sizeof(struct sockaddr_storage)` on both ABIs.
pub const SOCKADDR_MAX: u64 = 128;

/// Offset of `sun_path` in `sockaddr_un`.
pub const SUN_PATH_OFFSET: u64 = 2;
