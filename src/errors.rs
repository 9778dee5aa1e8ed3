// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types that need to be specially recognized.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Building the syscall tables failed. A partially-built table must never be used to enforce a
/// policy, so callers treat this as fatal.
#[derive(Debug)]
pub struct RegistrationError {
    pub platform: String,
    pub name: String,
    pub reason: String,
}

impl RegistrationError {
    pub fn new(platform: &str, name: &str, reason: impl Into<String>) -> RegistrationError {
        RegistrationError {
            platform: platform.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl Display for RegistrationError {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "Failed to register {}-{}: {}",
            self.platform, self.name, self.reason
        )
    }
}

impl Error for RegistrationError {}

/// Reading an argument out of the traced process failed (the process went away, or the pointer
/// was bad). Only the affected argument is lost.
#[derive(Debug)]
pub struct TranslationReadError {
    pub translation: &'static str,
    pub addr: u64,
}

impl Display for TranslationReadError {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "Failed to read {} argument at address 0x{:016x}",
            self.translation, self.addr
        )
    }
}

impl Error for TranslationReadError {}

/// A message or answer that doesn't fit the protocol: malformed, or not matching any pending
/// request.
#[derive(Debug)]
pub struct ProtocolMismatch(pub String);

impl Display for ProtocolMismatch {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(fmt, "Protocol mismatch: {}", self.0)
    }
}

impl Error for ProtocolMismatch {}

/// No answer arrived for a request in time.
#[derive(Debug)]
pub struct OrphanedRequest {
    pub pid: i32,
    pub seqnr: u16,
}

impl Display for OrphanedRequest {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "Request {} of pid {} was never answered; denying",
            self.seqnr, self.pid
        )
    }
}

impl Error for OrphanedRequest {}

#[derive(Debug)]
pub struct UnknownSyscall {
    pub platform: String,
    pub code: i32,
}

impl Display for UnknownSyscall {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "Unknown syscall number {} (0x{:x}) for platform {}",
            self.code, self.code, self.platform
        )
    }
}

impl Error for UnknownSyscall {}
