// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The wire format between the interception engine and the policy daemon.
//!
//! Everything is little-endian with fixed sizes. The engine sends [`Message`]s, each a 12-byte
//! header followed by a 1024-byte payload; the daemon talks back through ioctl requests
//! ([`Ioctl`]), the most common being an [`Answer`] to an `ASK`.

use crate::errors::ProtocolMismatch;
use anyhow::{Context, Result};
use bstr::{BString, ByteSlice};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const HEADER_SIZE: usize = 12;
pub const PAYLOAD_SIZE: usize = 1024;
pub const MSG_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;
pub const ANSWER_SIZE: usize = 28;
pub const POLICY_REQUEST_SIZE: usize = 20;
pub const IO_REQUEST_SIZE: usize = 24;

/// The most argument words an `ASK` carries.
pub const MAX_ARGS: usize = 64;
pub const EMUL_NAME_LEN: usize = 8;

pub const MSG_ASK: i32 = 1;
pub const MSG_RES: i32 = 2;
pub const MSG_EMUL: i32 = 3;
pub const MSG_CHILD: i32 = 4;
pub const MSG_UGID: i32 = 5;
pub const MSG_POLICYFREE: i32 = 6;
pub const MSG_EXECVE: i32 = 7;
pub const MSG_SCRIPTNAME: i32 = 8;

/// Ioctl encoding, 4.4BSD style.
pub const IOCPARM_MASK: u32 = 0x1fff;
pub const IOC_VOID: u32 = 0x2000_0000;
pub const IOC_OUT: u32 = 0x4000_0000;
pub const IOC_IN: u32 = 0x8000_0000;
pub const IOC_INOUT: u32 = IOC_IN | IOC_OUT;

const fn ioc(inout: u32, group: u8, num: u8, len: usize) -> u32 {
    inout | ((len as u32 & IOCPARM_MASK) << 16) | ((group as u32) << 8) | num as u32
}

pub const STRIOCCLONE: u32 = ioc(IOC_OUT, b's', 100, 4);
pub const STRIOCATTACH: u32 = ioc(IOC_IN, b's', 101, 4);
pub const STRIOCDETACH: u32 = ioc(IOC_IN, b's', 102, 4);
pub const STRIOCANSWER: u32 = ioc(IOC_IN, b's', 103, ANSWER_SIZE);
pub const STRIOCIO: u32 = ioc(IOC_INOUT, b's', 104, IO_REQUEST_SIZE);
pub const STRIOCPOLICY: u32 = ioc(IOC_INOUT, b's', 105, POLICY_REQUEST_SIZE);
pub const STRIOCREPORT: u32 = ioc(IOC_IN, b's', 108, 4);

/// A cached or answered decision for a syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Ask,
    Permit,
    Never,
}

impl Decision {
    pub fn to_raw(self) -> i32 {
        match self {
            Decision::Ask => 0,
            Decision::Permit => 1,
            Decision::Never => 2,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Decision> {
        match raw {
            0 => Some(Decision::Ask),
            1 => Some(Decision::Permit),
            2 => Some(Decision::Never),
            _ => None,
        }
    }
}

/// The syscall a process is about to make (`ASK`) or has just made (`RES`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyscallInfo {
    pub code: i32,
    pub args: Vec<u64>,
    /// Return values; only meaningful in a `RES`.
    pub rval: [u64; 2],
    /// The errno of the call; only meaningful in a `RES`.
    pub result: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Ask(SyscallInfo),
    Res(SyscallInfo),
    /// The process now runs under this emulation (platform).
    Emul(String),
    /// The process forked `new_pid`; `None` means the process exited.
    Child(Option<Pid>),
    Ugid { uid: u32, gid: u32 },
    /// The policy in the header was freed.
    PolicyFree,
    Execve(BString),
    ScriptName(BString),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub pid: Pid,
    pub seqnr: u16,
    /// The policy the process is assigned to, or -1.
    pub policy: i16,
    pub payload: Payload,
}

fn mismatch(what: impl Into<String>) -> ProtocolMismatch {
    ProtocolMismatch(what.into())
}

fn get_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    get_i32(buf, offset) as u32
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// The bytes up to the first NUL.
fn get_padded(buf: &[u8]) -> &[u8] {
    let end = buf.find_byte(0).unwrap_or(buf.len());
    &buf[..end]
}

impl SyscallInfo {
    fn encode(&self, payload: &mut [u8]) -> Result<(), ProtocolMismatch> {
        if self.args.len() > MAX_ARGS {
            return Err(mismatch(format!("{} argument words", self.args.len())));
        }
        put(payload, 0, &self.code.to_le_bytes());
        put(payload, 4, &((self.args.len() * 8) as i32).to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            put(payload, 8 + 8 * i, &arg.to_le_bytes());
        }
        let rval_at = 8 + 8 * MAX_ARGS;
        put(payload, rval_at, &self.rval[0].to_le_bytes());
        put(payload, rval_at + 8, &self.rval[1].to_le_bytes());
        put(payload, rval_at + 16, &self.result.to_le_bytes());
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<SyscallInfo, ProtocolMismatch> {
        let argsize = get_i32(payload, 4);
        if argsize < 0 || argsize % 8 != 0 || argsize as usize > 8 * MAX_ARGS {
            return Err(mismatch(format!("bad argument size {}", argsize)));
        }
        let args = (0..argsize as usize / 8)
            .map(|i| get_u64(payload, 8 + 8 * i))
            .collect();
        let rval_at = 8 + 8 * MAX_ARGS;
        Ok(SyscallInfo {
            code: get_i32(payload, 0),
            args,
            rval: [get_u64(payload, rval_at), get_u64(payload, rval_at + 8)],
            result: get_i32(payload, rval_at + 16),
        })
    }
}

impl Message {
    pub fn kind(&self) -> i32 {
        match self.payload {
            Payload::Ask(_) => MSG_ASK,
            Payload::Res(_) => MSG_RES,
            Payload::Emul(_) => MSG_EMUL,
            Payload::Child(_) => MSG_CHILD,
            Payload::Ugid { .. } => MSG_UGID,
            Payload::PolicyFree => MSG_POLICYFREE,
            Payload::Execve(_) => MSG_EXECVE,
            Payload::ScriptName(_) => MSG_SCRIPTNAME,
        }
    }

    pub fn encode(&self) -> Result<[u8; MSG_SIZE], ProtocolMismatch> {
        let mut buf = [0; MSG_SIZE];
        put(&mut buf, 0, &self.kind().to_le_bytes());
        put(&mut buf, 4, &self.pid.as_raw().to_le_bytes());
        put(&mut buf, 8, &self.seqnr.to_le_bytes());
        put(&mut buf, 10, &self.policy.to_le_bytes());

        let payload = &mut buf[HEADER_SIZE..];
        match &self.payload {
            Payload::Ask(info) | Payload::Res(info) => info.encode(payload)?,
            Payload::Emul(name) => {
                if name.len() >= EMUL_NAME_LEN {
                    return Err(mismatch(format!("emulation name {:?} too long", name)));
                }
                put(payload, 0, name.as_bytes());
            }
            Payload::Child(new_pid) => {
                let raw = new_pid.map_or(-1, Pid::as_raw);
                put(payload, 0, &raw.to_le_bytes());
            }
            Payload::Ugid { uid, gid } => {
                put(payload, 0, &uid.to_le_bytes());
                put(payload, 4, &gid.to_le_bytes());
            }
            Payload::PolicyFree => {}
            Payload::Execve(path) | Payload::ScriptName(path) => {
                if path.len() >= PAYLOAD_SIZE {
                    return Err(mismatch(format!("path of {} bytes", path.len())));
                }
                put(payload, 0, path.as_bytes());
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolMismatch> {
        if buf.len() != MSG_SIZE {
            return Err(mismatch(format!(
                "message of {} bytes, expected {}",
                buf.len(),
                MSG_SIZE
            )));
        }
        let kind = get_i32(buf, 0);
        let payload = &buf[HEADER_SIZE..];
        let payload = match kind {
            MSG_ASK => Payload::Ask(SyscallInfo::decode(payload)?),
            MSG_RES => Payload::Res(SyscallInfo::decode(payload)?),
            MSG_EMUL => Payload::Emul(
                get_padded(&payload[..EMUL_NAME_LEN])
                    .to_str()
                    .map_err(|_| mismatch("emulation name is not UTF-8"))?
                    .to_string(),
            ),
            MSG_CHILD => Payload::Child(match get_i32(payload, 0) {
                -1 => None,
                raw if raw > 0 => Some(Pid::from_raw(raw)),
                raw => return Err(mismatch(format!("bad child pid {}", raw))),
            }),
            MSG_UGID => Payload::Ugid {
                uid: get_u32(payload, 0),
                gid: get_u32(payload, 4),
            },
            MSG_POLICYFREE => Payload::PolicyFree,
            MSG_EXECVE => Payload::Execve(BString::from(get_padded(payload))),
            MSG_SCRIPTNAME => Payload::ScriptName(BString::from(get_padded(payload))),
            _ => return Err(mismatch(format!("unknown message type {}", kind))),
        };
        Ok(Message {
            pid: Pid::from_raw(get_i32(buf, 4)),
            seqnr: get_u16(buf, 8),
            policy: get_u16(buf, 10) as i16,
            payload,
        })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Message> {
        let mut buf = [0; MSG_SIZE];
        reader
            .read_exact(&mut buf)
            .context("Failed to read message")?;
        Ok(Message::decode(&buf)?)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&self.encode()?)
            .context("Failed to write message")
    }
}

/// Answer flag bits.
pub const ANSWER_RESULT: i32 = 0x1;
pub const ANSWER_SETEUID: i32 = 0x2;
pub const ANSWER_SETEGID: i32 = 0x4;

/// The daemon's answer to an `ASK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Answer {
    pub pid: Pid,
    pub seqnr: u16,
    pub seteuid: u32,
    pub setegid: u32,
    pub decision: Decision,
    /// The errno a denied call fails with; 0 for the default.
    pub error: i32,
    pub flags: i32,
}

impl Answer {
    pub fn permit(pid: Pid, seqnr: u16) -> Answer {
        Answer {
            pid,
            seqnr,
            seteuid: 0,
            setegid: 0,
            decision: Decision::Permit,
            error: 0,
            flags: 0,
        }
    }

    pub fn deny(pid: Pid, seqnr: u16, error: i32) -> Answer {
        Answer {
            decision: Decision::Never,
            error,
            ..Answer::permit(pid, seqnr)
        }
    }

    pub fn encode(&self) -> [u8; ANSWER_SIZE] {
        let mut buf = [0; ANSWER_SIZE];
        put(&mut buf, 0, &self.pid.as_raw().to_le_bytes());
        put(&mut buf, 4, &self.seqnr.to_le_bytes());
        put(&mut buf, 8, &self.seteuid.to_le_bytes());
        put(&mut buf, 12, &self.setegid.to_le_bytes());
        put(&mut buf, 16, &self.decision.to_raw().to_le_bytes());
        put(&mut buf, 20, &self.error.to_le_bytes());
        put(&mut buf, 24, &self.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Answer, ProtocolMismatch> {
        if buf.len() != ANSWER_SIZE {
            return Err(mismatch(format!("answer of {} bytes", buf.len())));
        }
        let decision = get_i32(buf, 16);
        let flags = get_i32(buf, 24);
        if flags & !(ANSWER_RESULT | ANSWER_SETEUID | ANSWER_SETEGID) != 0 {
            return Err(mismatch(format!("unknown answer flags 0x{:x}", flags)));
        }
        Ok(Answer {
            pid: Pid::from_raw(get_i32(buf, 0)),
            seqnr: get_u16(buf, 4),
            seteuid: get_u32(buf, 8),
            setegid: get_u32(buf, 12),
            decision: Decision::from_raw(decision)
                .ok_or_else(|| mismatch(format!("unknown decision {}", decision)))?,
            error: get_i32(buf, 20),
            flags,
        })
    }
}

const POLICY_NEW: i32 = 1;
const POLICY_ASSIGN: i32 = 2;
const POLICY_MODIFY: i32 = 3;

/// A `STRIOCPOLICY` request. For `New`, the engine fills in the number of the new policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyRequest {
    New { maxents: i32, num: Option<i16> },
    Assign { num: i16, pid: Pid },
    Modify { num: i16, code: i32, decision: Decision },
}

impl PolicyRequest {
    pub fn encode(&self) -> [u8; POLICY_REQUEST_SIZE] {
        let (op, num, code_or_pid, decision, maxents) = match *self {
            PolicyRequest::New { maxents, num } => {
                (POLICY_NEW, num.map_or(-1, i32::from), 0, 0, maxents)
            }
            PolicyRequest::Assign { num, pid } => (POLICY_ASSIGN, num.into(), pid.as_raw(), 0, 0),
            PolicyRequest::Modify {
                num,
                code,
                decision,
            } => (POLICY_MODIFY, num.into(), code, decision.to_raw(), 0),
        };
        let mut buf = [0; POLICY_REQUEST_SIZE];
        for (i, field) in [op, num, code_or_pid, decision, maxents].iter().enumerate() {
            put(&mut buf, 4 * i, &field.to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<PolicyRequest, ProtocolMismatch> {
        if buf.len() != POLICY_REQUEST_SIZE {
            return Err(mismatch(format!("policy request of {} bytes", buf.len())));
        }
        let num = get_i32(buf, 4);
        let small_num = || {
            i16::try_from(num).map_err(|_| mismatch(format!("bad policy number {}", num)))
        };
        match get_i32(buf, 0) {
            POLICY_NEW => Ok(PolicyRequest::New {
                maxents: get_i32(buf, 16),
                num: if num < 0 { None } else { Some(small_num()?) },
            }),
            POLICY_ASSIGN => Ok(PolicyRequest::Assign {
                num: small_num()?,
                pid: Pid::from_raw(get_i32(buf, 8)),
            }),
            POLICY_MODIFY => {
                let decision = get_i32(buf, 12);
                Ok(PolicyRequest::Modify {
                    num: small_num()?,
                    code: get_i32(buf, 8),
                    decision: Decision::from_raw(decision)
                        .ok_or_else(|| mismatch(format!("unknown decision {}", decision)))?,
                })
            }
            op => Err(mismatch(format!("unknown policy op {}", op))),
        }
    }
}

const IO_READ: i32 = 1;
const IO_WRITE: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

/// A `STRIOCIO` request: move `len` bytes at `offs` in the address space of `pid`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRequest {
    pub pid: Pid,
    pub op: IoOp,
    pub offs: u64,
    pub len: u64,
}

impl IoRequest {
    pub fn encode(&self) -> [u8; IO_REQUEST_SIZE] {
        let op = match self.op {
            IoOp::Read => IO_READ,
            IoOp::Write => IO_WRITE,
        };
        let mut buf = [0; IO_REQUEST_SIZE];
        put(&mut buf, 0, &self.pid.as_raw().to_le_bytes());
        put(&mut buf, 4, &op.to_le_bytes());
        put(&mut buf, 8, &self.offs.to_le_bytes());
        put(&mut buf, 16, &self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<IoRequest, ProtocolMismatch> {
        if buf.len() != IO_REQUEST_SIZE {
            return Err(mismatch(format!("io request of {} bytes", buf.len())));
        }
        let op = match get_i32(buf, 4) {
            IO_READ => IoOp::Read,
            IO_WRITE => IoOp::Write,
            op => return Err(mismatch(format!("unknown io op {}", op))),
        };
        Ok(IoRequest {
            pid: Pid::from_raw(get_i32(buf, 0)),
            op,
            offs: get_u64(buf, 8),
            len: get_u64(buf, 16),
        })
    }
}

/// The requests a daemon can make of the engine.
#[derive(Debug)]
pub enum Ioctl<'a> {
    Attach(Pid),
    Detach(Pid),
    Answer(Answer),
    Io(IoRequest, &'a mut [u8]),
    Policy(&'a mut PolicyRequest),
    /// Ask for the process' emulation and credentials to be sent again.
    Report(Pid),
}

impl Ioctl<'_> {
    pub fn code(&self) -> u32 {
        match self {
            Ioctl::Attach(_) => STRIOCATTACH,
            Ioctl::Detach(_) => STRIOCDETACH,
            Ioctl::Answer(_) => STRIOCANSWER,
            Ioctl::Io(..) => STRIOCIO,
            Ioctl::Policy(_) => STRIOCPOLICY,
            Ioctl::Report(_) => STRIOCREPORT,
        }
    }
}
