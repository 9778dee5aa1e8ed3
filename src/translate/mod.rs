// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Turning raw syscall argument words into text that policies match on and audit logs show.
//!
//! Each bound argument has a [`Translation`]. Rendering is two steps: `translate` pulls whatever
//! the argument points at out of the traced process into an owned [`Translated`] value, and
//! `print` turns that value into text. Scalar translations just wrap the word. Because `print`
//! only accepts a `Translated`, it can't run ahead of `translate`.

mod print;
mod remote;
pub mod structures;

pub use print::{
    print_fcntlcmd, print_gname, print_memprot, print_modeflags, print_oflags, print_pidname,
    print_signame, print_sockdom, print_socktype, print_uname,
};
pub use remote::{translate_argv, translate_at_filename, translate_filename, translate_sockaddr};

use crate::{abi::Abi, errors::TranslationReadError, pod::ProcessMemory, SyscallKey};
use bstr::{BString, ByteSlice};
use nix::unistd::Pid;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

/// The bound on rendered text, including the terminating NUL of the C form.
pub const MAX_RENDER_LEN: usize = 2048;

/// What an argument renders as when reading it out of the process failed.
pub const UNAVAILABLE: &str = "<unavailable>";

/// How one syscall argument is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Translation {
    Number,
    OpenFlags(Abi),
    Mode,
    Uid,
    Gid,
    PidName,
    SigName(Abi),
    FcntlCmd(Abi),
    MemProt(Abi),
    SockDomain(Abi),
    SockType(Abi),
    Filename,
    /// A path relative to the directory descriptor in the preceding argument, as the `*at` calls
    /// take it. Conditions see it as a `filename`.
    AtFilename,
    Argv,
    /// A socket address; its length is the following argument.
    SockAddr(Abi),
}

/// The decoded form of one argument, owned for the duration of one rendered call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Translated {
    Scalar(u64),
    Bytes(BString),
}

/// Looks up the names of traced processes, for rendering pids.
pub trait ProcessNames {
    fn process_name(&self, pid: Pid) -> Option<String>;
}

impl ProcessNames for HashMap<Pid, String> {
    fn process_name(&self, pid: Pid) -> Option<String> {
        self.get(&pid).cloned()
    }
}

/// Everything a translation may consult about the process that made the call.
pub struct RenderContext<'a> {
    pub pid: Pid,
    pub memory: &'a dyn ProcessMemory,
    pub processes: &'a dyn ProcessNames,
}

impl Translation {
    /// Looks up a translation by the tag used in catalogs. The ABI selects the constant set for
    /// the tags that need one.
    pub fn from_tag(tag: &str, abi: Abi) -> Option<Translation> {
        let translation = match tag {
            "number" => Translation::Number,
            "oflags" => Translation::OpenFlags(abi),
            "mode" => Translation::Mode,
            "uid" => Translation::Uid,
            "gid" => Translation::Gid,
            "pidname" => Translation::PidName,
            "signame" => Translation::SigName(abi),
            "cmd" => Translation::FcntlCmd(abi),
            "prot" => Translation::MemProt(abi),
            "sockdom" => Translation::SockDomain(abi),
            "socktype" => Translation::SockType(abi),
            "filename" => Translation::Filename,
            "atfilename" => Translation::AtFilename,
            "argv" => Translation::Argv,
            "sockaddr" => Translation::SockAddr(abi),
            _ => return None,
        };
        Some(translation)
    }

    /// The tag naming what this argument means.
    pub fn name(&self) -> &'static str {
        match self {
            Translation::Number => "number",
            Translation::OpenFlags(_) => "oflags",
            Translation::Mode => "mode",
            Translation::Uid => "uid",
            Translation::Gid => "gid",
            Translation::PidName => "pidname",
            Translation::SigName(_) => "signame",
            Translation::FcntlCmd(_) => "cmd",
            Translation::MemProt(_) => "prot",
            Translation::SockDomain(_) => "sockdom",
            Translation::SockType(_) => "socktype",
            Translation::Filename | Translation::AtFilename => "filename",
            Translation::Argv => "argv",
            Translation::SockAddr(_) => "sockaddr",
        }
    }

    /// Pulls the argument's data out of the process. `prev` and `next` are the neighbouring
    /// argument words: a directory descriptor before a path, a length after a socket address.
    pub fn translate(
        &self,
        ctx: &RenderContext,
        raw: u64,
        prev: Option<u64>,
        next: Option<u64>,
    ) -> Result<Translated, TranslationReadError> {
        match *self {
            Translation::Filename => translate_filename(ctx, raw).map(Translated::Bytes),
            Translation::AtFilename => {
                translate_at_filename(ctx, prev, raw).map(Translated::Bytes)
            }
            Translation::Argv => translate_argv(ctx, raw).map(Translated::Bytes),
            Translation::SockAddr(abi) => {
                translate_sockaddr(ctx, abi, raw, next).map(Translated::Bytes)
            }
            _ => Ok(Translated::Scalar(raw)),
        }
    }

    /// Renders a translated value. Total: every value renders as something.
    pub fn print(&self, ctx: &RenderContext, value: &Translated) -> String {
        let raw = match value {
            Translated::Bytes(bytes) => return bytes.to_str_lossy().into_owned(),
            Translated::Scalar(raw) => *raw,
        };

        // Scalar arguments are C ints; the upper half of the register is garbage.
        let int = raw as i32;
        match *self {
            Translation::Number => (raw as i64).to_string(),
            Translation::OpenFlags(abi) => print_oflags(int, abi),
            Translation::Mode => print_modeflags(int),
            Translation::Uid => print_uname(raw as u32),
            Translation::Gid => print_gname(raw as u32),
            Translation::PidName => print_pidname(ctx.processes, int),
            Translation::SigName(abi) => print_signame(int, abi),
            Translation::FcntlCmd(abi) => print_fcntlcmd(int, abi),
            Translation::MemProt(abi) => print_memprot(int, abi),
            Translation::SockDomain(abi) => print_sockdom(int, abi),
            Translation::SockType(abi) => print_socktype(int, abi),
            // A remote translation handed a scalar: show the pointer.
            Translation::Filename
            | Translation::AtFilename
            | Translation::Argv
            | Translation::SockAddr(_) => {
                format!("0x{:x}", raw)
            }
        }
    }

    /// The policy name the call should be filed under, when this argument decides it.
    pub fn alias_hint(&self, value: &Translated) -> Option<&'static str> {
        match (self, value) {
            (Translation::OpenFlags(abi), Translated::Scalar(raw)) => {
                let flags = abi.open_flags();
                if (*raw as i32) & flags.accmode == flags.rdonly {
                    Some("fsread")
                } else {
                    Some("fswrite")
                }
            }
            _ => None,
        }
    }
}

/// A text buffer that never grows to `MAX_RENDER_LEN` bytes. Writes past the bound are cut at a
/// character boundary, leaving room for the NUL of the C form.
#[derive(Debug, Default)]
pub struct RenderBuf {
    text: String,
    truncated: bool,
}

impl RenderBuf {
    pub fn new() -> RenderBuf {
        RenderBuf::default()
    }

    pub fn push_str(&mut self, s: &str) {
        let room = MAX_RENDER_LEN - 1 - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.truncated = true;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// The C form: the text followed by exactly one NUL.
    pub fn to_bytes_with_nul(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(0);
        bytes
    }
}

impl fmt::Write for RenderBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}

/// One rendered argument of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedArg {
    pub index: usize,
    pub name: &'static str,
    pub value: String,
    pub alias_hint: Option<&'static str>,
}

/// The argument bindings of every registered syscall.
#[derive(Debug, Default)]
pub struct TranslationTable {
    bindings: HashMap<SyscallKey, BTreeMap<usize, Translation>>,
}

impl TranslationTable {
    pub fn new() -> TranslationTable {
        TranslationTable::default()
    }

    /// Binds `translation` to argument `index` of the syscall. A later registration for the same
    /// argument replaces an earlier one.
    pub fn register(&mut self, platform: &str, name: &str, index: usize, translation: Translation) {
        let replaced = self
            .bindings
            .entry(SyscallKey::new(platform, name))
            .or_default()
            .insert(index, translation);
        if let Some(old) = replaced {
            log::debug!(
                "Replacing {} translation of {}-{} argument {} with {}",
                old.name(),
                platform,
                name,
                index,
                translation.name()
            );
        }
    }

    pub fn get(&self, platform: &str, name: &str, index: usize) -> Option<Translation> {
        self.bindings
            .get(&SyscallKey::new(platform, name))
            .and_then(|args| args.get(&index))
            .copied()
    }

    /// Whether any argument of the syscall is bound.
    pub fn has_bindings(&self, platform: &str, name: &str) -> bool {
        self.bindings
            .get(&SyscallKey::new(platform, name))
            .map_or(false, |args| !args.is_empty())
    }

    /// Renders one argument. Unbound arguments render as plain numbers.
    pub fn render(
        &self,
        platform: &str,
        name: &str,
        index: usize,
        raw: u64,
        ctx: &RenderContext,
    ) -> String {
        let translation = self
            .get(platform, name, index)
            .unwrap_or(Translation::Number);
        render_one(translation, index, raw, None, None, ctx).value
    }

    /// Renders every bound argument of a call, in argument order.
    pub fn render_args(
        &self,
        platform: &str,
        name: &str,
        args: &[u64],
        ctx: &RenderContext,
    ) -> Vec<RenderedArg> {
        let bound = match self.bindings.get(&SyscallKey::new(platform, name)) {
            Some(bound) => bound,
            None => return Vec::new(),
        };
        bound
            .iter()
            .map(|(&index, &translation)| {
                let raw = args.get(index).copied().unwrap_or(0);
                let prev = index.checked_sub(1).and_then(|prev| args.get(prev)).copied();
                let next = args.get(index + 1).copied();
                render_one(translation, index, raw, prev, next, ctx)
            })
            .collect()
    }
}

fn render_one(
    translation: Translation,
    index: usize,
    raw: u64,
    prev: Option<u64>,
    next: Option<u64>,
    ctx: &RenderContext,
) -> RenderedArg {
    let (value, alias_hint) = match translation.translate(ctx, raw, prev, next) {
        Ok(translated) => {
            let mut buf = RenderBuf::new();
            buf.push_str(&translation.print(ctx, &translated));
            (buf.into_string(), translation.alias_hint(&translated))
        }
        Err(err) => {
            log::debug!("{} (pid {}); rendering as {}", err, ctx.pid, UNAVAILABLE);
            (UNAVAILABLE.to_string(), None)
        }
    };
    RenderedArg {
        index,
        name: translation.name(),
        value,
        alias_hint,
    }
}
