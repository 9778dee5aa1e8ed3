// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Aliases file several syscalls under one policy name, so that e.g. `open` for reading and
//! `stat` share the `fsread` rules.
//!
//! Some aliases depend on an argument: `open` is `fsread` or `fswrite` depending on its flags.
//! Each rendered call carries its own hints for that (see [`AliasTable::resolve`]), so concurrent
//! calls never see each other's choice. The shared target only changes through
//! [`AliasTable::switch`].

use crate::{errors::RegistrationError, translate::RenderedArg, SyscallKey};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AliasHandle(usize);

#[derive(Debug)]
struct Alias {
    target: Mutex<SyscallKey>,
    /// Argument indices whose translation can pick a different target name.
    determining: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: Vec<Alias>,
    by_source: HashMap<SyscallKey, usize>,
}

impl AliasTable {
    pub fn new() -> AliasTable {
        AliasTable::default()
    }

    /// Creates an alias from one syscall to a policy name. Registering the same alias twice
    /// returns the existing handle; aliasing one source to two targets is an error.
    pub fn new_alias(
        &mut self,
        src_platform: &str,
        src_name: &str,
        dst_platform: &str,
        dst_name: &str,
    ) -> Result<AliasHandle, RegistrationError> {
        let source = SyscallKey::new(src_platform, src_name);
        let target = SyscallKey::new(dst_platform, dst_name);

        if let Some(&index) = self.by_source.get(&source) {
            let existing = self.aliases[index]
                .target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if existing != target {
                return Err(RegistrationError::new(
                    src_platform,
                    src_name,
                    format!("already aliased to {}, not {}", existing, target),
                ));
            }
            return Ok(AliasHandle(index));
        }

        log::trace!("Aliasing {} to {}", source, target);
        let index = self.aliases.len();
        self.aliases.push(Alias {
            target: Mutex::new(target),
            determining: Vec::new(),
        });
        self.by_source.insert(source, index);
        Ok(AliasHandle(index))
    }

    /// Records that the translation of argument `index` can change which name this alias maps to.
    pub fn add_determining_translation(&mut self, handle: AliasHandle, index: usize) {
        let determining = &mut self.aliases[handle.0].determining;
        if !determining.contains(&index) {
            determining.push(index);
        }
    }

    pub fn determining_translations(&self, handle: AliasHandle) -> &[usize] {
        &self.aliases[handle.0].determining
    }

    pub fn handle(&self, src_platform: &str, src_name: &str) -> Option<AliasHandle> {
        self.by_source
            .get(&SyscallKey::new(src_platform, src_name))
            .copied()
            .map(AliasHandle)
    }

    /// Changes the shared target of an alias. Returns false if the source has no alias.
    pub fn switch(
        &self,
        src_platform: &str,
        src_name: &str,
        dst_platform: &str,
        dst_name: &str,
    ) -> bool {
        match self.handle(src_platform, src_name) {
            Some(handle) => {
                let mut target = self.aliases[handle.0]
                    .target
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *target = SyscallKey::new(dst_platform, dst_name);
                true
            }
            None => false,
        }
    }

    /// The shared target of an alias.
    pub fn lookup(&self, src_platform: &str, src_name: &str) -> Option<SyscallKey> {
        self.handle(src_platform, src_name).map(|handle| {
            self.aliases[handle.0]
                .target
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// The target for one call: a hint from one of the determining arguments picks the name,
    /// otherwise the shared target applies. `None` if the syscall has no alias.
    pub fn resolve(&self, source: &SyscallKey, args: &[RenderedArg]) -> Option<SyscallKey> {
        let handle = self.handle(&source.platform, &source.name)?;
        let alias = &self.aliases[handle.0];
        let target = alias
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let hint = args
            .iter()
            .filter(|arg| alias.determining.contains(&arg.index))
            .find_map(|arg| arg.alias_hint);
        Some(match hint {
            Some(name) => SyscallKey::new(&target.platform, name),
            None => target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::AliasTable;
    use crate::{translate::RenderedArg, SyscallKey};
    use std::{sync::Arc, thread};

    fn flags_arg(hint: &'static str) -> RenderedArg {
        RenderedArg {
            index: 1,
            name: "oflags",
            value: String::new(),
            alias_hint: Some(hint),
        }
    }

    #[test]
    fn switch_then_lookup_reads_own_write() {
        let mut table = AliasTable::new();
        table
            .new_alias("native", "open", "native", "fswrite")
            .unwrap();
        assert!(table.switch("native", "open", "native", "fsread"));
        assert_eq!(
            table.lookup("native", "open"),
            Some(SyscallKey::new("native", "fsread"))
        );
        assert!(!table.switch("native", "close", "native", "fsread"));
        assert_eq!(table.lookup("native", "close"), None);
    }

    #[test]
    fn conflicting_alias_is_rejected() {
        let mut table = AliasTable::new();
        let first = table.new_alias("native", "stat", "native", "fsread").unwrap();
        let again = table.new_alias("native", "stat", "native", "fsread").unwrap();
        assert_eq!(first, again);
        assert!(table
            .new_alias("native", "stat", "native", "fswrite")
            .is_err());
    }

    #[test]
    fn resolve_uses_only_determining_hints() {
        let mut table = AliasTable::new();
        let handle = table
            .new_alias("linux", "open", "native", "fswrite")
            .unwrap();
        let source = SyscallKey::new("linux", "open");

        // Not yet determining: the hint is ignored.
        assert_eq!(
            table.resolve(&source, &[flags_arg("fsread")]),
            Some(SyscallKey::new("native", "fswrite"))
        );

        table.add_determining_translation(handle, 1);
        table.add_determining_translation(handle, 1);
        assert_eq!(table.determining_translations(handle), &[1]);
        assert_eq!(
            table.resolve(&source, &[flags_arg("fsread")]),
            Some(SyscallKey::new("native", "fsread"))
        );
        assert_eq!(table.resolve(&SyscallKey::new("linux", "read"), &[]), None);
    }

    #[test]
    fn concurrent_resolution_is_per_call() {
        let mut table = AliasTable::new();
        let handle = table
            .new_alias("native", "open", "native", "fswrite")
            .unwrap();
        table.add_determining_translation(handle, 1);
        let table = Arc::new(table);

        let workers = ["fsread", "fswrite"]
            .iter()
            .map(|&hint| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    let source = SyscallKey::new("native", "open");
                    for _ in 0..1000 {
                        let target = table.resolve(&source, &[flags_arg(hint)]).unwrap();
                        assert_eq!(target.name, hint);
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
