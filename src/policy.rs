// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Policies: the engine-side cache of decisions, and the daemon-side rules that make them.

use crate::{protocol::Decision, registration::RenderedCall, SyscallKey};
use anyhow::{bail, ensure, Context, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The largest syscall table a policy may cover.
pub const MAX_POLICY_ENTRIES: i32 = 1024;

#[derive(Debug)]
struct Policy {
    maxents: i32,
    entries: HashMap<i32, Decision>,
    refcount: usize,
}

/// Numbered decision tables that processes are assigned to. A call whose decision is cached
/// doesn't need to ask the daemon.
#[derive(Debug, Default)]
pub struct PolicyCache {
    policies: BTreeMap<i16, Policy>,
    assignments: HashMap<Pid, i16>,
}

impl PolicyCache {
    pub fn new() -> PolicyCache {
        PolicyCache::default()
    }

    /// Creates an empty policy covering syscall codes `0..maxents`, returning its number.
    pub fn new_policy(&mut self, maxents: i32) -> Result<i16> {
        ensure!(
            0 < maxents && maxents <= MAX_POLICY_ENTRIES,
            "Bad policy size {}",
            maxents
        );
        let num = (0..=i16::MAX)
            .find(|num| !self.policies.contains_key(num))
            .context("Out of policy numbers")?;
        self.policies.insert(
            num,
            Policy {
                maxents,
                entries: HashMap::new(),
                refcount: 0,
            },
        );
        log::trace!("New policy {} with {} entries", num, maxents);
        Ok(num)
    }

    /// Assigns a process to a policy. Returns the number of its previous policy if that one is
    /// now unused and was freed.
    pub fn assign(&mut self, pid: Pid, num: i16) -> Result<Option<i16>> {
        match self.policies.get_mut(&num) {
            Some(policy) => policy.refcount += 1,
            None => bail!("No policy {} to assign pid {} to", num, pid),
        }
        Ok(match self.assignments.insert(pid, num) {
            Some(old) => self.unref(old),
            None => None,
        })
    }

    /// Caches a decision for one syscall code. Caching `Ask` removes the entry.
    pub fn modify(&mut self, num: i16, code: i32, decision: Decision) -> Result<()> {
        let policy = self
            .policies
            .get_mut(&num)
            .with_context(|| format!("No policy {} to modify", num))?;
        ensure!(
            0 <= code && code < policy.maxents,
            "Syscall {} is outside policy {}",
            code,
            num
        );
        match decision {
            Decision::Ask => policy.entries.remove(&code),
            decision => policy.entries.insert(code, decision),
        };
        Ok(())
    }

    /// The cached decision for a call; `Ask` if there is none.
    pub fn lookup(&self, pid: Pid, code: i32) -> Decision {
        self.assignments
            .get(&pid)
            .and_then(|num| self.policies.get(num))
            .and_then(|policy| policy.entries.get(&code))
            .copied()
            .unwrap_or(Decision::Ask)
    }

    pub fn policy_of(&self, pid: Pid) -> Option<i16> {
        self.assignments.get(&pid).copied()
    }

    /// A child starts out with its parent's policy.
    pub fn inherit(&mut self, parent: Pid, child: Pid) {
        if let Some(num) = self.policy_of(parent) {
            if let Some(policy) = self.policies.get_mut(&num) {
                policy.refcount += 1;
                self.assignments.insert(child, num);
            }
        }
    }

    /// Drops a process' assignment. Returns the policy number if that freed the policy.
    pub fn release(&mut self, pid: Pid) -> Option<i16> {
        let num = self.assignments.remove(&pid)?;
        self.unref(num)
    }

    fn unref(&mut self, num: i16) -> Option<i16> {
        let policy = self.policies.get_mut(&num)?;
        policy.refcount = policy.refcount.saturating_sub(1);
        if policy.refcount == 0 {
            self.policies.remove(&num);
            log::trace!("Freed policy {}", num);
            Some(num)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Permit,
    Deny,
}

impl Default for Action {
    fn default() -> Action {
        Action::Deny
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Neq,
    /// The value contains the operand.
    Sub,
    Nsub,
    /// The value is the operand path or lies below it.
    Inpath,
}

impl Op {
    pub fn matches(self, value: &str, operand: &str) -> bool {
        match self {
            Op::Eq => value == operand,
            Op::Neq => value != operand,
            Op::Sub => value.contains(operand),
            Op::Nsub => !value.contains(operand),
            Op::Inpath => {
                let dir = operand.trim_end_matches('/');
                value == operand
                    || value
                        .strip_prefix(dir)
                        .map_or(false, |rest| rest.starts_with('/'))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// The translation tag of the arguments to test, e.g. `filename`.
    pub arg: String,
    pub op: Op,
    pub value: String,
}

impl Condition {
    /// Holds when the call has at least one argument with the tag, and all of them match.
    pub fn holds(&self, call: &RenderedCall) -> bool {
        let mut values = call.values(&self.arg).peekable();
        values.peek().is_some() && values.all(|value| self.op.matches(value, &self.value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: Action,
    /// The errno a denied call fails with, instead of `EPERM`.
    #[serde(default)]
    pub errno: Option<i32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Rule {
    pub fn matches(&self, call: &RenderedCall) -> bool {
        self.conditions.iter().all(|condition| condition.holds(call))
    }
}

/// Rules keyed by policy name, e.g. `native-fsread`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub default: Action,
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<Rule>>,
}

/// The outcome of evaluating a call against a rule set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub action: Action,
    pub errno: Option<i32>,
    /// `name[index]` of the rule that matched; `None` for the default.
    pub rule: Option<String>,
    /// Whether the outcome would be the same whatever the call's arguments.
    pub unconditional: bool,
}

impl PolicySet {
    pub fn rules_for(&self, key: &SyscallKey) -> &[Rule] {
        self.rules
            .get(&key.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First match wins: the rules of the call's policy name (its alias target), then those of
    /// the call itself, then the default.
    pub fn evaluate(&self, call: &RenderedCall) -> Evaluation {
        let mut names = vec![&call.policy];
        if call.policy != call.syscall {
            names.push(&call.syscall);
        }

        let mut conditional = false;
        for key in names {
            for (index, rule) in self.rules_for(key).iter().enumerate() {
                conditional |= !rule.conditions.is_empty();
                if rule.matches(call) {
                    return Evaluation {
                        action: rule.action,
                        errno: rule.errno,
                        rule: Some(format!("{}[{}]", key, index)),
                        unconditional: !conditional,
                    };
                }
            }
        }
        Evaluation {
            action: self.default,
            errno: None,
            rule: None,
            unconditional: !conditional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, Op, PolicyCache, PolicySet};
    use crate::{
        protocol::Decision, registration::RenderedCall, translate::RenderedArg, SyscallKey,
    };
    use nix::unistd::Pid;

    fn call(syscall: (&str, &str), policy: (&str, &str), args: &[(&'static str, &str)]) -> RenderedCall {
        RenderedCall {
            syscall: SyscallKey::new(syscall.0, syscall.1),
            policy: SyscallKey::new(policy.0, policy.1),
            args: args
                .iter()
                .enumerate()
                .map(|(index, &(name, value))| RenderedArg {
                    index,
                    name,
                    value: value.to_string(),
                    alias_hint: None,
                })
                .collect(),
        }
    }

    const RULES: &str = r#"{
        "default": "deny",
        "rules": {
            "native-fsread": [
                { "action": "deny", "errno": 2,
                  "conditions": [ { "arg": "filename", "op": "inpath", "value": "/etc/ssh" } ] },
                { "action": "permit",
                  "conditions": [ { "arg": "filename", "op": "inpath", "value": "/etc" } ] }
            ],
            "native-open": [
                { "action": "permit",
                  "conditions": [ { "arg": "filename", "op": "eq", "value": "/dev/null" } ] }
            ],
            "native-rename": [
                { "action": "permit",
                  "conditions": [ { "arg": "filename", "op": "sub", "value": "/tmp/" } ] }
            ],
            "native-getpid": [ { "action": "permit" } ]
        }
    }"#;

    #[test]
    fn first_match_wins_with_alias_rules_first() {
        let rules: PolicySet = serde_json::from_str(RULES).unwrap();
        let open = |path| {
            call(("native", "open"), ("native", "fsread"), &[("filename", path), ("oflags", "ro")])
        };

        let eval = rules.evaluate(&open("/etc/passwd"));
        assert_eq!(eval.action, Action::Permit);
        assert_eq!(eval.rule.as_deref(), Some("native-fsread[1]"));
        assert!(!eval.unconditional);

        let eval = rules.evaluate(&open("/etc/ssh/ssh_host_key"));
        assert_eq!((eval.action, eval.errno), (Action::Deny, Some(2)));

        // Falls through the alias rules to the syscall's own
        let eval = rules.evaluate(&open("/dev/null"));
        assert_eq!(eval.rule.as_deref(), Some("native-open[0]"));

        let eval = rules.evaluate(&open("/etcetera"));
        assert_eq!((eval.action, eval.rule), (Action::Deny, None));
    }

    #[test]
    fn conditions_need_every_tagged_argument() {
        let rules: PolicySet = serde_json::from_str(RULES).unwrap();
        let rename = |from, to| {
            call(("native", "rename"), ("native", "rename"), &[("filename", from), ("filename", to)])
        };
        assert_eq!(rules.evaluate(&rename("/tmp/a", "/tmp/b")).action, Action::Permit);
        assert_eq!(rules.evaluate(&rename("/tmp/a", "/home/b")).action, Action::Deny);
        // No filename argument at all
        assert_eq!(
            rules.evaluate(&call(("native", "rename"), ("native", "rename"), &[])).action,
            Action::Deny
        );
    }

    #[test]
    fn unconditional_outcomes() {
        let rules: PolicySet = serde_json::from_str(RULES).unwrap();
        let getpid = rules.evaluate(&call(("native", "getpid"), ("native", "getpid"), &[]));
        assert_eq!(getpid.action, Action::Permit);
        assert!(getpid.unconditional);
        let other = rules.evaluate(&call(("native", "sync"), ("native", "sync"), &[]));
        assert_eq!(other.action, Action::Deny);
        assert!(other.unconditional);
    }

    #[test]
    fn ops() {
        assert!(Op::Inpath.matches("/etc", "/etc"));
        assert!(Op::Inpath.matches("/etc/passwd", "/etc/"));
        assert!(Op::Inpath.matches("/anything", "/"));
        assert!(!Op::Inpath.matches("/etcetera", "/etc"));
        assert!(Op::Neq.matches("a", "b"));
        assert!(Op::Nsub.matches("/usr/lib", "/tmp"));
        assert_eq!(PolicySet::default().default, Action::Deny);
    }

    #[test]
    fn cache_lookup_and_modify() {
        let mut cache = PolicyCache::new();
        let pid = Pid::from_raw(50);
        assert_eq!(cache.lookup(pid, 5), Decision::Ask);

        let num = cache.new_policy(512).unwrap();
        assert_eq!(cache.assign(pid, num).unwrap(), None);
        cache.modify(num, 20, Decision::Permit).unwrap();
        cache.modify(num, 59, Decision::Never).unwrap();
        assert_eq!(cache.lookup(pid, 20), Decision::Permit);
        assert_eq!(cache.lookup(pid, 59), Decision::Never);
        assert_eq!(cache.lookup(pid, 5), Decision::Ask);

        cache.modify(num, 20, Decision::Ask).unwrap();
        assert_eq!(cache.lookup(pid, 20), Decision::Ask);

        assert!(cache.modify(num, 512, Decision::Permit).is_err());
        assert!(cache.modify(num + 1, 1, Decision::Permit).is_err());
        assert!(cache.assign(pid, num + 1).is_err());
        assert!(cache.new_policy(0).is_err());
    }

    #[test]
    fn children_inherit_and_policies_are_freed() {
        let mut cache = PolicyCache::new();
        let parent = Pid::from_raw(60);
        let child = Pid::from_raw(61);
        let num = cache.new_policy(64).unwrap();
        cache.assign(parent, num).unwrap();
        cache.modify(num, 3, Decision::Permit).unwrap();

        cache.inherit(parent, child);
        assert_eq!(cache.policy_of(child), Some(num));
        assert_eq!(cache.lookup(child, 3), Decision::Permit);

        assert_eq!(cache.release(parent), None);
        assert_eq!(cache.release(child), Some(num));
        assert!(cache.is_empty());
        assert_eq!(cache.release(child), None);

        // Reassigning frees the old policy
        let first = cache.new_policy(64).unwrap();
        let second = cache.new_policy(64).unwrap();
        assert_ne!(first, second);
        cache.assign(parent, first).unwrap();
        assert_eq!(cache.assign(parent, second).unwrap(), Some(first));
        assert_eq!(cache.len(), 1);
    }
}
