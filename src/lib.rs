// SPDX-FileCopyrightText: 2022-2024 Smart Information Flow Technologies
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

pub mod abi;
pub mod alias;
pub mod daemon;
pub mod engine;
pub mod errors;
pub mod pending;
pub mod pod;
pub mod policy;
pub mod protocol;
pub mod registration;
pub mod translate;

use policy::PolicySet;
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize, Serialize, Serializer,
};
use std::{collections::HashMap, fmt, path::PathBuf};

/// Identifies a syscall on one platform (ABI), e.g. `native-open` or `linux-openat`. Policy names
/// are keys too: `native-fsread` is the policy shared by the read-only file syscalls.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyscallKey {
    pub platform: String,
    pub name: String,
}

impl SyscallKey {
    pub fn new(platform: &str, name: &str) -> SyscallKey {
        SyscallKey {
            platform: platform.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for SyscallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.platform, self.name)
    }
}

#[derive(Debug, Deserialize)]
pub struct SystraceSpec {
    /// The binary to run under the tracer. This must be an absolute path.
    pub binary: PathBuf,

    /// The arguments the binary should be run with. These *include* `argv[0]`!
    pub args: Vec<String>,

    /// The environment variables the binary should be run with. Nothing is inherited from the
    /// tracer's environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// The directory the binary should be run in. This must be an absolute path.
    pub cwd: PathBuf,

    /// The rules the policy daemon decides with.
    pub policy: PolicySet,

    /// An extra syscall catalog, registered after the built-in one.
    #[serde(default)]
    pub catalog: Option<PathBuf>,

    /// How long a traced call may wait for its answer before it is denied.
    #[serde(default = "default_orphan_timeout_ms")]
    pub orphan_timeout_ms: u64,

    /// The number of policy daemon threads.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Cache decisions that don't depend on a call's arguments.
    #[serde(default = "default_cache_decisions")]
    pub cache_decisions: bool,

    /// Record the result of every permitted call. This turns off caching.
    #[serde(default)]
    pub report_results: bool,
}

fn default_orphan_timeout_ms() -> u64 {
    10_000
}

fn default_workers() -> usize {
    4
}

fn default_cache_decisions() -> bool {
    true
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct U64AsString(pub u64);

impl From<u64> for U64AsString {
    fn from(value: u64) -> Self {
        U64AsString(value)
    }
}

impl From<U64AsString> for u64 {
    fn from(value: U64AsString) -> u64 {
        value.0
    }
}

impl<'de> Deserialize<'de> for U64AsString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = U64AsString;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("U64 as a number or string")
            }

            fn visit_u64<E>(self, id: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(U64AsString(id))
            }

            fn visit_str<E>(self, id: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                id.parse().map(U64AsString).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

impl Serialize for U64AsString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{SystraceSpec, U64AsString};

    #[test]
    fn u64_as_string_accepts_both_forms() {
        let from_number: U64AsString = serde_json::from_str("18446744073709551615").unwrap();
        let from_string: U64AsString = serde_json::from_str("\"18446744073709551615\"").unwrap();
        assert_eq!(from_number, U64AsString(u64::MAX));
        assert_eq!(from_string, U64AsString(u64::MAX));
        assert_eq!(
            serde_json::to_string(&U64AsString(7)).unwrap(),
            "\"7\"".to_string()
        );
    }

    #[test]
    fn spec_defaults() {
        let spec: SystraceSpec = serde_json::from_str(
            r#"{
                "binary": "/bin/ls",
                "args": ["ls", "-l"],
                "cwd": "/tmp",
                "policy": { "default": "deny" }
            }"#,
        )
        .unwrap();
        assert_eq!(spec.orphan_timeout_ms, 10_000);
        assert_eq!(spec.workers, 4);
        assert!(spec.env.is_empty());
        assert!(spec.catalog.is_none());
        assert!(spec.cache_decisions);
        assert!(!spec.report_results);
    }
}
