//! Environment variable sanitizer.
//!
//! A pure allow-list / deny-glob filter over a `key -> value` environment
//! map. Used directly by callers that want to inspect a prospective
//! environment, and internally by the shell executor before spawning a
//! child process.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use tracing::warn;

/// Variables kept by default regardless of deny patterns.
pub const DEFAULT_ALLOW_LIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_MONETARY",
    "LC_NUMERIC",
    "LC_TIME",
];

/// Glob patterns that strip a variable unless it's allow-listed.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "*_KEY",
    "*_SECRET",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL",
    "AWS_*",
    "GITHUB_*",
];

struct Compiled {
    allow_list: HashSet<String>,
    deny_patterns: Vec<String>,
    deny_set: GlobSet,
}

fn compile(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

fn default_compiled() -> Compiled {
    let deny_patterns: Vec<String> = DEFAULT_DENY_PATTERNS.iter().map(|s| (*s).to_string()).collect();
    let deny_set = compile(&deny_patterns).expect("default deny patterns are valid globs");
    Compiled {
        allow_list: DEFAULT_ALLOW_LIST.iter().map(|s| (*s).to_string()).collect(),
        deny_patterns,
        deny_set,
    }
}

/// Partial configuration update. `None` fields leave the current setting
/// untouched; `Some(empty)` is treated as invalid and also leaves it
/// untouched (see [`EnvSanitizer::configure`]).
#[derive(Debug, Clone, Default)]
pub struct SanitizerConfig {
    /// Replacement allow list, if present.
    pub allow_list: Option<Vec<String>>,
    /// Replacement deny glob patterns, if present.
    pub deny_patterns: Option<Vec<String>>,
}

/// Allow-list / deny-glob filter over environment maps.
///
/// Pure with respect to `sanitize`: identical inputs (and identical
/// configuration) give identical outputs. Configuration itself is internally
/// synchronized so the sanitizer can be shared behind an `Arc` across the
/// shell executor's concurrent callers.
pub struct EnvSanitizer {
    inner: RwLock<Compiled>,
}

impl Default for EnvSanitizer {
    fn default() -> Self {
        Self {
            inner: RwLock::new(default_compiled()),
        }
    }
}

impl EnvSanitizer {
    /// Construct a sanitizer with the default allow list and deny patterns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is allow-listed by exact match.
    #[must_use]
    pub fn is_allowed(&self, key: &str) -> bool {
        self.inner.read().unwrap().allow_list.contains(key)
    }

    /// Whether `key` matches any deny glob pattern.
    #[must_use]
    pub fn is_denied(&self, key: &str) -> bool {
        self.inner.read().unwrap().deny_set.is_match(key)
    }

    /// Current allow list, sorted.
    #[must_use]
    pub fn allow_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self.inner.read().unwrap().allow_list.iter().cloned().collect();
        list.sort();
        list
    }

    /// Current deny glob patterns, in configured order.
    #[must_use]
    pub fn deny_patterns(&self) -> Vec<String> {
        self.inner.read().unwrap().deny_patterns.clone()
    }

    /// Replace the allow list and/or deny patterns.
    ///
    /// A list is only replaced when it is non-empty and, for deny patterns,
    /// every pattern compiles as a valid glob. An invalid or empty update is
    /// logged and ignored, leaving the existing configuration in place —
    /// `configure` never raises.
    pub fn configure(&self, update: SanitizerConfig) {
        let mut inner = self.inner.write().unwrap();

        if let Some(allow_list) = update.allow_list {
            if allow_list.is_empty() {
                warn!("ignoring empty allow list in sanitizer configure() call");
            } else {
                inner.allow_list = allow_list.into_iter().collect();
            }
        }

        if let Some(deny_patterns) = update.deny_patterns {
            if deny_patterns.is_empty() {
                warn!("ignoring empty deny pattern list in sanitizer configure() call");
            } else {
                match compile(&deny_patterns) {
                    Ok(deny_set) => {
                        inner.deny_patterns = deny_patterns;
                        inner.deny_set = deny_set;
                    },
                    Err(err) => {
                        warn!(error = %err, "ignoring invalid deny pattern list in sanitizer configure() call");
                    },
                }
            }
        }
    }

    /// Filter `env`, keeping every key that is allow-listed or not matched
    /// by any deny pattern.
    #[must_use]
    pub fn sanitize(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let inner = self.inner.read().unwrap();
        env.iter()
            .filter(|(key, _)| inner.allow_list.contains(*key) || !inner.deny_set.is_match(key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
