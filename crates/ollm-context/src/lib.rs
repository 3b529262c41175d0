//! Context manager.
//!
//! An in-memory, priority-ordered set of ambient facts — from hooks,
//! extensions, the user, or the system itself — rendered as a suffix
//! appended to the system prompt.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use chrono::Utc;
use ollm_core::{ContextEntry, ContextSource};

struct Entry {
    insertion_index: u64,
    entry: ContextEntry,
}

/// Priority-ordered store of [`ContextEntry`] values, keyed by `key`.
#[derive(Default)]
pub struct ContextManager {
    entries: Vec<Entry>,
    next_index: u64,
}

impl ContextManager {
    /// Construct an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the entry at `key`.
    ///
    /// Replacing an existing key keeps its original insertion position for
    /// tie-breaking purposes.
    pub fn add_context(
        &mut self,
        key: impl Into<String>,
        content: impl Into<String>,
        priority: i64,
        source: ContextSource,
    ) {
        let key = key.into();
        let new_entry = ContextEntry {
            key: key.clone(),
            content: content.into(),
            priority,
            source,
            timestamp: Utc::now(),
        };

        if let Some(existing) = self.entries.iter_mut().find(|e| e.entry.key == key) {
            existing.entry = new_entry;
        } else {
            let insertion_index = self.next_index;
            self.next_index += 1;
            self.entries.push(Entry {
                insertion_index,
                entry: new_entry,
            });
        }
    }

    /// Remove the entry at `key`, if present.
    pub fn remove_context(&mut self, key: &str) {
        self.entries.retain(|e| e.entry.key != key);
    }

    /// All entries, in insertion order.
    #[must_use]
    pub fn get_context(&self) -> Vec<ContextEntry> {
        self.entries.iter().map(|e| e.entry.clone()).collect()
    }

    /// Entries from a given source, in insertion order.
    #[must_use]
    pub fn get_context_by_source(&self, source: ContextSource) -> Vec<ContextEntry> {
        self.entries
            .iter()
            .filter(|e| e.entry.source == source)
            .map(|e| e.entry.clone())
            .collect()
    }

    /// Remove every entry.
    pub fn clear_context(&mut self) {
        self.entries.clear();
    }

    /// Render the system prompt suffix: entries sorted by descending
    /// priority (ties broken by insertion order, then by key), joined with
    /// a blank line between items. Empty manager renders the empty string.
    #[must_use]
    pub fn get_system_prompt_additions(&self) -> String {
        let mut ordered: Vec<&Entry> = self.entries.iter().collect();
        ordered.sort_by(|a, b| {
            b.entry
                .priority
                .cmp(&a.entry.priority)
                .then(a.insertion_index.cmp(&b.insertion_index))
                .then(a.entry.key.cmp(&b.entry.key))
        });
        ordered
            .iter()
            .map(|e| e.entry.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
