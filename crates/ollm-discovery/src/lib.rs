//! Ignore-aware file discovery and change watching.
//!
//! Discovery composes three layers of ignore rules: a built-in deny list
//! (`node_modules`, `.git`, `dist`, `build`, `.next`, `.cache`),
//! `.gitignore`, and an optional `.ollmignore` for rules specific to this
//! runtime. Watching is a thin wrapper over `notify`; dropping the returned
//! [`Subscription`] tears the underlying watch down, and a watcher that
//! fails to start degrades to a no-op subscription rather than raising.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::WalkBuilder;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use ollm_core::{FileEntry, FileKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Directory name patterns always excluded, regardless of `.gitignore`.
const BUILTIN_DENY_PATTERNS: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/.next/**",
    "**/.cache/**",
];

const CUSTOM_IGNORE_FILENAME: &str = ".ollmignore";

/// Errors raised by [`FileDiscoverer::new`] and [`FileDiscoverer::discover_all`].
///
/// Watcher failures are deliberately not part of this type: per contract,
/// [`FileDiscoverer::watch_changes`] degrades to a no-op subscription
/// instead of raising.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A directory walk failed, e.g. a permission error or a symlink cycle.
    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),
    /// A built-in or configured ignore pattern failed to compile as a glob.
    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] globset::Error),
}

/// Discovery configuration.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// Maximum depth below the root; `None` is unbounded. Depth 0 means
    /// only entries directly inside the root.
    pub max_depth: Option<usize>,
    /// If set, only entries matching at least one of these gitignore-syntax
    /// patterns are returned (applied after exclusion).
    pub include_patterns: Vec<String>,
    /// Additional gitignore-syntax patterns to exclude, beyond the built-in
    /// deny list and any `.gitignore` / `.ollmignore` files.
    pub exclude_patterns: Vec<String>,
    /// Follow symlinks during the walk. Cycles are still detected and
    /// terminate the walk with an error rather than recursing forever.
    pub follow_symlinks: bool,
}

/// A single filesystem change observed by [`FileDiscoverer::watch_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new file or directory appeared.
    Add(PathBuf),
    /// An existing file's contents or metadata changed.
    Change(PathBuf),
    /// A file or directory was removed.
    Unlink(PathBuf),
}

/// A disposable watch subscription. Dropping it, or calling
/// [`Subscription::dispose`], stops further events from reaching this
/// subscription's callback.
pub struct Subscription {
    _watcher: Option<RecommendedWatcher>,
}

impl Subscription {
    fn noop() -> Self {
        Self { _watcher: None }
    }

    /// Detach this subscription. No further events fire afterwards.
    pub fn dispose(self) {
        drop(self);
    }
}

/// Pure predicate: does `path` match any of `patterns` (shell-style globs)?
/// An empty pattern list or an empty path always returns false.
#[must_use]
pub fn should_ignore(path: &Path, patterns: &[String]) -> bool {
    if patterns.is_empty() || path.as_os_str().is_empty() {
        return false;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            },
            Err(err) => warn!(pattern, error = %err, "ignoring invalid glob in should_ignore"),
        }
    }
    match builder.build() {
        Ok(set) => set.is_match(path),
        Err(_) => false,
    }
}

/// Walks a root directory, composing built-in, `.gitignore`, and
/// `.ollmignore` rules, and can watch it for subsequent changes.
pub struct FileDiscoverer {
    root: PathBuf,
    config: DiscoveryConfig,
    builtin_deny: GlobSet,
    include: Option<GlobSet>,
    gitignore: Gitignore,
}

impl FileDiscoverer {
    /// Build a discoverer rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Pattern`] if any configured pattern is not
    /// a valid glob.
    pub fn new(root: impl Into<PathBuf>, config: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let root = root.into();

        let mut builtin = GlobSetBuilder::new();
        for pattern in BUILTIN_DENY_PATTERNS {
            builtin.add(Glob::new(pattern)?);
        }
        let builtin_deny = builtin.build()?;

        let include = if config.include_patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.include_patterns {
                builder.add(Glob::new(pattern)?);
            }
            Some(builder.build()?)
        };

        let mut gitignore_builder = GitignoreBuilder::new(&root);
        gitignore_builder.add(root.join(".gitignore"));
        gitignore_builder.add(root.join(CUSTOM_IGNORE_FILENAME));
        for pattern in &config.exclude_patterns {
            gitignore_builder.add_line(None, pattern)?;
        }
        let gitignore = gitignore_builder.build()?;

        Ok(Self {
            root,
            config,
            builtin_deny,
            include,
            gitignore,
        })
    }

    fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        if self.builtin_deny.is_match(path) {
            return true;
        }
        if self.gitignore.matched(path, is_dir).is_ignore() {
            return true;
        }
        if let Some(include) = &self.include {
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            return !include.is_match(relative);
        }
        false
    }

    /// Walk the root and return every non-ignored file and directory entry.
    ///
    /// Symlinks are followed only when `config.follow_symlinks` is set;
    /// cycles are detected by the underlying walker either way and
    /// surfaced as [`DiscoveryError::Walk`] rather than looping forever.
    /// Inaccessible directories are skipped with a debug log.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Walk`] if the walk itself fails outright
    /// (e.g. the root does not exist).
    pub fn discover_all(&self) -> Result<Vec<FileEntry>, DiscoveryError> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .parents(false)
            .follow_links(self.config.follow_symlinks)
            .add_custom_ignore_filename(CUSTOM_IGNORE_FILENAME);
        if let Some(depth) = self.config.max_depth {
            // `ignore` counts the root itself as depth 0.
            builder.max_depth(Some(depth + 1));
        }

        let mut entries = Vec::new();
        let mut visited_inodes: HashSet<u64> = HashSet::new();

        for result in builder.build() {
            let dir_entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(error = %err, "skipping inaccessible path during discovery");
                    continue;
                },
            };
            let path = dir_entry.path();
            if path == self.root {
                continue;
            }

            let Ok(metadata) = dir_entry.metadata() else {
                debug!(path = %path.display(), "skipping path with unreadable metadata");
                continue;
            };
            let is_dir = metadata.is_dir();

            if self.config.follow_symlinks {
                let inode = inode_of(&metadata);
                if !visited_inodes.insert(inode) {
                    continue;
                }
            }

            if self.is_excluded(path, is_dir) {
                continue;
            }

            let kind = if is_dir { FileKind::Directory } else { FileKind::File };
            let relative_path = path.strip_prefix(&self.root).unwrap_or(path).to_path_buf();

            entries.push(FileEntry {
                path: path.to_path_buf(),
                relative_path,
                kind,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            });
        }

        Ok(entries)
    }

    /// Watch the root for changes, invoking `on_event` for every add,
    /// change, and unlink observed. Ignored paths never produce events.
    ///
    /// Returns a [`Subscription`] unconditionally: if the underlying
    /// watcher fails to start (root missing, root is a file, OS resource
    /// limits), the failure is logged and a no-op subscription is returned
    /// rather than raising.
    pub fn watch_changes<F>(&self, mut on_event: F) -> Subscription
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let builtin_deny = self.builtin_deny.clone();
        let root = self.root.clone();

        let watcher_result = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "filesystem watch error");
                    return;
                },
            };
            for path in event.paths {
                if builtin_deny.is_match(&path) {
                    continue;
                }
                let mapped = match event.kind {
                    EventKind::Create(_) => Some(ChangeEvent::Add(path)),
                    EventKind::Modify(_) => Some(ChangeEvent::Change(path)),
                    EventKind::Remove(_) => Some(ChangeEvent::Unlink(path)),
                    _ => None,
                };
                if let Some(change) = mapped {
                    on_event(change);
                }
            }
        });

        let mut watcher = match watcher_result {
            Ok(watcher) => watcher,
            Err(err) => {
                warn!(error = %err, root = %root.display(), "failed to create filesystem watcher");
                return Subscription::noop();
            },
        };

        match watcher.watch(&root, RecursiveMode::Recursive) {
            Ok(()) => Subscription {
                _watcher: Some(watcher),
            },
            Err(err) => {
                warn!(error = %err, root = %root.display(), "failed to register watch root");
                Subscription::noop()
            },
        }
    }
}

#[cfg(unix)]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode_of(metadata: &std::fs::Metadata) -> u64 {
    metadata.len() ^ u64::from(metadata.is_dir())
}
