//! Durable session store.
//!
//! Sessions live as one JSON file per session under a root directory, with
//! a write-through [`DashMap`] cache in front of disk. Writes go through a
//! temp-file-then-rename so a crash mid-write never leaves a torn session
//! file behind; a reader either sees the old file or the new one, never a
//! partial one.

#![deny(unsafe_code)]
#![warn(clippy::all)]

use dashmap::DashMap;
use ollm_core::{Message, Session, SessionSummary, ToolCall};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised by [`SessionStore`] operations.
#[derive(Debug, Error)]
pub enum SessionStoreError {
    /// No session with this id exists on disk.
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    /// The session must be loaded into the cache (via [`SessionStore::create_session`]
    /// or [`SessionStore::get_session`]) before it can be mutated in place.
    #[error("session {0} is not resident in the cache")]
    SessionNotInCache(Uuid),
    /// The on-disk file for a session could not be parsed as a [`Session`].
    #[error("corrupted session file {0}: {1}")]
    CorruptedSession(Uuid, serde_json::Error),
    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON-per-file session store with a write-through cache.
pub struct SessionStore {
    dir: PathBuf,
    cache: DashMap<Uuid, Session>,
    max_sessions: Option<usize>,
}

impl SessionStore {
    /// Open a store rooted at `dir`. The directory is created lazily on
    /// first write; nothing is loaded from disk until requested.
    ///
    /// `max_sessions`, if set, bounds the number of sessions on disk:
    /// [`Self::create_session`] evicts the oldest sessions by
    /// `last_activity` after each creation to stay within the limit.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_sessions: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
            max_sessions,
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), SessionStoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("json.tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_from_disk(&self, id: Uuid) -> Result<Session, SessionStoreError> {
        let path = self.path_for(id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    SessionStoreError::SessionNotFound(id)
                } else {
                    SessionStoreError::Io(err)
                }
            })?;
        serde_json::from_slice(&bytes).map_err(|err| SessionStoreError::CorruptedSession(id, err))
    }

    /// Create a new session, persist it immediately, and place it in the
    /// cache. Evicts the oldest sessions if `max_sessions` is exceeded.
    pub async fn create_session(
        &self,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<Session, SessionStoreError> {
        let session = Session::new(model, provider);
        self.save_session(&session).await?;
        self.cache.insert(session.session_id, session.clone());

        if let Some(max) = self.max_sessions {
            self.delete_oldest_sessions(max).await?;
        }

        Ok(session)
    }

    /// Fetch a session, preferring the cache and falling back to disk.
    pub async fn get_session(&self, id: Uuid) -> Result<Session, SessionStoreError> {
        if let Some(cached) = self.cache.get(&id) {
            return Ok(cached.clone());
        }
        let session = self.read_from_disk(id).await?;
        self.cache.insert(id, session.clone());
        Ok(session)
    }

    /// Append a message to a cached session's transcript and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::SessionNotInCache`] if the session
    /// hasn't been loaded via [`Self::create_session`] or
    /// [`Self::get_session`] first.
    pub async fn record_message(
        &self,
        id: Uuid,
        message: Message,
    ) -> Result<(), SessionStoreError> {
        let snapshot = {
            let mut entry = self
                .cache
                .get_mut(&id)
                .ok_or(SessionStoreError::SessionNotInCache(id))?;
            entry.messages.push(message);
            entry.last_activity = chrono::Utc::now();
            entry.clone()
        };
        self.save_session(&snapshot).await
    }

    /// Append a tool call to a cached session and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionStoreError::SessionNotInCache`] under the same
    /// condition as [`Self::record_message`].
    pub async fn record_tool_call(
        &self,
        id: Uuid,
        tool_call: ToolCall,
    ) -> Result<(), SessionStoreError> {
        let snapshot = {
            let mut entry = self
                .cache
                .get_mut(&id)
                .ok_or(SessionStoreError::SessionNotInCache(id))?;
            entry.tool_calls.push(tool_call);
            entry.last_activity = chrono::Utc::now();
            entry.clone()
        };
        self.save_session(&snapshot).await
    }

    /// Persist `session` as given and refresh the cache entry.
    pub async fn save_session(&self, session: &Session) -> Result<(), SessionStoreError> {
        let bytes = serde_json::to_vec_pretty(session)
            .expect("Session serialization is infallible: no non-finite floats, no non-string map keys");
        let path = self.path_for(session.session_id);
        Self::atomic_write(&path, &bytes).await?;
        self.cache.insert(session.session_id, session.clone());
        debug!(session_id = %session.session_id, "session persisted");
        Ok(())
    }

    /// Remove a session's file and cache entry.
    pub async fn delete_session(&self, id: Uuid) -> Result<(), SessionStoreError> {
        self.cache.remove(&id);
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SessionStoreError::SessionNotFound(id))
            },
            Err(err) => Err(SessionStoreError::Io(err)),
        }
    }

    /// List every session's summary, most recently active first.
    ///
    /// Files that fail to parse are logged and skipped rather than failing
    /// the whole listing.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionStoreError> {
        let mut summaries = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => return Err(SessionStoreError::Io(err)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(std::ffi::OsStr::to_str) != Some("json") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(std::ffi::OsStr::to_str)
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };

            match self.get_session(id).await {
                Ok(session) => summaries.push(session.summary()),
                Err(SessionStoreError::CorruptedSession(id, err)) => {
                    warn!(session_id = %id, error = %err, "skipping corrupted session file");
                },
                Err(err) => return Err(err),
            }
        }

        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }

    /// Delete the oldest sessions (by `last_activity`) until at most `keep`
    /// remain. Returns the number of sessions deleted.
    pub async fn delete_oldest_sessions(&self, keep: usize) -> Result<usize, SessionStoreError> {
        let mut summaries = self.list_sessions().await?;
        if summaries.len() <= keep {
            return Ok(0);
        }
        summaries.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
        let to_delete = summaries.len() - keep;
        for summary in summaries.into_iter().take(to_delete) {
            self.delete_session(summary.session_id).await?;
        }
        Ok(to_delete)
    }
}
