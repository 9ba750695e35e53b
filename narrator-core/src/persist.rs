//! Session persistence.
//!
//! The engine owns a session while one of its turns runs and hands it to a
//! [`SessionStore`] between turns. Two stores ship with the crate: an
//! in-memory one and a directory of versioned JSON files.

use crate::error::ErrorKind;
use crate::id::SessionId;
use crate::session::Session;
use crate::turn::Turn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid save format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Background write failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Persistence
    }
}

/// Current save file version.
pub const SAVE_VERSION: u32 = 1;

/// Where sessions and their turns live between turns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, id: SessionId) -> Result<Option<Session>, PersistError>;

    /// Save a session snapshot. A snapshot older than the stored one is
    /// ignored, so concurrent savers cannot move the turn counter backwards.
    async fn save_session(&self, session: &Session) -> Result<(), PersistError>;

    /// Record a terminal turn.
    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistError>;

    /// Every recorded turn of a session, in the order they were appended.
    async fn load_turns(&self, id: SessionId) -> Result<Vec<Turn>, PersistError>;
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
    turns: Mutex<HashMap<SessionId, Vec<Turn>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load_session(&self, id: SessionId) -> Result<Option<Session>, PersistError> {
        Ok(self.sessions.lock().get(&id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<(), PersistError> {
        let mut sessions = self.sessions.lock();
        if sessions.get(&session.id).is_some_and(|saved| is_stale(saved, session)) {
            return Ok(());
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistError> {
        self.turns
            .lock()
            .entry(turn.session_id)
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn load_turns(&self, id: SessionId) -> Result<Vec<Turn>, PersistError> {
        Ok(self.turns.lock().get(&id).cloned().unwrap_or_default())
    }
}

fn is_stale(saved: &Session, incoming: &Session) -> bool {
    incoming.turn_counter < saved.turn_counter || incoming.updated_at < saved.updated_at
}

/// A saved session with its format version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSession {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub session: Session,
}

/// One line of a session's turn log.
#[derive(Debug, Serialize, Deserialize)]
struct TurnLine {
    version: u32,
    turn: Turn,
}

/// One JSON file per session plus a JSON-lines log of its turns:
///
/// ```text
/// <dir>/<session id>.session.json
/// <dir>/<session id>.turns.jsonl
/// ```
///
/// Saves of one session are serialized and each goes through its own
/// temporary file, then is renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    dir: PathBuf,
    writers: Arc<Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Arc::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.session.json"))
    }

    fn turns_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{id}.turns.jsonl"))
    }

    fn writer(&self, id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        self.writers.lock().entry(id).or_default().clone()
    }

    /// Ids of every session saved in the directory.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, PersistError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".session.json")) else {
                continue;
            };
            if let Ok(id) = stem.parse() {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl SessionStore for JsonDirStore {
    async fn load_session(&self, id: SessionId) -> Result<Option<Session>, PersistError> {
        let content = match fs::read_to_string(self.session_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let saved: SavedSession = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }
        if saved.session.id != id {
            return Err(PersistError::InvalidFormat(format!(
                "file for session {id} holds session {}",
                saved.session.id
            )));
        }

        Ok(Some(saved.session))
    }

    async fn save_session(&self, session: &Session) -> Result<(), PersistError> {
        let writer = self.writer(session.id);
        let _guard = writer.lock().await;

        if let Some(saved) = self.load_session(session.id).await? {
            if is_stale(&saved, session) {
                debug!(
                    session = %session.id,
                    saved = saved.turn_counter,
                    incoming = session.turn_counter,
                    "Skipping stale session save"
                );
                return Ok(());
            }
        }

        fs::create_dir_all(&self.dir).await?;
        let saved = SavedSession {
            version: SAVE_VERSION,
            saved_at: Utc::now(),
            session: session.clone(),
        };
        let content = serde_json::to_string_pretty(&saved)?;

        // Write then rename so a crash never leaves half a file behind.
        let dir = self.dir.clone();
        let path = self.session_path(session.id);
        tokio::task::spawn_blocking(move || -> Result<(), PersistError> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn append_turn(&self, turn: &Turn) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(&TurnLine {
            version: SAVE_VERSION,
            turn: turn.clone(),
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.turns_path(turn.session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_turns(&self, id: SessionId) -> Result<Vec<Turn>, PersistError> {
        let content = match fs::read_to_string(self.turns_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut turns = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let record: TurnLine = serde_json::from_str(line)?;
            if record.version != SAVE_VERSION {
                return Err(PersistError::VersionMismatch {
                    expected: SAVE_VERSION,
                    found: record.version,
                });
            }
            turns.push(record.turn);
        }
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::{TurnRequest, TurnStatus};

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();
        let session = Session::new("canon");
        assert!(store.load_session(session.id).await.unwrap().is_none());

        store.save_session(&session).await.unwrap();
        assert_eq!(store.load_session(session.id).await.unwrap(), Some(session.clone()));

        let turn = Turn::pending(TurnRequest::new(session.id, "hello"));
        store.append_turn(&turn).await.unwrap();
        assert_eq!(store.load_turns(session.id).await.unwrap(), vec![turn]);
    }

    #[tokio::test]
    async fn test_json_store_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path().join("saves"));
        let mut session = Session::new("canon");
        session.turn_counter = 3;

        store.save_session(&session).await.unwrap();
        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(store.list_sessions().await.unwrap(), vec![session.id]);
        assert!(store.load_session(SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_turn_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let session = SessionId::new();

        let mut first = Turn::pending(TurnRequest::new(session, "one"));
        first.sequence = 1;
        first.status = TurnStatus::Succeeded;
        first.narrative = Some("It begins.".into());
        let mut second = Turn::pending(TurnRequest::new(session, "two"));
        second.sequence = 2;
        store.append_turn(&first).await.unwrap();
        store.append_turn(&second).await.unwrap();

        let turns = store.load_turns(session).await.unwrap();
        assert_eq!(turns, vec![first, second]);
        assert!(store.load_turns(SessionId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_session_save_is_ignored() {
        let store = InMemoryStore::new();
        let mut session = Session::new("canon");
        let old = session.clone();
        session.turn_counter = 2;
        session.touch();

        store.save_session(&session).await.unwrap();
        store.save_session(&old).await.unwrap();
        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.turn_counter, 2);
    }

    #[tokio::test]
    async fn test_json_store_concurrent_saves_keep_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let mut session = Session::new("canon");
        let mut snapshots = Vec::new();
        for _ in 0..16 {
            session.next_sequence();
            snapshots.push(session.clone());
        }

        // Newest first, so most saves arrive stale
        let saves = snapshots.iter().rev().map(|s| store.save_session(s));
        for result in futures::future::join_all(saves).await {
            result.unwrap();
        }

        let loaded = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.turn_counter, 16);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "only the session file remains");
    }

    #[tokio::test]
    async fn test_json_store_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let session = Session::new("canon");
        let saved = serde_json::json!({
            "version": 99,
            "saved_at": Utc::now(),
            "session": session,
        });
        std::fs::write(
            dir.path().join(format!("{}.session.json", session.id)),
            saved.to_string(),
        )
        .unwrap();

        let err = store.load_session(session.id).await.unwrap_err();
        assert!(matches!(
            err,
            PersistError::VersionMismatch {
                expected: 1,
                found: 99
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
