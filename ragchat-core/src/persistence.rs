//! Durable session state.
//!
//! Two keys are written to a string key-value store: the message history as a
//! JSON array under `messageList`, and the scroll preference under
//! `stickToBottom`. Restoring never fails; anything unreadable is logged and
//! replaced by defaults.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::session::Session;
use crate::types::ChatMessage;

pub const MESSAGES_KEY: &str = "messageList";
pub const STICK_KEY: &str = "stickToBottom";
/// Value stored under [`STICK_KEY`] when stickiness is on.
pub const STICK_SENTINEL: &str = "stick";

/// A string-to-string store that survives restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
    fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        (**self).remove(key)
    }
}

/// In-memory store, used in tests and when no storage path is available.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.entries().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Every write replaces the file atomically.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, PersistenceError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&data).map_err(|e| PersistenceError::Malformed {
            message: format!("{}: {e}", self.path.display()),
        })
    }

    /// Read-modify-write under the store lock. A malformed file is replaced.
    fn update(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(PersistenceError::Malformed { message }) => {
                warn!(error = %message, "Overwriting malformed session store");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        change(&mut map);
        let json = serde_json::to_string_pretty(&map).map_err(|e| PersistenceError::Malformed {
            message: e.to_string(),
        })?;
        atomic_write(&self.path, json.as_bytes()).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.update(|map| {
            map.remove(key);
        })
    }
}

/// Write to a `.tmp` sibling, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// State read back at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoredState {
    pub messages: Vec<ChatMessage>,
    pub stick_to_bottom: bool,
}

/// Saves and restores the durable parts of a [`Session`].
pub struct SessionStore<S> {
    store: S,
}

impl<S: KeyValueStore> SessionStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }

    /// Persist the message history and the stickiness preference.
    ///
    /// The in-progress draft is not saved.
    pub fn save(&self, session: &Session) -> Result<(), PersistenceError> {
        let messages =
            serde_json::to_string(session.messages()).map_err(|e| PersistenceError::Malformed {
                message: e.to_string(),
            })?;
        self.store.set(MESSAGES_KEY, &messages)?;
        if session.stick_to_bottom() {
            self.store.set(STICK_KEY, STICK_SENTINEL)?;
        } else {
            self.store.remove(STICK_KEY)?;
        }
        debug!(messages = session.messages().len(), "Session saved");
        Ok(())
    }

    /// Load the saved state. Any read or parse failure yields the defaults.
    pub fn restore(&self) -> RestoredState {
        match self.try_restore() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session state");
                RestoredState::default()
            }
        }
    }

    fn try_restore(&self) -> Result<RestoredState, PersistenceError> {
        let messages = match self.store.get(MESSAGES_KEY)? {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str(&raw).map_err(|e| PersistenceError::Malformed {
                    message: format!("{MESSAGES_KEY}: {e}"),
                })?
            }
            _ => Vec::new(),
        };
        let stick_to_bottom = self.store.get(STICK_KEY)?.as_deref() == Some(STICK_SENTINEL);
        Ok(RestoredState {
            messages,
            stick_to_bottom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use tempfile::TempDir;

    fn session_with(messages: Vec<ChatMessage>, stick: bool) -> Session {
        Session::restored(RestoredState {
            messages,
            stick_to_bottom: stick,
        })
    }

    #[test]
    fn test_memory_store_get_set_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_save_writes_expected_keys() {
        let sessions = SessionStore::new(MemoryStore::new());
        let session = session_with(vec![ChatMessage::user("hi")], true);
        sessions.save(&session).unwrap();

        let raw = sessions.inner().get(MESSAGES_KEY).unwrap().unwrap();
        assert_eq!(raw, r#"[{"role":"user","content":"hi"}]"#);
        assert_eq!(
            sessions.inner().get(STICK_KEY).unwrap().as_deref(),
            Some("stick")
        );
    }

    #[test]
    fn test_save_removes_stick_key_when_off() {
        let sessions = SessionStore::new(MemoryStore::new());
        sessions.inner().set(STICK_KEY, STICK_SENTINEL).unwrap();
        sessions.save(&session_with(Vec::new(), false)).unwrap();
        assert_eq!(sessions.inner().get(STICK_KEY).unwrap(), None);
    }

    #[test]
    fn test_save_then_restore() {
        let sessions = SessionStore::new(MemoryStore::new());
        let messages = vec![
            ChatMessage::user("what is nextjs?"),
            ChatMessage::assistant("A React framework."),
        ];
        sessions.save(&session_with(messages.clone(), true)).unwrap();

        let restored = sessions.restore();
        assert_eq!(restored.messages, messages);
        assert!(restored.stick_to_bottom);
    }

    #[test]
    fn test_draft_is_not_persisted() {
        let sessions = SessionStore::new(MemoryStore::new());
        let mut session = Session::new();
        session.apply(SessionEvent::Submit("q".into())).unwrap();
        session.apply(SessionEvent::ContextReady).unwrap();
        session
            .apply(SessionEvent::Increment("unfinished".into()))
            .unwrap();
        sessions.save(&session).unwrap();

        assert_eq!(sessions.restore().messages, vec![ChatMessage::user("q")]);
    }

    #[test]
    fn test_restore_empty_store_gives_defaults() {
        let sessions = SessionStore::new(MemoryStore::new());
        assert_eq!(sessions.restore(), RestoredState::default());
    }

    #[test]
    fn test_restore_malformed_messages_gives_defaults() {
        let store = MemoryStore::new();
        store.set(MESSAGES_KEY, "{not json").unwrap();
        store.set(STICK_KEY, STICK_SENTINEL).unwrap();
        let restored = SessionStore::new(store).restore();
        assert!(restored.messages.is_empty());
        assert!(!restored.stick_to_bottom);
    }

    #[test]
    fn test_restore_ignores_other_stick_values() {
        let store = MemoryStore::new();
        store.set(STICK_KEY, "true").unwrap();
        assert!(!SessionStore::new(store).restore().stick_to_bottom);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let store = FileStore::new(&path);
        store.set(MESSAGES_KEY, "[]").unwrap();
        store.set(STICK_KEY, STICK_SENTINEL).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get(MESSAGES_KEY).unwrap().as_deref(), Some("[]"));
        reopened.remove(STICK_KEY).unwrap();
        assert_eq!(reopened.get(STICK_KEY).unwrap(), None);
    }

    #[test]
    fn test_file_store_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("absent.json"));
        assert_eq!(store.get(MESSAGES_KEY).unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_restores_defaults_and_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "garbage").unwrap();

        let sessions = SessionStore::new(FileStore::new(&path));
        assert_eq!(sessions.restore(), RestoredState::default());

        sessions
            .save(&session_with(vec![ChatMessage::user("fresh")], false))
            .unwrap();
        assert_eq!(
            sessions.restore().messages,
            vec![ChatMessage::user("fresh")]
        );
    }
}
