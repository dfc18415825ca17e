//! Durable conversation -> provider session mapping.
//!
//! The whole mapping is rewritten on every mutation, as one flat pretty-printed
//! JSON object. A single async lock is held across the in-memory change and the
//! file write, so concurrent writers never interleave partial files.

use crate::error::PersistError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<BTreeMap<String, String>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds a store and loads whatever is on disk. Load failures are logged and
    /// leave the store empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self::new(path);
        match store.load().await {
            Ok(count) => {
                tracing::info!(path = %store.path.display(), sessions = count, "session store loaded");
            }
            Err(e) => {
                tracing::warn!(%e, path = %store.path.display(), "session store load failed; starting empty");
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the in-memory mapping with the file contents.
    ///
    /// A missing file yields an empty mapping. A malformed file also yields an
    /// empty mapping, with a warning. Only unreadable files are errors.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<usize, PersistError> {
        let mut sessions = self.sessions.lock().await;
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                sessions.clear();
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        *sessions = match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(%e, "session file is malformed; ignoring its contents");
                BTreeMap::new()
            }
        };
        Ok(sessions.len())
    }

    pub async fn get(&self, conversation_id: &str) -> Option<String> {
        self.sessions.lock().await.get(conversation_id).cloned()
    }

    /// Stores the session id and persists. On persist failure the new value is
    /// still visible through [`SessionStore::get`] for the rest of the run.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn set(&self, conversation_id: &str, session_id: &str) -> Result<(), PersistError> {
        if conversation_id.is_empty() {
            return Err(PersistError::InvalidKey(
                "conversation id must not be empty".to_string(),
            ));
        }
        let mut sessions = self.sessions.lock().await;
        sessions.insert(conversation_id.to_string(), session_id.to_string());
        write_mapping(&self.path, &sessions).await
    }

    /// Removes the mapping for a conversation. Clearing an unknown id does not
    /// touch the file.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_id = %conversation_id))]
    pub async fn clear(&self, conversation_id: &str) -> Result<(), PersistError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(conversation_id).is_none() {
            return Ok(());
        }
        write_mapping(&self.path, &sessions).await
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

async fn write_mapping(path: &Path, sessions: &BTreeMap<String, String>) -> Result<(), PersistError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_string_pretty(sessions)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, body.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "sessions.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions.json"))
    }

    async fn file_map(path: &Path) -> BTreeMap<String, String> {
        let raw = tokio::fs::read_to_string(path).await.expect("read session file");
        serde_json::from_str(&raw).expect("session file is a flat object")
    }

    #[tokio::test]
    async fn unseen_conversation_is_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        assert_eq!(store.get("c1").await, None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn set_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.set("c1", "s1").await.expect("set c1");
        store.set("c2", "s2").await.expect("set c2");
        assert_eq!(store.get("c1").await.as_deref(), Some("s1"));

        let fresh = SessionStore::open(store.path().to_path_buf()).await;
        assert_eq!(fresh.get("c1").await.as_deref(), Some("s1"));
        assert_eq!(fresh.get("c2").await.as_deref(), Some("s2"));
        assert_eq!(fresh.len().await, 2);

        let on_disk = file_map(store.path()).await;
        assert_eq!(on_disk.get("c2").map(String::as_str), Some("s2"));
        assert!(!temp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn clear_keeps_other_conversations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.set("c1", "s1").await.expect("set c1");
        store.set("c2", "s2").await.expect("set c2");

        store.clear("c1").await.expect("clear c1");
        assert_eq!(store.get("c1").await, None);
        let on_disk = file_map(store.path()).await;
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk.get("c2").map(String::as_str), Some("s2"));
    }

    #[tokio::test]
    async fn clearing_unknown_id_does_not_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.clear("nobody").await.expect("no-op clear");
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn clearing_unknown_id_leaves_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.set("c1", "s1").await.expect("set c1");
        store.set("c2", "s2").await.expect("set c2");
        let before = tokio::fs::read(store.path()).await.expect("read before");

        store.clear("absent").await.expect("no-op clear");

        let after = tokio::fs::read(store.path()).await.expect("read after");
        assert_eq!(before, after);
        assert_eq!(store.get("c1").await.as_deref(), Some("s1"));
        assert_eq!(store.get("c2").await.as_deref(), Some("s2"));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn missing_and_malformed_files_load_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        assert_eq!(store.load().await.expect("missing file"), 0);

        tokio::fs::write(store.path(), b"{not json")
            .await
            .expect("write garbage");
        let fresh = SessionStore::new(store.path().to_path_buf());
        assert_eq!(fresh.load().await.expect("broken json"), 0);
        assert_eq!(fresh.get("c1").await, None);

        store.set("c9", "s9").await.expect("set");
        // Reloading discards memory in favour of the file.
        tokio::fs::write(store.path(), b"[1, 2, 3]")
            .await
            .expect("write wrong shape");
        assert_eq!(store.load().await.expect("malformed file"), 0);
        assert_eq!(store.get("c9").await, None);
    }

    #[tokio::test]
    async fn parent_directory_is_created_on_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("nested").join("sessions.json");
        let store = SessionStore::new(&path);
        store.set("c1", "s1").await.expect("set");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_write_keeps_value_in_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("sessions.json");
        tokio::fs::create_dir_all(path.join("occupied"))
            .await
            .expect("mkdir");
        let store = SessionStore::new(&path);
        let err = store.set("c1", "s1").await.expect_err("rename onto a directory");
        assert!(matches!(err, PersistError::Io(_)));
        assert_eq!(store.get("c1").await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn empty_conversation_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        assert!(matches!(
            store.set("", "s1").await,
            Err(PersistError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store_in(&dir));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .set(&format!("c{i}"), &format!("s{i}"))
                    .await
                    .expect("set");
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.expect("task");
        }
        assert_eq!(store.len().await, 16);
        assert_eq!(file_map(store.path()).await.len(), 16);
    }
}
