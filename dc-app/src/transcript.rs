//! Per-session conversation transcripts.
//!
//! Each session id maps to `{base_dir}/{session_id}.jsonl`, one serialized
//! `ChatMessage` per line.

use crate::error::PersistError;
use dc_llm::{ChatMessage, Role};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Turns kept on disk per session once a transcript is compacted.
const DEFAULT_MAX_TURNS: usize = 200;

pub struct TranscriptBook {
    base_dir: PathBuf,
    max_turns: usize,
    // Serializes appends and compaction so one exchange's two lines stay adjacent.
    write_lock: Mutex<()>,
}

impl TranscriptBook {
    /// Creates `base_dir` if it does not exist.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            max_turns: DEFAULT_MAX_TURNS,
            write_lock: Mutex::new(()),
        })
    }

    /// Transcripts longer than this are rewritten to their tail on the next read.
    /// Never drops below the `limit` passed to [`TranscriptBook::recent`].
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Last `limit` turns of a session, oldest first. The result never starts with
    /// an assistant turn, so it can be sent to the provider as-is.
    pub async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, PersistError> {
        let path = self.transcript_path(session_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut turns = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(trimmed) {
                Ok(msg) if msg.role != Role::System => turns.push(msg),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        line = line_num + 1,
                        error = %e,
                        path = %path.display(),
                        "skipping malformed transcript line"
                    );
                }
            }
        }

        let keep = self.max_turns.max(limit);
        if turns.len() > keep {
            let kept = tail_from_user(&turns, keep);
            match rewrite(&path, &kept).await {
                Ok(()) => tracing::debug!(
                    %session_id,
                    before = turns.len(),
                    after = kept.len(),
                    "transcript compacted"
                ),
                Err(e) => tracing::warn!(%e, %session_id, "transcript compaction failed"),
            }
        }

        Ok(tail_from_user(&turns, limit))
    }

    pub async fn append(&self, session_id: &str, turns: &[ChatMessage]) -> Result<(), PersistError> {
        let path = self.transcript_path(session_id)?;
        let mut lines = String::new();
        for turn in turns {
            lines.push_str(&serde_json::to_string(turn)?);
            lines.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Deletes a transcript. A missing file is not an error.
    pub async fn remove(&self, session_id: &str) -> Result<(), PersistError> {
        let path = self.transcript_path(session_id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn transcript_path(&self, session_id: &str) -> Result<PathBuf, PersistError> {
        if !is_valid_session_id(session_id) {
            return Err(PersistError::InvalidKey(format!(
                "session id {session_id:?} may only contain letters, digits, '-' and '_'"
            )));
        }
        Ok(self.base_dir.join(format!("{session_id}.jsonl")))
    }
}

/// The last `limit` turns, advanced past any leading assistant turns.
fn tail_from_user(turns: &[ChatMessage], limit: usize) -> Vec<ChatMessage> {
    let tail = &turns[turns.len().saturating_sub(limit)..];
    let first_user = tail
        .iter()
        .position(|m| m.role == Role::User)
        .unwrap_or(tail.len());
    tail[first_user..].to_vec()
}

async fn rewrite(path: &Path, turns: &[ChatMessage]) -> Result<(), PersistError> {
    let mut lines = String::new();
    for turn in turns {
        lines.push_str(&serde_json::to_string(turn)?);
        lines.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, lines.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
