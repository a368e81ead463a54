//! Durable persistence for one book's generation state.
//!
//! A [`CheckpointStore`] holds exactly one [`BookState`] per book id. Writes
//! replace the previous record wholesale; merging happens in memory before
//! the write. A missing checkpoint is reported as `Ok(None)`, every other
//! read failure as [`BookforgeError::CheckpointRead`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use bookforge_types::{BookState, BookforgeError, Result};

const CHECKPOINT_FILE: &str = "checkpoint.json";

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, book_id: &str) -> Result<Option<BookState>>;
    async fn save(&self, book_id: &str, state: &BookState) -> Result<()>;
    /// Explicit removal. Controllers never call this.
    async fn delete(&self, book_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// Stores each book at `<root>/<book_id>/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint_path(&self, book_id: &str) -> PathBuf {
        self.root.join(book_id).join(CHECKPOINT_FILE)
    }
}

fn read_error(book_id: &str, message: impl ToString) -> BookforgeError {
    BookforgeError::CheckpointRead {
        book_id: book_id.to_string(),
        message: message.to_string(),
    }
}

fn write_error(book_id: &str, message: impl ToString) -> BookforgeError {
    BookforgeError::CheckpointWrite {
        book_id: book_id.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, book_id: &str) -> Result<Option<BookState>> {
        let path = self.checkpoint_path(book_id);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(read_error(book_id, e)),
        };
        let state: BookState = serde_json::from_str(&json).map_err(|e| read_error(book_id, e))?;
        tracing::debug!(book_id, path = %path.display(), "Checkpoint loaded");
        Ok(Some(state))
    }

    async fn save(&self, book_id: &str, state: &BookState) -> Result<()> {
        let path = self.checkpoint_path(book_id);
        let dir = self.root.join(book_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_error(book_id, e))?;

        let json = serde_json::to_string_pretty(state).map_err(|e| write_error(book_id, e))?;
        // Readers never observe a half-written file.
        let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| write_error(book_id, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| write_error(book_id, e))?;

        tracing::debug!(
            book_id,
            chapter = state.progress.last_completed_chapter,
            page = state.progress.last_completed_page,
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn delete(&self, book_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.checkpoint_path(book_id)).await {
            Ok(()) => {
                tracing::info!(book_id, "Checkpoint deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_error(book_id, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// In-process store. Keeps every saved record so callers can inspect the
/// write history.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    history: Mutex<HashMap<String, Vec<BookState>>>,
    saves: AtomicUsize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint without counting it as a save.
    pub fn with_checkpoint(self, book_id: &str, state: BookState) -> Self {
        if let Ok(mut history) = self.history.lock() {
            history.insert(book_id.to_string(), vec![state]);
        }
        self
    }

    /// Total number of `save` calls across all books.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Every record written for `book_id`, oldest first.
    pub fn history(&self, book_id: &str) -> Vec<BookState> {
        self.history
            .lock()
            .map(|h| h.get(book_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, book_id: &str) -> Result<Option<BookState>> {
        let history = self
            .history
            .lock()
            .map_err(|e| read_error(book_id, e))?;
        Ok(history.get(book_id).and_then(|h| h.last().cloned()))
    }

    async fn save(&self, book_id: &str, state: &BookState) -> Result<()> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| write_error(book_id, e))?;
        history
            .entry(book_id.to_string())
            .or_default()
            .push(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, book_id: &str) -> Result<()> {
        let mut history = self
            .history
            .lock()
            .map_err(|e| write_error(book_id, e))?;
        history.remove(book_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
