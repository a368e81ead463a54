//! Shared types, errors, and the checkpoint record for the Bookforge pipeline.
//!
//! This crate provides the foundational types used across all other Bookforge crates:
//! - `BookforgeError`: unified error taxonomy
//! - `BookState`: the durable, resumable checkpoint record for one book
//! - `GenerationUnit`: an ephemeral (chapter, page) work item
//! - `ExtractedMetadata`: characters and plot points pulled out of a page

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Unified error type for all Bookforge subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BookforgeError {
    // === Generation Service Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout {
        provider: String,
        timeout_ms: u64,
    },

    #[error("Malformed response from generation service: {0}")]
    MalformedResponse(String),

    // === Batch Errors ===
    #[error("Batch job '{job_id}' failed")]
    BatchFailed { job_id: String },

    #[error("Batch job '{job_id}' still pending after {waited_ms}ms")]
    PollTimeout { job_id: String, waited_ms: u64 },

    // === Pipeline Errors ===
    #[error("Unsupported language '{language}'")]
    UnsupportedLanguage { language: String },

    #[error("Cancelled by caller before chapter {chapter}, page {page}")]
    Cancelled { chapter: u32, page: u32 },

    #[error("Failed to read checkpoint for book '{book_id}': {message}")]
    CheckpointRead { book_id: String, message: String },

    #[error("Failed to write checkpoint for book '{book_id}': {message}")]
    CheckpointWrite { book_id: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BookforgeError {
    /// Returns `true` if the error is transient and re-running the pipeline may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BookforgeError::RateLimited { .. }
                | BookforgeError::RequestTimeout { .. }
                | BookforgeError::ProviderError { retryable: true, .. }
        )
    }

    /// Returns `true` for a caller-initiated stop, which is not a system failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BookforgeError::Cancelled { .. })
    }

    /// Returns `true` if the error originated at the persistence boundary.
    pub fn is_checkpoint_error(&self) -> bool {
        matches!(
            self,
            BookforgeError::CheckpointRead { .. } | BookforgeError::CheckpointWrite { .. }
        )
    }
}

/// A convenience alias for `Result<T, BookforgeError>`.
pub type Result<T> = std::result::Result<T, BookforgeError>;

// ---------------------------------------------------------------------------
// Progress: the resume cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Cursor pointing at the last unit whose content was durably persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub last_completed_chapter: u32,
    pub last_completed_page: u32,
    pub status: GenerationStatus,
}

impl Progress {
    /// The (chapter, page) coordinate where generation resumes.
    ///
    /// A finished chapter (`last_completed_page >= pages_per_chapter`) rolls
    /// over to page 1 of the next chapter.
    pub fn next_unit(&self, pages_per_chapter: u32) -> (u32, u32) {
        if self.last_completed_chapter == 0 {
            return (1, 1);
        }
        if self.last_completed_page >= pages_per_chapter {
            (self.last_completed_chapter + 1, 1)
        } else {
            (self.last_completed_chapter, self.last_completed_page + 1)
        }
    }

    /// Whether every unit of a `chapters` x `pages_per_chapter` book is persisted.
    pub fn covers(&self, chapters: u32, pages_per_chapter: u32) -> bool {
        self.last_completed_chapter > chapters
            || (self.last_completed_chapter == chapters
                && self.last_completed_page >= pages_per_chapter)
    }
}

// ---------------------------------------------------------------------------
// Characters and book metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterRecord {
    pub description: String,
    pub first_appearance_chapter: u32,
    #[serde(default)]
    pub appearances: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
}

/// Generated text keyed by chapter, then page. Iteration is in numeric order.
pub type ContentMap = BTreeMap<u32, BTreeMap<u32, String>>;

// ---------------------------------------------------------------------------
// BookState: the checkpoint record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookState {
    #[serde(default)]
    pub progress: Progress,
    /// Persisted as an ordered list of `[name, record]` pairs.
    #[serde(default, with = "character_pairs")]
    pub characters: BTreeMap<String, CharacterRecord>,
    #[serde(default)]
    pub plot_points: BTreeSet<String>,
    #[serde(default)]
    pub content: ContentMap,
    #[serde(default)]
    pub outline: String,
    #[serde(default)]
    pub metadata: BookMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BookState {
    /// Whether `content[chapter]` holds pages `1..=pages_per_chapter` with no gap.
    pub fn chapter_is_complete(&self, chapter: u32, pages_per_chapter: u32) -> bool {
        self.content
            .get(&chapter)
            .map(|pages| (1..=pages_per_chapter).all(|p| pages.contains_key(&p)))
            .unwrap_or(false)
    }

    /// Total number of generated pages across all chapters.
    pub fn page_count(&self) -> usize {
        self.content.values().map(|pages| pages.len()).sum()
    }
}

mod character_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::CharacterRecord;

    pub fn serialize<S>(
        map: &BTreeMap<String, CharacterRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs: Vec<(&String, &CharacterRecord)> = map.iter().collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, CharacterRecord>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs: Vec<(String, CharacterRecord)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// GenerationUnit and extracted metadata
// ---------------------------------------------------------------------------

/// One (chapter, page) work item. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationUnit {
    pub chapter: u32,
    pub page: u32,
    pub prompt_context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractedCharacter {
    pub name: String,
    #[serde(default)]
    pub details: String,
}

/// Structured output of the metadata-extraction pass over one page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMetadata {
    #[serde(default)]
    pub characters: Vec<ExtractedCharacter>,
    #[serde(default, alias = "plot_points")]
    pub plot_points: Vec<String>,
}

impl ExtractedMetadata {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.plot_points.is_empty()
    }
}
