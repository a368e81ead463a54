//! The shared pipeline-controller capability and the types both controllers
//! speak: the book request, run stages, progress observers, run reports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bookforge_types::{BookforgeError, Progress, Result};

use crate::compiler::CompiledArtifacts;

/// Language codes accepted for translation, with their prompt names.
pub const SUPPORTED_LANGUAGES: &[(&str, &str)] = &[
    ("en", "English"),
    ("es", "Spanish"),
    ("fr", "French"),
    ("de", "German"),
    ("it", "Italian"),
    ("ja", "Japanese"),
    ("zh", "Chinese"),
];

pub const DEFAULT_LANGUAGE: &str = "en";

pub fn language_name(code: &str) -> Option<&'static str> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

// ---------------------------------------------------------------------------
// BookRequest
// ---------------------------------------------------------------------------

/// What to generate. `theme` is only consulted for a book without a
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRequest {
    pub book_id: String,
    pub theme: String,
    pub chapters: u32,
    pub pages_per_chapter: u32,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

impl BookRequest {
    pub fn new(
        book_id: impl Into<String>,
        theme: impl Into<String>,
        chapters: u32,
        pages_per_chapter: u32,
    ) -> Self {
        Self {
            book_id: book_id.into(),
            theme: theme.into(),
            chapters,
            pages_per_chapter,
            author: String::new(),
            genre: String::new(),
            language: default_language(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = genre.into();
        self
    }

    /// Reject malformed requests before any generation call is made.
    pub fn validate(&self) -> Result<()> {
        validate_book_id(&self.book_id)?;
        if self.chapters == 0 || self.pages_per_chapter == 0 {
            return Err(BookforgeError::InvalidRequest(
                "chapters and pages per chapter must both be at least 1".into(),
            ));
        }
        if language_name(&self.language).is_none() {
            return Err(BookforgeError::UnsupportedLanguage {
                language: self.language.clone(),
            });
        }
        Ok(())
    }

    pub fn wants_translation(&self) -> bool {
        self.language != DEFAULT_LANGUAGE
    }
}

/// A book id names one directory under the output root.
pub fn validate_book_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(BookforgeError::InvalidRequest(format!(
            "book id '{id}' is not a valid directory name"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Stages and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Init,
    OutlineReady,
    Generating,
    Compiling,
    Done,
    Failed,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub book_id: String,
    pub run_id: String,
    pub stage: PipelineStage,
    pub resumed: bool,
    /// Units generated by this run (pages for sequential, chapters for batch).
    pub units_generated: usize,
    pub progress: Progress,
    pub artifacts: CompiledArtifacts,
}

// ---------------------------------------------------------------------------
// Progress observation and cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    Continue,
    Cancel,
}

/// Called once before each generation unit begins.
pub trait ProgressObserver: Send + Sync {
    fn before_unit(&self, chapter: u32, page: u32) -> ProgressSignal;
}

impl<F> ProgressObserver for F
where
    F: Fn(u32, u32) -> ProgressSignal + Send + Sync,
{
    fn before_unit(&self, chapter: u32, page: u32) -> ProgressSignal {
        self(chapter, page)
    }
}

/// Observer that never cancels.
pub struct AlwaysContinue;

impl ProgressObserver for AlwaysContinue {
    fn before_unit(&self, _chapter: u32, _page: u32) -> ProgressSignal {
        ProgressSignal::Continue
    }
}

/// Shared flag that cancels the run at the next unit boundary once set.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl ProgressObserver for CancellationFlag {
    fn before_unit(&self, _chapter: u32, _page: u32) -> ProgressSignal {
        if self.is_cancelled() {
            ProgressSignal::Cancel
        } else {
            ProgressSignal::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineController
// ---------------------------------------------------------------------------

/// A strategy that drives one book from its checkpoint to a compiled result.
#[async_trait]
pub trait PipelineController: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Run to completion. On failure the checkpoint reflects the last
    /// successfully persisted unit; cancellation returns
    /// [`BookforgeError::Cancelled`].
    async fn run(&self, request: &BookRequest, observer: &dyn ProgressObserver)
        -> Result<RunReport>;
}
