//! Resumable book generation.
//!
//! This crate drives a book from theme to compiled manuscript: checkpoint
//! persistence, the in-memory narrative state, the per-unit executor, the
//! sequential (page-by-page) and batch (chapter-per-task) controllers, and
//! the compiler that assembles finished content for export.

pub mod batch;
pub mod checkpoint;
pub mod compiler;
pub mod config;
pub mod controller;
pub mod events;
pub mod executor;
pub mod narrative;
pub mod poll;
pub mod prompts;
pub mod sequential;
pub mod session;

pub use batch::{split_pages, BatchController};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use compiler::{
    CompiledArtifacts, CompiledBook, CompiledChapter, CompiledPage, Compiler, DocumentExporter,
    MarkdownExporter,
};
pub use config::PipelineConfig;
pub use controller::{
    language_name, validate_book_id, AlwaysContinue, BookRequest, CancellationFlag,
    PipelineController, PipelineStage, ProgressObserver, ProgressSignal, RunReport,
    DEFAULT_LANGUAGE, SUPPORTED_LANGUAGES,
};
pub use events::{BookEvent, EventEmitter};
pub use executor::{parse_metadata, UnitExecutor, UnitOutput};
pub use narrative::{MergeSummary, NarrativeState};
pub use poll::{wait_for_batch, BackoffPolicy, PollPolicy};
pub use sequential::SequentialController;
pub use session::{BookSession, OpenedBook};
