//! Page-by-page controller.
//!
//! Chapters run in order, pages in order within each chapter. Every unit is
//! checkpointed before progress advances, and every finished chapter gets
//! one more checkpoint of its own.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use bookforge_llm::GenerationService;
use bookforge_types::{BookforgeError, GenerationStatus, Result};

use crate::checkpoint::CheckpointStore;
use crate::compiler::Compiler;
use crate::config::PipelineConfig;
use crate::controller::{
    BookRequest, PipelineController, PipelineStage, ProgressObserver, ProgressSignal, RunReport,
};
use crate::events::{BookEvent, EventEmitter};
use crate::executor::UnitExecutor;
use crate::narrative::NarrativeState;
use crate::session::{enter, BookSession};

pub struct SequentialController {
    session: BookSession,
    executor: UnitExecutor,
}

impl SequentialController {
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        let executor = UnitExecutor::new(service.clone(), config.params.clone());
        Self {
            session: BookSession::new(service, store, config),
            executor,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.session.events = events;
        self
    }

    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.session.compiler = compiler;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        self.session.events()
    }

    /// GENERATING: every remaining unit from the resume point on. Returns
    /// the number of pages generated.
    async fn generate_remaining(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        observer: &dyn ProgressObserver,
    ) -> Result<usize> {
        let book_id = request.book_id.as_str();
        let ppc = request.pages_per_chapter;
        let (start_chapter, start_page) = state.progress().next_unit(ppc);
        let mut generated = 0;

        for chapter in start_chapter..=request.chapters {
            let first_page = if chapter == start_chapter { start_page } else { 1 };
            tracing::info!(book_id, chapter, first_page, "Chapter started");

            for page in first_page..=ppc {
                if observer.before_unit(chapter, page) == ProgressSignal::Cancel {
                    return Err(BookforgeError::Cancelled { chapter, page });
                }
                self.session
                    .events
                    .emit(BookEvent::UnitStarted { chapter, page });

                let output = self.executor.generate(chapter, page, state).await?;

                let mut pending = state.clone();
                pending.record_page(chapter, page, output.content.as_str());
                let summary = pending.merge_extracted_metadata(chapter, &output.metadata);
                pending.mark_completed_unit(chapter, page);
                self.session.commit(book_id, state, pending).await?;
                generated += 1;

                tracing::debug!(
                    book_id,
                    chapter,
                    page,
                    new_characters = summary.new_characters,
                    new_plot_points = summary.new_plot_points,
                    "Unit checkpointed"
                );
                self.session.events.emit(BookEvent::UnitCompleted {
                    chapter,
                    page,
                    new_characters: summary.new_characters,
                    new_plot_points: summary.new_plot_points,
                });

                if self.session.config.write_unit_artifacts {
                    self.session
                        .compiler
                        .write_unit(
                            &self.session.config.book_dir(book_id),
                            chapter,
                            page,
                            &output.content,
                        )
                        .await?;
                }
            }

            // Chapter durability boundary, independent of the per-page writes.
            self.session.checkpoint(book_id, state).await?;
            tracing::info!(book_id, chapter, "Chapter completed");
            self.session
                .events
                .emit(BookEvent::ChapterCompleted { chapter });
        }

        Ok(generated)
    }
}

#[async_trait]
impl PipelineController for SequentialController {
    fn mode(&self) -> &'static str {
        "sequential"
    }

    async fn run(
        &self,
        request: &BookRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<RunReport> {
        request.validate()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("sequential_run", book_id = %request.book_id, run_id = %run_id);

        async move {
            let book_id = request.book_id.as_str();
            let started = Instant::now();
            tracing::info!(
                chapters = request.chapters,
                pages_per_chapter = request.pages_per_chapter,
                "Sequential run started"
            );
            self.session.events.emit(BookEvent::RunStarted {
                book_id: book_id.to_string(),
                run_id: run_id.clone(),
                mode: self.mode().to_string(),
            });
            if request.wants_translation() {
                tracing::warn!(language = %request.language, "Translation is only applied in batch mode");
            }

            let opened = self.session.open(request).await?;
            let mut state = opened.state;

            enter(book_id, PipelineStage::Generating);
            state.set_status(GenerationStatus::InProgress);
            let generated = match self.generate_remaining(request, &mut state, observer).await {
                Ok(generated) => generated,
                Err(BookforgeError::Cancelled { chapter, page }) => {
                    self.session.cancel(book_id, &state, chapter, page).await;
                    return Err(BookforgeError::Cancelled { chapter, page });
                }
                Err(e) => {
                    self.session.fail(book_id, &mut state, &e).await;
                    return Err(e);
                }
            };

            self.session
                .finish(request, &mut state, &run_id, opened.resumed, generated, started)
                .await
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use bookforge_llm::{BatchHandle, BatchResult, BatchStatus, BatchTask, GenerationParams};
    use bookforge_types::{BookState, Progress};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes a page label for page prompts and empty metadata for extraction.
    struct EchoService {
        completes: AtomicUsize,
        images: AtomicUsize,
    }

    impl EchoService {
        fn new() -> Self {
            Self {
                completes: AtomicUsize::new(0),
                images: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationService for EchoService {
        async fn complete(&self, system: &str, user: &str, _p: &GenerationParams) -> Result<String> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            if system == crate::prompts::EXTRACTION_SYSTEM {
                return Ok("{}".into());
            }
            Ok(user.lines().last().unwrap_or_default().to_string())
        }
        async fn generate_image(&self, _prompt: &str, _size: &str) -> Result<String> {
            self.images.fetch_add(1, Ordering::SeqCst);
            Ok("https://img.example/cover.png".into())
        }
        async fn submit_batch(&self, _t: &[BatchTask], _p: &GenerationParams) -> Result<BatchHandle> {
            unimplemented!()
        }
        async fn poll_status(&self, _h: &BatchHandle) -> Result<BatchStatus> {
            unimplemented!()
        }
        async fn fetch_results(&self, _h: &BatchHandle) -> Result<Vec<BatchResult>> {
            unimplemented!()
        }
    }

    // Test 1: a finished checkpoint generates nothing and only compiles
    #[tokio::test]
    async fn completed_checkpoint_only_compiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut seeded = BookState {
            outline: "Chapter 1: Arrival".into(),
            progress: Progress {
                last_completed_chapter: 1,
                last_completed_page: 1,
                status: GenerationStatus::Completed,
            },
            ..Default::default()
        };
        seeded.metadata.title = "Done".into();
        seeded.metadata.cover_image = Some("https://img.example/old.png".into());
        seeded.content.entry(1).or_default().insert(1, "Done.".into());

        let service = Arc::new(EchoService::new());
        let store = Arc::new(MemoryCheckpointStore::new().with_checkpoint("book", seeded));
        let controller = SequentialController::new(
            service.clone(),
            store.clone(),
            PipelineConfig::new(dir.path()),
        );

        let report = controller
            .run(&BookRequest::new("book", "", 1, 1), &crate::controller::AlwaysContinue)
            .await
            .unwrap();

        assert!(report.resumed);
        assert_eq!(report.units_generated, 0);
        assert_eq!(report.stage, PipelineStage::Done);
        assert_eq!(service.completes.load(Ordering::SeqCst), 0);
        assert_eq!(service.images.load(Ordering::SeqCst), 0);
        assert!(report.artifacts.document_path.exists());
    }

    // Test 2: invalid request is rejected before touching the service
    #[tokio::test]
    async fn invalid_request_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(EchoService::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let controller =
            SequentialController::new(service.clone(), store.clone(), PipelineConfig::new(dir.path()));

        let err = controller
            .run(&BookRequest::new("book", "theme", 0, 2), &crate::controller::AlwaysContinue)
            .await
            .unwrap_err();

        assert!(matches!(err, BookforgeError::InvalidRequest(_)));
        assert_eq!(service.completes.load(Ordering::SeqCst), 0);
        assert_eq!(store.save_count(), 0);
    }

    // Test 3: unit artifacts are written per page when enabled
    #[tokio::test]
    async fn unit_artifacts_written_per_page() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SequentialController::new(
            Arc::new(EchoService::new()),
            Arc::new(MemoryCheckpointStore::new()),
            PipelineConfig::new(dir.path()),
        );
        controller
            .run(&BookRequest::new("book", "a lighthouse", 1, 2), &crate::controller::AlwaysContinue)
            .await
            .unwrap();

        let units = dir.path().join("book").join("units");
        assert!(units.join("chapter_1_page_1.json").exists());
        assert!(units.join("chapter_1_page_2.md").exists());

        let disabled = tempfile::tempdir().unwrap();
        let controller = SequentialController::new(
            Arc::new(EchoService::new()),
            Arc::new(MemoryCheckpointStore::new()),
            PipelineConfig::new(disabled.path()).with_unit_artifacts(false),
        );
        controller
            .run(&BookRequest::new("book", "a lighthouse", 1, 2), &crate::controller::AlwaysContinue)
            .await
            .unwrap();
        assert!(!disabled.path().join("book").join("units").exists());
    }
}
