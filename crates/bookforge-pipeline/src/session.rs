//! Pieces both controllers compose: opening a book (load or bootstrap),
//! confirmed checkpoint commits, the failure and cancellation exits, and the
//! compile-and-finish step.

use std::sync::Arc;
use std::time::Instant;

use bookforge_llm::GenerationService;
use bookforge_types::{BookforgeError, GenerationStatus, Result};

use crate::checkpoint::CheckpointStore;
use crate::compiler::Compiler;
use crate::config::PipelineConfig;
use crate::controller::{BookRequest, PipelineStage, RunReport};
use crate::events::{BookEvent, EventEmitter};
use crate::narrative::NarrativeState;
use crate::prompts;

/// A book opened for one run.
pub struct OpenedBook {
    pub state: NarrativeState,
    pub resumed: bool,
}

/// Shared collaborators of a controller.
#[derive(Clone)]
pub struct BookSession {
    pub(crate) service: Arc<dyn GenerationService>,
    pub(crate) store: Arc<dyn CheckpointStore>,
    pub(crate) config: PipelineConfig,
    pub(crate) events: EventEmitter,
    pub(crate) compiler: Compiler,
}

pub(crate) fn enter(book_id: &str, stage: PipelineStage) {
    tracing::debug!(book_id, stage = ?stage, "Stage");
}

impl BookSession {
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            service,
            store,
            config,
            events: EventEmitter::default(),
            compiler: Compiler::default(),
        }
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// INIT and OUTLINE_READY: resume from the checkpoint, or request an
    /// outline for a fresh book and checkpoint it straight away. Title and
    /// cover are then filled in whenever they are still unset.
    ///
    /// Failures before the outline exists only end the run. Later failures
    /// take the FAILED exit, so the outline survives for the next run.
    pub async fn open(&self, request: &BookRequest) -> Result<OpenedBook> {
        let book_id = request.book_id.as_str();
        enter(book_id, PipelineStage::Init);

        let loaded = match self.store.load(book_id).await {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.abort(book_id, e)),
        };
        let (mut state, resumed) = match loaded {
            Some(checkpoint) => {
                let state = NarrativeState::from_checkpoint(checkpoint);
                let progress = state.progress();
                tracing::info!(
                    book_id,
                    chapter = progress.last_completed_chapter,
                    page = progress.last_completed_page,
                    status = ?progress.status,
                    "Resuming from checkpoint"
                );
                self.events.emit(BookEvent::SessionResumed {
                    book_id: book_id.to_string(),
                    last_completed_chapter: progress.last_completed_chapter,
                    last_completed_page: progress.last_completed_page,
                });
                (state, true)
            }
            None => match self.bootstrap(request).await {
                Ok(state) => (state, false),
                Err(e) => return Err(self.abort(book_id, e)),
            },
        };

        let title_added = match self.ensure_title(&mut state, request).await {
            Ok(added) => added,
            Err(e) => {
                self.fail(book_id, &mut state, &e).await;
                return Err(e);
            }
        };
        let cover_added = self.ensure_cover(&mut state, request).await;
        if title_added || cover_added {
            if let Err(e) = self.checkpoint(book_id, &state).await {
                self.fail(book_id, &mut state, &e).await;
                return Err(e);
            }
        }
        Ok(OpenedBook { state, resumed })
    }

    /// Ends a run that failed before any book state could be saved.
    fn abort(&self, book_id: &str, error: BookforgeError) -> BookforgeError {
        enter(book_id, PipelineStage::Failed);
        tracing::error!(book_id, error = %error, "Could not open book");
        self.events.emit(BookEvent::RunFailed {
            book_id: book_id.to_string(),
            error: error.to_string(),
        });
        error
    }

    async fn bootstrap(&self, request: &BookRequest) -> Result<NarrativeState> {
        let book_id = request.book_id.as_str();
        if request.theme.trim().is_empty() {
            return Err(BookforgeError::InvalidRequest(format!(
                "book '{book_id}' has no checkpoint and no theme to start from"
            )));
        }
        tracing::info!(book_id, theme = %request.theme, "No checkpoint, requesting outline");

        let outline = self
            .service
            .complete(
                prompts::AUTHOR_SYSTEM,
                &prompts::outline_prompt(&request.theme, request.chapters, request.pages_per_chapter),
                &self.config.params,
            )
            .await?;
        if outline.trim().is_empty() {
            return Err(BookforgeError::MalformedResponse("empty outline".into()));
        }

        let mut state = NarrativeState::new();
        state.set_outline(outline.trim());
        let metadata = state.metadata_mut();
        metadata.author = request.author.clone();
        metadata.genre = request.genre.clone();
        self.checkpoint(book_id, &state).await?;

        enter(book_id, PipelineStage::OutlineReady);
        self.events.emit(BookEvent::OutlineReady {
            book_id: book_id.to_string(),
        });
        Ok(state)
    }

    /// Returns true when a title was generated by this call.
    async fn ensure_title(&self, state: &mut NarrativeState, request: &BookRequest) -> Result<bool> {
        if !state.metadata().title.is_empty() {
            return Ok(false);
        }
        let reply = self
            .service
            .complete(
                prompts::AUTHOR_SYSTEM,
                &prompts::title_prompt(&request.theme, state.outline()),
                &self.config.params,
            )
            .await?;
        let title = clean_title(&reply);
        if title.is_empty() {
            return Err(BookforgeError::MalformedResponse("empty title".into()));
        }
        tracing::info!(book_id = %request.book_id, title = %title, "Title chosen");
        state.metadata_mut().title = title;
        Ok(true)
    }

    /// Returns true when a cover was generated by this call. A failed image
    /// call leaves the cover unset for the next run.
    async fn ensure_cover(&self, state: &mut NarrativeState, request: &BookRequest) -> bool {
        if state.metadata().cover_image.is_some() {
            tracing::debug!(book_id = %request.book_id, "Cover already present");
            return false;
        }
        let prompt = prompts::cover_prompt(&state.metadata().title, &request.theme);
        match self
            .service
            .generate_image(&prompt, &self.config.cover_size)
            .await
        {
            Ok(url) => {
                tracing::info!(book_id = %request.book_id, url = %url, "Cover generated");
                self.events.emit(BookEvent::CoverGenerated {
                    book_id: request.book_id.clone(),
                    url: url.clone(),
                });
                state.metadata_mut().cover_image = Some(url);
                true
            }
            Err(e) => {
                tracing::warn!(book_id = %request.book_id, error = %e, "Cover generation failed, continuing without cover");
                false
            }
        }
    }

    /// Full checkpoint write of the current state.
    pub async fn checkpoint(&self, book_id: &str, state: &NarrativeState) -> Result<()> {
        self.store.save(book_id, &state.snapshot()).await?;
        let progress = state.progress();
        self.events.emit(BookEvent::CheckpointSaved {
            book_id: book_id.to_string(),
            chapter: progress.last_completed_chapter,
            page: progress.last_completed_page,
        });
        Ok(())
    }

    /// Persist `pending`, then adopt it. On a failed write `state` is left
    /// as it was, so progress never runs ahead of the store.
    pub async fn commit(
        &self,
        book_id: &str,
        state: &mut NarrativeState,
        pending: NarrativeState,
    ) -> Result<()> {
        self.checkpoint(book_id, &pending).await?;
        *state = pending;
        Ok(())
    }

    /// FAILED exit: mark the state failed and make one best-effort write.
    pub async fn fail(&self, book_id: &str, state: &mut NarrativeState, error: &BookforgeError) {
        enter(book_id, PipelineStage::Failed);
        state.set_status(GenerationStatus::Failed);
        let progress = state.progress();
        tracing::error!(
            book_id,
            chapter = progress.last_completed_chapter,
            page = progress.last_completed_page,
            error = %error,
            "Run failed"
        );
        if let Err(e) = self.checkpoint(book_id, state).await {
            tracing::error!(book_id, error = %e, "Could not checkpoint failed run");
        }
        self.events.emit(BookEvent::RunFailed {
            book_id: book_id.to_string(),
            error: error.to_string(),
        });
    }

    /// Cancellation exit: keep the run resumable and make one best-effort
    /// write of the last completed unit.
    pub async fn cancel(&self, book_id: &str, state: &NarrativeState, chapter: u32, page: u32) {
        tracing::info!(book_id, chapter, page, "Cancelled by caller");
        if let Err(e) = self.checkpoint(book_id, state).await {
            tracing::error!(book_id, error = %e, "Could not checkpoint cancelled run");
        }
        self.events.emit(BookEvent::RunCancelled {
            book_id: book_id.to_string(),
            chapter,
            page,
        });
    }

    /// COMPILING and DONE: mark completed, checkpoint, compile.
    pub async fn finish(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        run_id: &str,
        resumed: bool,
        units_generated: usize,
        started: Instant,
    ) -> Result<RunReport> {
        let book_id = request.book_id.as_str();
        state.set_status(GenerationStatus::Completed);
        self.checkpoint(book_id, state).await?;

        enter(book_id, PipelineStage::Compiling);
        let book = self.compiler.compile(&state.snapshot());
        let artifacts = self
            .compiler
            .write(&book, &self.config.book_dir(book_id))
            .await?;

        enter(book_id, PipelineStage::Done);
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(book_id, units = units_generated, duration_ms, "Run completed");
        self.events.emit(BookEvent::RunCompleted {
            book_id: book_id.to_string(),
            units: units_generated,
            duration_ms,
        });

        Ok(RunReport {
            book_id: book_id.to_string(),
            run_id: run_id.to_string(),
            stage: PipelineStage::Done,
            resumed,
            units_generated,
            progress: state.progress().clone(),
            artifacts,
        })
    }
}

/// First line of a title reply, without quotes or markdown emphasis.
fn clean_title(raw: &str) -> String {
    let decoration = |c: char| c == '"' || c == '*' || c == '#';
    let line = raw
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .trim_matches(decoration)
        .trim();
    let line = line.strip_prefix("Title:").unwrap_or(line).trim();
    line.trim_matches(decoration).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_title_strips_decoration() {
        assert_eq!(clean_title("\"Tidewater\""), "Tidewater");
        assert_eq!(clean_title("\n**Title: The Last Lamp**\nextra"), "The Last Lamp");
        assert_eq!(clean_title("# Salt and Iron"), "Salt and Iron");
        assert_eq!(clean_title(""), "");
    }
}
