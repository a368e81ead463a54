//! Chapter-per-task controller backed by the generation service's batch API.
//!
//! All remaining chapters are submitted as one job. Results are processed
//! in submission order: advisory consistency check, edit pass, metadata
//! extraction, then a checkpoint per chapter. An optional translation step
//! runs after every chapter is merged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use bookforge_llm::{BatchTask, GenerationService};
use bookforge_types::{BookforgeError, GenerationStatus, Result};

use crate::checkpoint::CheckpointStore;
use crate::compiler::Compiler;
use crate::config::PipelineConfig;
use crate::controller::{
    language_name, BookRequest, PipelineController, PipelineStage, ProgressObserver,
    ProgressSignal, RunReport,
};
use crate::events::{BookEvent, EventEmitter};
use crate::executor::UnitExecutor;
use crate::narrative::NarrativeState;
use crate::poll::{wait_for_batch, PollPolicy};
use crate::prompts::{self, PAGE_BREAK};
use crate::session::{enter, BookSession};

pub struct BatchController {
    session: BookSession,
    executor: UnitExecutor,
    poll: PollPolicy,
}

fn task_id(chapter: u32) -> String {
    format!("chapter-{chapter}")
}

/// Split a chapter reply into `pages_per_chapter` pages.
///
/// Page-break markers are used when they yield enough pages; surplus pages
/// are folded into the last one. Otherwise the paragraphs are dealt into
/// contiguous pages. A reply with fewer paragraphs than pages comes back
/// short, and the caller decides what to do with it.
pub fn split_pages(text: &str, pages_per_chapter: u32) -> Vec<String> {
    let limit = pages_per_chapter.max(1) as usize;
    let mut pages: Vec<String> = text
        .split(PAGE_BREAK)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect();

    if pages.len() < limit {
        let paragraphs = paragraphs(&text.replace(PAGE_BREAK, "\n\n"));
        if paragraphs.len() >= limit {
            let n = paragraphs.len();
            pages = (0..limit)
                .map(|i| paragraphs[i * n / limit..(i + 1) * n / limit].join("\n\n"))
                .collect();
        }
    }

    if pages.len() > limit {
        let surplus = pages.split_off(limit);
        if let Some(last) = pages.last_mut() {
            for extra in surplus {
                last.push_str("\n\n");
                last.push_str(&extra);
            }
        }
    }
    pages
}

/// Blank-line separated blocks, trimmed.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n").trim().to_string());
    }
    out
}

impl BatchController {
    pub fn new(
        service: Arc<dyn GenerationService>,
        store: Arc<dyn CheckpointStore>,
        config: PipelineConfig,
    ) -> Self {
        let executor = UnitExecutor::new(service.clone(), config.params.clone());
        Self {
            session: BookSession::new(service, store, config),
            executor,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
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

    /// Submit, wait, and merge every remaining chapter. Returns the chapters
    /// merged by this run, in order.
    async fn generate_chapters(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        observer: &dyn ProgressObserver,
    ) -> Result<Vec<u32>> {
        let book_id = request.book_id.as_str();
        let ppc = request.pages_per_chapter;
        // A partially written chapter is regenerated as a whole.
        let (first, _) = state.progress().next_unit(ppc);
        if first > request.chapters {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        for chapter in first..=request.chapters {
            if observer.before_unit(chapter, 1) == ProgressSignal::Cancel {
                return Err(BookforgeError::Cancelled { chapter, page: 1 });
            }
            tasks.push(BatchTask {
                task_id: task_id(chapter),
                system_prompt: prompts::AUTHOR_SYSTEM.to_string(),
                user_prompt: prompts::chapter_prompt(state, chapter, request.chapters, ppc),
            });
        }

        let service = &self.session.service;
        let handle = service
            .submit_batch(&tasks, &self.session.config.params)
            .await?;
        tracing::info!(book_id, job_id = %handle.job_id, tasks = tasks.len(), "Batch job submitted");
        self.session.events.emit(BookEvent::BatchSubmitted {
            job_id: handle.job_id.clone(),
            tasks: tasks.len(),
        });

        wait_for_batch(service.as_ref(), &handle, &self.poll, &self.session.events).await?;

        let mut results: HashMap<String, String> = service
            .fetch_results(&handle)
            .await?
            .into_iter()
            .map(|r| (r.task_id, r.response_text))
            .collect();

        let mut merged = Vec::new();
        for chapter in first..=request.chapters {
            let draft = results.remove(&task_id(chapter)).ok_or_else(|| {
                BookforgeError::MalformedResponse(format!(
                    "batch '{}' returned no result for chapter {chapter}",
                    handle.job_id
                ))
            })?;
            self.merge_chapter(request, state, chapter, draft.trim()).await?;
            merged.push(chapter);
        }
        if !results.is_empty() {
            tracing::warn!(job_id = %handle.job_id, unexpected = results.len(), "Ignoring results for unknown tasks");
        }

        Ok(merged)
    }

    async fn merge_chapter(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        chapter: u32,
        draft: &str,
    ) -> Result<()> {
        let book_id = request.book_id.as_str();
        let params = &self.session.config.params;
        let service = &self.session.service;
        if draft.is_empty() {
            return Err(BookforgeError::MalformedResponse(format!(
                "empty batch result for chapter {chapter}"
            )));
        }

        // Advisory only: findings are logged, never block the merge.
        let verdict = service
            .complete(
                prompts::EDITOR_SYSTEM,
                &prompts::consistency_prompt(
                    chapter,
                    draft,
                    &state.character_table(),
                    &state.plot_point_list(),
                ),
                params,
            )
            .await?;
        if !verdict.trim_start().to_uppercase().starts_with("CONSISTENT") {
            tracing::warn!(book_id, chapter, findings = %verdict.trim(), "Consistency check flagged chapter");
        }

        let edited = service
            .complete(prompts::EDITOR_SYSTEM, &prompts::edit_prompt(chapter, draft), params)
            .await?;
        if edited.trim().is_empty() {
            return Err(BookforgeError::MalformedResponse(format!(
                "empty edit pass for chapter {chapter}"
            )));
        }

        let ppc = request.pages_per_chapter;
        let pages = split_pages(&edited, ppc);
        if pages.len() < ppc as usize {
            return Err(BookforgeError::MalformedResponse(format!(
                "chapter {chapter} came back with {} of {ppc} pages",
                pages.len()
            )));
        }
        let metadata = self.executor.extract_metadata(&pages.join("\n\n")).await?;

        let mut pending = state.clone();
        pending.replace_chapter(chapter, pages);
        let summary = pending.merge_extracted_metadata(chapter, &metadata);
        if chapter >= pending.progress().last_completed_chapter {
            pending.mark_completed_unit(chapter, ppc);
        }
        self.session.commit(book_id, state, pending).await?;

        tracing::info!(
            book_id,
            chapter,
            pages = ppc,
            new_characters = summary.new_characters,
            "Chapter merged"
        );
        self.session.events.emit(BookEvent::ChapterCompleted { chapter });
        Ok(())
    }

    /// Translate the first page of each listed chapter.
    async fn translate(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        chapters: &[u32],
    ) -> Result<()> {
        let book_id = request.book_id.as_str();
        let language = language_name(&request.language).ok_or_else(|| {
            BookforgeError::UnsupportedLanguage {
                language: request.language.clone(),
            }
        })?;
        tracing::warn!(book_id, language, "Translating the first page of each chapter only");

        let mut pending = state.clone();
        // TODO: translate every page of the chapter, not only page 1.
        for &chapter in chapters {
            let Some(original) = pending.page(chapter, 1).map(String::from) else {
                continue;
            };
            let translated = self
                .session
                .service
                .complete(
                    prompts::TRANSLATOR_SYSTEM,
                    &prompts::translation_prompt(language, &original),
                    &self.session.config.params,
                )
                .await?;
            if translated.trim().is_empty() {
                return Err(BookforgeError::MalformedResponse(format!(
                    "empty translation for chapter {chapter}"
                )));
            }
            pending.record_page(chapter, 1, translated.trim());
        }
        self.session.commit(book_id, state, pending).await
    }

    async fn drive(
        &self,
        request: &BookRequest,
        state: &mut NarrativeState,
        observer: &dyn ProgressObserver,
    ) -> Result<usize> {
        let merged = self.generate_chapters(request, state, observer).await?;
        if request.wants_translation() && !merged.is_empty() {
            self.translate(request, state, &merged).await?;
        }
        Ok(merged.len())
    }
}

#[async_trait]
impl PipelineController for BatchController {
    fn mode(&self) -> &'static str {
        "batch"
    }

    async fn run(
        &self,
        request: &BookRequest,
        observer: &dyn ProgressObserver,
    ) -> Result<RunReport> {
        // Language is checked here, before the first generation call.
        request.validate()?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("batch_run", book_id = %request.book_id, run_id = %run_id);

        async move {
            let book_id = request.book_id.as_str();
            let started = Instant::now();
            tracing::info!(
                chapters = request.chapters,
                pages_per_chapter = request.pages_per_chapter,
                language = %request.language,
                "Batch run started"
            );
            self.session.events.emit(BookEvent::RunStarted {
                book_id: book_id.to_string(),
                run_id: run_id.clone(),
                mode: self.mode().to_string(),
            });

            let opened = self.session.open(request).await?;
            let mut state = opened.state;

            enter(book_id, PipelineStage::Generating);
            state.set_status(GenerationStatus::InProgress);
            let merged = match self.drive(request, &mut state, observer).await {
                Ok(merged) => merged,
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
                .finish(request, &mut state, &run_id, opened.resumed, merged, started)
                .await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pages_on_marker() {
        let pages = split_pages("One.\n---PAGE BREAK---\nTwo.\n---PAGE BREAK---\nThree.", 3);
        assert_eq!(pages, vec!["One.", "Two.", "Three."]);
    }

    #[test]
    fn split_pages_folds_surplus_into_last_page() {
        let pages = split_pages("A---PAGE BREAK---B---PAGE BREAK---C", 2);
        assert_eq!(pages, vec!["A".to_string(), "B\n\nC".to_string()]);
    }

    #[test]
    fn split_pages_single_paragraph_comes_back_short() {
        assert_eq!(split_pages("  Just prose.  ", 4), vec!["Just prose."]);
    }

    #[test]
    fn split_pages_deals_paragraphs_without_markers() {
        let pages = split_pages("P1\n\nP2\n\n  \nP3", 2);
        assert_eq!(pages, vec!["P1".to_string(), "P2\n\nP3".to_string()]);
    }

    #[test]
    fn split_pages_prefers_paragraphs_over_too_few_markers() {
        let pages = split_pages("A\n\nB\n---PAGE BREAK---\nC", 3);
        assert_eq!(pages, vec!["A", "B", "C"]);
    }

    #[test]
    fn split_pages_empty_reply_has_no_pages() {
        assert!(split_pages("  \n---PAGE BREAK---\n ", 2).is_empty());
    }

    #[test]
    fn split_pages_ignores_empty_segments() {
        let pages = split_pages("---PAGE BREAK---\nA\n---PAGE BREAK------PAGE BREAK---\nB\n", 5);
        assert_eq!(pages, vec!["A", "B"]);
    }
}
