//! Generation unit executor: one (chapter, page) in, page text and extracted
//! metadata out.

use std::sync::Arc;

use bookforge_llm::{GenerationParams, GenerationService};
use bookforge_types::{BookforgeError, ExtractedMetadata, GenerationUnit, Result};

use crate::narrative::NarrativeState;
use crate::prompts;

/// Result of one generation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutput {
    pub content: String,
    pub metadata: ExtractedMetadata,
}

/// Builds prompts, calls the generation service, and parses metadata.
///
/// Service failures are never retried here; they propagate to the controller.
/// Nothing is persisted.
#[derive(Clone)]
pub struct UnitExecutor {
    service: Arc<dyn GenerationService>,
    params: GenerationParams,
}

impl UnitExecutor {
    pub fn new(service: Arc<dyn GenerationService>, params: GenerationParams) -> Self {
        Self { service, params }
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Assemble the prompt context for a unit: chapter outline, earlier pages
    /// of the same chapter in page order, character table, plot points.
    pub fn build_unit(&self, chapter: u32, page: u32, state: &NarrativeState) -> GenerationUnit {
        let previous: Vec<String> = state
            .chapter_pages(chapter)
            .filter(|(p, _)| *p < page)
            .map(|(p, text)| format!("[Page {p}]\n{text}"))
            .collect();

        GenerationUnit {
            chapter,
            page,
            prompt_context: prompts::page_prompt(
                chapter,
                page,
                state.chapter_outline(chapter),
                &previous.join("\n\n"),
                &state.character_table(),
                &state.plot_point_list(),
            ),
        }
    }

    pub async fn generate(
        &self,
        chapter: u32,
        page: u32,
        state: &NarrativeState,
    ) -> Result<UnitOutput> {
        let unit = self.build_unit(chapter, page, state);
        tracing::debug!(chapter, page, context_len = unit.prompt_context.len(), "Generating unit");

        let content = self
            .service
            .complete(prompts::AUTHOR_SYSTEM, &unit.prompt_context, &self.params)
            .await?;
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(BookforgeError::MalformedResponse(format!(
                "empty page text for chapter {chapter}, page {page}"
            )));
        }

        let metadata = self.extract_metadata(&content).await?;
        Ok(UnitOutput { content, metadata })
    }

    /// Secondary pass that pulls characters and plot points out of `content`.
    ///
    /// A reply that does not parse yields empty metadata. Service errors
    /// still propagate.
    pub async fn extract_metadata(&self, content: &str) -> Result<ExtractedMetadata> {
        let reply = self
            .service
            .complete(
                prompts::EXTRACTION_SYSTEM,
                &prompts::extraction_prompt(content),
                &self.params,
            )
            .await?;

        match parse_metadata(&reply) {
            Ok(metadata) => Ok(metadata),
            Err(e) => {
                tracing::warn!(error = %e, "Metadata extraction unparseable, treating as empty");
                Ok(ExtractedMetadata::default())
            }
        }
    }
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(s: &str) -> &str {
    let s = s.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse an extraction reply. Tolerates code fences and prose around the
/// JSON object.
pub fn parse_metadata(reply: &str) -> Result<ExtractedMetadata> {
    let body = strip_code_fence(reply);
    let object = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => {
            return Err(BookforgeError::MalformedResponse(
                "no JSON object in metadata reply".into(),
            ))
        }
    };
    serde_json::from_str(object)
        .map_err(|e| BookforgeError::MalformedResponse(format!("metadata reply: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
