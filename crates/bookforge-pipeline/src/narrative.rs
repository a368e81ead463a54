//! In-memory narrative aggregate for one book run.
//!
//! [`NarrativeState`] is owned by the active controller and passed by
//! reference to the unit executor. The checkpoint store is its only
//! persistence boundary: [`NarrativeState::merge_checkpoint`] on the way in,
//! [`NarrativeState::snapshot`] on the way out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use bookforge_types::{
    BookMetadata, BookState, CharacterRecord, ContentMap, ExtractedMetadata, GenerationStatus,
    Progress,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NarrativeState {
    progress: Progress,
    characters: BTreeMap<String, CharacterRecord>,
    plot_points: BTreeSet<String>,
    content: ContentMap,
    outline: String,
    metadata: BookMetadata,
}

/// What a metadata merge actually added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub new_characters: usize,
    pub new_plot_points: usize,
}

fn chapter_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:#+\s*|\*\*)?chapter\s+(\d+)\b").expect("valid chapter heading regex")
    })
}

impl NarrativeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_checkpoint(state: BookState) -> Self {
        let mut narrative = Self::new();
        narrative.merge_checkpoint(state);
        narrative
    }

    /// Replace every field wholesale from a loaded checkpoint.
    pub fn merge_checkpoint(&mut self, state: BookState) {
        self.progress = state.progress;
        self.characters = state.characters;
        self.plot_points = state.plot_points;
        self.content = state.content;
        self.outline = state.outline;
        self.metadata = state.metadata;
    }

    pub fn snapshot(&self) -> BookState {
        BookState {
            progress: self.progress.clone(),
            characters: self.characters.clone(),
            plot_points: self.plot_points.clone(),
            content: self.content.clone(),
            outline: self.outline.clone(),
            metadata: self.metadata.clone(),
            saved_at: Some(chrono::Utc::now()),
        }
    }

    /// Insert or overwrite one page. Progress is left untouched.
    pub fn record_page(&mut self, chapter: u32, page: u32, content: impl Into<String>) {
        self.content
            .entry(chapter)
            .or_default()
            .insert(page, content.into());
    }

    /// Replace all pages of `chapter` with `pages`, numbered from 1.
    pub fn replace_chapter(&mut self, chapter: u32, pages: Vec<String>) {
        let numbered = pages
            .into_iter()
            .zip(1u32..)
            .map(|(text, page)| (page, text))
            .collect();
        self.content.insert(chapter, numbered);
    }

    /// Fold extracted characters and plot points into the state.
    ///
    /// Characters are append-only: a known name only gains `chapter` in its
    /// appearances and keeps its original description. Plot points are
    /// de-duplicated by exact text.
    pub fn merge_extracted_metadata(
        &mut self,
        chapter: u32,
        extracted: &ExtractedMetadata,
    ) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for character in &extracted.characters {
            let name = character.name.trim();
            if name.is_empty() {
                continue;
            }
            match self.characters.get_mut(name) {
                Some(record) => {
                    record.appearances.insert(chapter);
                }
                None => {
                    self.characters.insert(
                        name.to_string(),
                        CharacterRecord {
                            description: character.details.clone(),
                            first_appearance_chapter: chapter,
                            appearances: BTreeSet::from([chapter]),
                        },
                    );
                    summary.new_characters += 1;
                }
            }
        }

        for point in &extracted.plot_points {
            if !point.is_empty() && self.plot_points.insert(point.clone()) {
                summary.new_plot_points += 1;
            }
        }

        summary
    }

    // -- Progress ----------------------------------------------------------

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn mark_completed_unit(&mut self, chapter: u32, page: u32) {
        self.progress.last_completed_chapter = chapter;
        self.progress.last_completed_page = page;
    }

    pub fn set_status(&mut self, status: GenerationStatus) {
        self.progress.status = status;
    }

    // -- Outline and metadata ---------------------------------------------

    pub fn outline(&self) -> &str {
        &self.outline
    }

    pub fn set_outline(&mut self, outline: impl Into<String>) {
        self.outline = outline.into();
    }

    /// The outline section for one chapter, or the whole outline when no
    /// "Chapter N" heading matches.
    pub fn chapter_outline(&self, chapter: u32) -> &str {
        let re = chapter_heading();
        let headings: Vec<(usize, u32)> = re
            .captures_iter(&self.outline)
            .filter_map(|caps| {
                let start = caps.get(0)?.start();
                let number = caps.get(1)?.as_str().parse().ok()?;
                Some((start, number))
            })
            .collect();

        for (i, (start, number)) in headings.iter().enumerate() {
            if *number == chapter {
                let end = headings
                    .get(i + 1)
                    .map(|(next, _)| *next)
                    .unwrap_or(self.outline.len());
                return self.outline[*start..end].trim();
            }
        }
        self.outline.trim()
    }

    pub fn metadata(&self) -> &BookMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BookMetadata {
        &mut self.metadata
    }

    // -- Narrative context -------------------------------------------------

    pub fn content(&self) -> &ContentMap {
        &self.content
    }

    pub fn page(&self, chapter: u32, page: u32) -> Option<&str> {
        self.content
            .get(&chapter)
            .and_then(|pages| pages.get(&page))
            .map(String::as_str)
    }

    /// Pages of `chapter` in page order.
    pub fn chapter_pages(&self, chapter: u32) -> impl Iterator<Item = (u32, &str)> {
        self.content
            .get(&chapter)
            .into_iter()
            .flat_map(|pages| pages.iter().map(|(p, text)| (*p, text.as_str())))
    }

    pub fn characters(&self) -> &BTreeMap<String, CharacterRecord> {
        &self.characters
    }

    pub fn plot_points(&self) -> &BTreeSet<String> {
        &self.plot_points
    }

    pub fn character_table(&self) -> String {
        if self.characters.is_empty() {
            return "(none yet)".to_string();
        }
        self.characters
            .iter()
            .map(|(name, record)| {
                let chapters: Vec<String> =
                    record.appearances.iter().map(|c| c.to_string()).collect();
                format!(
                    "- {name}: {} (chapters {})",
                    record.description,
                    chapters.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn plot_point_list(&self) -> String {
        if self.plot_points.is_empty() {
            return "(none yet)".to_string();
        }
        self.plot_points
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bookforge_types::ExtractedCharacter;

    fn extracted(characters: &[(&str, &str)], plot_points: &[&str]) -> ExtractedMetadata {
        ExtractedMetadata {
            characters: characters
                .iter()
                .map(|(name, details)| ExtractedCharacter {
                    name: name.to_string(),
                    details: details.to_string(),
                })
                .collect(),
            plot_points: plot_points.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn new_character_records_first_appearance() {
        let mut state = NarrativeState::new();
        let summary = state.merge_extracted_metadata(3, &extracted(&[("Mara", "keeper")], &[]));

        assert_eq!(summary.new_characters, 1);
        let mara = &state.characters()["Mara"];
        assert_eq!(mara.first_appearance_chapter, 3);
        assert_eq!(mara.appearances, BTreeSet::from([3]));
        assert_eq!(mara.description, "keeper");
    }

    #[test]
    fn known_character_gains_appearance_and_keeps_description() {
        let mut state = NarrativeState::new();
        state.merge_extracted_metadata(1, &extracted(&[("Mara", "keeper")], &[]));
        let summary =
            state.merge_extracted_metadata(2, &extracted(&[("Mara", "a retired sailor")], &[]));

        assert_eq!(summary.new_characters, 0);
        let mara = &state.characters()["Mara"];
        assert_eq!(mara.description, "keeper");
        assert_eq!(mara.first_appearance_chapter, 1);
        assert_eq!(mara.appearances, BTreeSet::from([1, 2]));
    }

    #[test]
    fn repeated_merges_never_shrink_appearances() {
        let mut state = NarrativeState::new();
        for chapter in [2, 1, 2, 3, 1] {
            let before = state
                .characters()
                .get("Mara")
                .map(|r| r.appearances.clone())
                .unwrap_or_default();
            state.merge_extracted_metadata(chapter, &extracted(&[("Mara", "keeper")], &[]));
            let after = &state.characters()["Mara"].appearances;
            assert!(before.is_subset(after));
        }
        assert_eq!(state.characters()["Mara"].appearances, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn plot_points_are_deduplicated_by_exact_text() {
        let mut state = NarrativeState::new();
        let first = state.merge_extracted_metadata(1, &extracted(&[], &["The lamp fails"]));
        let second = state.merge_extracted_metadata(1, &extracted(&[], &["The lamp fails"]));
        state.merge_extracted_metadata(1, &extracted(&[], &["the lamp fails"]));

        assert_eq!(first.new_plot_points, 1);
        assert_eq!(second.new_plot_points, 0);
        assert_eq!(state.plot_points().len(), 2);
        assert!(state.plot_points().contains("The lamp fails"));
    }

    #[test]
    fn blank_names_and_points_are_ignored() {
        let mut state = NarrativeState::new();
        let summary = state.merge_extracted_metadata(1, &extracted(&[("  ", "nobody")], &[""]));
        assert_eq!(summary, MergeSummary::default());
        assert!(state.characters().is_empty());
        assert!(state.plot_points().is_empty());
    }

    #[test]
    fn record_page_does_not_touch_progress() {
        let mut state = NarrativeState::new();
        state.record_page(1, 1, "Once.");
        state.record_page(1, 1, "Once upon a time.");

        assert_eq!(state.page(1, 1), Some("Once upon a time."));
        assert_eq!(state.progress(), &Progress::default());
    }

    #[test]
    fn snapshot_and_merge_checkpoint_round_trip() {
        let mut state = NarrativeState::new();
        state.set_outline("Chapter 1: Arrival");
        state.record_page(1, 1, "The ferry docked.");
        state.mark_completed_unit(1, 1);
        state.set_status(GenerationStatus::InProgress);
        state.metadata_mut().title = "Tidewater".into();

        let snapshot = state.snapshot();
        assert!(snapshot.saved_at.is_some());

        let restored = NarrativeState::from_checkpoint(snapshot);
        assert_eq!(restored, state);
    }

    #[test]
    fn merge_checkpoint_replaces_fields_wholesale() {
        let mut state = NarrativeState::new();
        state.record_page(5, 5, "stale");
        state.merge_checkpoint(BookState {
            outline: "fresh".into(),
            ..Default::default()
        });
        assert!(state.content().is_empty());
        assert_eq!(state.outline(), "fresh");
    }

    #[test]
    fn chapter_outline_extracts_matching_section() {
        let mut state = NarrativeState::new();
        state.set_outline(
            "Chapter 1: Arrival\nMara takes the post.\n\nChapter 2: Storm\nThe lamp fails.\n## Chapter 10: Coda\nQuiet.",
        );

        assert_eq!(state.chapter_outline(1), "Chapter 1: Arrival\nMara takes the post.");
        assert_eq!(state.chapter_outline(2), "Chapter 2: Storm\nThe lamp fails.");
        assert_eq!(state.chapter_outline(10), "## Chapter 10: Coda\nQuiet.");
    }

    #[test]
    fn chapter_outline_falls_back_to_whole_outline() {
        let mut state = NarrativeState::new();
        state.set_outline("  A story about a lighthouse.  ");
        assert_eq!(state.chapter_outline(4), "A story about a lighthouse.");
    }

    #[test]
    fn replace_chapter_drops_stale_pages() {
        let mut state = NarrativeState::new();
        state.record_page(2, 1, "old one");
        state.record_page(2, 3, "old three");
        state.replace_chapter(2, vec!["new one".into(), "new two".into()]);

        let pages: Vec<(u32, &str)> = state.chapter_pages(2).collect();
        assert_eq!(pages, vec![(1, "new one"), (2, "new two")]);
    }

    #[test]
    fn chapter_pages_iterate_in_page_order() {
        let mut state = NarrativeState::new();
        state.record_page(1, 3, "c");
        state.record_page(1, 1, "a");
        state.record_page(1, 2, "b");

        let pages: Vec<(u32, &str)> = state.chapter_pages(1).collect();
        assert_eq!(pages, vec![(1, "a"), (2, "b"), (3, "c")]);
        assert_eq!(state.chapter_pages(9).count(), 0);
    }
}
