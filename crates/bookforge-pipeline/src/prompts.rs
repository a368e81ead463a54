//! Prompt templates for every generation call the pipeline makes.

use crate::narrative::NarrativeState;

/// Separator the batch prompt asks the model to place between pages.
pub const PAGE_BREAK: &str = "---PAGE BREAK---";

pub const AUTHOR_SYSTEM: &str = "You are an accomplished novelist. You write vivid, \
coherent prose and keep characters and plot consistent with everything written so far.";

pub const EXTRACTION_SYSTEM: &str = "You extract structured story metadata. \
Respond with a single JSON object and nothing else.";

pub const EDITOR_SYSTEM: &str = "You are a meticulous fiction editor.";

pub const TRANSLATOR_SYSTEM: &str = "You are a literary translator. Preserve tone, \
names and paragraphing.";

pub fn outline_prompt(theme: &str, chapters: u32, pages_per_chapter: u32) -> String {
    format!(
        "Write a chapter-by-chapter outline for a book on the theme: \"{theme}\".\n\
         The book has {chapters} chapters of {pages_per_chapter} pages each.\n\
         Start each chapter's entry on its own line as \"Chapter N: <title>\" followed by a \
         short synopsis of its events."
    )
}

pub fn title_prompt(theme: &str, outline: &str) -> String {
    format!(
        "Suggest a title for a book on the theme \"{theme}\" with this outline:\n\n{outline}\n\n\
         Reply with the title only."
    )
}

pub fn cover_prompt(title: &str, theme: &str) -> String {
    format!("A book cover illustration for \"{title}\", a story about {theme}. No text.")
}

pub fn page_prompt(
    chapter: u32,
    page: u32,
    chapter_outline: &str,
    previous_pages: &str,
    characters: &str,
    plot_points: &str,
) -> String {
    let previous = if previous_pages.is_empty() {
        "(this is the first page of the chapter)"
    } else {
        previous_pages
    };
    format!(
        "Chapter outline:\n{chapter_outline}\n\n\
         Pages already written in this chapter:\n{previous}\n\n\
         Known characters:\n{characters}\n\n\
         Plot points so far:\n{plot_points}\n\n\
         Write page {page} of chapter {chapter}. Continue directly from the previous page. \
         Reply with the page text only."
    )
}

pub fn extraction_prompt(content: &str) -> String {
    format!(
        "Read the passage below and list the characters who appear in it and the plot points \
         it establishes.\n\
         Reply as JSON: {{\"characters\": [{{\"name\": \"...\", \"details\": \"...\"}}], \
         \"plotPoints\": [\"...\"]}}\n\n\
         Passage:\n{content}"
    )
}

/// One batch task: a whole chapter, with the outline and every page produced
/// in earlier rounds.
pub fn chapter_prompt(
    state: &NarrativeState,
    chapter: u32,
    chapters: u32,
    pages_per_chapter: u32,
) -> String {
    let mut written = String::new();
    for (number, pages) in state.content() {
        for (page, text) in pages {
            written.push_str(&format!("[Chapter {number}, page {page}]\n{text}\n\n"));
        }
    }
    if written.is_empty() {
        written.push_str("(nothing yet)");
    }

    format!(
        "Full outline ({chapters} chapters):\n{}\n\n\
         Content written so far:\n{}\n\n\
         Known characters:\n{}\n\n\
         Plot points so far:\n{}\n\n\
         Write chapter {chapter} in {pages_per_chapter} pages. Separate consecutive pages \
         with a line containing only {PAGE_BREAK}. Reply with the chapter text only.",
        state.outline().trim(),
        written.trim_end(),
        state.character_table(),
        state.plot_point_list(),
    )
}

pub fn consistency_prompt(chapter: u32, text: &str, characters: &str, plot_points: &str) -> String {
    format!(
        "Known characters:\n{characters}\n\nPlot points so far:\n{plot_points}\n\n\
         Does chapter {chapter} below contradict any of them? Reply \"CONSISTENT\" if not, \
         otherwise list each contradiction.\n\nChapter {chapter}:\n{text}"
    )
}

pub fn edit_prompt(chapter: u32, text: &str) -> String {
    format!(
        "Proofread and tighten chapter {chapter} below. Fix grammar, continuity slips and \
         awkward phrasing without changing events. Keep every {PAGE_BREAK} line exactly where \
         it is. Reply with the edited chapter only.\n\n{text}"
    )
}

pub fn translation_prompt(language_name: &str, text: &str) -> String {
    format!("Translate the following text into {language_name}. Reply with the translation only.\n\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_prompt_marks_first_page() {
        let prompt = page_prompt(1, 1, "Chapter 1: Arrival", "", "(none yet)", "(none yet)");
        assert!(prompt.contains("first page of the chapter"));
        assert!(prompt.contains("Write page 1 of chapter 1"));
    }

    #[test]
    fn chapter_prompt_includes_earlier_content() {
        let mut state = NarrativeState::new();
        state.set_outline("Chapter 1: Arrival\nChapter 2: Storm");
        state.record_page(1, 1, "The ferry docked.");

        let prompt = chapter_prompt(&state, 2, 2, 3);
        assert!(prompt.contains("[Chapter 1, page 1]\nThe ferry docked."));
        assert!(prompt.contains("Write chapter 2 in 3 pages"));
        assert!(prompt.contains(PAGE_BREAK));
    }
}
