//! Assemble a finished book into export-ready structures and write the
//! compiled artifacts.
//!
//! Rendering is delegated to a [`DocumentExporter`], a pure function from
//! [`CompiledBook`] to bytes. [`MarkdownExporter`] is the built-in one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use bookforge_types::{BookState, Result};

// ---------------------------------------------------------------------------
// Compiled structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPage {
    pub number: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledChapter {
    pub number: u32,
    pub pages: Vec<CompiledPage>,
}

/// A book in chapter-then-page order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledBook {
    pub title: String,
    pub author: String,
    pub genre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    pub chapters: Vec<CompiledChapter>,
}

impl CompiledBook {
    pub fn from_state(state: &BookState) -> Self {
        let chapters = state
            .content
            .iter()
            .map(|(number, pages)| CompiledChapter {
                number: *number,
                pages: pages
                    .iter()
                    .map(|(page, content)| CompiledPage {
                        number: *page,
                        content: content.clone(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            title: state.metadata.title.clone(),
            author: state.metadata.author.clone(),
            genre: state.metadata.genre.clone(),
            cover_image: state.metadata.cover_image.clone(),
            chapters,
        }
    }

    pub fn page_count(&self) -> usize {
        self.chapters.iter().map(|c| c.pages.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Exporters
// ---------------------------------------------------------------------------

pub trait DocumentExporter: Send + Sync {
    /// File extension of rendered documents, without the dot.
    fn extension(&self) -> &str;
    fn render_book(&self, book: &CompiledBook) -> Result<Vec<u8>>;
    fn render_unit(&self, chapter: u32, page: u32, content: &str) -> Result<Vec<u8>>;
}

pub struct MarkdownExporter;

impl DocumentExporter for MarkdownExporter {
    fn extension(&self) -> &str {
        "md"
    }

    fn render_book(&self, book: &CompiledBook) -> Result<Vec<u8>> {
        let mut out = String::new();
        let title = if book.title.is_empty() { "Untitled" } else { &book.title };
        out.push_str(&format!("# {title}\n\n"));
        if !book.author.is_empty() {
            out.push_str(&format!("*by {}*\n\n", book.author));
        }
        if let Some(cover) = &book.cover_image {
            out.push_str(&format!("![Cover]({cover})\n\n"));
        }
        for chapter in &book.chapters {
            out.push_str(&format!("## Chapter {}\n\n", chapter.number));
            for page in &chapter.pages {
                out.push_str(page.content.trim());
                out.push_str("\n\n");
            }
        }
        Ok(out.into_bytes())
    }

    fn render_unit(&self, chapter: u32, page: u32, content: &str) -> Result<Vec<u8>> {
        Ok(format!("## Chapter {chapter}, Page {page}\n\n{}\n", content.trim()).into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Paths written by [`Compiler::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifacts {
    pub json_path: PathBuf,
    pub document_path: PathBuf,
}

#[derive(Clone)]
pub struct Compiler {
    exporter: Arc<dyn DocumentExporter>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Arc::new(MarkdownExporter))
    }
}

impl Compiler {
    pub fn new(exporter: Arc<dyn DocumentExporter>) -> Self {
        Self { exporter }
    }

    pub fn compile(&self, state: &BookState) -> CompiledBook {
        CompiledBook::from_state(state)
    }

    /// Write `compiled/book.json` and `compiled/book.<ext>` under `book_dir`.
    pub async fn write(&self, book: &CompiledBook, book_dir: &Path) -> Result<CompiledArtifacts> {
        let dir = book_dir.join("compiled");
        tokio::fs::create_dir_all(&dir).await?;

        let json_path = dir.join("book.json");
        tokio::fs::write(&json_path, serde_json::to_string_pretty(book)?).await?;

        let document_path = dir.join(format!("book.{}", self.exporter.extension()));
        tokio::fs::write(&document_path, self.exporter.render_book(book)?).await?;

        tracing::info!(
            path = %document_path.display(),
            chapters = book.chapters.len(),
            pages = book.page_count(),
            "Book compiled"
        );
        Ok(CompiledArtifacts {
            json_path,
            document_path,
        })
    }

    /// Write `units/chapter_{c}_page_{p}.json` and the rendered unit document.
    pub async fn write_unit(
        &self,
        book_dir: &Path,
        chapter: u32,
        page: u32,
        content: &str,
    ) -> Result<PathBuf> {
        let dir = book_dir.join("units");
        tokio::fs::create_dir_all(&dir).await?;
        let stem = format!("chapter_{chapter}_page_{page}");

        let record = serde_json::json!({
            "chapter": chapter,
            "page": page,
            "content": content,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let json_path = dir.join(format!("{stem}.json"));
        tokio::fs::write(&json_path, serde_json::to_string_pretty(&record)?).await?;

        let doc = self.exporter.render_unit(chapter, page, content)?;
        tokio::fs::write(dir.join(format!("{stem}.{}", self.exporter.extension())), doc).await?;

        tracing::debug!(chapter, page, path = %json_path.display(), "Unit artifact written");
        Ok(json_path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_state() -> BookState {
        let mut state = BookState::default();
        state.metadata.title = "Tidewater".into();
        state.metadata.author = "A. Writer".into();
        // Inserted out of order on purpose.
        for (c, p, text) in [(2, 2, "D"), (1, 2, "B"), (2, 1, "C"), (1, 1, "A"), (10, 1, "E")] {
            state.content.entry(c).or_default().insert(p, text.to_string());
        }
        state
    }

    #[test]
    fn compile_orders_chapters_and_pages_numerically() {
        let book = Compiler::default().compile(&finished_state());
        let order: Vec<(u32, u32, &str)> = book
            .chapters
            .iter()
            .flat_map(|c| c.pages.iter().map(move |p| (c.number, p.number, p.content.as_str())))
            .collect();
        assert_eq!(
            order,
            vec![(1, 1, "A"), (1, 2, "B"), (2, 1, "C"), (2, 2, "D"), (10, 1, "E")]
        );
        assert_eq!(book.page_count(), 5);
    }

    #[test]
    fn markdown_concatenates_in_reading_order() {
        let book = Compiler::default().compile(&finished_state());
        let md = String::from_utf8(MarkdownExporter.render_book(&book).unwrap()).unwrap();

        assert!(md.starts_with("# Tidewater\n\n*by A. Writer*"));
        let positions: Vec<usize> = ["A", "B", "## Chapter 2", "C", "D", "## Chapter 10", "E"]
            .iter()
            .map(|needle| md.find(&format!("{needle}\n")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn write_produces_json_and_document() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = Compiler::default();
        let book = compiler.compile(&finished_state());

        let artifacts = compiler.write(&book, dir.path()).await.unwrap();
        assert_eq!(artifacts.json_path, dir.path().join("compiled").join("book.json"));
        assert_eq!(artifacts.document_path, dir.path().join("compiled").join("book.md"));

        let json = std::fs::read_to_string(&artifacts.json_path).unwrap();
        let restored: CompiledBook = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, book);
    }

    #[tokio::test]
    async fn write_unit_names_files_by_chapter_and_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = Compiler::default()
            .write_unit(dir.path(), 3, 2, "The lamp flickered.")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("units").join("chapter_3_page_2.json"));
        let record: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(record["chapter"], 3);
        assert_eq!(record["page"], 2);
        assert_eq!(record["content"], "The lamp flickered.");
        assert!(record["timestamp"].is_string());
        assert!(dir.path().join("units").join("chapter_3_page_2.md").exists());
    }
}
