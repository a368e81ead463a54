use std::path::PathBuf;

use bookforge_llm::GenerationParams;

/// Configuration shared by both controllers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Each book lives in `<output_root>/<book_id>/`.
    pub output_root: PathBuf,
    pub params: GenerationParams,
    /// Write `units/chapter_{c}_page_{p}.*` after every checkpointed page.
    pub write_unit_artifacts: bool,
    pub cover_size: String,
}

impl PipelineConfig {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            params: GenerationParams::default(),
            write_unit_artifacts: true,
            cover_size: "1024x1024".to_string(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_unit_artifacts(mut self, enabled: bool) -> Self {
        self.write_unit_artifacts = enabled;
        self
    }

    pub fn book_dir(&self, book_id: &str) -> PathBuf {
        self.output_root.join(book_id)
    }
}
