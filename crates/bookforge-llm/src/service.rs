//! The generation-service contract the pipeline consumes.

use async_trait::async_trait;

use bookforge_types::Result;

use crate::{BatchHandle, BatchResult, BatchStatus, BatchTask, GenerationParams};

/// Text and image generation, synchronous and bulk.
///
/// Every call may fail transiently; implementations do not retry.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String>;

    /// Returns a URL for the generated image.
    async fn generate_image(&self, prompt: &str, size: &str) -> Result<String>;

    async fn submit_batch(
        &self,
        tasks: &[BatchTask],
        params: &GenerationParams,
    ) -> Result<BatchHandle>;

    async fn poll_status(&self, handle: &BatchHandle) -> Result<BatchStatus>;

    async fn fetch_results(&self, handle: &BatchHandle) -> Result<Vec<BatchResult>>;
}
