use async_trait::async_trait;

use bookforge_types::BookforgeError;

use crate::{BatchHandle, BatchResult, BatchStatus, Request, Response};

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

/// Wire-level adapter for one hosted model provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response, BookforgeError>;
    /// Returns a URL for the generated image.
    async fn generate_image(&self, prompt: &str, size: &str) -> Result<String, BookforgeError>;
    /// Submit `(task_id, request)` pairs as one asynchronous job.
    async fn submit_batch(
        &self,
        requests: &[(String, Request)],
    ) -> Result<BatchHandle, BookforgeError>;
    async fn batch_status(&self, handle: &BatchHandle) -> Result<BatchStatus, BookforgeError>;
    async fn batch_results(
        &self,
        handle: &BatchHandle,
    ) -> Result<Vec<BatchResult>, BookforgeError>;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
}

// ---------------------------------------------------------------------------
// DynProvider
// ---------------------------------------------------------------------------

pub struct DynProvider(Box<dyn ProviderAdapter>);

impl DynProvider {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self(Box::new(provider))
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, BookforgeError> {
        self.0.complete(request).await
    }

    pub async fn generate_image(&self, prompt: &str, size: &str) -> Result<String, BookforgeError> {
        self.0.generate_image(prompt, size).await
    }

    pub async fn submit_batch(
        &self,
        requests: &[(String, Request)],
    ) -> Result<BatchHandle, BookforgeError> {
        self.0.submit_batch(requests).await
    }

    pub async fn batch_status(&self, handle: &BatchHandle) -> Result<BatchStatus, BookforgeError> {
        self.0.batch_status(handle).await
    }

    pub async fn batch_results(
        &self,
        handle: &BatchHandle,
    ) -> Result<Vec<BatchResult>, BookforgeError> {
        self.0.batch_results(handle).await
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn default_model(&self) -> &str {
        self.0.default_model()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
