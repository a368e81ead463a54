use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use bookforge_types::{BookforgeError, Result};

use crate::{
    BatchHandle, BatchResult, BatchStatus, BatchTask, DynProvider, GenerationParams,
    GenerationService, ProviderAdapter, Request, Response,
};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "LLM request"
        );
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware: UsageTrackingMiddleware
// ---------------------------------------------------------------------------

/// Accumulates token usage across calls. Clones share the same counters.
#[derive(Clone)]
pub struct UsageTrackingMiddleware {
    total_input: Arc<AtomicU64>,
    total_output: Arc<AtomicU64>,
}

impl UsageTrackingMiddleware {
    pub fn new() -> Self {
        Self {
            total_input: Arc::new(AtomicU64::new(0)),
            total_output: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn total_input_tokens(&self) -> u64 {
        self.total_input.load(Ordering::Relaxed)
    }

    pub fn total_output_tokens(&self) -> u64 {
        self.total_output.load(Ordering::Relaxed)
    }
}

impl Default for UsageTrackingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for UsageTrackingMiddleware {
    fn after(&self, _request: &Request, response: &mut Response) {
        self.total_input
            .fetch_add(response.usage.input_tokens, Ordering::Relaxed);
        self.total_output
            .fetch_add(response.usage.output_tokens, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// A provider plus a middleware chain, exposed as a [`GenerationService`].
pub struct LlmClient {
    provider: DynProvider,
    middleware: Vec<Box<dyn Middleware>>,
}

impl LlmClient {
    pub fn new(provider: impl ProviderAdapter + 'static) -> Self {
        Self {
            provider: DynProvider::new(provider),
            middleware: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Send a fully-built request through the middleware chain.
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let mut req = request.clone();

        for m in &self.middleware {
            m.before(&mut req);
        }

        let mut resp = self.provider.complete(&req).await?;

        for m in &self.middleware {
            m.after(&req, &mut resp);
        }

        Ok(resp)
    }

    /// Create from environment variables (`OPENAI_API_KEY`, optional `OPENAI_BASE_URL`).
    pub fn from_env() -> Result<Self> {
        let adapter = crate::OpenAiAdapter::from_env().map_err(|_| {
            BookforgeError::Other("No generation service API key found in environment".to_string())
        })?;
        Ok(Self::new(adapter).with_middleware(LoggingMiddleware))
    }
}

#[async_trait]
impl GenerationService for LlmClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        params: &GenerationParams,
    ) -> Result<String> {
        let request = params.to_request(system_prompt, user_prompt);
        let response = self.send(&request).await?;
        Ok(response.text)
    }

    async fn generate_image(&self, prompt: &str, size: &str) -> Result<String> {
        tracing::debug!(provider = self.provider.name(), size, "Image request");
        self.provider.generate_image(prompt, size).await
    }

    async fn submit_batch(
        &self,
        tasks: &[BatchTask],
        params: &GenerationParams,
    ) -> Result<BatchHandle> {
        let mut requests = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mut req = params.to_request(&task.system_prompt, &task.user_prompt);
            for m in &self.middleware {
                m.before(&mut req);
            }
            requests.push((task.task_id.clone(), req));
        }
        let handle = self.provider.submit_batch(&requests).await?;
        tracing::info!(job_id = %handle.job_id, tasks = tasks.len(), "Batch submitted");
        Ok(handle)
    }

    async fn poll_status(&self, handle: &BatchHandle) -> Result<BatchStatus> {
        self.provider.batch_status(handle).await
    }

    async fn fetch_results(&self, handle: &BatchHandle) -> Result<Vec<BatchResult>> {
        self.provider.batch_results(handle).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, Usage};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockProvider {
        call_count: Arc<AtomicUsize>,
        batches: Arc<Mutex<Vec<Vec<(String, Request)>>>>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                call_count: Arc::new(AtomicUsize::new(0)),
                batches: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        async fn complete(&self, request: &Request) -> Result<Response> {
            self.call_count.fetch_add(1, Ordering::Relaxed);
            Ok(Response {
                id: "mock-resp".into(),
                text: format!("echo: {}", request.messages.last().unwrap().content),
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 20,
                    total_tokens: 30,
                },
                model: request.model.clone(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        async fn generate_image(&self, prompt: &str, _size: &str) -> Result<String> {
            Ok(format!("https://img.example/{}", prompt.len()))
        }

        async fn submit_batch(&self, requests: &[(String, Request)]) -> Result<BatchHandle> {
            self.batches.lock().unwrap().push(requests.to_vec());
            Ok(BatchHandle {
                job_id: "batch_1".into(),
            })
        }

        async fn batch_status(&self, _handle: &BatchHandle) -> Result<BatchStatus> {
            Ok(BatchStatus::Pending)
        }

        async fn batch_results(&self, _handle: &BatchHandle) -> Result<Vec<BatchResult>> {
            Ok(vec![BatchResult {
                task_id: "chapter-1".into(),
                response_text: "text".into(),
            }])
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }
    }

    // Test 1: complete routes through the provider
    #[tokio::test]
    async fn complete_returns_provider_text() {
        let client = LlmClient::new(MockProvider::new());
        let params = GenerationParams::new("mock-model");
        let text = client.complete("sys", "hello", &params).await.unwrap();
        assert_eq!(text, "echo: hello");
        assert_eq!(client.provider_name(), "mock");
    }

    // Test 2: middleware before/after called
    #[tokio::test]
    async fn middleware_before_after_called() {
        let before_count = Arc::new(AtomicUsize::new(0));
        let after_count = Arc::new(AtomicUsize::new(0));

        struct CountingMiddleware {
            before_count: Arc<AtomicUsize>,
            after_count: Arc<AtomicUsize>,
        }

        impl Middleware for CountingMiddleware {
            fn before(&self, _request: &mut Request) {
                self.before_count.fetch_add(1, Ordering::Relaxed);
            }
            fn after(&self, _request: &Request, _response: &mut Response) {
                self.after_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        let client = LlmClient::new(MockProvider::new()).with_middleware(CountingMiddleware {
            before_count: before_count.clone(),
            after_count: after_count.clone(),
        });

        let _ = client
            .complete("", "hi", &GenerationParams::default())
            .await
            .unwrap();

        assert_eq!(before_count.load(Ordering::Relaxed), 1);
        assert_eq!(after_count.load(Ordering::Relaxed), 1);
    }

    // Test 3: usage tracking accumulates tokens
    #[tokio::test]
    async fn usage_tracking_middleware() {
        let usage = UsageTrackingMiddleware::new();
        let client = LlmClient::new(MockProvider::new()).with_middleware(usage.clone());
        let params = GenerationParams::default();

        client.complete("", "a", &params).await.unwrap();
        assert_eq!(usage.total_input_tokens(), 10);
        assert_eq!(usage.total_output_tokens(), 20);

        client.complete("", "b", &params).await.unwrap();
        assert_eq!(usage.total_input_tokens(), 20);
        assert_eq!(usage.total_output_tokens(), 40);
    }

    // Test 4: batch submission builds one request per task
    #[tokio::test]
    async fn submit_batch_builds_requests_from_tasks() {
        let provider = MockProvider::new();
        let batches = provider.batches.clone();
        let client = LlmClient::new(provider);

        let tasks = vec![
            BatchTask {
                task_id: "chapter-1".into(),
                system_prompt: "sys".into(),
                user_prompt: "write chapter 1".into(),
            },
            BatchTask {
                task_id: "chapter-2".into(),
                system_prompt: "sys".into(),
                user_prompt: "write chapter 2".into(),
            },
        ];
        let handle = client
            .submit_batch(&tasks, &GenerationParams::new("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(handle.job_id, "batch_1");

        let submitted = batches.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].len(), 2);
        assert_eq!(submitted[0][1].0, "chapter-2");
        assert_eq!(submitted[0][1].1.messages[1].content, "write chapter 2");
        assert_eq!(submitted[0][1].1.model, "gpt-4o");
    }

    // Test 5: poll/fetch pass through
    #[tokio::test]
    async fn poll_and_fetch_pass_through() {
        let client = LlmClient::new(MockProvider::new());
        let handle = BatchHandle {
            job_id: "batch_1".into(),
        };
        assert_eq!(
            client.poll_status(&handle).await.unwrap(),
            BatchStatus::Pending
        );
        let results = client.fetch_results(&handle).await.unwrap();
        assert_eq!(results[0].task_id, "chapter-1");
    }
}
