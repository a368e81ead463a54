use async_trait::async_trait;
use serde_json::json;

use crate::{
    BatchHandle, BatchResult, BatchStatus, FinishReason, ProviderAdapter, Request, Response,
    Usage,
};
use bookforge_types::BookforgeError;

const PROVIDER: &str = "openai";

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    image_model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com".to_string(),
            default_model: "gpt-4o".to_string(),
            image_model: "dall-e-3".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, BookforgeError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| BookforgeError::AuthError {
            provider: PROVIDER.into(),
        })?;
        let adapter = Self::new(key);
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) if !url.is_empty() => adapter.with_base_url(url),
            _ => adapter,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_image_model(mut self, model: String) -> Self {
        self.image_model = model;
        self
    }

    fn build_request_body(&self, request: &Request) -> serde_json::Value {
        let input: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|msg| {
                json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "input": input,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }

        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        body
    }

    fn parse_response(&self, body: serde_json::Value) -> Result<Response, BookforgeError> {
        let id = body["id"].as_str().unwrap_or("").to_string();
        let model = body["model"].as_str().unwrap_or("").to_string();

        let finish_reason = match body["status"].as_str() {
            Some("incomplete") => FinishReason::MaxTokens,
            _ => FinishReason::EndTurn,
        };

        let mut text_parts: Vec<String> = Vec::new();
        if let Some(output) = body["output"].as_array() {
            for item in output.iter().filter(|item| item["type"] == "message") {
                if let Some(content) = item["content"].as_array() {
                    for block in content {
                        if block["type"] == "output_text" {
                            if let Some(t) = block["text"].as_str() {
                                text_parts.push(t.to_string());
                            }
                        }
                    }
                }
            }
        }

        if text_parts.is_empty() {
            return Err(BookforgeError::MalformedResponse(format!(
                "response '{id}' contained no output text"
            )));
        }

        let usage_obj = &body["usage"];
        let input_tokens = usage_obj["input_tokens"].as_u64().unwrap_or(0);
        let output_tokens = usage_obj["output_tokens"].as_u64().unwrap_or(0);

        Ok(Response {
            id,
            text: text_parts.join(""),
            usage: Usage {
                input_tokens,
                output_tokens,
                total_tokens: input_tokens + output_tokens,
            },
            model,
            finish_reason,
        })
    }

    /// Encode batch requests as the JSONL input file the batch endpoint expects.
    fn build_batch_file(&self, requests: &[(String, Request)]) -> Result<Vec<u8>, BookforgeError> {
        let mut out = Vec::new();
        for (task_id, request) in requests {
            let line = json!({
                "custom_id": task_id,
                "method": "POST",
                "url": "/v1/responses",
                "body": self.build_request_body(request),
            });
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Decode the JSONL output file of a finished batch.
    fn parse_batch_output(&self, jsonl: &str) -> Result<Vec<BatchResult>, BookforgeError> {
        let mut results = Vec::new();
        for line in jsonl.lines().filter(|l| !l.trim().is_empty()) {
            let entry: serde_json::Value = serde_json::from_str(line)?;
            let task_id = entry["custom_id"].as_str().unwrap_or("").to_string();
            let status = entry["response"]["status_code"].as_u64().unwrap_or(0);
            if status != 200 {
                tracing::warn!(task_id = %task_id, status, "Batch task failed on provider side");
                continue;
            }
            let response = self.parse_response(entry["response"]["body"].clone())?;
            results.push(BatchResult {
                task_id,
                response_text: response.text,
            });
        }
        Ok(results)
    }

    async fn send_json(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, BookforgeError> {
        let text = self.send_text(builder).await?;
        serde_json::from_str(&text).map_err(|e| {
            BookforgeError::MalformedResponse(format!("failed to parse response JSON: {e}"))
        })
    }

    async fn send_text(&self, builder: reqwest::RequestBuilder) -> Result<String, BookforgeError> {
        let resp = builder
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(map_error(status, &body));
        }
        Ok(body)
    }
}

fn map_batch_status(status: &str) -> BatchStatus {
    match status {
        "completed" => BatchStatus::Completed,
        "failed" | "expired" | "cancelled" | "cancelling" => BatchStatus::Failed,
        // validating, in_progress, finalizing
        _ => BatchStatus::Pending,
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn transport_error(e: reqwest::Error) -> BookforgeError {
    if e.is_timeout() {
        return BookforgeError::RequestTimeout {
            provider: PROVIDER.into(),
            timeout_ms: 0,
        };
    }
    BookforgeError::ProviderError {
        provider: PROVIDER.into(),
        status: 0,
        message: e.to_string(),
        retryable: true,
    }
}

fn map_error(status: reqwest::StatusCode, body: &str) -> BookforgeError {
    let status_u16 = status.as_u16();
    match status_u16 {
        429 => {
            let retry_ms = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            BookforgeError::RateLimited {
                provider: PROVIDER.into(),
                retry_after_ms: retry_ms,
            }
        }
        401 => BookforgeError::AuthError {
            provider: PROVIDER.into(),
        },
        500 | 502 | 503 | 504 => BookforgeError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => BookforgeError::ProviderError {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(&self, request: &Request) -> Result<Response, BookforgeError> {
        let body = self.build_request_body(request);
        let json = self
            .send_json(
                self.client
                    .post(format!("{}/v1/responses", self.base_url))
                    .json(&body),
            )
            .await?;
        self.parse_response(json)
    }

    async fn generate_image(&self, prompt: &str, size: &str) -> Result<String, BookforgeError> {
        let body = json!({
            "model": self.image_model,
            "prompt": prompt,
            "size": size,
            "n": 1,
        });
        let json = self
            .send_json(
                self.client
                    .post(format!("{}/v1/images/generations", self.base_url))
                    .json(&body),
            )
            .await?;
        json["data"][0]["url"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| BookforgeError::MalformedResponse("image response had no url".into()))
    }

    async fn submit_batch(
        &self,
        requests: &[(String, Request)],
    ) -> Result<BatchHandle, BookforgeError> {
        let file = self.build_batch_file(requests)?;
        let part = reqwest::multipart::Part::bytes(file)
            .file_name("bookforge-batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| BookforgeError::Other(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let uploaded = self
            .send_json(
                self.client
                    .post(format!("{}/v1/files", self.base_url))
                    .multipart(form),
            )
            .await?;
        let file_id = uploaded["id"].as_str().ok_or_else(|| {
            BookforgeError::MalformedResponse("file upload response had no id".into())
        })?;

        let batch = self
            .send_json(
                self.client
                    .post(format!("{}/v1/batches", self.base_url))
                    .json(&json!({
                        "input_file_id": file_id,
                        "endpoint": "/v1/responses",
                        "completion_window": "24h",
                    })),
            )
            .await?;
        let job_id = batch["id"].as_str().ok_or_else(|| {
            BookforgeError::MalformedResponse("batch response had no id".into())
        })?;

        Ok(BatchHandle {
            job_id: job_id.to_string(),
        })
    }

    async fn batch_status(&self, handle: &BatchHandle) -> Result<BatchStatus, BookforgeError> {
        let batch = self
            .send_json(
                self.client
                    .get(format!("{}/v1/batches/{}", self.base_url, handle.job_id)),
            )
            .await?;
        Ok(map_batch_status(batch["status"].as_str().unwrap_or("")))
    }

    async fn batch_results(
        &self,
        handle: &BatchHandle,
    ) -> Result<Vec<BatchResult>, BookforgeError> {
        let batch = self
            .send_json(
                self.client
                    .get(format!("{}/v1/batches/{}", self.base_url, handle.job_id)),
            )
            .await?;
        let output_file = batch["output_file_id"].as_str().ok_or_else(|| {
            BookforgeError::MalformedResponse(format!(
                "batch '{}' has no output file",
                handle.job_id
            ))
        })?;

        let jsonl = self
            .send_text(
                self.client
                    .get(format!("{}/v1/files/{}/content", self.base_url, output_file)),
            )
            .await?;
        self.parse_batch_output(&jsonl)
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn make_basic_request() -> Request {
        Request {
            model: "gpt-4o".into(),
            messages: vec![
                Message::system("You are a novelist."),
                Message::user("Write page 1."),
            ],
            max_tokens: Some(4096),
            temperature: Some(0.7),
        }
    }

    #[test]
    fn build_request_body_produces_correct_structure() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let body = adapter.build_request_body(&make_basic_request());

        assert_eq!(body["model"], "gpt-4o");
        let input = body["input"].as_array().expect("input should be an array");
        assert_eq!(input.len(), 2);
        assert_eq!(input[0]["role"], "system");
        assert_eq!(input[0]["content"], "You are a novelist.");
        assert_eq!(input[1]["role"], "user");
        assert_eq!(body["max_output_tokens"], 4096);
        let temp = body["temperature"].as_f64().unwrap();
        assert!((temp - 0.7).abs() < 0.01);
    }

    #[test]
    fn build_request_body_without_optional_fields() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let req = Request {
            model: "gpt-4o".into(),
            messages: vec![Message::user("Hi")],
            max_tokens: None,
            temperature: None,
        };
        let body = adapter.build_request_body(&req);
        assert!(body.get("max_output_tokens").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn parse_response_handles_complete_response() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let response_json = json!({
            "id": "resp_abc123",
            "output": [
                {
                    "type": "message",
                    "content": [
                        { "type": "output_text", "text": "The tide came in " },
                        { "type": "output_text", "text": "early that year." }
                    ]
                }
            ],
            "usage": { "input_tokens": 100, "output_tokens": 50 },
            "model": "gpt-4o",
            "status": "completed"
        });

        let resp = adapter.parse_response(response_json).unwrap();
        assert_eq!(resp.id, "resp_abc123");
        assert_eq!(resp.text, "The tide came in early that year.");
        assert_eq!(resp.finish_reason, FinishReason::EndTurn);
        assert_eq!(resp.usage.total_tokens, 150);
    }

    #[test]
    fn parse_response_handles_incomplete_status() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let response_json = json!({
            "id": "resp_inc",
            "output": [
                { "type": "message", "content": [ { "type": "output_text", "text": "Partial..." } ] }
            ],
            "model": "gpt-4o",
            "status": "incomplete"
        });
        let resp = adapter.parse_response(response_json).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::MaxTokens);
    }

    #[test]
    fn parse_response_without_text_is_malformed() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let err = adapter
            .parse_response(json!({ "id": "resp_empty", "output": [] }))
            .unwrap_err();
        assert!(matches!(err, BookforgeError::MalformedResponse(_)));
    }

    #[test]
    fn batch_file_has_one_line_per_task() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let bytes = adapter
            .build_batch_file(&[
                ("chapter-1".into(), make_basic_request()),
                ("chapter-2".into(), make_basic_request()),
            ])
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["custom_id"], "chapter-1");
        assert_eq!(first["url"], "/v1/responses");
        assert_eq!(first["body"]["model"], "gpt-4o");
    }

    #[test]
    fn batch_output_skips_failed_tasks() {
        let adapter = OpenAiAdapter::new("test-key".into());
        let ok = json!({
            "custom_id": "chapter-1",
            "response": {
                "status_code": 200,
                "body": {
                    "id": "r1",
                    "output": [ { "type": "message", "content": [ { "type": "output_text", "text": "Chapter one." } ] } ]
                }
            }
        });
        let failed = json!({
            "custom_id": "chapter-2",
            "response": { "status_code": 500, "body": {} }
        });
        let jsonl = format!("{ok}\n{failed}\n");

        let results = adapter.parse_batch_output(&jsonl).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, "chapter-1");
        assert_eq!(results[0].response_text, "Chapter one.");
    }

    #[test]
    fn batch_status_mapping() {
        assert_eq!(map_batch_status("validating"), BatchStatus::Pending);
        assert_eq!(map_batch_status("in_progress"), BatchStatus::Pending);
        assert_eq!(map_batch_status("finalizing"), BatchStatus::Pending);
        assert_eq!(map_batch_status("completed"), BatchStatus::Completed);
        assert_eq!(map_batch_status("expired"), BatchStatus::Failed);
    }

    #[test]
    fn with_base_url_trims_trailing_slash() {
        let adapter = OpenAiAdapter::new("key".into()).with_base_url("https://proxy.local/".into());
        assert_eq!(adapter.base_url, "https://proxy.local");
    }

    #[test]
    fn error_mapping_429_rate_limited() {
        let err = map_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error": {"message": "rate limited", "retry_after": 3.0}}"#,
        );
        assert!(matches!(err, BookforgeError::RateLimited { retry_after_ms: 3000, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn error_mapping_401_auth() {
        let err = map_error(
            reqwest::StatusCode::UNAUTHORIZED,
            r#"{"error": {"message": "invalid api key"}}"#,
        );
        assert!(matches!(err, BookforgeError::AuthError { .. }));
    }

    #[test]
    fn error_mapping_500_retryable() {
        let err = map_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error": {"message": "server error"}}"#,
        );
        match &err {
            BookforgeError::ProviderError {
                retryable, status, message, ..
            } => {
                assert!(*retryable);
                assert_eq!(*status, 500);
                assert_eq!(message, "server error");
            }
            _ => panic!("expected ProviderError"),
        }
    }
}
