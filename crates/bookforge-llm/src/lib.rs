//! Generation service contract and the OpenAI adapter behind it.
//!
//! Provides the `GenerationService` trait consumed by the pipeline, the
//! wire-level `ProviderAdapter` trait, a middleware chain, and `LlmClient`,
//! which joins the two.

mod client;
mod openai;
mod provider;
mod service;
mod types;

pub use client::*;
pub use openai::OpenAiAdapter;
pub use provider::*;
pub use service::GenerationService;
pub use types::*;
