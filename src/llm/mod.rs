//! LLM provider setup via rig-core.
//!
//! [`anthropic_client`] builds an Anthropic client from a
//! [`SecretString`]-wrapped API key; [`RigGenerator`] puts a rig agent
//! behind the annotation step's [`TextGenerator`] seam.
//!
//! # Example
//! ```no_run
//! use caseflow::llm::{anthropic_client, RigGenerator};
//! use secrecy::SecretString;
//!
//! let key = SecretString::from("sk-ant-...");
//! let client = anthropic_client(&key).expect("failed to create Anthropic client");
//! let generator = RigGenerator::new(client, "claude-sonnet-4-20250514");
//! ```
//!
//! [`SecretString`]: secrecy::SecretString

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::{ExposeSecret, SecretString};
use tracing::Instrument;

use crate::step::{StepError, TextGenerator};
use crate::telemetry::genai;

/// Default model for annotation.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const PREAMBLE: &str = "You write concise, factual SEO metadata for images on \
    missing-person case pages. Follow the requested line format exactly.";

/// Create an Anthropic client from a secret API key.
///
/// # Errors
/// Returns an error if the underlying HTTP client cannot be constructed.
pub fn anthropic_client(
    api_key: &SecretString,
) -> Result<rig::providers::anthropic::Client, rig::http_client::Error> {
    rig::providers::anthropic::Client::new(api_key.expose_secret())
}

/// [`TextGenerator`] backed by a rig agent on Anthropic.
pub struct RigGenerator {
    client: rig::providers::anthropic::Client,
    model: String,
    max_tokens: u64,
}

impl RigGenerator {
    pub fn new(client: rig::providers::anthropic::Client, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens: 2048,
        }
    }
}

#[async_trait]
impl TextGenerator for RigGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, StepError> {
        let span = genai::start_chat_span(&self.model, "anthropic");

        let agent = self
            .client
            .agent(&self.model)
            .preamble(PREAMBLE)
            .max_tokens(self.max_tokens)
            .build();

        let response = async { agent.prompt(prompt).await }
            .instrument(span.clone())
            .await
            .map_err(|e| StepError::Provider(e.to_string()))?;

        genai::record_response_length(&span, response.len());
        Ok(response)
    }
}
