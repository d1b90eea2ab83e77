//! Processing steps: one fallible external operation per work item.
//!
//! A step declares a timeout and a classification from its raw errors to
//! an [`ErrorClass`]. The runner never sees a raw error: [`execute`] turns
//! every invocation into a [`ProcessingResult`].
//!
//! Steps must be safe to repeat. A reclaimed item may be processed again
//! after a crash, so object keys are derived from the item and derived rows
//! are replaced rather than appended.

pub mod annotate;
pub mod fetch;
pub mod mirror;
pub mod s3;
pub mod transcode;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use thiserror::Error;

use crate::model::{Artifact, WorkItem};
use crate::telemetry::metrics;

pub use annotate::{AnnotateStep, TextGenerator};
pub use fetch::FetchStep;
pub use mirror::{FsObjectStore, MirrorImagesStep, ObjectStore};
pub use s3::{S3ObjectStore, S3Settings};
pub use transcode::WebpTranscoder;

/// Default per-item timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Raw error from a step's external operation.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// The call succeeded but its result is unusable.
    #[error("malformed result: {0}")]
    Malformed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Error reported by a provider SDK, as text.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<reqwest::Error> for StepError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StepError::Timeout
        } else if let Some(status) = e.status() {
            StepError::Http {
                status: status.as_u16(),
                body: String::new(),
            }
        } else if e.is_decode() {
            StepError::Malformed(e.to_string())
        } else {
            StepError::Network(e.to_string())
        }
    }
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        StepError::Io(e.to_string())
    }
}

/// How a failed invocation should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network trouble or a timeout. Retry after the normal backoff.
    TransientIo,
    /// Explicit 429/503/quota signal. Retry after an extended backoff.
    RateLimited,
    /// Repeating would produce the same bad output. Terminal.
    MalformedResult,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::TransientIo | ErrorClass::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::TransientIo => "transient_io",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::MalformedResult => "malformed_result",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// What a step produced for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub data: serde_json::Value,
    pub artifacts: Vec<Artifact>,
}

/// Successful step return.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Done(StepOutput),
    /// Nothing to do for this item.
    Skip(String),
}

/// Classified outcome of one step invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult {
    Success(StepOutput),
    Retryable { class: ErrorClass, reason: String },
    Fatal { class: ErrorClass, reason: String },
    Skipped(String),
}

impl ProcessingResult {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingResult::Success(_) => "success",
            ProcessingResult::Retryable { .. } => "retryable",
            ProcessingResult::Fatal { .. } => "fatal",
            ProcessingResult::Skipped(_) => "skipped",
        }
    }
}

/// A fallible external operation applied to one work item.
#[async_trait]
pub trait ProcessingStep: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration {
        DEFAULT_STEP_TIMEOUT
    }

    async fn process(&self, item: &WorkItem) -> Result<StepOutcome, StepError>;

    fn classify(&self, err: &StepError) -> ErrorClass {
        classify_error(err)
    }
}

/// Default classification.
///
/// Provider SDKs only give us text, so rate-limit and quota signals are
/// matched on the message here and nowhere else.
pub fn classify_error(err: &StepError) -> ErrorClass {
    match err {
        StepError::Http { status, body } => match status {
            429 | 503 => ErrorClass::RateLimited,
            408 => ErrorClass::TransientIo,
            s if *s >= 500 => ErrorClass::TransientIo,
            _ if mentions_rate_limit(body) => ErrorClass::RateLimited,
            _ => ErrorClass::Fatal,
        },
        StepError::Timeout | StepError::Network(_) | StepError::Io(_) => ErrorClass::TransientIo,
        StepError::Malformed(_) => ErrorClass::MalformedResult,
        StepError::InvalidPayload(_) => ErrorClass::Fatal,
        StepError::Provider(msg) => {
            let msg = msg.to_lowercase();
            if mentions_rate_limit(&msg) || msg.contains("429") || msg.contains("503") {
                ErrorClass::RateLimited
            } else if ["timeout", "timed out", "connection", "overloaded", "500", "502", "504"]
                .iter()
                .any(|needle| msg.contains(needle))
            {
                ErrorClass::TransientIo
            } else {
                ErrorClass::Fatal
            }
        }
    }
}

fn mentions_rate_limit(text: &str) -> bool {
    let text = text.to_lowercase();
    ["quota", "rate limit", "rate_limit", "too many requests"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Run one step invocation under its timeout and classify the outcome.
pub async fn execute(step: &dyn ProcessingStep, item: &WorkItem) -> ProcessingResult {
    let started = Instant::now();

    let raw = match tokio::time::timeout(step.timeout(), step.process(item)).await {
        Ok(result) => result,
        Err(_) => Err(StepError::Timeout),
    };

    let result = match raw {
        Ok(StepOutcome::Done(output)) => ProcessingResult::Success(output),
        Ok(StepOutcome::Skip(reason)) => ProcessingResult::Skipped(reason),
        Err(err) => {
            let class = step.classify(&err);
            let reason = err.to_string();
            if class.is_retryable() {
                ProcessingResult::Retryable { class, reason }
            } else {
                ProcessingResult::Fatal { class, reason }
            }
        }
    };

    metrics::step_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[
            KeyValue::new("step", step.name().to_string()),
            KeyValue::new("result", result.label()),
        ],
    );
    result
}

/// Required string field of the item payload.
pub(crate) fn payload_str<'a>(item: &'a WorkItem, field: &str) -> Result<&'a str, StepError> {
    item.payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| StepError::InvalidPayload(format!("missing string field `{field}`")))
}

/// Item key made safe for use as a single object-key path segment.
pub(crate) fn key_segment(item: &WorkItem) -> String {
    item.stable_key()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Cut a response body down for error messages.
pub(crate) fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
