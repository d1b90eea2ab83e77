//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Pipeline definitions live in a TOML file, see [`pipeline`].

pub mod pipeline;
pub mod secrets;

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::step::S3Settings;
use secrecy::SecretString;

pub use pipeline::{Overrides, PipelineDef, PipelineRegistry, StepKind, Storage};

#[derive(Debug)]
pub struct Config {
    /// e.g. `sqlite://caseflow.db`
    pub database_url: SecretString,
    /// Only needed by the annotate step.
    pub anthropic_api_key: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Pipeline definitions file. Built-in pipelines are used when it
    /// does not exist.
    pub pipelines_path: PathBuf,
    /// Bucket for `storage = "s3"` pipelines, present when `B2_BUCKET` is set.
    pub s3: Option<S3Settings>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            anthropic_api_key: optional_var("ANTHROPIC_API_KEY").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            pipelines_path: pipelines_path(),
            s3: s3_from_env()?,
        })
    }
}

/// `CASEFLOW_PIPELINES`, or `pipelines.toml` in the working directory.
pub fn pipelines_path() -> PathBuf {
    optional_var("CASEFLOW_PIPELINES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pipelines.toml"))
}

/// Once a bucket is named, the rest of the connection must be too.
fn s3_from_env() -> Result<Option<S3Settings>> {
    let Some(bucket) = optional_var("B2_BUCKET") else {
        return Ok(None);
    };
    Ok(Some(S3Settings {
        endpoint: required_var("B2_ENDPOINT")?,
        region: required_var("B2_REGION")?,
        bucket,
        access_key_id: required_var("B2_KEY_ID")?,
        secret_access_key: SecretString::from(required_var("B2_APPLICATION_KEY")?),
        public_url: required_var("B2_PUBLIC_URL")?,
    }))
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
