//! Pipeline definitions and registry.
//!
//! A pipeline binds a queue to a processing step with its batch size,
//! pacing, retry policy and timeouts. Definitions are `[[pipeline]]` tables
//! in a TOML file:
//!
//! ```toml
//! [[pipeline]]
//! name = "webp"
//! step = "mirror"
//! batch_size = 50
//! min_wait_secs = 3
//! max_wait_secs = 5
//! require_field = ["html"]
//! webp_quality = 80.0
//! output_dir = "public/images"
//! public_url = "https://cdn.example.org"
//! ```
//!
//! `storage = "s3"` sends mirrored images to the bucket configured by the
//! `B2_*` environment variables instead of `output_dir`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::backoff::{BackoffScheduler, Pacing, RetryBackoff};
use crate::engine::claim::{ClaimStrategy, DEFAULT_BATCH_SIZE};
use crate::engine::runner::{DEFAULT_MAX_ATTEMPTS, RunnerConfig};
use crate::error::{Error, Result};
use crate::llm;
use crate::step::transcode::DEFAULT_MAX_DIMENSION;
use crate::step::{
    AnnotateStep, FetchStep, FsObjectStore, MirrorImagesStep, ObjectStore, ProcessingStep,
    S3ObjectStore, S3Settings, WebpTranscoder,
};
use crate::store::ClaimOrder;

/// Used when no pipelines file exists.
pub const BUILTIN_PIPELINES: &str = r#"
[[pipeline]]
name = "fetch"
step = "fetch"
min_wait_secs = 5
max_wait_secs = 20
require_field = ["url"]

[[pipeline]]
name = "webp"
step = "mirror"
batch_size = 50
min_wait_secs = 3
max_wait_secs = 5
require_field = ["html"]
webp_quality = 80.0
output_dir = "public/images"
public_url = "http://localhost:8080/images"

[[pipeline]]
name = "seo"
step = "annotate"
min_wait_secs = 8
max_wait_secs = 15
step_timeout_secs = 45
require_field = ["html"]
"#;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PipelineFile {
    #[serde(default)]
    pipeline: Vec<PipelineDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    Mirror,
    Annotate,
}

/// Destination of mirrored images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// `output_dir`, served from `public_url`.
    #[default]
    Fs,
    /// S3-compatible bucket from the environment.
    S3,
}

/// One `[[pipeline]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDef {
    pub name: String,
    /// Defaults to the pipeline name.
    pub queue: Option<String>,
    pub step: StepKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub order: ClaimOrder,
    #[serde(default)]
    pub min_wait_secs: u64,
    #[serde(default)]
    pub max_wait_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    #[serde(default = "default_rate_limit_factor")]
    pub rate_limit_factor: f64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default)]
    pub require_field: Vec<String>,
    pub max_iterations: Option<u64>,
    pub max_runtime_secs: Option<u64>,

    // Step-specific
    #[serde(default)]
    pub storage: Storage,
    /// Re-encode mirrored images as WebP at this quality (0 to 100).
    pub webp_quality: Option<f32>,
    /// Longest side of a re-encoded image.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    pub output_dir: Option<PathBuf>,
    pub public_url: Option<String>,
    pub model: Option<String>,
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_base_secs() -> u64 {
    20
}

fn default_retry_cap_secs() -> u64 {
    3600
}

fn default_rate_limit_factor() -> f64 {
    3.0
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_step_timeout_secs() -> u64 {
    20
}

fn default_max_dimension() -> u32 {
    DEFAULT_MAX_DIMENSION
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub batch_size: Option<u32>,
    pub min_wait_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
    pub max_iterations: Option<u64>,
    pub max_runtime_secs: Option<u64>,
}

impl PipelineDef {
    pub fn queue(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.name)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(n) = overrides.batch_size {
            self.batch_size = n;
        }
        if let Some(s) = overrides.min_wait_secs {
            self.min_wait_secs = s;
        }
        if let Some(s) = overrides.max_wait_secs {
            self.max_wait_secs = s;
        }
        if overrides.max_iterations.is_some() {
            self.max_iterations = overrides.max_iterations;
        }
        if overrides.max_runtime_secs.is_some() {
            self.max_runtime_secs = overrides.max_runtime_secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("pipeline {}: {msg}", self.name)));

        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".into());
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1".into());
        }
        if self.min_wait_secs > self.max_wait_secs && self.max_wait_secs != 0 {
            return fail(format!(
                "min_wait_secs ({}) exceeds max_wait_secs ({})",
                self.min_wait_secs, self.max_wait_secs
            ));
        }
        if !self.rate_limit_factor.is_finite() || self.rate_limit_factor < 1.0 {
            return fail("rate_limit_factor must be a finite number >= 1".into());
        }
        if self.retry_cap_secs < self.retry_base_secs {
            return fail("retry_cap_secs is below retry_base_secs".into());
        }
        if self.step_timeout_secs == 0 {
            return fail("step_timeout_secs must be at least 1".into());
        }
        if self.stale_after_secs <= self.step_timeout_secs {
            // A claim could be reclaimed while its step is still running.
            return fail("stale_after_secs must exceed step_timeout_secs".into());
        }
        if self.step == StepKind::Mirror && self.storage == Storage::Fs && self.output_dir.is_none()
        {
            return fail("mirror step needs output_dir".into());
        }
        if let Some(q) = self
            .webp_quality
            .filter(|q| !(q.is_finite() && *q > 0.0 && *q <= 100.0))
        {
            return fail(format!("webp_quality must be in (0, 100], got {q}"));
        }
        if self.max_dimension == 0 {
            return fail("max_dimension must be at least 1".into());
        }
        Ok(())
    }

    pub fn claim_strategy(&self) -> ClaimStrategy {
        self.require_field.iter().fold(
            ClaimStrategy::new(self.queue())
                .limit(self.batch_size)
                .order(self.order),
            |strategy, field| strategy.require_field(field.clone()),
        )
    }

    pub fn backoff(&self) -> BackoffScheduler {
        // A lone min_wait means a fixed delay.
        let max_wait = self.max_wait_secs.max(self.min_wait_secs);
        BackoffScheduler::new(
            Pacing::from_secs(self.min_wait_secs, max_wait),
            RetryBackoff {
                base: Duration::from_secs(self.retry_base_secs),
                cap: Duration::from_secs(self.retry_cap_secs),
                rate_limit_factor: self.rate_limit_factor,
            },
        )
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            default_max_attempts: self.max_attempts,
            stale_after: Duration::from_secs(self.stale_after_secs),
            max_iterations: self.max_iterations,
            max_runtime: self.max_runtime_secs.map(Duration::from_secs),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Construct the processing step. The annotate step needs an API key,
    /// S3 storage needs bucket settings.
    pub fn build_step(
        &self,
        anthropic_api_key: Option<&SecretString>,
        s3: Option<&S3Settings>,
    ) -> Result<Arc<dyn ProcessingStep>> {
        let timeout = self.step_timeout();
        Ok(match self.step {
            StepKind::Fetch => Arc::new(FetchStep::new(timeout)?),
            StepKind::Mirror => {
                let mut step = MirrorImagesStep::new(self.object_store(s3)?, timeout)?;
                if let Some(quality) = self.webp_quality {
                    step = step.with_transcoder(WebpTranscoder::new(self.max_dimension, quality));
                }
                Arc::new(step)
            }
            StepKind::Annotate => {
                let key = anthropic_api_key.ok_or_else(|| {
                    Error::Config(format!(
                        "pipeline {}: ANTHROPIC_API_KEY is required for the annotate step",
                        self.name
                    ))
                })?;
                let client = llm::anthropic_client(key)
                    .map_err(|e| Error::Other(format!("failed to create Anthropic client: {e}")))?;
                let model = self.model.as_deref().unwrap_or(llm::DEFAULT_MODEL);
                let generator = Arc::new(llm::RigGenerator::new(client, model));
                Arc::new(AnnotateStep::new(generator, timeout))
            }
        })
    }

    fn object_store(&self, s3: Option<&S3Settings>) -> Result<Arc<dyn ObjectStore>> {
        match self.storage {
            Storage::Fs => {
                let root = self
                    .output_dir
                    .clone()
                    .ok_or_else(|| Error::Config(format!("pipeline {}: no output_dir", self.name)))?;
                let public_url = self
                    .public_url
                    .clone()
                    .unwrap_or_else(|| format!("file://{}", root.display()));
                Ok(Arc::new(FsObjectStore::new(root, public_url)))
            }
            Storage::S3 => {
                let settings = s3.ok_or_else(|| {
                    Error::Config(format!(
                        "pipeline {}: B2_BUCKET and its credentials are required for s3 storage",
                        self.name
                    ))
                })?;
                Ok(Arc::new(S3ObjectStore::new(settings.clone())?))
            }
        }
    }
}

/// Registry of pipelines, indexed by name.
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineDef>,
}

impl PipelineRegistry {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PipelineFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad pipelines file: {e}")))?;

        let mut pipelines = BTreeMap::new();
        for def in file.pipeline {
            def.validate()?;
            if pipelines.contains_key(&def.name) {
                return Err(Error::Config(format!("duplicate pipeline: {}", def.name)));
            }
            pipelines.insert(def.name.clone(), def);
        }
        Ok(Self { pipelines })
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_PIPELINES)
    }

    /// Load `path`, or the built-in pipelines when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no pipelines file, using built-in pipelines");
            return Self::builtin();
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipelines file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&PipelineDef> {
        self.pipelines.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }
}
