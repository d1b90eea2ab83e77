//! Page fetch: HTTP GET of `payload.url`, body kept as a page artifact.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::error::{Error, Result};

/// Downloads the page at `payload.url`.
pub struct FetchStep {
    client: reqwest::Client,
    timeout: Duration,
}

impl FetchStep {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("caseflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to build http client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl ProcessingStep for FetchStep {
    fn name(&self) -> &str {
        "fetch"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(&self, item: &WorkItem) -> std::result::Result<StepOutcome, StepError> {
        let url = payload_str(item, "url")?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::Http {
                status: status.as_u16(),
                body: truncate(body, 512),
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(StepError::Malformed(format!("empty body from {url}")));
        }

        let key = format!("pages/{}.html", key_segment(item));
        tracing::debug!(url, key = %key, bytes = body.len(), "page fetched");

        Ok(StepOutcome::Done(StepOutput {
            data: json!({ "url": url, "key": key, "bytes": body.len() }),
            artifacts: vec![Artifact::new(
                "page",
                key,
                json!({ "url": url, "status": status.as_u16(), "body": body }),
            )],
        }))
    }
}
