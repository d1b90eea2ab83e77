//! Image mirroring: copy every image referenced by `payload.html` into
//! object storage under a key derived from the item.
//!
//! Keys are `cases/<case>/<n>.<ext>` with `n` the 1-based position of the
//! image in the page, so a repeated run overwrites instead of duplicating.
//! With a [`WebpTranscoder`] every image is re-encoded and stored as
//! `<n>.webp`; without one the bytes are stored as downloaded.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;

use super::*;
use crate::error::{Error, Result};

static IMG_SRC_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#).expect("valid img regex")
});

static IMAGE_EXT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(jpe?g|png|gif|webp)(?:[?#]|$)").expect("valid extension regex")
});

/// Destination for mirrored bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key`, replacing any previous object. Returns the
    /// public URL of the object.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> std::result::Result<String, StepError>;
}

/// Object store on the local filesystem, served from `public_url`.
pub struct FsObjectStore {
    root: PathBuf,
    public_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> std::result::Result<String, StepError> {
        check_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("{}/{key}", self.public_url))
    }
}

/// Keys are relative paths without empty or parent segments.
pub(crate) fn check_key(key: &str) -> std::result::Result<(), StepError> {
    if key.split('/').any(|part| part.is_empty() || part == "..") {
        return Err(StepError::InvalidPayload(format!("bad object key: {key}")));
    }
    Ok(())
}

/// Downloads the images of a case page and uploads them by deterministic key.
pub struct MirrorImagesStep {
    client: reqwest::Client,
    store: Arc<dyn ObjectStore>,
    transcoder: Option<WebpTranscoder>,
    timeout: Duration,
}

impl MirrorImagesStep {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("caseflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            store,
            transcoder: None,
            timeout,
        })
    }

    /// Re-encode every image as WebP before upload.
    pub fn with_transcoder(mut self, transcoder: WebpTranscoder) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    async fn download(&self, url: &str) -> std::result::Result<Vec<u8>, StepError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StepError::Http {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Image URLs referenced by `<img src>` in page order, without repeats.
/// Relative sources are resolved against `base` when given, else dropped.
pub fn extract_image_urls(html: &str, base: Option<&str>) -> Vec<String> {
    let base = base.and_then(|b| reqwest::Url::parse(b).ok());
    let mut urls: Vec<String> = Vec::new();

    for cap in IMG_SRC_REGEX.captures_iter(html) {
        let src = cap[1].trim();
        if !IMAGE_EXT_REGEX.is_match(src) {
            continue;
        }
        let resolved = match reqwest::Url::parse(src) {
            Ok(url) => url,
            Err(_) => match base.as_ref().and_then(|b| b.join(src).ok()) {
                Some(url) => url,
                None => continue,
            },
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let resolved = resolved.to_string();
        if !urls.contains(&resolved) {
            urls.push(resolved);
        }
    }
    urls
}

/// Lowercase file extension of an image URL, `jpeg` folded into `jpg`.
fn image_ext(url: &str) -> &'static str {
    let ext = IMAGE_EXT_REGEX
        .captures(url)
        .map(|cap| cap[1].to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "png",
        "gif" => "gif",
        "webp" => "webp",
        _ => "jpg",
    }
}

fn content_type(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl ProcessingStep for MirrorImagesStep {
    fn name(&self) -> &str {
        "mirror"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(&self, item: &WorkItem) -> std::result::Result<StepOutcome, StepError> {
        let html = payload_str(item, "html")?;
        let base = item.payload.get("base_url").and_then(|v| v.as_str());

        let urls = extract_image_urls(html, base);
        if urls.is_empty() {
            return Ok(StepOutcome::Skip("no images in page".to_string()));
        }

        let segment = key_segment(item);
        let mut artifacts = Vec::with_capacity(urls.len());
        let mut last_error = None;

        for (i, url) in urls.iter().enumerate() {
            let bytes = match self.download(url).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "image download failed");
                    last_error = Some(e);
                    continue;
                }
            };

            let (bytes, ext) = match &self.transcoder {
                Some(transcoder) => match transcoder.transcode(bytes).await {
                    Ok(webp) => (webp, "webp"),
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "image transcode failed");
                        last_error = Some(e);
                        continue;
                    }
                },
                None => (bytes, image_ext(url)),
            };
            let key = format!("cases/{segment}/{}.{ext}", i + 1);
            let size = bytes.len();
            let public_url = self.store.put(&key, bytes, content_type(ext)).await?;

            artifacts.push(Artifact::new(
                "image",
                key,
                json!({ "source": url, "url": public_url, "bytes": size }),
            ));
        }

        if artifacts.is_empty() {
            // Nothing could be stored: surface the last error so it gets classified.
            return Err(last_error
                .unwrap_or_else(|| StepError::Network("no image downloaded".to_string())));
        }

        Ok(StepOutcome::Done(StepOutput {
            data: json!({
                "images": artifacts.len(),
                "failed": urls.len() - artifacts.len(),
            }),
            artifacts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_only_image_sources_in_order() {
        let html = r#"
            <p><img class="x" src="https://a.test/1.JPG"></p>
            <img src='https://a.test/2.png?w=200'>
            <img src="https://a.test/tracker.php">
            <img src="https://a.test/1.JPG">
            <img data-src="https://a.test/lazy.png" src="https://a.test/3.webp">
        "#;
        assert_eq!(
            extract_image_urls(html, None),
            vec![
                "https://a.test/1.JPG",
                "https://a.test/2.png?w=200",
                "https://a.test/3.webp",
            ]
        );
    }

    #[test]
    fn relative_sources_need_a_base() {
        let html = r#"<img src="/photos/a.jpeg">"#;
        assert!(extract_image_urls(html, None).is_empty());
        assert_eq!(
            extract_image_urls(html, Some("https://cases.test/case/7")),
            vec!["https://cases.test/photos/a.jpeg"]
        );
    }

    #[test]
    fn extension_folds_jpeg() {
        assert_eq!(image_ext("https://a.test/x.JPEG"), "jpg");
        assert_eq!(image_ext("https://a.test/x.gif#frag"), "gif");
        assert_eq!(content_type("webp"), "image/webp");
    }
}
