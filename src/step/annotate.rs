//! SEO annotation: ask a text generator for image filenames, alt text and
//! captions, one `original|new|alt|caption` line per image.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::*;

static SCRIPT_STYLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>").expect("valid regex")
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));

static SPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid space regex"));

/// Prompt in, text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, StepError>;
}

/// One parsed annotation line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAnnotation {
    pub original: String,
    pub filename: String,
    pub alt: String,
    pub caption: String,
}

pub struct AnnotateStep {
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    max_chars: usize,
}

impl AnnotateStep {
    pub fn new(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self {
            generator,
            timeout,
            max_chars: 4000,
        }
    }

    /// Cap on page text sent to the generator.
    pub fn max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

#[async_trait]
impl ProcessingStep for AnnotateStep {
    fn name(&self) -> &str {
        "annotate"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process(&self, item: &WorkItem) -> Result<StepOutcome, StepError> {
        let html = payload_str(item, "html")?;
        let text = strip_tags(html);
        if text.is_empty() {
            return Ok(StepOutcome::Skip("page has no text".to_string()));
        }

        let images: Vec<&str> = item
            .payload
            .get("images")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        let prompt = build_prompt(&clip(&text, self.max_chars), &images);
        let response = self.generator.generate(&prompt).await?;

        let annotations = parse_annotations(&response);
        if annotations.is_empty() {
            return Err(StepError::Malformed(
                "no original|new|alt|caption lines in response".to_string(),
            ));
        }

        let segment = key_segment(item);
        let artifacts = annotations
            .iter()
            .map(|a| {
                Ok(Artifact::new(
                    "seo",
                    format!("seo/{segment}/{}", a.filename),
                    serde_json::to_value(a).map_err(|e| StepError::Malformed(e.to_string()))?,
                ))
            })
            .collect::<Result<Vec<_>, StepError>>()?;

        Ok(StepOutcome::Done(StepOutput {
            data: serde_json::json!({ "annotations": annotations.len() }),
            artifacts,
        }))
    }
}

fn build_prompt(text: &str, images: &[&str]) -> String {
    let mut prompt = String::from(
        "Write SEO metadata for the images of the page below. Answer with one line per \
         image and nothing else, in the form original|new-filename|alt text|caption.\n",
    );
    if !images.is_empty() {
        prompt.push_str("\nImages:\n");
        for image in images {
            prompt.push_str(image);
            prompt.push('\n');
        }
    }
    prompt.push_str("\nPage:\n");
    prompt.push_str(text);
    prompt
}

/// Visible text of an HTML fragment, whitespace collapsed.
pub fn strip_tags(html: &str) -> String {
    let without_code = SCRIPT_STYLE_REGEX.replace_all(html, " ");
    let text = TAG_REGEX.replace_all(&without_code, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    SPACE_REGEX.replace_all(&text, " ").trim().to_string()
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Parse `original|new|alt|caption` lines. Lines without a pipe, header
/// lines and lines with fewer than four fields are ignored. New filenames
/// are normalized and made unique.
pub fn parse_annotations(response: &str) -> Vec<ImageAnnotation> {
    let mut seen = HashSet::new();
    let mut annotations = Vec::new();

    for line in response.lines() {
        if !line.contains('|') {
            continue;
        }
        let fields: Vec<&str> = line
            .trim()
            .trim_start_matches(['-', '*'])
            .split('|')
            .map(str::trim)
            .collect();
        if fields.len() < 4 || fields[0].is_empty() || fields[1].is_empty() {
            continue;
        }
        if fields[0].eq_ignore_ascii_case("original") {
            continue;
        }

        let Some(stem) = filename_stem(fields[1]) else {
            continue;
        };
        let mut filename = format!("{stem}.webp");
        let mut n = 2;
        while !seen.insert(filename.clone()) {
            filename = format!("{stem}-{n}.webp");
            n += 1;
        }

        annotations.push(ImageAnnotation {
            original: fields[0].to_string(),
            filename,
            alt: fields[2].to_string(),
            caption: fields[3..].join("|"),
        });
    }
    annotations
}

/// Lowercase, quotes removed, whitespace to dashes, image extension dropped.
fn filename_stem(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '`'))
        .map(|c| if c.is_whitespace() || c == '/' { '-' } else { c })
        .collect();

    let stem = match cleaned.rsplit_once('.') {
        Some((stem, ext)) if matches!(ext, "webp" | "jpg" | "jpeg" | "png" | "gif") => stem,
        _ => cleaned.as_str(),
    };
    let stem = stem.trim_matches(['-', '.']);
    (!stem.is_empty()).then(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lines_and_normalizes_filenames() {
        let response = "Here you go:\n\
            original|new|alt|caption\n\
            IMG_01.jpg|\"Jane Doe Portrait\".JPG|Jane Doe in 2019|Last seen photo\n\
            img_02.png|jane-doe-portrait.png|Second photo|Taken at home | 2018\n\
            broken|line\n";

        let parsed = parse_annotations(response);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].original, "IMG_01.jpg");
        assert_eq!(parsed[0].filename, "jane-doe-portrait.webp");
        assert_eq!(parsed[0].alt, "Jane Doe in 2019");
        assert_eq!(parsed[1].filename, "jane-doe-portrait-2.webp");
        assert_eq!(parsed[1].caption, "Taken at home|2018");
    }

    #[test]
    fn nothing_parseable_yields_empty() {
        assert!(parse_annotations("I cannot help with that.").is_empty());
        assert!(parse_annotations("a|''|alt|caption").is_empty());
    }

    #[test]
    fn strip_tags_drops_markup_and_scripts() {
        let html = "<div><script>var x = 1;</script><p>Missing&nbsp;since  <b>2019</b></p>\
                    <style>p{}</style>Tom &amp; Jerry</div>";
        assert_eq!(strip_tags(html), "Missing since 2019 Tom & Jerry");
    }
}
