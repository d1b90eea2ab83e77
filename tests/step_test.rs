//! Processing steps against mocked HTTP services and a fake text generator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use caseflow::model::*;
use caseflow::step::{
    self, AnnotateStep, ErrorClass, FetchStep, FsObjectStore, MirrorImagesStep, ObjectStore,
    ProcessingResult, ProcessingStep, S3ObjectStore, S3Settings, StepError, TextGenerator,
    WebpTranscoder,
};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use caseflow::store::{MemoryStore, SubmitResult, WorkStore};
use serde_json::{Value, json};
use wiremock::matchers::{header, header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn item(dedup_key: &str, payload: Value) -> WorkItem {
    let store = MemoryStore::new();
    match store
        .submit(NewWorkItem::new("cases").dedup_key(dedup_key).payload(payload))
        .await
        .unwrap()
    {
        SubmitResult::Created(item) => *item,
        _ => panic!("expected Created"),
    }
}

fn success(result: ProcessingResult) -> step::StepOutput {
    match result {
        ProcessingResult::Success(output) => output,
        other => panic!("expected Success, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_keeps_the_page_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/case/17"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Jane Doe</h1>"))
        .mount(&server)
        .await;

    let url = format!("{}/case/17", server.uri());
    let item = item("case-17", json!({ "url": url })).await;
    let fetch = FetchStep::new(TIMEOUT).unwrap();

    let output = success(step::execute(&fetch, &item).await);
    assert_eq!(output.data["key"], "pages/case-17.html");
    assert_eq!(output.artifacts.len(), 1);
    assert_eq!(output.artifacts[0].kind, "page");
    assert_eq!(output.artifacts[0].data["body"], "<h1>Jane Doe</h1>");
    assert_eq!(output.artifacts[0].data["status"], 200);
}

#[tokio::test]
async fn fetch_classifies_http_errors() {
    let server = MockServer::start().await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;
    Mock::given(path("/broken"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(path("/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&server)
        .await;
    let fetch = FetchStep::new(TIMEOUT).unwrap();

    let cases = [
        ("/busy", ErrorClass::RateLimited, true),
        ("/broken", ErrorClass::TransientIo, true),
        ("/gone", ErrorClass::Fatal, false),
    ];
    for (route, expected, retryable) in cases {
        let item = item(route, json!({ "url": format!("{}{route}", server.uri()) })).await;
        match step::execute(&fetch, &item).await {
            ProcessingResult::Retryable { class, .. } if retryable => assert_eq!(class, expected),
            ProcessingResult::Fatal { class, reason } if !retryable => {
                assert_eq!(class, expected);
                assert!(reason.contains("404"), "{reason}");
            }
            other => panic!("{route}: unexpected {other:?}"),
        }
    }
}

#[tokio::test]
async fn fetch_without_url_is_fatal() {
    let fetch = FetchStep::new(TIMEOUT).unwrap();
    let item = item("case-1", json!({ "html": "<p/>" })).await;
    match step::execute(&fetch, &item).await {
        ProcessingResult::Fatal { class, .. } => assert_eq!(class, ErrorClass::Fatal),
        other => panic!("expected Fatal, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_server_times_out_as_transient() {
    let server = MockServer::start().await;
    Mock::given(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("late")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let fetch = FetchStep::new(Duration::from_millis(100)).unwrap();
    let item = item("slow", json!({ "url": format!("{}/slow", server.uri()) })).await;
    match step::execute(&fetch, &item).await {
        ProcessingResult::Retryable { class, reason } => {
            assert_eq!(class, ErrorClass::TransientIo);
            assert_eq!(reason, "timed out");
        }
        other => panic!("expected Retryable, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// mirror
// ---------------------------------------------------------------------------

async fn image_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(path("/img/1.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .mount(&server)
        .await;
    Mock::given(path("/img/2.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(path("/img/3.webp"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF".to_vec()))
        .mount(&server)
        .await;
    Mock::given(path("/img/down.jpg"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

fn mirror(root: &std::path::Path) -> MirrorImagesStep {
    let store = Arc::new(FsObjectStore::new(root, "https://cdn.test/images/"));
    MirrorImagesStep::new(store, TIMEOUT).unwrap()
}

#[tokio::test]
async fn mirror_uploads_what_it_can_under_stable_keys() {
    let server = image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mirror = mirror(dir.path());

    let html = format!(
        r#"<img src="{0}/img/1.jpg"><img src="/img/2.png"><img src="{0}/img/3.webp">"#,
        server.uri()
    );
    let item = item("case 9", json!({ "html": html, "base_url": server.uri() })).await;

    let first = success(step::execute(&mirror, &item).await);
    assert_eq!(first.data, json!({ "images": 2, "failed": 1 }));
    let keys: Vec<&str> = first.artifacts.iter().map(|a| a.key.as_str()).collect();
    assert_eq!(keys, vec!["cases/case_9/1.jpg", "cases/case_9/3.webp"]);
    assert_eq!(
        first.artifacts[0].data["url"],
        "https://cdn.test/images/cases/case_9/1.jpg"
    );
    assert_eq!(
        std::fs::read(dir.path().join("cases/case_9/1.jpg")).unwrap(),
        vec![0xFF, 0xD8, 0xFF]
    );

    // Running again overwrites the same objects.
    let second = success(step::execute(&mirror, &item).await);
    assert_eq!(second, first);
    let files = std::fs::read_dir(dir.path().join("cases/case_9")).unwrap().count();
    assert_eq!(files, 2);
}

#[tokio::test]
async fn mirror_with_every_download_failing_is_retryable() {
    let server = image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let html = format!(r#"<img src="{}/img/down.jpg">"#, server.uri());
    let item = item("case-3", json!({ "html": html })).await;

    match step::execute(&mirror(dir.path()), &item).await {
        ProcessingResult::Retryable { class, .. } => assert_eq!(class, ErrorClass::RateLimited),
        other => panic!("expected Retryable, got {other:?}"),
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([20, 90, 160]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

#[tokio::test]
async fn transcoding_mirror_stores_bounded_webp() {
    let server = MockServer::start().await;
    Mock::given(path("/img/portrait.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png(2000, 1000)))
        .mount(&server)
        .await;
    Mock::given(path("/img/small.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png(640, 480)))
        .mount(&server)
        .await;
    Mock::given(path("/img/broken.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>404</html>"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsObjectStore::new(dir.path(), "https://cdn.test/images"));
    let mirror = MirrorImagesStep::new(store, TIMEOUT)
        .unwrap()
        .with_transcoder(WebpTranscoder::default());

    let html = format!(
        r#"<img src="{0}/img/portrait.png"><img src="{0}/img/broken.jpg"><img src="{0}/img/small.jpg">"#,
        server.uri()
    );
    let item = item("case-12", json!({ "html": html })).await;
    let output = success(step::execute(&mirror, &item).await);

    assert_eq!(output.data, json!({ "images": 2, "failed": 1 }));
    let keys: Vec<&str> = output.artifacts.iter().map(|a| a.key.as_str()).collect();
    assert_eq!(keys, vec!["cases/case-12/1.webp", "cases/case-12/3.webp"]);
    assert_eq!(
        output.artifacts[0].data["url"],
        "https://cdn.test/images/cases/case-12/1.webp"
    );

    let stored = std::fs::read(dir.path().join("cases/case-12/1.webp")).unwrap();
    assert_eq!(&stored[..4], b"RIFF");
    assert_eq!(&stored[8..12], b"WEBP");
    let decoded = image::load_from_memory(&stored).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (1200, 600));

    let small = std::fs::read(dir.path().join("cases/case-12/3.webp")).unwrap();
    let decoded = image::load_from_memory(&small).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));
}

#[tokio::test]
async fn mirror_with_only_undecodable_images_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(path("/img/fake.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not really a jpeg"))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();
    let mirror = MirrorImagesStep::new(Arc::new(FsObjectStore::new(dir.path(), "")), TIMEOUT)
        .unwrap()
        .with_transcoder(WebpTranscoder::default());

    let html = format!(r#"<img src="{}/img/fake.jpg">"#, server.uri());
    let item = item("case-13", json!({ "html": html })).await;
    match step::execute(&mirror, &item).await {
        ProcessingResult::Fatal { class, .. } => assert_eq!(class, ErrorClass::MalformedResult),
        other => panic!("expected Fatal, got {other:?}"),
    }
}

#[tokio::test]
async fn mirror_skips_pages_without_images() {
    let dir = tempfile::tempdir().unwrap();
    let item = item("case-4", json!({ "html": "<p>No photo on file.</p>" })).await;
    assert_eq!(
        step::execute(&mirror(dir.path()), &item).await,
        ProcessingResult::Skipped("no images in page".into())
    );
}

// ---------------------------------------------------------------------------
// S3-compatible storage
// ---------------------------------------------------------------------------

fn bucket(endpoint: String) -> S3Settings {
    S3Settings {
        endpoint,
        region: "us-east-005".into(),
        bucket: "case-images".into(),
        access_key_id: "005keyid".into(),
        secret_access_key: SecretString::from("app-key".to_string()),
        public_url: "https://f005.backblazeb2.com/file/case-images/".into(),
    }
}

#[tokio::test]
async fn s3_store_puts_signed_objects() {
    let server = MockServer::start().await;
    let body = b"RIFF....WEBPVP8 ".to_vec();
    let payload_hash = format!("{:x}", Sha256::digest(&body));
    Mock::given(method("PUT"))
        .and(path("/case-images/cases/case-5/1.webp"))
        .and(header("content-type", "image/webp"))
        .and(header("x-amz-content-sha256", payload_hash.as_str()))
        .and(header_regex("x-amz-date", r"^\d{8}T\d{6}Z$"))
        .and(header_regex(
            "authorization",
            r"^AWS4-HMAC-SHA256 Credential=005keyid/\d{8}/us-east-005/s3/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=[0-9a-f]{64}$",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = S3ObjectStore::new(bucket(server.uri())).unwrap();
    let url = store
        .put("cases/case-5/1.webp", body, "image/webp")
        .await
        .unwrap();
    assert_eq!(
        url,
        "https://f005.backblazeb2.com/file/case-images/cases/case-5/1.webp"
    );
}

#[tokio::test]
async fn s3_rejections_keep_their_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503).set_body_string("SlowDown"))
        .mount(&server)
        .await;

    let store = S3ObjectStore::new(bucket(server.uri())).unwrap();
    match store.put("cases/case-5/1.webp", vec![1, 2, 3], "image/webp").await {
        Err(StepError::Http { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "SlowDown");
        }
        other => panic!("expected Http error, got {other:?}"),
    }
    assert!(matches!(
        store.put("cases/../secrets", vec![], "image/webp").await,
        Err(StepError::InvalidPayload(_))
    ));
}

// ---------------------------------------------------------------------------
// annotate
// ---------------------------------------------------------------------------

/// Replies with a canned response and remembers the prompts it saw.
struct CannedGenerator {
    reply: std::result::Result<String, StepError>,
    prompts: Mutex<Vec<String>>,
}

impl CannedGenerator {
    fn new(reply: std::result::Result<&str, StepError>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, prompt: &str) -> std::result::Result<String, StepError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.reply.clone()
    }
}

fn case_page() -> Value {
    json!({
        "html": "<h1>Jane Doe</h1><script>track()</script><p>Missing since 2019.</p>",
        "images": ["https://cdn.test/images/cases/case-5/1.jpg"],
    })
}

#[tokio::test]
async fn annotate_turns_lines_into_artifacts() {
    let generator = CannedGenerator::new(Ok(
        "1.jpg|Jane Doe missing 2019.jpg|Jane Doe, missing since 2019|Last known photo",
    ));
    let annotate = AnnotateStep::new(generator.clone(), TIMEOUT);
    let item = item("case-5", case_page()).await;

    let output = success(step::execute(&annotate, &item).await);
    assert_eq!(output.data, json!({ "annotations": 1 }));
    assert_eq!(output.artifacts[0].kind, "seo");
    assert_eq!(output.artifacts[0].key, "seo/case-5/jane-doe-missing-2019.webp");
    assert_eq!(output.artifacts[0].data["alt"], "Jane Doe, missing since 2019");

    let prompts = generator.prompts.lock().unwrap();
    assert!(prompts[0].contains("Jane Doe Missing since 2019."));
    assert!(prompts[0].contains("cases/case-5/1.jpg"));
    assert!(!prompts[0].contains("track()"));
}

#[tokio::test]
async fn annotate_rejects_unparseable_responses() {
    let annotate = AnnotateStep::new(CannedGenerator::new(Ok("Sorry, I can't.")), TIMEOUT);
    let item = item("case-6", case_page()).await;
    match step::execute(&annotate, &item).await {
        ProcessingResult::Fatal { class, .. } => assert_eq!(class, ErrorClass::MalformedResult),
        other => panic!("expected Fatal, got {other:?}"),
    }
}

#[tokio::test]
async fn annotate_classifies_provider_errors() {
    let item = item("case-7", case_page()).await;

    let quota = CannedGenerator::new(Err(StepError::Provider(
        "CompletionError: ProviderError: 429 rate_limit_error".into(),
    )));
    match step::execute(&AnnotateStep::new(quota, TIMEOUT), &item).await {
        ProcessingResult::Retryable { class, .. } => assert_eq!(class, ErrorClass::RateLimited),
        other => panic!("expected Retryable, got {other:?}"),
    }

    let overloaded = CannedGenerator::new(Err(StepError::Provider("overloaded_error".into())));
    match step::execute(&AnnotateStep::new(overloaded, TIMEOUT), &item).await {
        ProcessingResult::Retryable { class, .. } => assert_eq!(class, ErrorClass::TransientIo),
        other => panic!("expected Retryable, got {other:?}"),
    }

    let refused = CannedGenerator::new(Err(StepError::Provider("invalid x-api-key".into())));
    assert!(matches!(
        step::execute(&AnnotateStep::new(refused, TIMEOUT), &item).await,
        ProcessingResult::Fatal { .. }
    ));
}

#[tokio::test]
async fn annotate_skips_empty_pages() {
    let annotate = AnnotateStep::new(CannedGenerator::new(Ok("unused")), TIMEOUT);
    let item = item("case-8", json!({ "html": "<div><img src=\"x.jpg\"></div>" })).await;
    let result = step::execute(&annotate, &item).await;
    assert!(matches!(result, ProcessingResult::Skipped(_)));
    assert_eq!(result.label(), "skipped");
}

#[test]
fn step_names() {
    let fetch = FetchStep::new(TIMEOUT).unwrap();
    assert_eq!(fetch.name(), "fetch");
    assert_eq!(fetch.timeout(), TIMEOUT);
}
