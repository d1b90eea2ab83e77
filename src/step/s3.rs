//! S3-compatible object storage (Backblaze B2 speaks this API).
//!
//! Objects are written with a single path-style `PUT` signed with AWS
//! Signature Version 4. The payload hash is sent, so nothing is streamed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use super::StepError;
use super::mirror::{ObjectStore, check_key};
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Bucket location and credentials.
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// e.g. `https://s3.us-east-005.backblazeb2.com`
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    /// Base URL objects are served from.
    pub public_url: String,
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    settings: S3Settings,
}

impl S3ObjectStore {
    pub fn new(settings: S3Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("caseflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("failed to build http client: {e}")))?;
        Ok(Self { client, settings })
    }

    fn object_path(&self, key: &str) -> String {
        let key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("/{}/{key}", uri_encode(&self.settings.bucket))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> std::result::Result<String, StepError> {
        check_key(key)?;
        let path = self.object_path(key);
        let url = reqwest::Url::parse(&format!(
            "{}{path}",
            self.settings.endpoint.trim_end_matches('/')
        ))
        .map_err(|e| StepError::InvalidPayload(format!("bad object url: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(StepError::InvalidPayload(format!("no host in {url}"))),
        };

        let payload_hash = format!("{:x}", Sha256::digest(&bytes));
        let signed = sign_put(
            &self.settings,
            &SignedPut {
                host: &host,
                path: &path,
                content_type,
                payload_hash: &payload_hash,
            },
            Utc::now(),
        )?;

        let response = self
            .client
            .put(url)
            .header("content-type", content_type)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(bytes)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(format!(
            "{}/{key}",
            self.settings.public_url.trim_end_matches('/')
        ))
    }
}

/// The parts of a `PUT` that get signed.
#[derive(Debug)]
pub(crate) struct SignedPut<'a> {
    pub host: &'a str,
    /// Already URI-encoded.
    pub path: &'a str,
    pub content_type: &'a str,
    pub payload_hash: &'a str,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

const SIGNED_HEADERS: &str = "content-type;host;x-amz-content-sha256;x-amz-date";

pub(crate) fn sign_put(
    settings: &S3Settings,
    req: &SignedPut<'_>,
    now: DateTime<Utc>,
) -> std::result::Result<Signature, StepError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/s3/aws4_request", settings.region);

    let canonical_request = format!(
        "PUT\n{path}\n\ncontent-type:{ct}\nhost:{host}\nx-amz-content-sha256:{hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{hash}",
        path = req.path,
        ct = req.content_type.trim(),
        host = req.host,
        hash = req.payload_hash,
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{:x}",
        Sha256::digest(canonical_request.as_bytes())
    );

    let secret = format!("AWS4{}", settings.secret_access_key.expose_secret());
    let mut key = hmac_sha256(secret.as_bytes(), date.as_bytes())?;
    for part in [settings.region.as_str(), "s3", "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    let signature = hmac_sha256(&key, string_to_sign.as_bytes())?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    Ok(Signature {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            settings.access_key_id
        ),
        amz_date,
    })
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> std::result::Result<Vec<u8>, StepError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| StepError::Io(format!("signing key rejected: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything except the unreserved set.
fn uri_encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
