//! Source connectors: enumerate and download remote objects.
//!
//! The one production implementation targets S3-compatible object stores
//! using the REST API directly with AWS Signature V4 authentication (pure
//! Rust signing via `hmac` + `sha2`). Listing paginates through
//! `ListObjectsV2` continuation tokens; downloads land in a uniquely named
//! temp file whose directory is removed when the [`LocalFile`] is dropped,
//! on every exit path.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "name": "runbooks",
//!   "type": "object_store",
//!   "settings": {
//!     "bucket": "acme-docs",
//!     "prefix": "engineering/",
//!     "endpoint": "http://localhost:9000",
//!     "access_key_id": "...",
//!     "secret_access_key": "..."
//!   }
//! }
//! ```
//!
//! Credentials fall back to `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` /
//! `AWS_SESSION_TOKEN` when not present in the settings. A custom `endpoint`
//! (MinIO, LocalStack) switches to path-style addressing.
//!
//! # Failure semantics
//!
//! `validate()` issues a signed HEAD-bucket request; a failure there refuses
//! the connector. Per-object download errors surface to the caller so the
//! queue can retry the enclosing job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::factory::ObjectStoreSettings;
use crate::errors::SourceError;
use crate::models::{file_extension, CloudFile, LocalFile, Metadata, METADATA_LAST_MODIFIED};

type HmacSha256 = Hmac<Sha256>;

/// Enumerates and downloads remote objects for the extraction stage.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Instance name from the pipeline configuration.
    fn name(&self) -> &str;

    /// Cheap connectivity/authentication check. Called right after
    /// construction; failure is fatal for the pipeline.
    async fn validate(&self) -> Result<(), SourceError>;

    /// All objects under the configured prefix.
    async fn list_full(&self) -> Result<Vec<CloudFile>, SourceError>;

    /// Objects with `last_modified > since`.
    async fn list_delta(&self, since: DateTime<Utc>) -> Result<Vec<CloudFile>, SourceError>;

    /// Fetch one object to a scoped temp file.
    async fn download(&self, file: &CloudFile) -> Result<LocalFile, SourceError>;
}

/// Keep only objects newer than `since`. Objects without a parseable
/// `last_modified` are skipped for delta runs.
pub fn delta_filter(files: Vec<CloudFile>, since: DateTime<Utc>) -> Vec<CloudFile> {
    files
        .into_iter()
        .filter(|f| f.last_modified().map(|ts| ts > since).unwrap_or(false))
        .collect()
}

/// Temp file name for an object key: path separators escaped so the key
/// collapses into a single flat component.
fn escaped_file_name(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

// ═══════════════════════════════════════════════════════════════════════
// Object-store source
// ═══════════════════════════════════════════════════════════════════════

/// S3-compatible object-store source connector.
pub struct ObjectStoreSource {
    name: String,
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
    include: GlobSet,
    exclude: GlobSet,
    http: reqwest::Client,
}

impl ObjectStoreSource {
    /// Build the connector from its settings. Credential resolution and glob
    /// compilation happen here; connectivity is checked by [`validate`].
    ///
    /// [`validate`]: SourceConnector::validate
    pub fn new(name: String, settings: &ObjectStoreSettings) -> Result<Self, SourceError> {
        let access_key_id = settings
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| {
                SourceError::Connection("no access key in settings or AWS_ACCESS_KEY_ID".into())
            })?;
        let secret_access_key = settings
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| {
                SourceError::Connection(
                    "no secret key in settings or AWS_SECRET_ACCESS_KEY".into(),
                )
            })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        let include = build_globset(&settings.include_globs)
            .map_err(|e| SourceError::Connection(format!("invalid include glob: {e}")))?;
        let exclude = build_globset(&settings.exclude_globs)
            .map_err(|e| SourceError::Connection(format!("invalid exclude glob: {e}")))?;

        Ok(Self {
            name,
            bucket: settings.bucket.clone(),
            prefix: settings.prefix.clone().unwrap_or_default(),
            region: settings
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: settings.endpoint.clone(),
            access_key_id,
            secret_access_key,
            session_token,
            include,
            exclude,
            http: reqwest::Client::new(),
        })
    }

    /// Host and base path. Custom endpoints use path-style addressing
    /// (`host/bucket/key`); AWS uses virtual-host style.
    fn host_and_base(&self) -> (String, String, String) {
        match &self.endpoint {
            Some(endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                (scheme.to_string(), host, format!("/{}", self.bucket))
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                String::new(),
            ),
        }
    }

    /// Issue a signed request against the bucket.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        key_path: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response, SourceError> {
        let (scheme, host, base) = self.host_and_base();
        let canonical_uri = if key_path.is_empty() && base.is_empty() {
            "/".to_string()
        } else {
            format!("{}{}", base, key_path)
        };

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(b"");

        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_query: String = sorted
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(token) = &self.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key_id, credential_scope, signed_headers, signature
        );

        let url = if canonical_query.is_empty() {
            format!("{}://{}{}", scheme, host, canonical_uri)
        } else {
            format!("{}://{}{}?{}", scheme, host, canonical_uri, canonical_query)
        };

        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(token) = &self.session_token {
            request = request.header("x-amz-security-token", token);
        }

        request
            .send()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))
    }

    /// Paginate `ListObjectsV2` and apply glob filters.
    async fn list_objects(&self) -> Result<Vec<CloudFile>, SourceError> {
        let mut files = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !self.prefix.is_empty() {
                query.push(("prefix".to_string(), self.prefix.clone()));
            }
            if let Some(token) = &continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self
                .signed_request(reqwest::Method::GET, "", &query)
                .await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Listing {
                    bucket: self.bucket.clone(),
                    reason: format!(
                        "ListObjectsV2 failed (HTTP {}): {}",
                        status,
                        body.chars().take(500).collect::<String>()
                    ),
                });
            }

            let xml = response
                .text()
                .await
                .map_err(|e| SourceError::Listing {
                    bucket: self.bucket.clone(),
                    reason: e.to_string(),
                })?;
            let (objects, truncated, next_token) = parse_list_objects(&xml);

            for obj in objects {
                if !self.key_matches(&obj.key) {
                    continue;
                }
                files.push(self.cloud_file(obj));
            }

            if truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        debug!(source = %self.name, count = files.len(), "listed objects");
        Ok(files)
    }

    fn key_matches(&self, key: &str) -> bool {
        let rel = key
            .strip_prefix(self.prefix.trim_end_matches('/'))
            .map(|s| s.trim_start_matches('/'))
            .unwrap_or(key);
        if self.exclude.is_match(rel) {
            return false;
        }
        self.include.is_empty() || self.include.is_match(rel)
    }

    fn cloud_file(&self, obj: ListedObject) -> CloudFile {
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_LAST_MODIFIED.to_string(), json!(obj.last_modified));
        metadata.insert("etag".to_string(), json!(obj.etag));
        metadata.insert("size".to_string(), json!(obj.size));
        metadata.insert("bucket".to_string(), json!(self.bucket));

        let file_type = file_extension(std::path::Path::new(&obj.key));
        CloudFile {
            id: obj.key.clone(),
            name: obj.key.clone(),
            path: format!("s3://{}/{}", self.bucket, obj.key),
            metadata,
            file_type: Some(file_type),
        }
    }
}

#[async_trait]
impl SourceConnector for ObjectStoreSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self) -> Result<(), SourceError> {
        let response = self
            .signed_request(reqwest::Method::HEAD, "", &[])
            .await?;
        if !response.status().is_success() {
            return Err(SourceError::Connection(format!(
                "HEAD bucket `{}` returned status {}",
                self.bucket,
                response.status()
            )));
        }
        Ok(())
    }

    async fn list_full(&self) -> Result<Vec<CloudFile>, SourceError> {
        self.list_objects().await
    }

    async fn list_delta(&self, since: DateTime<Utc>) -> Result<Vec<CloudFile>, SourceError> {
        Ok(delta_filter(self.list_objects().await?, since))
    }

    async fn download(&self, file: &CloudFile) -> Result<LocalFile, SourceError> {
        let key_path = format!(
            "/{}",
            file.id
                .split('/')
                .map(uri_encode)
                .collect::<Vec<_>>()
                .join("/")
        );

        let response = self
            .signed_request(reqwest::Method::GET, &key_path, &[])
            .await
            .map_err(|e| SourceError::Download {
                key: file.id.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(SourceError::Download {
                key: file.id.clone(),
                reason: format!("GetObject returned status {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| SourceError::Download {
            key: file.id.clone(),
            reason: e.to_string(),
        })?;

        let scope = tempfile::TempDir::new().map_err(|e| SourceError::LocalFile {
            key: file.id.clone(),
            reason: e.to_string(),
        })?;
        let path = scope.path().join(escaped_file_name(&file.id));
        std::fs::write(&path, &bytes).map_err(|e| SourceError::LocalFile {
            key: file.id.clone(),
            reason: e.to_string(),
        })?;

        debug!(key = %file.id, bytes = bytes.len(), "downloaded object");
        let file_type = file
            .file_type
            .clone()
            .unwrap_or_else(|| file_extension(&path));
        Ok(LocalFile::scoped(
            file.id.clone(),
            path,
            file.metadata.clone(),
            file_type,
            scope,
        ))
    }
}

// ============ AWS SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")`
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding for SigV4 canonical requests: everything except
/// unreserved characters is percent-encoded.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ XML parsing (minimal, no extra deps) ============

struct ListedObject {
    key: String,
    /// RFC 3339 timestamp as returned by the listing.
    last_modified: String,
    etag: String,
    size: i64,
}

/// Parse a `ListObjectsV2` response: objects, is-truncated, next token.
/// Directory placeholder keys (trailing `/`) are skipped.
fn parse_list_objects(xml: &str) -> (Vec<ListedObject>, bool, Option<String>) {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }

        objects.push(ListedObject {
            key,
            last_modified: extract_xml_value(block, "LastModified").unwrap_or_default(),
            etag: extract_xml_value(block, "ETag")
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        });
    }

    (objects, is_truncated, next_token)
}

/// Text content of a simple, non-nested XML tag.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

/// An empty include set means "everything"; callers check `is_empty`.
fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LISTING: &str = r#"<?xml version="1.0"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-abc</NextContinuationToken>
  <Contents>
    <Key>docs/a.txt</Key>
    <LastModified>2024-03-01T12:00:00Z</LastModified>
    <ETag>"abc123"</ETag>
    <Size>10240</Size>
  </Contents>
  <Contents>
    <Key>docs/</Key>
    <LastModified>2024-03-01T12:00:00Z</LastModified>
    <ETag>"dir"</ETag>
    <Size>0</Size>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn test_parse_listing() {
        let (objects, truncated, token) = parse_list_objects(LISTING);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "docs/a.txt");
        assert_eq!(objects[0].etag, "abc123");
        assert_eq!(objects[0].size, 10240);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("token-abc"));
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("safe-chars_.~"), "safe-chars_.~");
    }

    #[test]
    fn test_escaped_file_name() {
        assert_eq!(escaped_file_name("a/b/c.txt"), "a_b_c.txt");
        assert_eq!(escaped_file_name("win\\path.md"), "win_path.md");
    }

    fn cloud_file_at(key: &str, ts: &str) -> CloudFile {
        let mut metadata = Metadata::new();
        metadata.insert(METADATA_LAST_MODIFIED.to_string(), json!(ts));
        CloudFile {
            id: key.to_string(),
            name: key.to_string(),
            path: format!("s3://b/{}", key),
            metadata,
            file_type: None,
        }
    }

    #[test]
    fn test_delta_filter_keeps_only_newer() {
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let files = vec![
            cloud_file_at("old.txt", "2024-02-28T00:00:00Z"),
            cloud_file_at("new.txt", "2024-03-02T00:00:00Z"),
        ];
        let kept = delta_filter(files, since);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "new.txt");
    }

    #[test]
    fn test_delta_filter_future_since_is_empty() {
        let since = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        let files = vec![cloud_file_at("a.txt", "2024-03-02T00:00:00Z")];
        assert!(delta_filter(files, since).is_empty());
    }

    #[test]
    fn test_signing_key_derivation_matches_aws_example() {
        // Known vector from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }
}
