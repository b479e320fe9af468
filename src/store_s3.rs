//! S3-backed [`ObjectStore`] implementation.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using only pure-Rust dependencies (`hmac`, `sha2`) for signing. Supports
//! custom endpoints for S3-compatible services (MinIO, LocalStack) via
//! path-style addressing.
//!
//! Credentials are read from environment variables:
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials / IAM roles)
//!
//! User metadata rides on `x-amz-meta-*` headers, so [`head`](S3Store::head)
//! reads it without fetching the body.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::store::{Metadata, ObjectStore};

type HmacSha256 = Hmac<Sha256>;

const META_HEADER_PREFIX: &str = "x-amz-meta-";

/// AWS credentials loaded from environment variables.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// One bucket accessed over signed S3 REST calls.
pub struct S3Store {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    /// Open a bucket using credentials from the environment.
    pub fn connect(bucket: &str, config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            bucket: bucket.to_string(),
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            creds: AwsCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    fn host(&self) -> String {
        match &self.endpoint_url {
            Some(endpoint) => endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
            None => format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
        }
    }

    fn scheme(&self) -> &str {
        match &self.endpoint_url {
            Some(endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    /// Canonical URI path for a key. Path-style (bucket in the path) when a
    /// custom endpoint is configured, virtual-hosted otherwise.
    fn canonical_uri(&self, key: &str) -> String {
        let encoded = encode_key(key);
        if self.endpoint_url.is_some() {
            if encoded.is_empty() {
                format!("/{}/", self.bucket)
            } else {
                format!("/{}/{}", self.bucket, encoded)
            }
        } else if encoded.is_empty() {
            "/".to_string()
        } else {
            format!("/{encoded}")
        }
    }

    /// Sign and send one S3 request.
    ///
    /// `amz_headers` are extra `x-amz-*` headers that participate in signing
    /// (metadata, copy source). `query` must not be pre-encoded.
    async fn request(
        &self,
        method: &str,
        key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        amz_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let host = self.host();
        let canonical_uri = self.canonical_uri(key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut sorted_query: Vec<_> = query.to_vec();
        sorted_query.sort();
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (name, value) in amz_headers {
            headers.push((name.to_lowercase(), value.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_querystring}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.creds.access_key_id
        );

        let mut url = format!("{}://{host}{canonical_uri}", self.scheme());
        if !canonical_querystring.is_empty() {
            url = format!("{url}?{canonical_querystring}");
        }

        let mut builder = match method {
            "GET" => self.client.get(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            "HEAD" => self.client.head(&url),
            other => bail!("unsupported S3 method: {other}"),
        };
        builder = builder.header("Authorization", &authorization);
        for (name, value) in &headers {
            if name != "host" {
                builder = builder.header(name, value);
            }
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        builder
            .send()
            .await
            .with_context(|| format!("S3 {method} s3://{}/{key} failed", self.bucket))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let resp = self.request("GET", key, &[], Vec::new(), &[]).await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{key}'",
                resp.status()
            );
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn put(&self, key: &str, body: &[u8], metadata: &Metadata) -> Result<()> {
        let amz_headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(name, value)| (format!("{META_HEADER_PREFIX}{name}"), value.clone()))
            .collect();
        let resp = self
            .request("PUT", key, &[], body.to_vec(), &amz_headers)
            .await?;
        if !resp.status().is_success() {
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{key}'",
                resp.status()
            );
        }
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let copy_source = format!("/{}/{}", self.bucket, encode_key(src));
        let headers = vec![("x-amz-copy-source".to_string(), copy_source)];
        let resp = self.request("PUT", dst, &[], Vec::new(), &headers).await?;
        if !resp.status().is_success() {
            bail!(
                "S3 CopyObject failed (HTTP {}) for '{src}' -> '{dst}'",
                resp.status()
            );
        }
        // CopyObject can return 200 with an error document in the body.
        let body = resp.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            bail!("S3 CopyObject returned an error body for '{src}' -> '{dst}'");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.request("DELETE", key, &[], Vec::new(), &[]).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() && status != 404 {
            bail!("S3 DeleteObject failed (HTTP {status}) for key '{key}'");
        }
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<Metadata>> {
        let resp = self.request("HEAD", key, &[], Vec::new(), &[]).await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            bail!(
                "S3 HeadObject failed (HTTP {}) for key '{key}'",
                resp.status()
            );
        }

        let mut metadata = Metadata::new();
        for (name, value) in resp.headers() {
            let name = name.as_str();
            if let Some(meta_key) = name.strip_prefix(META_HEADER_PREFIX) {
                if let Ok(value) = value.to_str() {
                    metadata.insert(meta_key.to_string(), value.to_string());
                }
            }
        }
        Ok(Some(metadata))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.request("GET", "", &query, Vec::new(), &[]).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {status}): {}",
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml = resp.text().await?;
            let mut remaining = xml.as_str();
            while let Some(start) = remaining.find("<Contents>") {
                let block_start = start + "<Contents>".len();
                let Some(end) = remaining[block_start..].find("</Contents>") else {
                    break;
                };
                let block = &remaining[block_start..block_start + end];
                if let Some(key) = extract_xml_value(block, "Key") {
                    if !key.is_empty() {
                        keys.push(key);
                    }
                }
                remaining = &remaining[block_start + end + "</Contents>".len()..];
            }

            let is_truncated = extract_xml_value(&xml, "IsTruncated")
                .map(|v| v == "true")
                .unwrap_or(false);
            if is_truncated {
                continuation_token = extract_xml_value(&xml, "NextContinuationToken");
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

/// URI-encode a key, preserving `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// URI-encode a string per RFC 3986 (SigV4 canonical form).
///
/// Encodes everything except unreserved characters: `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{byte:02X}")),
        }
    }
    result
}

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

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{secret_key}").as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Extract the text content of an XML tag (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}
