//! S3-compatible object store over `reqwest`.
//!
//! Requests use path-style addressing (`{endpoint}/{bucket}/{key}`) and are
//! signed with AWS Signature Version 4, which MinIO, R2 and AWS all accept.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::contract::{ObjectStore, StoredObject};
use crate::error::ObjectStoreError;
use crate::publish;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Connection settings for the bundle bucket.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// `https://host[:port]`; a bare `host[:port]` is taken as https.
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Base of the URLs recorded as preview links.
    pub public_base_url: String,
}

pub fn default_region() -> String {
    "us-east-1".to_string()
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    endpoint: Url,
    config: S3Config,
}

impl S3ObjectStore {
    pub fn new(config: S3Config) -> Result<Self, ObjectStoreError> {
        let endpoint = normalize_endpoint(&config.endpoint)?;
        info!(endpoint = %endpoint, bucket = %config.bucket, "Object store configured");
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            config,
        })
    }

    fn object_url(&self, key: &str, query: &[(&str, &str)]) -> Result<Url, ObjectStoreError> {
        let mut path = format!("/{}", uri_encode(&self.config.bucket, false));
        if !key.is_empty() {
            path.push('/');
            path.push_str(&uri_encode(key.trim_start_matches('/'), true));
        }
        let mut url = self.endpoint.clone();
        url.set_path(&path);
        let query = canonical_query(query);
        url.set_query((!query.is_empty()).then_some(query.as_str()));
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        extra: &[(&'static str, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let payload_hash = hex::encode(Sha256::digest(&body));
        let signed = sign(
            &self.config,
            method.as_str(),
            &url,
            extra,
            &payload_hash,
            Utc::now(),
        )?;

        let mut request = self.client.request(method, url);
        for (name, value) in extra.iter().chain(signed.iter()) {
            request = request.header(*name, value);
        }
        Ok(request.body(body).send().await?)
    }

    async fn check(
        method: &'static str,
        key: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ObjectStoreError::Status {
            method,
            key: key.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let url = self.object_url(key, &[])?;
        let extra = [("content-type", content_type.to_string())];
        let response = self.send(Method::PUT, url, &extra, body).await?;
        Self::check("PUT", key, response).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        let url = self.object_url(key, &[])?;
        let response = self.send(Method::GET, url, &[], Vec::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check("GET", key, response).await?;
        let content_type = header_content_type(response.headers());
        let body = response.bytes().await?.to_vec();
        Ok(Some(StoredObject { body, content_type }))
    }

    async fn content_type(&self, key: &str) -> Result<Option<String>, ObjectStoreError> {
        let url = self.object_url(key, &[])?;
        let response = self.send(Method::HEAD, url, &[], Vec::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check("HEAD", key, response).await?;
        Ok(header_content_type(response.headers()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = continuation.as_deref() {
                query.push(("continuation-token", token));
            }
            let url = self.object_url("", &query)?;
            let response = self.send(Method::GET, url, &[], Vec::new()).await?;
            let response = Self::check("LIST", prefix, response).await?;
            let page = parse_listing(&response.text().await?)?;
            keys.extend(page.keys);
            match page.next_token {
                Some(token) if page.truncated => continuation = Some(token),
                _ => break,
            }
        }
        debug!(prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }

    async fn set_content_type(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let url = self.object_url(key, &[])?;
        let source = format!(
            "/{}/{}",
            uri_encode(&self.config.bucket, false),
            uri_encode(key.trim_start_matches('/'), true)
        );
        let extra = [
            ("content-type", content_type.to_string()),
            ("x-amz-copy-source", source),
            ("x-amz-metadata-directive", "REPLACE".to_string()),
        ];
        let response = self.send(Method::PUT, url, &extra, Vec::new()).await?;
        Self::check("COPY", key, response).await?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        publish::public_url(&self.config.public_base_url, &self.config.bucket, key)
    }
}

fn normalize_endpoint(raw: &str) -> Result<Url, ObjectStoreError> {
    let raw = raw.trim().trim_end_matches('/');
    if raw.is_empty() {
        return Err(ObjectStoreError::Endpoint(raw.to_string()));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|_| ObjectStoreError::Endpoint(raw.to_string()))?;
    if url.host_str().is_none() {
        return Err(ObjectStoreError::Endpoint(raw.to_string()));
    }
    Ok(url)
}

fn header_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// One `ListObjectsV2` response page.
#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ListBucketResult {
    contents: Vec<ListEntry>,
    is_truncated: bool,
    next_continuation_token: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
}

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_listing(xml: &str) -> Result<ListPage, ObjectStoreError> {
    let result: ListBucketResult =
        quick_xml::de::from_str(xml).map_err(|e| ObjectStoreError::Listing(e.to_string()))?;
    Ok(ListPage {
        keys: result.contents.into_iter().map(|entry| entry.key).collect(),
        truncated: result.is_truncated,
        next_token: result.next_continuation_token,
    })
}

/// Headers to add for a SigV4-signed request: `x-amz-date`,
/// `x-amz-content-sha256` and `authorization`.
fn sign(
    config: &S3Config,
    method: &str,
    url: &Url,
    extra: &[(&'static str, String)],
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, ObjectStoreError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(ObjectStoreError::Endpoint(url.to_string())),
    };

    let mut headers: Vec<(String, String)> = vec![
        ("host".into(), host),
        ("x-amz-content-sha256".into(), payload_hash.to_string()),
        ("x-amz-date".into(), amz_date.clone()),
    ];
    headers.extend(
        extra
            .iter()
            .filter(|(name, _)| name.starts_with("x-amz-"))
            .map(|(name, value)| (name.to_string(), value.trim().to_string())),
    );
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        url.path(),
        url.query().unwrap_or("")
    );
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", config.region);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&config.secret_access_key, &date, &config.region, SERVICE);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));
    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        config.access_key_id
    );

    Ok(vec![
        ("x-amz-date", amz_date),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("authorization", authorization),
    ])
}

fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Sorted `k=v&...` with both sides percent-encoded.
fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, false), uri_encode(v, false)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986 encoding as SigV4 expects; `/` is kept when `keep_slash`.
fn uri_encode(value: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_matches_published_derivation() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn encodes_keys_and_queries() {
        assert_eq!(
            uri_encode("components/btn/1.0.0/a b+c.js", true),
            "components/btn/1.0.0/a%20b%2Bc.js"
        );
        assert_eq!(uri_encode("a/b", false), "a%2Fb");
        assert_eq!(
            canonical_query(&[("prefix", "components/btn/"), ("list-type", "2")]),
            "list-type=2&prefix=components%2Fbtn%2F"
        );
    }

    #[test]
    fn parses_listing_pages() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bundles</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok==</NextContinuationToken>
  <Contents><Key>components/btn/1.0.0/index.html</Key><Size>10</Size></Contents>
  <Contents><Key>components/btn/1.0.0/assets/a&amp;b.css</Key></Contents>
</ListBucketResult>"#;
        let page = parse_listing(xml).unwrap();
        assert_eq!(
            page.keys,
            vec![
                "components/btn/1.0.0/index.html".to_string(),
                "components/btn/1.0.0/assets/a&b.css".to_string(),
            ]
        );
        assert!(page.truncated);
        assert_eq!(page.next_token.as_deref(), Some("tok=="));
    }

    #[test]
    fn endpoints_default_to_https() {
        assert_eq!(
            normalize_endpoint("minio.local:9000").unwrap().as_str(),
            "https://minio.local:9000/"
        );
        assert_eq!(
            normalize_endpoint("http://127.0.0.1:9000/").unwrap().as_str(),
            "http://127.0.0.1:9000/"
        );
        assert!(normalize_endpoint("").is_err());
    }
}
