//! S3-compatible object store over plain HTTPS with SigV4 signing.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use regex::Regex;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::sigv4::{self, Credentials, EMPTY_PAYLOAD_SHA256, SigningRequest};
use super::{ObjectStore, StorageError, StorageResult};

static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("Invalid regex pattern for list keys"));
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>")
        .expect("Invalid regex pattern for continuation token")
});

/// S3 connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Custom endpoint (MinIO, R2, ...). Defaults to AWS for `region`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub bucket: String,

    /// Falls back to `AWS_ACCESS_KEY_ID`.
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Falls back to `AWS_SECRET_ACCESS_KEY`.
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Falls back to `AWS_SESSION_TOKEN`.
    #[serde(default)]
    pub session_token: Option<String>,

    /// Address the bucket in the path instead of the host name.
    #[serde(default)]
    pub path_style: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: default_region(),
            bucket: String::new(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            path_style: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

pub struct S3Store {
    client: reqwest::Client,
    credentials: Credentials,
    region: String,
    scheme: String,
    /// `host[:port]` the requests are sent to.
    authority: String,
    /// `/bucket` for path-style addressing, empty otherwise.
    bucket_path: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("region", &self.region)
            .field("authority", &self.authority)
            .field("bucket_path", &self.bucket_path)
            .finish()
    }
}

impl S3Store {
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Backend("s3 bucket is not configured".into()));
        }

        let access_key_id = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .ok_or_else(|| StorageError::Backend("s3 access key id is not configured".into()))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .ok_or_else(|| {
                StorageError::Backend("s3 secret access key is not configured".into())
            })?;
        let session_token = config
            .session_token
            .clone()
            .or_else(|| std::env::var("AWS_SESSION_TOKEN").ok());

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region));
        let url = Url::parse(&endpoint)
            .map_err(|e| StorageError::Backend(format!("invalid s3 endpoint {}: {}", endpoint, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| StorageError::Backend(format!("s3 endpoint has no host: {}", endpoint)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let (authority, bucket_path) = if config.path_style {
            (host, format!("/{}", sigv4::uri_encode(&config.bucket, true)))
        } else {
            (format!("{}.{}", config.bucket, host), String::new())
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            credentials: Credentials {
                access_key_id,
                secret_access_key,
                session_token,
            },
            region: config.region,
            scheme: url.scheme().to_string(),
            authority,
            bucket_path,
        })
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_path, sigv4::uri_encode(key, false))
    }

    fn bucket_root(&self) -> String {
        if self.bucket_path.is_empty() {
            "/".to_string()
        } else {
            self.bucket_path.clone()
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Bytes,
    ) -> StorageResult<reqwest::Response> {
        let timestamp = Utc::now();
        let payload_hash = if body.is_empty() {
            EMPTY_PAYLOAD_SHA256.to_string()
        } else {
            sigv4::sha256_hex(&body)
        };

        let mut headers = vec![
            ("host".to_string(), self.authority.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), sigv4::amz_date(&timestamp)),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let authorization = sigv4::sign(
            &SigningRequest {
                method: method.as_str(),
                path,
                query,
                headers: &headers,
                payload_hash: &payload_hash,
                region: &self.region,
                service: "s3",
                timestamp,
            },
            &self.credentials,
        )?;

        let query_string = sigv4::canonical_query(query);
        let url = if query_string.is_empty() {
            format!("{}://{}{}", self.scheme, self.authority, path)
        } else {
            format!("{}://{}{}?{}", self.scheme, self.authority, path, query_string)
        };

        let mut request = self
            .client
            .request(method, &url)
            .header("authorization", authorization);
        for (name, value) in headers.iter().filter(|(name, _)| name != "host") {
            request = request.header(name.as_str(), value.as_str());
        }

        Ok(request.body(body).send().await?)
    }

    async fn check(
        response: reqwest::Response,
        operation: &'static str,
        key: &str,
    ) -> StorageResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Status {
            operation,
            key: key.to_string(),
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }

    /// One page of `ListObjectsV2`.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
    ) -> StorageResult<(Vec<String>, Option<String>)> {
        let mut query = vec![
            ("list-type".to_string(), "2".to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        }

        let response = self
            .send(Method::GET, &self.bucket_root(), &query, Bytes::new())
            .await?;
        let body = Self::check(response, "LIST", prefix).await?.text().await?;
        Ok(parse_list_response(&body))
    }
}

/// Extract keys and the continuation token from a `ListObjectsV2` body.
pub(crate) fn parse_list_response(body: &str) -> (Vec<String>, Option<String>) {
    let keys = KEY_RE
        .captures_iter(body)
        .map(|c| xml_unescape(&c[1]))
        .collect();
    let truncated = body.contains("<IsTruncated>true</IsTruncated>");
    let token = if truncated {
        TOKEN_RE.captures(body).map(|c| xml_unescape(&c[1]))
    } else {
        None
    };
    (keys, token)
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StorageResult<()> {
        let len = body.len();
        let response = self
            .send(Method::PUT, &self.object_path(key), &[], body)
            .await?;
        Self::check(response, "PUT", key).await?;
        debug!("Uploaded {} ({} bytes)", key, len);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let response = self
            .send(Method::DELETE, &self.object_path(key), &[], Bytes::new())
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, "DELETE", key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        if prefix.is_empty() {
            return Err(StorageError::InvalidKey(
                "refusing to delete an empty prefix".into(),
            ));
        }

        let mut removed = 0;
        let mut continuation: Option<String> = None;
        loop {
            let (keys, next) = self.list_page(prefix, continuation.as_deref()).await?;
            for key in keys {
                self.delete_object(&key).await?;
                removed += 1;
            }
            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        debug!("Deleted {} objects under {}", removed, prefix);
        Ok(removed)
    }
}
