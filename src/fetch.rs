//! Single-request HTTP fetching with a per-attempt timeout and bounded retry.
//!
//! One [`FetchClient`] exists per host/credential pair and is configured once,
//! at construction. Every call issues one `GET`; transient failures (transport
//! errors, timeouts, 5xx, 429) are retried with a constant delay until
//! `max_retry` attempts have been made, while any other 4xx stops immediately.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Query parameters as ordered key/value pairs.
pub type Query = Vec<(String, String)>;

const MAX_DIAGNOSTIC_BODY: usize = 1024;

/// Immutable per-source fetch settings.
#[derive(Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub host: String,
    /// Pre-formatted `Authorization` header value; opaque to this module.
    pub auth: String,
    pub proxy: Option<String>,
    pub timeout: Duration,
    /// Total number of attempts per request, including the first one.
    pub max_retry: u32,
    pub retry_delay: Duration,
}

impl fmt::Debug for FetchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchConfig")
            .field("host", &self.host)
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .field("max_retry", &self.max_retry)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl FetchConfig {
    /// Check the configuration and return the normalised base URL.
    pub fn validate(&self) -> Result<Url, FetchError> {
        if self.host.trim().is_empty() {
            return Err(FetchError::Configuration("host must be non-empty".into()));
        }
        if self.auth.trim().is_empty() {
            return Err(FetchError::Configuration("auth must be non-empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(FetchError::Configuration("timeout must be > 0".into()));
        }
        if self.max_retry == 0 {
            return Err(FetchError::Configuration("max_retry must be >= 1".into()));
        }
        let mut base = Url::parse(self.host.trim())
            .map_err(|e| FetchError::Configuration(format!("invalid host {}: {e}", self.host)))?;
        if base.cannot_be_a_base() {
            return Err(FetchError::Configuration(format!(
                "host {} cannot be used as a base URL",
                self.host
            )));
        }
        // Relative joins replace the last path segment unless it ends with '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch configuration: {0}")]
    Configuration(String),
    #[error("GET {path} returned {status}: {body}")]
    Terminal {
        path: String,
        status: u16,
        body: String,
    },
    #[error("GET {path} still failing after {attempts} attempts (last status {status:?}): {body}")]
    Exhausted {
        path: String,
        attempts: u32,
        status: Option<u16>,
        body: String,
    },
    #[error("GET {path} returned a body that is not valid JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A GET request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body)
            .chars()
            .take(MAX_DIAGNOSTIC_BODY)
            .collect()
    }
}

fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http transport error: {0}")]
    Transport(String),
}

/// Transport boundary for all outbound HTTP.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Real transport backed by reqwest; routes through the configured proxy when present.
#[derive(Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<&str>) -> Result<Self, FetchError> {
        let builder = Client::builder().user_agent("lakesync/0.1");
        let builder = match proxy {
            Some(proxy) => builder.proxy(
                Proxy::all(proxy)
                    .map_err(|e| FetchError::Configuration(format!("invalid proxy {proxy}: {e}")))?,
            ),
            None => builder.no_proxy(),
        };
        let http = builder
            .build()
            .map_err(|e| FetchError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.http.get(request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let res = builder
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = res.status().as_u16();
        let headers = header_pairs(res.headers());
        let body = res
            .bytes()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Header values are kept even when they are not visible ASCII.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Outcome of a single failed attempt, before retry policy is applied.
#[derive(Debug)]
enum AttemptError {
    Transient(TransientError),
    Terminal { status: u16, body: String },
}

/// Network error, timeout, 5xx or 429. Never leaves this module directly;
/// it becomes [`FetchError::Exhausted`] once attempts run out.
#[derive(Debug)]
struct TransientError {
    status: Option<u16>,
    detail: String,
}

impl AttemptError {
    fn transient(status: Option<u16>, detail: String) -> Self {
        AttemptError::Transient(TransientError { status, detail })
    }

    fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transient(t) => match t.status {
                Some(status) => write!(f, "status {status}: {}", t.detail),
                None => f.write_str(&t.detail),
            },
            AttemptError::Terminal { status, body } => write!(f, "status {status}: {body}"),
        }
    }
}

fn classify(res: HttpResponse) -> Result<HttpResponse, AttemptError> {
    match res.status {
        100..=399 => Ok(res),
        429 | 500..=599 => Err(AttemptError::transient(Some(res.status), res.body_text())),
        status => Err(AttemptError::Terminal {
            status,
            body: res.body_text(),
        }),
    }
}

pub struct FetchClient {
    config: FetchConfig,
    base_url: Url,
    transport: Arc<dyn HttpTransport>,
}

impl fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl FetchClient {
    /// Build a client using the reqwest transport.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        config.validate()?;
        let transport = ReqwestTransport::new(config.proxy.as_deref())?;
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(
        config: FetchConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, FetchError> {
        let base_url = config.validate()?;
        Ok(Self {
            config,
            base_url,
            transport,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn build_request(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<HttpRequest, FetchError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::Configuration(format!("invalid path {path}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(HttpRequest {
            url,
            headers: vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), self.config.auth.clone()),
            ],
        })
    }

    /// Issue one GET, retrying transient failures.
    #[instrument(skip_all, fields(path = %path))]
    pub async fn fetch(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, FetchError> {
        let request = self.build_request(path, query)?;
        let attempts = AtomicU32::new(0);
        let backoff = ConstantBuilder::default()
            .with_delay(self.config.retry_delay)
            .with_max_times(self.config.max_retry.saturating_sub(1) as usize);

        let attempt = || {
            attempts.fetch_add(1, Ordering::SeqCst);
            self.attempt(request.clone())
        };

        let result = attempt
            .retry(backoff)
            .when(AttemptError::is_transient)
            .notify(|err, delay| {
                warn!(
                    attempt = attempts.load(Ordering::SeqCst),
                    max_retry = self.config.max_retry,
                    ?delay,
                    error = %err,
                    "transient fetch failure; retrying"
                );
            })
            .await;

        match result {
            Ok(res) => Ok(res),
            Err(AttemptError::Terminal { status, body }) => {
                warn!(status, "terminal fetch failure");
                Err(FetchError::Terminal {
                    path: path.to_string(),
                    status,
                    body,
                })
            }
            Err(AttemptError::Transient(last)) => Err(FetchError::Exhausted {
                path: path.to_string(),
                attempts: attempts.load(Ordering::SeqCst),
                status: last.status,
                body: last.detail,
            }),
        }
    }

    /// Fetch and decode a JSON body.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<(T, HttpResponse), FetchError> {
        let res = self.fetch(path, query).await?;
        let body = decode(path, &res)?;
        Ok((body, res))
    }

    async fn attempt(&self, request: HttpRequest) -> Result<HttpResponse, AttemptError> {
        debug!(url = %request.url, "GET");
        let res = match tokio::time::timeout(self.config.timeout, self.transport.get(request)).await
        {
            Err(_) => {
                return Err(AttemptError::transient(
                    None,
                    format!("timed out after {:?}", self.config.timeout),
                ))
            }
            Ok(Err(err)) => return Err(AttemptError::transient(None, err.to_string())),
            Ok(Ok(res)) => res,
        };
        debug!(status = res.status, "response");
        classify(res)
    }
}

fn decode<T: DeserializeOwned>(path: &str, res: &HttpResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&res.body).map_err(|source| FetchError::Decode {
        path: path.to_string(),
        source,
    })
}
