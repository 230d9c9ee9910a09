//! HTTP fetch utilities and persistence backends for HomeScout.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub mod postgres;
pub mod store;

pub use postgres::PgStore;
pub use store::{LockService, MemoryStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "homescout-storage";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only rate limiting is worth another attempt; other 4xx/5xx answers are final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Linear backoff: the wait after the n-th failed attempt (1-based) is `n * base_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Source names allowed to fall back to the proxy.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: String,
    pub proxy: Option<ProxyConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            user_agent: None,
            accept_language: "en-US,en;q=0.9".to_string(),
            proxy: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout_ms}ms fetching {url}")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("request failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Text fetch boundary the engine and adapters depend on.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get_text(&self, source: &str, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    proxy_client: Option<reqwest::Client>,
    proxy_sources: Vec<String>,
}

fn browser_headers(config: &HttpClientConfig) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let user_agent = config.user_agent.as_deref().unwrap_or(BROWSER_USER_AGENT);
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_str(user_agent).context("invalid user agent header")?,
    );
    headers.insert(header::ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_str(&config.accept_language).context("invalid accept-language header")?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(headers)
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let headers = browser_headers(&config)?;
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers.clone())
            .build()
            .context("building reqwest client")?;

        let (proxy_client, proxy_sources) = match &config.proxy {
            Some(proxy) => {
                let mut rule = reqwest::Proxy::all(&proxy.url)
                    .with_context(|| format!("invalid proxy url {}", proxy.url))?;
                if let Some(username) = &proxy.username {
                    rule = rule.basic_auth(username, proxy.password.as_deref().unwrap_or_default());
                }
                let client = reqwest::Client::builder()
                    .gzip(true)
                    .brotli(true)
                    .timeout(config.timeout)
                    .default_headers(headers)
                    .proxy(rule)
                    .build()
                    .context("building proxied reqwest client")?;
                (Some(client), proxy.sources.clone())
            }
            None => (None, Vec::new()),
        };

        Ok(Self {
            client,
            proxy_client,
            proxy_sources,
        })
    }

    fn proxy_for(&self, source: &str, err: &FetchError) -> Option<&reqwest::Client> {
        let client = self.proxy_client.as_ref()?;
        if !self.proxy_sources.iter().any(|s| s.eq_ignore_ascii_case(source)) {
            return None;
        }
        let blocked = match err {
            FetchError::HttpStatus { status, .. } => matches!(status, 403 | 429 | 451 | 503),
            FetchError::Request { .. } | FetchError::Timeout { .. } => true,
        };
        blocked.then_some(client)
    }
}

async fn fetch_with(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<String, FetchError> {
    let map_err = |source: reqwest::Error| {
        if source.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source,
            }
        }
    };

    let resp = client.get(url).timeout(timeout).send().await.map_err(map_err)?;
    let status = resp.status();
    if !(status.is_success() || status.is_redirection()) {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        });
    }
    resp.text().await.map_err(map_err)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get_text(&self, source: &str, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", source, url);
        async {
            match fetch_with(&self.client, url, timeout).await {
                Ok(body) => Ok(body),
                Err(err) => match self.proxy_for(source, &err) {
                    Some(proxy) => {
                        warn!(error = %err, "direct fetch blocked; retrying through proxy");
                        fetch_with(proxy, url, timeout).await
                    }
                    None => Err(err),
                },
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_linear_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3500),
        };

        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(3500));
    }

    #[test]
    fn default_policy_allows_three_attempts() {
        assert_eq!(BackoffPolicy::default().max_attempts(), 3);
    }

    #[test]
    fn only_rate_limits_and_timeouts_are_retryable() {
        let url = "https://s.test/a".to_string();
        let timeout = FetchError::Timeout {
            url: url.clone(),
            timeout_ms: 1000,
        };
        assert_eq!(timeout.disposition(), RetryDisposition::Retryable);

        let limited = FetchError::HttpStatus {
            status: 429,
            url: url.clone(),
        };
        assert_eq!(limited.disposition(), RetryDisposition::Retryable);
        assert_eq!(limited.status(), Some(429));

        for status in [400, 403, 404, 500, 502, 503] {
            let err = FetchError::HttpStatus {
                status,
                url: url.clone(),
            };
            assert_eq!(err.disposition(), RetryDisposition::NonRetryable, "status {status}");
        }
    }

    #[test]
    fn proxy_fallback_is_limited_to_named_sources() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            proxy: Some(ProxyConfig {
                url: "http://127.0.0.1:3128".into(),
                username: Some("scout".into()),
                password: Some("secret".into()),
                sources: vec!["beta".into()],
            }),
            ..Default::default()
        })
        .expect("fetcher");

        let forbidden = FetchError::HttpStatus {
            status: 403,
            url: "https://beta.test/x".into(),
        };
        let not_found = FetchError::HttpStatus {
            status: 404,
            url: "https://beta.test/x".into(),
        };
        assert!(fetcher.proxy_for("beta", &forbidden).is_some());
        assert!(fetcher.proxy_for("BETA", &forbidden).is_some());
        assert!(fetcher.proxy_for("alpha", &forbidden).is_none());
        assert!(fetcher.proxy_for("beta", &not_found).is_none());
    }
}
