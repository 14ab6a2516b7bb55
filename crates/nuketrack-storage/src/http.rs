//! Retrying HTTP client shared by every ingestion source.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_USER_AGENT: &str =
    "nuketrack/0.1 (US nuclear infrastructure tracker; public-data research)";

/// Statuses worth another attempt: throttling and server-side failures. The
/// NRC site answers 503 during its maintenance windows.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// How many times a request is sent and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends, the first one included.
    pub attempts: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_delay: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `retry` (1-based): doubles from `first_delay`,
    /// never above `ceiling`. A server-supplied `Retry-After` wins when it is
    /// shorter than the ceiling.
    pub fn wait_before(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.ceiling);
        }
        let doubling = 2u32.saturating_pow(retry.saturating_sub(1));
        self.first_delay.saturating_mul(doubling).min(self.ceiling)
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    let seconds = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    seconds.trim().parse().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus { status: u16, url: String, attempts: u32 },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn get(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, method = "GET", url);
        self.send(|| self.client.get(url)).instrument(span).await
    }

    pub async fn get_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        Ok(self.get(source, url).await?.text())
    }

    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        payload: &Value,
    ) -> Result<Value, FetchError> {
        let span = info_span!("http_fetch", source, method = "POST", url);
        self.send(|| self.client.post(url).json(payload))
            .instrument(span)
            .await?
            .json()
    }

    async fn send<F>(&self, request: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            let last = attempt >= attempts;
            let wait = match request().send().await {
                Ok(response) if response.status().is_success() => {
                    let status = response.status();
                    let final_url = response.url().to_string();
                    let body = response.bytes().await?.to_vec();
                    debug!(status = status.as_u16(), bytes = body.len(), attempt, "fetched");
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    if last || !is_transient_status(status) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: response.url().to_string(),
                            attempts: attempt,
                        });
                    }
                    let wait = self.retry.wait_before(attempt, retry_after(&response));
                    warn!(status = status.as_u16(), attempt, wait_ms = wait.as_millis() as u64, "transient status; retrying");
                    wait
                }
                Err(err) => {
                    if last || !is_transient_error(&err) {
                        return Err(FetchError::Request(err));
                    }
                    let wait = self.retry.wait_before(attempt, None);
                    warn!(error = %err, attempt, wait_ms = wait.as_millis() as u64, "request failed; retrying");
                    wait
                }
            };
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves the given raw responses in order, repeating the last one, and
    /// counts the requests it saw.
    async fn scripted_server(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let response = responses[n.min(responses.len() - 1)];
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/reading-rm/doc-collections/news/2026/"), hits)
    }

    const NRC_MAINTENANCE: &str = "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 0\r\n\
         Content-Length: 0\r\nConnection: close\r\n\r\n";
    const NRC_PAGE: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 25\r\n\
         Connection: close\r\n\r\n<html>news index</html>\r\n";
    const NOT_FOUND: &str = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    fn quick_fetcher(attempts: u32) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            retry: RetryPolicy {
                attempts,
                first_delay: Duration::from_millis(5),
                ceiling: Duration::from_millis(20),
            },
        })
        .unwrap()
    }

    #[test]
    fn waits_double_up_to_the_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait_before(1, None), Duration::from_secs(1));
        assert_eq!(policy.wait_before(2, None), Duration::from_secs(2));
        assert_eq!(policy.wait_before(4, None), Duration::from_secs(8));
        assert_eq!(policy.wait_before(6, None), Duration::from_secs(30));
        assert_eq!(policy.wait_before(90, None), Duration::from_secs(30));
        assert_eq!(policy.wait_before(1, Some(Duration::from_secs(120))), Duration::from_secs(30));
        assert_eq!(policy.wait_before(3, Some(Duration::ZERO)), Duration::ZERO);
    }

    #[test]
    fn maintenance_and_throttling_are_transient() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[tokio::test]
    async fn nrc_maintenance_page_is_retried_until_the_page_returns() {
        let (url, hits) = scripted_server(vec![NRC_MAINTENANCE, NRC_PAGE]).await;
        let body = quick_fetcher(3).get_text("nrc-events", &url).await.unwrap();
        assert!(body.starts_with("<html>news index</html>"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_outage_gives_up_after_the_configured_attempts() {
        let (url, hits) = scripted_server(vec![NRC_MAINTENANCE]).await;
        let err = quick_fetcher(3).get("nrc-events", &url).await.unwrap_err();
        assert!(
            matches!(err, FetchError::HttpStatus { status: 503, attempts: 3, .. }),
            "{err}"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn missing_page_is_not_retried() {
        let (url, hits) = scripted_server(vec![NOT_FOUND, NRC_PAGE]).await;
        let err = quick_fetcher(4).get("nrc-reactors", &url).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, attempts: 1, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_helpers_decode_body() {
        let ok = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://api.usaspending.gov/".into(),
            body: br#"{"results": []}"#.to_vec(),
        };
        assert_eq!(ok.json().unwrap()["results"], serde_json::json!([]));

        let html = FetchedResponse {
            body: b"<html>not json</html>".to_vec(),
            ..ok
        };
        assert!(html.text().starts_with("<html>"));
        assert!(matches!(html.json(), Err(FetchError::Decode { .. })));
    }
}
