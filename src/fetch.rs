//! Page fetching with per-attempt timeouts and exponential backoff.
//!
//! # Architecture
//!
//! - [`PageFetcher`]: The injected capability that turns a URL into a [`RawPage`]
//! - [`HttpFetcher`]: reqwest-backed implementation, one client session per fetch
//! - [`RetryFetch`]: Decorator that adds timeouts, retries and attempt tracing
//!
//! # Retry Strategy
//!
//! - Only [`FetchError::Timeout`] and [`FetchError::NetworkFailure`] are retried
//! - Exponential backoff from a configurable base delay
//! - Maximum delay capped at 30 seconds
//! - Random jitter (0-250ms) added to prevent thundering herd
//! - Backoff sleeps are a cancellation checkpoint

use chrono::Utc;
use rand::{Rng, rng};
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::error::{FailureKind, FetchError};
use crate::models::{FetchAttempt, RawPage, SourceRef};

/// Counts fetch sessions that are currently held.
///
/// A session stands for whatever per-fetch resource the fetcher needs (a
/// browser tab, an HTTP client). The [`Session`] guard gives it back on drop,
/// so every exit path of a fetch releases it.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SessionTracker {
    pub fn acquire(&self) -> Session {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        debug!(in_flight = now, "Session acquired");
        Session {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of sessions held at once since the tracker was created.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct Session {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Session {
    fn drop(&mut self) {
        let left = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(in_flight = left, "Session released");
    }
}

/// Trait for retrieving one page.
///
/// Implementors own the transport; timeouts and retries are layered on top
/// by [`RetryFetch`].
pub trait PageFetcher {
    /// Fetch `url`, giving up after `timeout`.
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<RawPage, FetchError>;
}

/// Plain HTTP fetcher.
///
/// Each call builds its own `reqwest::Client` inside a tracked [`Session`];
/// nothing is shared between concurrent fetches.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    user_agent: String,
    sessions: SessionTracker,
}

impl HttpFetcher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            sessions: SessionTracker::default(),
        }
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }
}

impl PageFetcher for HttpFetcher {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<RawPage, FetchError> {
        let parsed = check_fetchable(url)?;
        let _session = self.sessions.acquire();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| FetchError::NetworkFailure(format!("client setup: {e}")))?;

        let response = client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, timeout))?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_reqwest(e, timeout))?;

        Ok(RawPage {
            url: url.to_string(),
            body,
            fetched_at: Utc::now(),
            status: status.as_u16(),
        })
    }
}

/// Only absolute http(s) URLs with a host can be fetched.
pub fn check_fetchable(url: &str) -> Result<Url, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::Malformed(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(FetchError::Malformed(format!("unsupported scheme {other:?}"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(FetchError::Malformed(format!("{url}: missing host")));
    }
    Ok(parsed)
}

/// Map a non-success HTTP status onto the fetch taxonomy.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    Some(match code {
        401 | 403 | 429 | 451 => FetchError::BlockedOrForbidden { status: code },
        408 => FetchError::NetworkFailure(format!("HTTP {status}")),
        _ if status.is_server_error() => FetchError::NetworkFailure(format!("HTTP {status}")),
        _ => FetchError::Malformed(format!("HTTP {status}")),
    })
}

fn classify_reqwest(e: reqwest::Error, timeout: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(timeout)
    } else if e.is_builder() {
        FetchError::Malformed(e.to_string())
    } else {
        FetchError::NetworkFailure(e.to_string())
    }
}

/// Why a fetch produced no page.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchFailure {
    Error(FetchError),
    /// The run was cancelled before the fetch could complete.
    Cancelled,
}

impl FetchFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchFailure::Error(e) => e.kind(),
            FetchFailure::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Error(e) => write!(f, "{e}"),
            FetchFailure::Cancelled => f.write_str("cancelled before fetch completed"),
        }
    }
}

/// Wrapper that adds a timeout and exponential backoff retry logic to any
/// [`PageFetcher`].
///
/// # Backoff Strategy
///
/// The delay between retries follows this formula:
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=jitter)
/// ```
pub struct RetryFetch<T> {
    inner: T,
    /// Additional attempts after the first one.
    max_retries: u32,
    timeout: Duration,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl<T> RetryFetch<T>
where
    T: PageFetcher,
{
    pub fn new(inner: T, max_retries: u32, timeout: Duration, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            timeout,
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }

    /// Upper bound of the random jitter added to each backoff.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rng().random_range(0..=jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }

    /// Fetch one source, retrying transient failures.
    ///
    /// Returns every attempt made alongside the final result, so callers can
    /// report latency and error kinds even when the source failed.
    #[instrument(level = "info", skip_all, fields(url = %source))]
    pub async fn fetch(
        &self,
        source: &SourceRef,
        cancel: &CancellationToken,
    ) -> (Result<RawPage, FetchFailure>, Vec<FetchAttempt>) {
        let total_t0 = Instant::now();
        let mut attempts = Vec::new();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!(attempts = attempts.len(), "Fetch abandoned; run cancelled");
                return (Err(FetchFailure::Cancelled), attempts);
            }

            attempt += 1;
            let attempt_t0 = Instant::now();
            let result = match tokio::time::timeout(
                self.timeout,
                self.inner.fetch(source.as_str(), self.timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(self.timeout)),
            };
            let attempt_dt = attempt_t0.elapsed();

            match result {
                Ok(page) => {
                    attempts.push(FetchAttempt {
                        attempt,
                        latency_ms: attempt_dt.as_millis() as u64,
                        error: None,
                    });
                    debug!(
                        attempt,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        status = page.status,
                        bytes = page.body.len(),
                        "fetch() succeeded"
                    );
                    return (Ok(page), attempts);
                }
                Err(e) => {
                    attempts.push(FetchAttempt {
                        attempt,
                        latency_ms: attempt_dt.as_millis() as u64,
                        error: Some(e.kind()),
                    });
                    let total_dt = total_t0.elapsed();

                    if !e.is_transient() {
                        warn!(attempt, error = %e, "fetch() failed; not retryable");
                        return (Err(FetchFailure::Error(e)), attempts);
                    }

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "fetch() exhausted retries"
                        );
                        return (Err(FetchFailure::Error(e)), attempts);
                    }

                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        elapsed_ms_total = total_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "fetch() attempt failed; backing off"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            info!(attempt, "Backoff interrupted; run cancelled");
                            return (Err(FetchFailure::Cancelled), attempts);
                        }
                    }
                }
            }
        }
    }
}

impl<T> fmt::Debug for RetryFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryFetch")
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFetcher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn source(url: &str) -> SourceRef {
        SourceRef::parse(url).unwrap()
    }

    fn quick<T: PageFetcher>(inner: T, retries: u32) -> RetryFetch<T> {
        RetryFetch::new(inner, retries, Duration::from_secs(5), Duration::from_millis(1))
            .with_jitter(Duration::ZERO)
    }

    /// Serve exactly one canned HTTP response on a local port.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/")
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            Some(FetchError::BlockedOrForbidden { status: 403 })
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS).map(|e| e.kind()),
            Some(FailureKind::BlockedOrForbidden)
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap().is_transient());
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND).map(|e| e.kind()),
            Some(FailureKind::Malformed)
        );
    }

    #[test]
    fn test_check_fetchable() {
        assert!(check_fetchable("https://dot.ca.gov/").is_ok());
        assert!(matches!(
            check_fetchable("ftp://files.example.test/bids.txt"),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            check_fetchable("mailto:bids@example.test"),
            Err(FetchError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let url = "https://example.test/flaky";
        let fetcher = ScriptedFetcher::new()
            .fail(url, FetchError::NetworkFailure("reset".into()))
            .fail(url, FetchError::Timeout(Duration::from_secs(1)))
            .page(url, "<title>Flaky</title>");
        let retry = quick(fetcher, 3);

        let (result, attempts) = retry.fetch(&source(url), &CancellationToken::new()).await;

        assert!(result.is_ok());
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].error, Some(FailureKind::NetworkFailure));
        assert_eq!(attempts[1].error, Some(FailureKind::Timeout));
        assert_eq!(attempts[2].error, None);
    }

    #[tokio::test]
    async fn test_does_not_retry_blocked() {
        let url = "https://example.test/blocked";
        let fetcher = ScriptedFetcher::new()
            .fail(url, FetchError::BlockedOrForbidden { status: 403 })
            .page(url, "<title>never</title>");
        let retry = quick(fetcher, 5);

        let (result, attempts) = retry.fetch(&source(url), &CancellationToken::new()).await;

        assert_eq!(
            result.unwrap_err(),
            FetchFailure::Error(FetchError::BlockedOrForbidden { status: 403 })
        );
        assert_eq!(attempts.len(), 1);
        assert_eq!(retry.inner().calls(url), 1);
    }

    #[tokio::test]
    async fn test_exhausts_retry_limit() {
        let url = "https://example.test/down";
        let fetcher = ScriptedFetcher::new().always_fail(url, FetchError::NetworkFailure("refused".into()));
        let retry = quick(fetcher, 2);

        let (result, attempts) = retry.fetch(&source(url), &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::NetworkFailure);
        assert_eq!(attempts.len(), 3);
        assert_eq!(retry.inner().sessions().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_enforced_around_slow_fetcher() {
        let url = "https://example.test/slow";
        let fetcher = ScriptedFetcher::new()
            .page(url, "<title>late</title>")
            .with_delay(url, Duration::from_secs(10));
        let retry = RetryFetch::new(fetcher, 0, Duration::from_millis(50), Duration::from_millis(1));

        let (result, attempts) = retry.fetch(&source(url), &CancellationToken::new()).await;

        assert_eq!(result.unwrap_err().kind(), FailureKind::Timeout);
        assert_eq!(attempts.len(), 1);
        assert_eq!(retry.inner().sessions().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let url = "https://example.test/a";
        let retry = quick(ScriptedFetcher::new().page(url, "<title>a</title>"), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (result, attempts) = retry.fetch(&source(url), &cancel).await;

        assert_eq!(result.unwrap_err(), FetchFailure::Cancelled);
        assert!(attempts.is_empty());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryFetch::new(
            ScriptedFetcher::new(),
            10,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .with_jitter(Duration::ZERO);
        assert_eq!(retry.backoff(1), Duration::from_secs(1));
        assert_eq!(retry.backoff(3), Duration::from_secs(4));
        assert_eq!(retry.backoff(8), Duration::from_secs(30));
    }

    #[test]
    fn test_session_tracker_records_peak() {
        let tracker = SessionTracker::default();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.in_flight(), 2);
        drop(first);
        drop(second);
        let _third = tracker.acquire();
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.peak(), 2);
    }

    #[tokio::test]
    async fn test_http_fetcher_reads_page() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 27\r\nConnection: close\r\n\r\n<title>Local page</title>\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new("project_ingest-test");

        let page = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();

        assert_eq!(page.status, 200);
        assert!(page.body.contains("Local page"));
        assert_eq!(fetcher.sessions().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_fetcher_maps_forbidden() {
        let url = serve_once("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let fetcher = HttpFetcher::new("project_ingest-test");

        let err = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap_err();

        assert_eq!(err, FetchError::BlockedOrForbidden { status: 403 });
        assert_eq!(fetcher.sessions().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_fetcher_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            sleep(Duration::from_secs(10)).await;
        });
        let fetcher = HttpFetcher::new("project_ingest-test");

        let err = fetcher
            .fetch(&format!("http://{addr}/"), Duration::from_millis(200))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Timeout);
        assert_eq!(fetcher.sessions().in_flight(), 0);
    }
}
