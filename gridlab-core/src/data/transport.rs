//! Retrying HTTP transport.
//!
//! [`Transport`] is the raw seam: one request, one response, no policy.
//! [`RetryingTransport`] wraps it with bounded retries, linear backoff with
//! jitter, a per-attempt timeout and admission through the
//! [`ConcurrencyGovernor`].
//!
//! Attempt lifecycle:
//!
//! ```text
//! Attempting ──ok──────────────► Success
//!     │
//!     ├─404──────────────────────► NotFound (no retry)
//!     ├─non-2xx / network / timeout
//!     │       │
//!     │       ├─attempts left──► Backoff ──► Attempting
//!     │       └─exhausted──────► Fail(last error)
//!     └─other error──────────────► Fail
//! ```

use super::governor::{Admission, ConcurrencyGovernor};
use super::provider::DataError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Response body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, DataError>>;

/// Raw response from a [`Transport`]: a status line and an unread body.
pub struct HttpResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Sent as `Authorization: Bearer ...`.
    pub bearer: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Overrides the policy's per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A single network fetch with no retry policy.
///
/// Implementations report connection failures as
/// [`DataError::TransientNetwork`] and leave status interpretation to the
/// caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, url: &str, opts: &RequestOptions) -> Result<HttpResponse, DataError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("gridlab/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| DataError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, url: &str, opts: &RequestOptions) -> Result<HttpResponse, DataError> {
        let mut request = self.client.get(url);
        if let Some(token) = &opts.bearer {
            request = request.bearer_auth(token);
        }
        for (name, value) in &opts.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let resp = request.send().await.map_err(|e| DataError::TransientNetwork {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status().as_u16();
        let owned_url = url.to_string();
        let body = resp
            .bytes_stream()
            .map_err(move |e| DataError::TransientNetwork {
                url: owned_url.clone(),
                reason: format!("body read failed: {e}"),
            })
            .boxed();
        Ok(HttpResponse { status, body })
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
            timeout_ms: 45_000,
        }
    }
}

impl RetryPolicy {
    /// Sleep before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.75, 1.0);
        let ms = self.backoff_ms as f64 * attempt as f64 * jitter;
        Duration::from_millis(ms.round() as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Uniform jitter factor in [0.75, 1.0].
fn jitter() -> f64 {
    rand::thread_rng().gen_range(0.75..=1.0)
}

/// [`Transport`] plus retry, backoff, timeout and admission control.
#[derive(Clone)]
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
    governor: ConcurrencyGovernor,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy, governor: ConcurrencyGovernor) -> Self {
        Self {
            inner,
            policy,
            governor,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// Fetch a whole body. Body read failures count as a failed attempt.
    pub async fn fetch_bytes(&self, url: &str, opts: &RequestOptions) -> Result<Bytes, DataError> {
        let timeout = self.attempt_timeout(opts);
        self.with_retry(url, |admission| async move {
            let _admission = admission;
            within(url, timeout, async {
                let resp = self.send_checked(url, opts).await?;
                let chunks: Vec<Bytes> = resp.body.try_collect().await?;
                Ok::<_, DataError>(Bytes::from(chunks.concat()))
            })
            .await
        })
        .await
    }

    /// Fetch and decode a JSON document.
    pub async fn fetch_json(
        &self,
        url: &str,
        opts: &RequestOptions,
    ) -> Result<serde_json::Value, DataError> {
        let bytes = self.fetch_bytes(url, opts).await?;
        serde_json::from_slice(&bytes).map_err(|e| DataError::Parse {
            url: url.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    /// Fetch a body as a stream. Retries cover the status line only; once
    /// the body starts flowing, errors surface to the consumer. Each chunk
    /// must arrive within the attempt timeout. The governor slot stays held
    /// until the stream is dropped.
    pub async fn fetch_stream(&self, url: &str, opts: &RequestOptions) -> Result<ByteStream, DataError> {
        let timeout = self.attempt_timeout(opts);
        self.with_retry(url, |admission| async move {
            let resp = within(url, timeout, self.send_checked(url, opts)).await?;
            let body = idle_deadline(resp.body, url, timeout)
                .map(move |chunk| {
                    let _held = &admission;
                    chunk
                })
                .boxed();
            Ok(body)
        })
        .await
    }

    /// Fetch a body and hand it to `consume`, retrying request and
    /// consumption as one unit.
    ///
    /// A retryable error raised while consuming (a reset connection, a body
    /// that stops arriving) starts a fresh request after the usual backoff.
    /// Each chunk must arrive within the attempt timeout, so a stalled body
    /// ends the attempt instead of holding its governor slot.
    pub async fn consume_stream<T, C, CFut>(&self, url: &str, opts: &RequestOptions, consume: C) -> Result<T, DataError>
    where
        C: Fn(ByteStream) -> CFut,
        CFut: Future<Output = Result<T, DataError>>,
    {
        let timeout = self.attempt_timeout(opts);
        let consume = &consume;
        self.with_retry(url, |admission| async move {
            let _admission = admission;
            let resp = within(url, timeout, self.send_checked(url, opts)).await?;
            consume(idle_deadline(resp.body, url, timeout)).await
        })
        .await
    }

    fn attempt_timeout(&self, opts: &RequestOptions) -> Duration {
        opts.timeout.unwrap_or_else(|| self.policy.timeout())
    }

    async fn send_checked(&self, url: &str, opts: &RequestOptions) -> Result<HttpResponse, DataError> {
        let resp = self.inner.send(url, opts).await?;
        match resp.status {
            200..=299 => Ok(resp),
            404 => Err(DataError::NotFound {
                url: url.to_string(),
            }),
            status => Err(DataError::TransientNetwork {
                url: url.to_string(),
                reason: format!("HTTP {status}"),
            }),
        }
    }

    async fn with_retry<T, F, Fut>(&self, url: &str, mut attempt_fn: F) -> Result<T, DataError>
    where
        F: FnMut(Admission) -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = self.policy.delay_for_attempt(attempt - 1, jitter());
                warn!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = ?last_error,
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
            }

            let admission = self.governor.admit().await;
            debug!(url, attempt, attempts, "request attempt");
            match attempt_fn(admission).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::TransientNetwork {
            url: url.to_string(),
            reason: "max attempts exceeded".into(),
        }))
    }
}

fn timed_out(url: &str, timeout: Duration) -> DataError {
    DataError::TransientNetwork {
        url: url.to_string(),
        reason: format!("timed out after {}ms", timeout.as_millis()),
    }
}

/// Run `fut` under `timeout`; expiry drops it and reads as a transient failure.
async fn within<T, Fut>(url: &str, timeout: Duration, fut: Fut) -> Result<T, DataError>
where
    Fut: Future<Output = Result<T, DataError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or_else(|_| Err(timed_out(url, timeout)))
}

/// End `body` with a transient error if no chunk arrives within `idle`.
fn idle_deadline(body: ByteStream, url: &str, idle: Duration) -> ByteStream {
    let url = url.to_string();
    stream::unfold(Some(body), move |state| {
        let url = url.clone();
        async move {
            let mut body = state?;
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some(body))),
                Ok(None) => None,
                Err(_) => Some((Err(timed_out(&url, idle)), None)),
            }
        }
    })
    .boxed()
}
