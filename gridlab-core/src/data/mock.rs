//! Scripted in-memory transport for tests and offline runs.
//!
//! Responses are registered per exact URL. A URL with a sequence of
//! responses plays them in order and then keeps repeating the last one;
//! unregistered URLs answer 404. Every request is counted.

use super::provider::DataError;
use super::transport::{HttpResponse, RequestOptions, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// 200 with the given body.
    Body(Bytes),
    /// Any status with an empty body.
    Status(u16),
    /// Connection-level failure.
    NetworkError(String),
    /// Wait, then produce the inner response.
    Delayed(Duration, Box<MockResponse>),
    /// 200 that sends the given prefix, then fails with a connection reset.
    ResetAfter(Bytes),
    /// 200 that sends the given prefix, then never sends another byte.
    StallAfter(Bytes),
}

impl MockResponse {
    pub fn body(text: &str) -> Self {
        MockResponse::Body(Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn json(value: &serde_json::Value) -> Self {
        MockResponse::Body(Bytes::from(value.to_string()))
    }

    /// 200 with `text` gzip-compressed.
    pub fn gzip(text: &str) -> Self {
        MockResponse::Body(Bytes::from(gzip_bytes(text.as_bytes())))
    }
}

/// Gzip-compress a payload.
pub fn gzip_bytes(raw: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(raw);
    encoder.finish().unwrap_or_default()
}

#[derive(Default)]
struct Script {
    queue: VecDeque<MockResponse>,
    last: Option<MockResponse>,
}

/// In-memory [`Transport`] with per-URL scripts and call counters.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, RequestOptions)>>,
    chunk_size: Option<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split bodies into chunks of `size` bytes to exercise streaming paths.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size.max(1));
        self
    }

    /// Always answer `url` with `response`.
    pub fn respond(&self, url: &str, response: MockResponse) {
        self.respond_sequence(url, vec![response]);
    }

    /// Answer `url` with each response in turn, repeating the last one.
    pub fn respond_sequence(&self, url: &str, responses: Vec<MockResponse>) {
        let mut scripts = lock(&self.scripts);
        scripts.insert(
            url.to_string(),
            Script {
                queue: responses.into(),
                last: None,
            },
        );
    }

    /// Requests made for `url` so far.
    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).get(url).copied().unwrap_or(0)
    }

    /// Requests made across all URLs.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// Every request in arrival order, with its options.
    pub fn requests(&self) -> Vec<(String, RequestOptions)> {
        lock(&self.requests).clone()
    }

    fn next_response(&self, url: &str) -> MockResponse {
        let mut scripts = lock(&self.scripts);
        let Some(script) = scripts.get_mut(url) else {
            return MockResponse::Status(404);
        };
        match script.queue.pop_front() {
            Some(response) => {
                script.last = Some(response.clone());
                response
            }
            None => script.last.clone().unwrap_or(MockResponse::Status(404)),
        }
    }

    fn ok_response(&self, bytes: Bytes) -> HttpResponse {
        let chunks: Vec<Result<Bytes, DataError>> = match self.chunk_size {
            Some(size) => bytes
                .chunks(size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
            None => vec![Ok(bytes)],
        };
        HttpResponse {
            status: 200,
            body: stream::iter(chunks).boxed(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, url: &str, opts: &RequestOptions) -> Result<HttpResponse, DataError> {
        *lock(&self.calls).entry(url.to_string()).or_insert(0) += 1;
        lock(&self.requests).push((url.to_string(), opts.clone()));

        let mut response = self.next_response(url);
        loop {
            match response {
                MockResponse::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::Body(bytes) => return Ok(self.ok_response(bytes)),
                MockResponse::ResetAfter(prefix) => {
                    let reset = DataError::TransientNetwork {
                        url: url.to_string(),
                        reason: "connection reset".into(),
                    };
                    let body = self.ok_response(prefix).body.chain(stream::iter([Err(reset)]));
                    return Ok(HttpResponse {
                        status: 200,
                        body: body.boxed(),
                    });
                }
                MockResponse::StallAfter(prefix) => {
                    let body = self.ok_response(prefix).body.chain(stream::pending());
                    return Ok(HttpResponse {
                        status: 200,
                        body: body.boxed(),
                    });
                }
                MockResponse::Status(status) => {
                    return Ok(HttpResponse {
                        status,
                        body: stream::empty().boxed(),
                    })
                }
                MockResponse::NetworkError(reason) => {
                    return Err(DataError::TransientNetwork {
                        url: url.to_string(),
                        reason,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn unregistered_urls_are_404() {
        let mock = MockTransport::new();
        let resp = mock
            .send("https://nowhere.example/x", &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(mock.calls("https://nowhere.example/x"), 1);
    }

    #[tokio::test]
    async fn sequence_repeats_last() {
        let mock = MockTransport::new();
        let url = "https://files.example/a";
        mock.respond_sequence(url, vec![MockResponse::Status(500), MockResponse::body("ok")]);
        let opts = RequestOptions::default();
        assert_eq!(mock.send(url, &opts).await.unwrap().status, 500);
        for _ in 0..2 {
            let resp = mock.send(url, &opts).await.unwrap();
            let body: Vec<Bytes> = resp.body.try_collect().await.unwrap();
            assert_eq!(body.concat(), b"ok");
        }
        assert_eq!(mock.calls(url), 3);
    }

    #[test]
    fn gzip_bytes_have_magic_header() {
        let gz = gzip_bytes(b"a,b\n");
        assert_eq!(&gz[..2], &[0x1f, 0x8b]);
    }
}
