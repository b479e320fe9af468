//! Retrying HTTP client.
//!
//! Wraps `reqwest` with bounded retries, exponential backoff with jitter, a
//! per-attempt timeout, and Retry-After honoring. The retry decision is an
//! explicit tagged value ([`Attempt`]) produced by classifying each outcome,
//! and the driving loop owns the backoff schedule — the policy is unit
//! testable without real network calls.
//!
//! Retryable: 429, 500, 502, 503, 504, network errors, timeouts, and (for
//! JSON endpoints) body decode failures. Everything else fails fast.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Transport-level failure reaching a remote source.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The remote answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    /// Connection, DNS, TLS, or mid-body failure.
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    /// The response body was not valid JSON.
    #[error("invalid JSON from {url}: {message}")]
    Decode { url: String, message: String },
}

impl HttpError {
    /// The HTTP status code, when the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Outcome of one attempt, classified for the retry loop.
pub enum Attempt<T> {
    Success(T),
    /// Worth retrying; carries a server-provided delay hint when present.
    Retryable {
        error: HttpError,
        retry_after: Option<f64>,
    },
    /// Retrying cannot help (e.g. a non-429 4xx).
    Fatal(HttpError),
}

/// Retry/backoff schedule shared by all requests of one client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (minimum 1).
    pub retries: u32,
    /// Base backoff in seconds; doubles each attempt.
    pub backoff_seconds: f64,
    /// Ceiling applied after the Retry-After hint and jitter.
    pub max_backoff_seconds: f64,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_seconds: 1.0,
            max_backoff_seconds: 60.0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, without jitter applied.
    ///
    /// `attempt` is zero-based; a server hint overrides the exponential base
    /// when larger. The ceiling always wins.
    pub fn base_delay(&self, attempt: u32, retry_after: Option<f64>) -> f64 {
        let exp = self.backoff_seconds.max(0.0) * 2f64.powi(attempt as i32);
        let candidate = exp.max(retry_after.unwrap_or(0.0));
        candidate.min(self.max_backoff_seconds)
    }

    fn jittered_delay(&self, attempt: u32, retry_after: Option<f64>) -> f64 {
        let exp = self.backoff_seconds.max(0.0) * 2f64.powi(attempt as i32);
        let mut candidate = exp.max(retry_after.unwrap_or(0.0));
        if candidate > 0.0 {
            candidate *= rand::thread_rng().gen_range(0.8..1.2);
        }
        candidate.min(self.max_backoff_seconds)
    }
}

/// Whether a status code is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Parse a Retry-After header value into seconds (best effort).
///
/// Only the integer/float-seconds form is understood; HTTP-date values are
/// ignored. Negative values are ignored.
pub fn parse_retry_after(value: Option<&str>) -> Option<f64> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    let seconds: f64 = raw.parse().ok()?;
    if seconds < 0.0 {
        return None;
    }
    Some(seconds)
}

/// Drive `op` until it succeeds, fails fatally, or attempts are exhausted.
pub async fn run_with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, HttpError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let attempts = policy.retries.max(1);
    let mut last_error: Option<HttpError> = None;

    for attempt in 0..attempts {
        match op().await {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fatal(error) => return Err(error),
            Attempt::Retryable { error, retry_after } => {
                tracing::debug!(attempt, %error, "retryable HTTP failure");
                last_error = Some(error);
                if attempt + 1 < attempts {
                    let delay = policy.jittered_delay(attempt, retry_after);
                    if delay > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }
    }

    // attempts >= 1, so at least one Retryable was recorded.
    Err(last_error.expect("retry loop ran at least once"))
}

/// HTTP client with a fixed retry policy.
pub struct HttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch a URL's body as bytes.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Vec<u8>, HttpError> {
        run_with_retries(&self.policy, || self.attempt_bytes(url, headers)).await
    }

    /// Fetch a URL's body as UTF-8 text (lossy on invalid sequences).
    pub async fn fetch_text(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<String, HttpError> {
        let body = self.fetch_bytes(url, headers).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Fetch and decode a JSON body. Decode failures count as retryable.
    pub async fn fetch_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Value, HttpError> {
        run_with_retries(&self.policy, || async {
            match self.attempt_bytes(url, headers).await {
                Attempt::Success(body) => decode_json(url, &body),
                Attempt::Retryable { error, retry_after } => {
                    Attempt::Retryable { error, retry_after }
                }
                Attempt::Fatal(error) => Attempt::Fatal(error),
            }
        })
        .await
    }

    /// POST a JSON payload and decode the JSON response.
    pub async fn post_json(
        &self,
        url: &str,
        payload: &Value,
        headers: &[(&str, &str)],
    ) -> Result<Value, HttpError> {
        run_with_retries(&self.policy, || async {
            let mut request = self
                .client
                .post(url)
                .timeout(self.policy.timeout)
                .json(payload);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }
            match send(url, request).await {
                Attempt::Success(body) => decode_json(url, &body),
                other => other.map_never(),
            }
        })
        .await
    }

    async fn attempt_bytes(&self, url: &str, headers: &[(&str, &str)]) -> Attempt<Vec<u8>> {
        let mut request = self.client.get(url).timeout(self.policy.timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        send(url, request).await
    }
}

impl<T> Attempt<T> {
    /// Re-tag a failure attempt with a different success type.
    fn map_never<U>(self) -> Attempt<U> {
        match self {
            Attempt::Success(_) => unreachable!("map_never called on a success"),
            Attempt::Retryable { error, retry_after } => Attempt::Retryable { error, retry_after },
            Attempt::Fatal(error) => Attempt::Fatal(error),
        }
    }
}

fn decode_json<T>(url: &str, body: &[u8]) -> Attempt<T>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_slice(body) {
        Ok(value) => Attempt::Success(value),
        Err(e) => Attempt::Retryable {
            error: HttpError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            },
            retry_after: None,
        },
    }
}

async fn send(url: &str, request: reqwest::RequestBuilder) -> Attempt<Vec<u8>> {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            return Attempt::Retryable {
                error: HttpError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                },
                retry_after: None,
            }
        }
    };

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(Some(v)));
        let error = HttpError::Status {
            status,
            url: url.to_string(),
        };
        return if is_retryable_status(status) {
            Attempt::Retryable {
                error,
                retry_after,
            }
        } else {
            Attempt::Fatal(error)
        };
    }

    match response.bytes().await {
        Ok(body) => Attempt::Success(body.to_vec()),
        Err(e) => Attempt::Retryable {
            error: HttpError::Network {
                url: url.to_string(),
                message: e.to_string(),
            },
            retry_after: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff_seconds: 0.0,
            max_backoff_seconds: 0.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404, 418] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("5")), Some(5.0));
        assert_eq!(parse_retry_after(Some(" 2.5 ")), Some(2.5));
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(Some("")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn test_base_delay_schedule() {
        let policy = RetryPolicy {
            retries: 5,
            backoff_seconds: 1.0,
            max_backoff_seconds: 60.0,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.base_delay(0, None), 1.0);
        assert_eq!(policy.base_delay(1, None), 2.0);
        assert_eq!(policy.base_delay(2, None), 4.0);
        // Server hint wins when larger than the exponential base.
        assert_eq!(policy.base_delay(0, Some(10.0)), 10.0);
        // Ceiling always wins.
        assert_eq!(policy.base_delay(10, None), 60.0);
        assert_eq!(policy.base_delay(0, Some(300.0)), 60.0);
    }

    #[tokio::test]
    async fn test_recovers_after_retryable_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = HttpClient::new(fast_policy(3));
        let body = client
            .fetch_bytes(&format!("{}/data", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(fast_policy(3));
        let err = client
            .fetch_bytes(&format!("{}/gone", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = HttpClient::new(fast_policy(2));
        let err = client
            .fetch_bytes(&format!("{}/down", server.uri()), &[])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_fetch_json_retries_bad_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"a\":1}"))
            .mount(&server)
            .await;

        let client = HttpClient::new(fast_policy(2));
        let value = client
            .fetch_json(&format!("{}/json", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(value["a"], 1);
    }
}
