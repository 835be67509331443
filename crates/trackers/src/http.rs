//! Shared HTTP plumbing for the platform adapters.
//!
//! Owns the retry policy: capped exponential backoff with jitter on 429/503
//! and transport failures, 404 mapped to [`TrackerError::NotFound`] without
//! retry, other 4xx surfaced as permanent errors with the response body.

use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::types::{TrackerError, TrackerResult};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Total attempts per logical request (1 initial + retries).
const MAX_ATTEMPTS: u32 = 4;

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Backoff delay for a given retry attempt, with jitter so synchronized
/// fleets do not stampede a throttling remote.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * 2u64.pow(attempt);
    let capped = base.min(MAX_BACKOFF_MS);
    let jitter_range = capped / 4;
    let jitter = if jitter_range > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        now % jitter_range
    } else {
        0
    };
    Duration::from_millis(capped + jitter)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

/// A reqwest client bound to one platform: base URL plus auth header.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    auth_header: &'static str,
    auth_value: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("auth_header", &self.auth_header)
            .field("auth_value", &"<secret>")
            .finish()
    }
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        auth_header: &'static str,
        auth_value: String,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("trackbridge/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header,
            auth_value,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> TrackerResult<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(self.auth_header, &self.auth_value);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(TrackerError::NotFound);
                    }
                    if is_retryable_status(status) {
                        if attempt + 1 < MAX_ATTEMPTS {
                            let delay = backoff_delay(attempt);
                            tracing::warn!(
                                url = %url,
                                status = status.as_u16(),
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                "Remote is throttling, retrying with backoff"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(TrackerError::Transient(format!(
                            "HTTP {} after {} attempts",
                            status.as_u16(),
                            MAX_ATTEMPTS
                        )));
                    }
                    if status.is_client_error() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(TrackerError::Permanent {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    // Remaining 5xx: transient, but left to the next pass.
                    return Err(TrackerError::Transient(format!(
                        "HTTP {}",
                        status.as_u16()
                    )));
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transport error, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(TrackerError::Transient(e.to_string())),
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> TrackerResult<T> {
        let response = self.execute(Method::GET, path, query, None).await?;
        decode_json(response).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> TrackerResult<T> {
        let response = self.execute(Method::POST, path, &[], Some(body)).await?;
        decode_json(response).await
    }

    /// PUT where the response body is irrelevant (Redmine answers 204).
    pub async fn put(&self, path: &str, body: &serde_json::Value) -> TrackerResult<()> {
        self.execute(Method::PUT, path, &[], Some(body)).await?;
        Ok(())
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> TrackerResult<T> {
    let status = response.status();
    response.json::<T>().await.map_err(|e| TrackerError::Permanent {
        status: status.as_u16(),
        body: format!("invalid response body: {e}"),
    })
}
