use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Error;

/// Raw JSON exchange with the tracking server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, Error>;

    async fn patch(&self, url: &str, body: &Value) -> Result<String, Error>;
}

/// reqwest transport with a per-request timeout and exponential backoff.
pub struct HttpTransport {
    client: reqwest::Client,
    max_attempts: u32,
    max_elapsed: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration, max_attempts: u32) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_attempts: max_attempts.max(1),
            max_elapsed: timeout * max_attempts.max(1) * 2,
        })
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<String, Error> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        };

        let mut attempt = 0;
        backoff::future::retry(policy, || {
            attempt += 1;
            let last = attempt >= self.max_attempts;
            let method = method.clone();
            let current = attempt;
            async move {
                let mut request = self.client.request(method, url);
                if let Some(body) = body {
                    request = request.json(body);
                }

                let response = match request.send().await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(url, attempt = current, error = %e, "registry request failed");
                        return Err(classify(Error::Http(e), last, true));
                    }
                };

                let status = response.status();
                if status != StatusCode::OK {
                    warn!(url, attempt = current, %status, "registry answered with non-200 status");
                    let err = Error::Status {
                        url: url.to_string(),
                        status: status.as_u16(),
                    };
                    return Err(classify(err, last, is_retryable(status)));
                }

                debug!(url, attempt = current, "registry request succeeded");
                response
                    .text()
                    .await
                    .map_err(|e| classify(Error::Http(e), last, true))
            }
        })
        .await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<String, Error> {
        self.send(Method::GET, url, None).await
    }

    async fn patch(&self, url: &str, body: &Value) -> Result<String, Error> {
        self.send(Method::PATCH, url, Some(body)).await
    }
}

fn classify(err: Error, last_attempt: bool, retryable: bool) -> backoff::Error<Error> {
    if retryable && !last_attempt {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Statuses worth another attempt: throttling and server-side failures.
pub fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
