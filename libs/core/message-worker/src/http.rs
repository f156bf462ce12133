//! Outbound HTTP with retries.
//!
//! `ResilientHttpClient` runs requests through a [`RetryPolicy`]. Server
//! errors (5xx), timeouts and connection failures are retried; any other
//! non-success status is returned immediately.

use crate::error::{ErrorCategory, Transience};
use crate::resilience::RetryPolicy;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// HTTP call errors
#[derive(Error, Debug)]
pub enum HttpError {
    /// The server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Status { status: StatusCode, url: String },

    /// Request could not be sent or the response could not be read
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::Transport(err) => err.status(),
        }
    }
}

impl Transience for HttpError {
    fn category(&self) -> ErrorCategory {
        match self {
            HttpError::Status { status, .. } if status.is_server_error() => ErrorCategory::Transient,
            HttpError::Status { status, .. } if *status == StatusCode::TOO_MANY_REQUESTS => {
                ErrorCategory::Transient
            }
            HttpError::Transport(err) if err.is_timeout() || err.is_connect() => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }
}

/// `reqwest` client whose calls go through a retry policy.
#[derive(Clone)]
pub struct ResilientHttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl ResilientHttpClient {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send the request built by `build`, rebuilding it for every attempt.
    ///
    /// Non-success statuses are turned into [`HttpError::Status`].
    pub async fn send<B>(&self, build: B) -> Result<Response, HttpError>
    where
        B: Fn(&Client) -> RequestBuilder + Sync,
    {
        let build = &build;
        let client = &self.client;

        self.policy
            .execute_observed(
                move || async move {
                    let response = build(client).send().await?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(response)
                    } else {
                        Err(HttpError::Status {
                            status,
                            url: response.url().to_string(),
                        })
                    }
                },
                |retry| {
                    debug!(
                        attempt = retry.attempt,
                        wait_secs = retry.wait.as_secs(),
                        error = %retry.error,
                        "Retrying HTTP request"
                    );
                },
            )
            .await
    }

    /// GET `url` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        let response = self.send(|client| client.get(url)).await?;
        Ok(response.json().await?)
    }

    /// POST `body` as JSON to `url` and decode the JSON response.
    pub async fn post_json<B, T>(&self, url: &str, body: &B) -> Result<T, HttpError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(|client| client.post(url).json(body)).await?;
        Ok(response.json().await?)
    }
}
