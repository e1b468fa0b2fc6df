//! Provider REST Client
//!
//! The one place that talks HTTP to a carrier: outbound call origination
//! and hangup. Requests carry a 30 second timeout and one retry with a
//! 250 ms backoff on transport errors; HTTP status failures are never
//! retried.

use crate::config::Credentials;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum RestError {
    #[error("request timed out")]
    Timeout,

    #[error("provider returned http {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl RestError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RestError::Timeout
        } else {
            RestError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct OriginateResponse {
    request_uuid: String,
}

/// Narrow HTTP client for one provider account.
#[derive(Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RestError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Ask the carrier to originate a call; on answer it will fetch the
    /// answer document from `answer_url` and open the media stream.
    pub async fn originate_call(
        &self,
        credentials: &Credentials,
        to: &str,
        from: &str,
        answer_url: &str,
    ) -> Result<String, RestError> {
        let url = originate_url(&self.base_url, &credentials.auth_id);
        let body = serde_json::json!({
            "from": from,
            "to": to,
            "answer_url": answer_url,
            "answer_method": "POST",
        });

        let response = self
            .send_with_retry(|| {
                self.http
                    .post(&url)
                    .basic_auth(&credentials.auth_id, Some(&credentials.auth_token))
                    .json(&body)
            })
            .await?;

        response
            .json::<OriginateResponse>()
            .await
            .map(|r| r.request_uuid)
            .map_err(|e| RestError::InvalidResponse(e.to_string()))
    }

    /// Hang up a live call on the provider side.
    pub async fn hangup_call(
        &self,
        credentials: &Credentials,
        call_uuid: &str,
    ) -> Result<(), RestError> {
        let url = hangup_url(&self.base_url, &credentials.auth_id, call_uuid);
        self.send_with_retry(|| {
            self.http
                .delete(&url)
                .basic_auth(&credentials.auth_id, Some(&credentials.auth_token))
        })
        .await
        .map(|_| ())
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RestError> {
        let response = match build().send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => return Err(RestError::Timeout),
            Err(err) => {
                warn!("provider request failed ({err}), retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                build().send().await.map_err(RestError::from_reqwest)?
            }
        };

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(RestError::Status(response.status().as_u16()))
        }
    }
}

fn originate_url(base_url: &str, auth_id: &str) -> String {
    format!("{base_url}/v1/Account/{auth_id}/Call/")
}

fn hangup_url(base_url: &str, auth_id: &str, call_uuid: &str) -> String {
    format!("{base_url}/v1/Account/{auth_id}/Call/{call_uuid}/")
}
