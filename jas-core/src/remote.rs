//! Client for a hosted text-to-image inference endpoint.
//!
//! One call to [`RemoteClient::synthesize`] is one HTTPS POST. There is no
//! retry and no backoff: every outcome, including a cold-starting model, is
//! handed back to the caller as an [`InferenceError`] for a manual retry.

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use thiserror::Error;

use crate::Prompt;

pub const DEFAULT_ENDPOINT: &str =
    "https://router.huggingface.co/hf-inference/models/stabilityai/stable-diffusion-xl-base-1.0";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub const TOKEN_ENV: &str = "HF_TOKEN";
pub const ENDPOINT_ENV: &str = "JAS_ENDPOINT";
pub const TIMEOUT_ENV: &str = "JAS_TIMEOUT_SECS";

/// Longest slice of a response body carried into user-facing messages.
pub const EXCERPT_CHARS: usize = 300;

/// Bearer credential for the inference endpoint. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiToken(String);

impl ApiToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().trim().to_string())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiToken(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub token: ApiToken,
    pub timeout: Duration,
}

impl RemoteConfig {
    pub fn new(endpoint: impl Into<String>, token: ApiToken) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Every way a remote synthesis call can fail. All of them are recoverable by
/// the user trying again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("Unauthorized: the access token is invalid or expired")]
    Unauthorized,

    #[error("Forbidden: no access to this model, accept its license on the Hub first")]
    Forbidden,

    #[error("Model is loading on the inference servers, wait 20-30 seconds and try again")]
    ServiceWarming,

    #[error("API error ({status}): {}", excerpt(.body))]
    ApiError { status: u16, body: String },

    #[error("Request timed out, the model may be overloaded, please try again")]
    Timeout,

    #[error("Connection error, check your internet connection ({0})")]
    ConnectionFailure(String),

    #[error("API returned a non-image response ({content_type}): {excerpt}")]
    InvalidContent {
        content_type: String,
        excerpt: String,
    },
}

impl InferenceError {
    /// Maps a non-success HTTP status to its failure kind. Returns `None` for
    /// 2xx statuses.
    pub fn from_status(status: StatusCode, body: String) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        Some(match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized,
            StatusCode::FORBIDDEN => Self::Forbidden,
            StatusCode::SERVICE_UNAVAILABLE => Self::ServiceWarming,
            other => Self::ApiError {
                status: other.as_u16(),
                body,
            },
        })
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::ConnectionFailure(err.to_string())
        }
    }

    /// Whether trying again later without changing anything can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceWarming | Self::Timeout | Self::ConnectionFailure(_)
        )
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(EXCERPT_CHARS).collect()
}

fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .trim_start()
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("image/"))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InferencePayload<'a> {
    pub inputs: &'a str,
    pub parameters: InferenceParameters<'a>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InferenceParameters<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<&'a str>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    endpoint: Url,
    authorization: HeaderValue,
}

impl RemoteClient {
    /// Fails on a malformed endpoint URL or a token that cannot be sent as a
    /// header value.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("invalid inference endpoint {:?}", config.endpoint))?;
        let mut authorization =
            HeaderValue::from_str(&format!("Bearer {}", config.token.expose()))
                .context("access token contains characters not allowed in an HTTP header")?;
        authorization.set_sensitive(true);
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            authorization,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Sends one synthesis request and returns the raw image bytes.
    ///
    /// The prompt is validated by the caller; the bytes are not decoded here.
    pub async fn synthesize(
        &self,
        prompt: &Prompt,
        negative_prompt: Option<&str>,
        steps: usize,
        guidance_scale: f64,
    ) -> Result<Bytes, InferenceError> {
        let payload = InferencePayload {
            inputs: prompt.as_str(),
            parameters: InferenceParameters {
                negative_prompt,
                num_inference_steps: steps,
                guidance_scale,
            },
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            steps,
            guidance_scale,
            "sending inference request"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(AUTHORIZATION, self.authorization.clone())
            .json(&payload)
            .send()
            .await
            .map_err(InferenceError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = InferenceError::from_status(status, body)
                .unwrap_or(InferenceError::ApiError {
                    status: status.as_u16(),
                    body: String::new(),
                });
            tracing::warn!(status = status.as_u16(), "inference request failed: {err}");
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !is_image_content_type(&content_type) {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%content_type, "inference endpoint returned a non-image body");
            return Err(InferenceError::InvalidContent {
                content_type,
                excerpt: excerpt(&body),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(InferenceError::from_transport)?;
        tracing::info!(len = bytes.len(), %content_type, "received generated image");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(InferenceError::from_status(StatusCode::OK, String::new()), None);
        assert_eq!(
            InferenceError::from_status(StatusCode::UNAUTHORIZED, "nope".into()),
            Some(InferenceError::Unauthorized)
        );
        assert_eq!(
            InferenceError::from_status(StatusCode::FORBIDDEN, String::new()),
            Some(InferenceError::Forbidden)
        );
        assert_eq!(
            InferenceError::from_status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            Some(InferenceError::ServiceWarming)
        );
        assert_eq!(
            InferenceError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
            Some(InferenceError::ApiError {
                status: 500,
                body: "boom".into()
            })
        );
        assert_eq!(
            InferenceError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Some(InferenceError::ApiError {
                status: 429,
                body: String::new()
            })
        );
    }

    #[test]
    fn api_error_message_truncates_body() {
        let err = InferenceError::ApiError {
            status: 500,
            body: "x".repeat(1000),
        };
        let message = err.to_string();
        assert!(message.starts_with("API error (500): "));
        assert_eq!(message.len(), "API error (500): ".len() + EXCERPT_CHARS);
    }

    #[test]
    fn image_content_types() {
        assert!(is_image_content_type("image/png"));
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("Image/PNG; charset=binary"));
        assert!(!is_image_content_type("application/json"));
        assert!(!is_image_content_type("text/plain; charset=utf-8"));
        assert!(!is_image_content_type(""));
        assert!(!is_image_content_type("imag"));
    }

    #[test]
    fn payload_matches_wire_format() {
        let payload = InferencePayload {
            inputs: "a lighthouse at dusk",
            parameters: InferenceParameters {
                negative_prompt: Some("blurry"),
                num_inference_steps: 30,
                guidance_scale: 7.5,
            },
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({
                "inputs": "a lighthouse at dusk",
                "parameters": {
                    "negative_prompt": "blurry",
                    "num_inference_steps": 30,
                    "guidance_scale": 7.5
                }
            })
        );

        let payload = InferencePayload {
            parameters: InferenceParameters {
                negative_prompt: None,
                ..payload.parameters
            },
            ..payload
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value["parameters"].get("negative_prompt").is_none());
    }

    #[test]
    fn token_is_redacted_in_debug_output() {
        let config = RemoteConfig::new(DEFAULT_ENDPOINT, ApiToken::new("hf_secret_value"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("hf_secret_value"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn transient_kinds() {
        assert!(InferenceError::ServiceWarming.is_transient());
        assert!(InferenceError::Timeout.is_transient());
        assert!(!InferenceError::Unauthorized.is_transient());
        assert!(!InferenceError::ApiError {
            status: 500,
            body: String::new()
        }
        .is_transient());
    }

    #[test]
    fn client_debug_hides_credential() {
        let config = RemoteConfig::new(DEFAULT_ENDPOINT, ApiToken::new("hf_secret_value"));
        let client = RemoteClient::new(config).unwrap();
        assert!(!format!("{client:?}").contains("hf_secret_value"));
    }
}
