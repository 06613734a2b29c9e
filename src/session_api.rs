use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Default base URL for a locally running session service.
pub const SESSION_API_BASE_URL: &str = "http://localhost:8000";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionApiDefaults;

impl SessionApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 2;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct SessionApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SessionApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SessionApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: SessionApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: SessionApiDefaults::MAX_ATTEMPTS,
                initial_backoff: SessionApiDefaults::BACKOFF,
                max_backoff: SessionApiDefaults::BACKOFF,
                jitter: SessionApiDefaults::JITTER,
            },
        }
    }
}

/// HTTP client for the session CRUD and brainstorm control endpoints.
///
/// The channel manager is orthogonal to this client; it only carries the live
/// event stream, while session setup and control flow through here.
#[derive(Clone)]
pub struct SessionApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl SessionApiClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(SessionApiClientOptions::default())
    }

    pub fn with_options(options: SessionApiClientOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: SESSION_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Sets an explicit service base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim().trim_end_matches('/').to_string();
        self
    }

    pub async fn list_sessions(&self, skip: u32, limit: u32) -> Result<Vec<Session>, ApiError> {
        self.request_json(Method::GET, &format!("/api/sessions?skip={skip}&limit={limit}"))
            .await
    }

    pub async fn get_session(&self, session_id: u64) -> Result<Session, ApiError> {
        self.request_json(Method::GET, &format!("/api/sessions/{session_id}"))
            .await
    }

    pub async fn list_messages(
        &self,
        session_id: u64,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<SessionMessage>, ApiError> {
        self.request_json(
            Method::GET,
            &format!("/api/sessions/{session_id}/messages?skip={skip}&limit={limit}"),
        )
        .await
    }

    /// Starts the orchestrated discussion for a session.
    pub async fn start_brainstorm(&self, session_id: u64) -> Result<ControlResponse, ApiError> {
        self.request_json(Method::POST, &format!("/api/sessions/{session_id}/start"))
            .await
    }

    /// Stops a running discussion.
    pub async fn stop_brainstorm(&self, session_id: u64) -> Result<ControlResponse, ApiError> {
        self.request_json(Method::POST, &format!("/api/sessions/{session_id}/stop"))
            .await
    }

    pub async fn system_stats(&self) -> Result<SystemStats, ApiError> {
        self.request_json(Method::GET, "/api/stats").await
    }

    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.request_json(Method::GET, "/health").await
    }

    async fn request_json<T>(&self, method: Method, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let endpoint = format!("{}{}", self.base_url, path);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                let method = method.clone();
                async move { self.send_attempt(method, &endpoint).await }
            },
            ApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt<T>(&self, method: Method, endpoint: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                detail: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))
    }
}

/// A discussion session resource.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: u64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub topic: String,
    pub max_rounds: u32,
    pub current_round: u32,
    pub temperature: f64,
    pub max_tokens: u32,
    pub is_active: bool,
    pub is_completed: bool,
    pub consensus_reached: bool,
    pub consensus_percentage: f64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub llms: Vec<SessionParticipant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<u64>,
}

/// Agent participant attached to a session, reduced to the fields the live
/// view needs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionParticipant {
    pub id: i64,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_enabled: Option<bool>,
}

/// A stored discussion message as returned by the history endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMessage {
    pub id: i64,
    pub session_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_brand_color: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_points: Option<Vec<String>>,
    pub created_at: String,
}

/// Acknowledgement returned by the start/stop control endpoints.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlResponse {
    pub message: String,
    pub session_id: u64,
}

/// Aggregate counters for the dashboard.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemStats {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_messages: u64,
    pub total_llms: u64,
    pub online_llms: u64,
}

/// Service liveness probe response.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Errors produced by the session API transport and response handling.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request could not be sent or the response body not read.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-success HTTP status with the service's `detail` message.
    #[error("http status {status}: {detail}")]
    HttpStatus { status: StatusCode, detail: String },

    /// Response body did not match the expected schema.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        detail: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(detail) = parsed.detail.or(parsed.message) {
            return detail;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn error_body_detail_is_extracted() {
        assert_eq!(
            summarize_error_body(r#"{"detail":"Session not found"}"#),
            "Session not found"
        );
    }

    #[test]
    fn error_body_without_detail_is_truncated_verbatim() {
        let body = "upstream exploded".to_string() + &"x".repeat(400);
        let summary = summarize_error_body(&body);
        assert!(summary.starts_with("upstream exploded"));
        assert_eq!(summary.chars().count(), 220);
    }

    #[test]
    fn retryable_statuses_are_server_side_only() {
        let server_side = ApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            detail: "bad gateway".to_string(),
        };
        assert!(server_side.is_retryable());

        let client_side = ApiError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            detail: "Session not found".to_string(),
        };
        assert!(!client_side.is_retryable());

        assert!(!ApiError::Parse("truncated".to_string()).is_retryable());
    }

    #[test]
    fn session_decodes_from_service_shape() {
        let session: Session = serde_json::from_value(json!({
            "id": 42,
            "title": "Pricing strategy",
            "description": null,
            "topic": "How should we price the new tier?",
            "max_rounds": 5,
            "current_round": 2,
            "temperature": 0.7,
            "max_tokens": 2000,
            "is_active": true,
            "is_completed": false,
            "consensus_reached": false,
            "consensus_percentage": 41.5,
            "created_at": "2025-06-01T11:00:00Z",
            "updated_at": "2025-06-01T12:00:00Z",
            "llms": [
                {"id": 1, "display_name": "Claude", "brand_color": "#d97757", "is_enabled": true}
            ],
            "message_count": 9
        }))
        .expect("decode");

        assert_eq!(session.id, 42);
        assert_eq!(session.llms.len(), 1);
        assert_eq!(session.llms[0].display_name, "Claude");
        assert_eq!(session.message_count, Some(9));
    }

    #[test]
    fn base_url_override_is_normalized() {
        let client = SessionApiClient::new()
            .expect("build client")
            .with_base_url("http://sessions.internal:9000/  ");
        assert_eq!(client.base_url, "http://sessions.internal:9000");
    }
}
