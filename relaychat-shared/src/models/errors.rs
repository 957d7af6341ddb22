use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Error body returned by every endpoint (`application/problem+json`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, ToSchema)]
pub struct ErrorResponse {
    /// `urn:relaychat:error:<code>`
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    /// Stable machine-readable error code (`forbidden`, `not_found`, ...)
    pub code: String,
    /// The main error message
    pub message: String,
    /// Optional additional details about the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Request id the failure belongs to; matches the request id header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Instance id of the process that rejected the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ErrorResponse {
    #[must_use]
    pub fn new(
        status: u16,
        title: impl Into<String>,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            problem_type: format!("urn:relaychat:error:{code}"),
            title: title.into(),
            status,
            code: code.to_string(),
            message: message.into(),
            details: None,
            request_id: None,
            instance_id: None,
        }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}: {} ({details})", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ErrorResponse {}
