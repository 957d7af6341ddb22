use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use serde_json::json;
use shared::models::ErrorResponse;
use thiserror::Error;

use crate::services::{
    chat_service::ChatServiceError, fanout::FanoutError, query_service::QueryServiceError,
};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_user", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// Transient failures the caller may retry.
    pub fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl ApiError {
    fn into_problem(self) -> ErrorResponse {
        let title = self.status.canonical_reason().unwrap_or("Error");
        let mut problem = ErrorResponse::new(self.status.as_u16(), title, self.code, self.message);
        problem.details = self.details;
        problem
    }
}

/// Renders `problem` as `application/problem+json`. A copy stays in the
/// response extensions so the request middleware can stamp the request and
/// instance ids onto it.
pub fn problem_response(problem: ErrorResponse) -> Response {
    let status =
        StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(&problem)).into_response();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response.extensions_mut().insert(problem);
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        problem_response(self.into_problem())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal_server_error(value.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err
                .code()
                .unwrap_or_else(|| std::borrow::Cow::Borrowed("unknown"));
            let message = format!("database error {code}");
            return Self::unavailable("store_unavailable", message)
                .with_details(json!({ "sqlstate": code, "message": db_err.message() }));
        }

        Self::unavailable("store_unavailable", err.to_string())
    }
}

impl From<ChatServiceError> for ApiError {
    fn from(err: ChatServiceError) -> Self {
        match err {
            ChatServiceError::Validation(message) => Self::bad_request("validation_failed", message),
            ChatServiceError::NotFound(message) => Self::not_found(message),
            ChatServiceError::Forbidden(message) => Self::forbidden(message),
            ChatServiceError::Unavailable(db_err) => Self::from(db_err),
            ChatServiceError::Unexpected(err) => Self::from(err),
        }
    }
}

impl From<QueryServiceError> for ApiError {
    fn from(err: QueryServiceError) -> Self {
        match err {
            QueryServiceError::NotFound(message) => Self::not_found(message),
            QueryServiceError::Unavailable(db_err) => Self::from(db_err),
            QueryServiceError::Unexpected(err) => Self::from(err),
        }
    }
}

impl From<FanoutError> for ApiError {
    fn from(err: FanoutError) -> Self {
        match err {
            FanoutError::Broker(broker_err) => {
                Self::unavailable("broker_unavailable", broker_err.to_string())
            }
            other => Self::bad_request(other.code(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    #[test]
    fn new_sets_fields_and_allows_details() {
        let error = ApiError::forbidden("nope").with_details(json!({ "reason": "membership" }));
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.code, "forbidden");
        assert!(
            error
                .details
                .as_ref()
                .is_some_and(|details| details["reason"] == Value::from("membership"))
        );
    }

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::not_found("chat 42")
            .with_details(json!({ "resource": "chat" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value =
            serde_json::from_slice(&bytes).expect("problem details deserializes to json");
        assert_eq!(json["type"], "urn:relaychat:error:not_found");
        assert_eq!(json["title"], "Not Found");
        assert!(json.get("request_id").is_none());
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "chat 42");
        assert_eq!(json["details"]["resource"], "chat");
    }

    #[test]
    fn command_errors_distinguish_forbidden_missing_and_transient() {
        let validation = ApiError::from(ChatServiceError::Validation("bad".into()));
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);

        let not_found = ApiError::from(ChatServiceError::NotFound("missing".into()));
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let forbidden = ApiError::from(ChatServiceError::Forbidden("nope".into()));
        assert_eq!(forbidden.status, StatusCode::FORBIDDEN);

        let transient = ApiError::from(ChatServiceError::Unavailable(sqlx::Error::PoolTimedOut));
        assert_eq!(transient.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transient.code, "store_unavailable");
    }

    #[test]
    fn query_errors_map_to_matching_status_codes() {
        let not_found = ApiError::from(QueryServiceError::NotFound("message".into()));
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);

        let transient = ApiError::from(QueryServiceError::Unavailable(sqlx::Error::PoolClosed));
        assert_eq!(transient.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
