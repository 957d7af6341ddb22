use std::str::FromStr;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::http::error::{ApiError, AppResult, problem_response};
use shared::{config::server::Config, models::ErrorResponse};

/// Per-request identity. There is no authentication: the caller names the
/// user it acts for in the configured user header.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<Uuid>,
}

impl RequestContext {
    pub fn require_user(&self) -> AppResult<Uuid> {
        self.user_id
            .ok_or_else(|| ApiError::unauthorized("a user id header is required"))
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Debug)]
pub struct RequestIdState {
    header: HeaderName,
    user_header: HeaderName,
    instance_id: String,
}

impl RequestIdState {
    pub fn from_config(config: &Config) -> Self {
        let header = HeaderName::from_str(&config.server.request_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-request-id"));
        let user_header = HeaderName::from_str(&config.server.user_id_header)
            .unwrap_or_else(|_| HeaderName::from_static("x-user-id"));
        Self {
            header,
            user_header,
            instance_id: config.server.instance_id.clone(),
        }
    }

    /// Stamps the request and instance ids onto an error body.
    fn stamp_problem(&self, response: Response, request_id: &str) -> Response {
        let (mut parts, body) = response.into_parts();
        let Some(mut problem) = parts.extensions.remove::<ErrorResponse>() else {
            return Response::from_parts(parts, body);
        };
        problem.request_id = Some(request_id.to_string());
        problem.instance_id = Some(self.instance_id.clone());

        let mut stamped = problem_response(problem);
        *stamped.status_mut() = parts.status;
        for (name, value) in &parts.headers {
            if !stamped.headers().contains_key(name) {
                stamped.headers_mut().insert(name.clone(), value.clone());
            }
        }
        stamped
    }
}

pub async fn assign_request_id(
    State(state): State<RequestIdState>,
    mut request: Request<Body>,
    next: Next,
) -> AppResult<Response> {
    let header_name = state.header.clone();
    let current = extract_header(request.headers(), &header_name);

    let request_id = current.unwrap_or_else(|| Uuid::new_v4().to_string());
    let user_id = match extract_header(request.headers(), &state.user_header) {
        Some(raw) => match Uuid::parse_str(&raw) {
            Ok(user_id) => Some(user_id),
            Err(_) => {
                let response = ApiError::bad_request(
                    "invalid_user_id",
                    format!("{} must be a UUID", state.user_header),
                )
                .into_response();
                let mut response = state.stamp_problem(response, &request_id);
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    response.headers_mut().insert(header_name, value);
                }
                return Ok(response);
            }
        },
        None => None,
    };

    request.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        user_id,
    });

    request.headers_mut().insert(
        header_name.clone(),
        HeaderValue::from_str(&request_id)
            .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?,
    );

    let response = next.run(request).await;
    let mut response = state.stamp_problem(response, &request_id);
    response.headers_mut().insert(
        header_name,
        HeaderValue::from_str(&request_id)
            .map_err(|_| ApiError::internal_server_error("failed to encode request id"))?,
    );

    Ok(response)
}

fn extract_header(headers: &HeaderMap, header: &HeaderName) -> Option<String> {
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
