//! Facade-native error payloads. The orchestrating handlers are the only
//! place client-facing errors are produced.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Anthropic error envelope: `{"type":"error","error":{type,message}}`.
pub fn anthropic_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let body = json!({
        "type": "error",
        "error": { "type": kind, "message": message.into() },
    });
    (status, Json(body)).into_response()
}

/// OpenAI error envelope: `{"error":{type,code,message}}`.
pub fn openai_error(
    status: StatusCode,
    kind: &str,
    code: &str,
    message: impl Into<String>,
) -> Response {
    let body = json!({
        "error": { "type": kind, "code": code, "message": message.into() },
    });
    (status, Json(body)).into_response()
}

/// Client-visible status for an upstream failure status.
pub fn map_upstream_status(upstream: u16) -> StatusCode {
    match upstream {
        429 => StatusCode::TOO_MANY_REQUESTS,
        401 | 403 => StatusCode::UNAUTHORIZED,
        400..=499 => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}

pub fn map_upstream_type_anthropic(upstream: u16) -> &'static str {
    match upstream {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}

pub fn map_upstream_type_openai(upstream: u16) -> &'static str {
    match upstream {
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        400..=499 => "invalid_request_error",
        _ => "server_error",
    }
}

pub fn map_upstream_code_openai(upstream: u16) -> &'static str {
    match upstream {
        429 => "rate_limit",
        401 | 403 => "unauthorized",
        500.. => "upstream_error",
        _ => "bad_request",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_mapping() {
        assert_eq!(map_upstream_status(429), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(map_upstream_status(401), StatusCode::UNAUTHORIZED);
        assert_eq!(map_upstream_status(403), StatusCode::UNAUTHORIZED);
        assert_eq!(map_upstream_status(404), StatusCode::BAD_REQUEST);
        assert_eq!(map_upstream_status(503), StatusCode::BAD_GATEWAY);
        assert_eq!(map_upstream_status(0), StatusCode::BAD_GATEWAY);
    }
}
