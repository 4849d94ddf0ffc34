use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::auth::{AuthError, RefreshFailure};

/// Errors returned to callers of the API client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failure or timeout, passed through untouched.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The session could not be renewed, or the replayed request was rejected again.
    #[error("authentication required (HTTP 401): {body}")]
    Unauthorized {
        body: String,
        #[source]
        refresh: Option<RefreshFailure>,
    },
    #[error("permission denied (HTTP 403): {body}")]
    Forbidden { body: String },
    #[error("resource not found (HTTP 404): {body}")]
    NotFound { body: String },
    #[error("validation failed ({status}): {message}")]
    Validation {
        status: StatusCode,
        message: String,
        body: String,
    },
    #[error("server error {status}: {body}")]
    Server { status: StatusCode, body: String },
    #[error("HTTP status {status} body: {body}")]
    Status { status: StatusCode, body: String },
    /// Raised for requests that waited on a refresh cycle led by another request.
    #[error("token refresh failed: {0}")]
    RefreshFailed(#[source] RefreshFailure),
    #[error("token refresh was abandoned before it settled")]
    RefreshAbandoned,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// A resolved URL left the configured API base; nothing was sent.
    #[error("refusing to send credentials outside the API base URL: {0}")]
    ForeignUrl(url::Url),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Classify a non-success response. 401 is handled by the client before this point.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized {
                body,
                refresh: None,
            },
            StatusCode::FORBIDDEN => ApiError::Forbidden { body },
            StatusCode::NOT_FOUND => ApiError::NotFound { body },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation {
                status,
                message: validation_message(&body),
                body,
            },
            status if status.is_server_error() => ApiError::Server { status, body },
            status => ApiError::Status { status, body },
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Http(err) => err.status(),
            ApiError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            ApiError::Forbidden { .. } => Some(StatusCode::FORBIDDEN),
            ApiError::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            ApiError::Validation { status, .. }
            | ApiError::Server { status, .. }
            | ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Http(err) if err.is_timeout())
    }

    /// Whether the caller has to log in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized { .. } | ApiError::RefreshFailed(_) | ApiError::RefreshAbandoned
        )
    }

    /// Text suitable for an alert or inline message.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Http(err) if err.is_timeout() => {
                "The request timed out. Check your connection and try again.".into()
            }
            ApiError::Http(_) => {
                "Unable to reach the server. Check your connection and try again.".into()
            }
            ApiError::Unauthorized { .. }
            | ApiError::RefreshFailed(_)
            | ApiError::RefreshAbandoned => "Your session has expired. Please log in again.".into(),
            ApiError::Forbidden { .. } => {
                "You do not have permission to perform this action.".into()
            }
            ApiError::NotFound { .. } => "The requested resource was not found.".into(),
            ApiError::Validation { message, .. } => message.clone(),
            ApiError::Server { .. } => "Server error, please try again later.".into(),
            ApiError::Status { status, .. } => format!("Request failed ({status})."),
            ApiError::Auth(_)
            | ApiError::InvalidUrl(_)
            | ApiError::ForeignUrl(_)
            | ApiError::Deserialize(_) => {
                "Something went wrong. Please try again.".into()
            }
        }
    }
}

const GENERIC_VALIDATION: &str = "The submitted data is invalid.";

/// Pull a readable message out of a DRF-style error body.
///
/// Understands `{"detail": ..}`, `{"message": ..}`, `{"error": ..}`,
/// `{"non_field_errors": [..]}` and `{"field": ["msg"]}`.
fn validation_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return GENERIC_VALIDATION.to_owned();
    };
    let Some(object) = value.as_object() else {
        return first_text(&value).unwrap_or_else(|| GENERIC_VALIDATION.to_owned());
    };

    for key in ["detail", "message", "error", "non_field_errors"] {
        if let Some(text) = object.get(key).and_then(first_text) {
            return text;
        }
    }

    object
        .iter()
        .find_map(|(field, value)| first_text(value).map(|text| format!("{field}: {text}")))
        .unwrap_or_else(|| GENERIC_VALIDATION.to_owned())
}

fn first_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Array(items) => items.iter().find_map(first_text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            ApiError::from_status(StatusCode::FORBIDDEN, String::new()),
            ApiError::Forbidden { .. }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, String::new()),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, String::new()),
            ApiError::Server { .. }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::CONFLICT, String::new()),
            ApiError::Status { .. }
        ));
    }

    #[test]
    fn forbidden_is_not_session_expiry() {
        let err = ApiError::from_status(StatusCode::FORBIDDEN, "{}".into());
        assert!(!err.is_session_expired());
        assert_eq!(
            err.user_message(),
            "You do not have permission to perform this action."
        );
    }

    #[test]
    fn validation_messages_are_readable() {
        assert_eq!(
            validation_message(r#"{"detail":"Workout already finished."}"#),
            "Workout already finished."
        );
        assert_eq!(
            validation_message(r#"{"non_field_errors":["Passwords do not match."]}"#),
            "Passwords do not match."
        );
        assert_eq!(
            validation_message(r#"{"email":["Enter a valid email address."]}"#),
            "email: Enter a valid email address."
        );
        assert_eq!(validation_message("<html>"), GENERIC_VALIDATION);

        let err = ApiError::from_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"message":"Reps must be positive"}"#.into(),
        );
        assert_eq!(err.user_message(), "Reps must be positive");
        assert_eq!(err.status(), Some(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn server_errors_use_generic_message() {
        let err = ApiError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "trace".into());
        assert_eq!(err.user_message(), "Server error, please try again later.");
    }
}
