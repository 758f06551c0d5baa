use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use permit_ledger_store::LedgerError;

#[derive(Debug)]
pub struct OpsError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: &'a str,
}

impl OpsError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "unauthorized", "missing or invalid ops token")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }
}

impl From<LedgerError> for OpsError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::Validation { .. } => StatusCode::BAD_REQUEST,
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            LedgerError::Constraint { .. } => StatusCode::CONFLICT,
            LedgerError::CircuitOpen { .. } | LedgerError::Storage { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LedgerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LedgerError::Translation { .. } | LedgerError::Config { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for OpsError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: &self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_statuses() {
        let cases = [
            (LedgerError::invalid("bad table"), StatusCode::BAD_REQUEST),
            (LedgerError::circuit_open("open"), StatusCode::SERVICE_UNAVAILABLE),
            (LedgerError::timeout("slow"), StatusCode::GATEWAY_TIMEOUT),
            (LedgerError::constraint("dup"), StatusCode::CONFLICT),
            (LedgerError::translation("upsert"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(OpsError::from(err).status, status);
        }
    }
}
