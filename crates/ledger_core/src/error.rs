use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("timeout: {message}")]
    Timeout { message: String },
    #[error("circuit open: {message}")]
    CircuitOpen { message: String },
    #[error("constraint violation: {message}")]
    Constraint { message: String },
    #[error("translation error: {message}")]
    Translation { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("config error: {message}")]
    Config { message: String },
}

impl LedgerError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::CircuitOpen {
            message: message.into(),
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Transient failures are the only ones retried and counted by the circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Timeout { .. })
    }

    /// Stable snake_case code used by the operational HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "storage_error",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Constraint { .. } => "constraint_violation",
            Self::Translation { .. } => "translation_error",
            Self::Validation { .. } => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Config { .. } => "config_error",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<DbErr> for LedgerError {
    fn from(value: DbErr) -> Self {
        match value.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(message)) => LedgerError::constraint(message),
            Some(SqlErr::ForeignKeyConstraintViolation(message)) => {
                LedgerError::constraint(message)
            }
            _ => LedgerError::storage(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LedgerError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = LedgerError::storage("disk");
        assert!(matches!(err, LedgerError::Storage { .. }));
        let err = LedgerError::timeout("slow");
        assert!(matches!(err, LedgerError::Timeout { .. }));
        let err = LedgerError::circuit_open("tripped");
        assert!(matches!(err, LedgerError::CircuitOpen { .. }));
        let err = LedgerError::constraint("dup");
        assert!(matches!(err, LedgerError::Constraint { .. }));
        let err = LedgerError::translation("upsert");
        assert!(matches!(err, LedgerError::Translation { .. }));
        let err = LedgerError::invalid("bad");
        assert!(matches!(err, LedgerError::Validation { .. }));
        let err = LedgerError::not_found("missing");
        assert!(matches!(err, LedgerError::NotFound { .. }));
        let err = LedgerError::unauthorized("token");
        assert!(matches!(err, LedgerError::Unauthorized { .. }));
        let err = LedgerError::config("path");
        assert!(matches!(err, LedgerError::Config { .. }));
    }

    #[test]
    fn only_storage_and_timeout_are_transient() {
        assert!(LedgerError::storage("drop").is_transient());
        assert!(LedgerError::timeout("slow").is_transient());
        assert!(!LedgerError::constraint("dup").is_transient());
        assert!(!LedgerError::translation("upsert").is_transient());
        assert!(!LedgerError::circuit_open("open").is_transient());
        assert!(!LedgerError::invalid("bad").is_transient());
    }

    #[test]
    fn codes_are_snake_case() {
        assert_eq!(LedgerError::circuit_open("x").code(), "circuit_open");
        assert_eq!(LedgerError::unauthorized("x").code(), "unauthorized");
    }
}
