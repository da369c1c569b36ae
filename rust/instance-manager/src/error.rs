//! Error kinds shared by every manager operation

use strum::{Display, IntoStaticStr};

/// Coarse classification of a failed operation, used by frontends to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// User input violates a documented rule
    Validation,
    /// Current state forbids the operation
    Conflict,
    /// Target entity does not exist
    NotFound,
    /// Operation is a no-op against current state
    NotModified,
    /// Anything else, usually a cluster API failure
    Internal,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::NotModified => 204,
            ErrorKind::Internal => 500,
        }
    }
}

/// Implemented by the error type of every manager operation.
pub trait ManagerError: std::error::Error + Send + Sync + 'static {
    fn kind(&self) -> ErrorKind;
}

/// Messages of `err` and each of its sources, joined as `"error: source: root cause"`
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    let mut messages = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        messages.push(cause.to_string());
        source = cause.source();
    }
    messages.join(": ")
}
