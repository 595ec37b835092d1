//! Server error taxonomy
//!
//! Errors are classified by kind; the REST layer maps each kind to a status
//! through [`Error::status`]. Agent-reported failures (`ok=false` replies)
//! keep their raw message under the `Client` kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request parameters, unknown interpreter, conflicting flags.
    #[error("{0}")]
    Validation(String),

    /// Bad credentials, disabled writes.
    #[error("{0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id, port in use, parameter conflicts, bound credentials.
    #[error("{0}")]
    Conflict(String),

    /// The agent answered `ok=false`; carries the raw error string.
    #[error("client error: {0}")]
    Client(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the REST layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(_) => 401,
            Error::NotFound(_) => 404,
            Error::Conflict(_) | Error::Client(_) => 409,
            Error::Internal(_) => 500,
        }
    }
}

impl From<portway_server_db::StoreError> for Error {
    fn from(e: portway_server_db::StoreError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<portway_connection::SessionError> for Error {
    fn from(e: portway_connection::SessionError) -> Self {
        use portway_connection::SessionError;
        match e {
            SessionError::Remote(msg) => Error::Client(msg),
            SessionError::Closed => Error::Conflict("client is not connected".to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::Validation("x".into()).status(), 400);
        assert_eq!(Error::Auth("x".into()).status(), 401);
        assert_eq!(Error::NotFound("x".into()).status(), 404);
        assert_eq!(Error::Conflict("x".into()).status(), 409);
        assert_eq!(Error::Client("x".into()).status(), 409);
        assert_eq!(Error::Internal("x".into()).status(), 500);
    }
}
