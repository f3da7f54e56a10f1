use std::{io, sync::Arc};
use thiserror::Error;

/// Errors shared by the transport, the token manager and the API client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    AuthMissing(String),
    #[error("Baidu API error ({errno}): {message}")]
    Remote { errno: i64, message: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP error: {status} {body}")]
    Http { status: u16, body: String },
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Token refresh rejected: {0}")]
    Refresh(String),
    #[error("Token refresh failed: {0}")]
    RefreshFailed(Arc<Error>),
    #[error("Credential store error: {0}")]
    Credential(String),
    #[error("Reqwest error: {0:?}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("Serde JSON error: {0}. Response: {1}")]
    SerdeJSONError(#[source] serde_json::Error, String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl Error {
    pub fn remote(errno: i64, errmsg: Option<String>) -> Self {
        let message = describe_errno(errno)
            .map(str::to_owned)
            .or(errmsg)
            .unwrap_or_else(|| format!("Unknown error: {errno}"));
        Error::Remote { errno, message }
    }

    pub fn auth_missing() -> Self {
        Error::AuthMissing(
            "Access token not found. Please authorize first or set BAIDU_ACCESS_TOKEN".to_owned(),
        )
    }

    /// The application error code, if the server answered with one.
    pub fn errno(&self) -> Option<i64> {
        match self {
            Error::Remote { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Network failures and throttled or failing servers are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Http { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Messages for the error codes the client knows about.
pub fn describe_errno(errno: i64) -> Option<&'static str> {
    let message = match errno {
        0 => "Success",
        -6 => "Invalid access token",
        -7 => "Access denied",
        -9 => "File not found",
        2 => "Parameter error",
        111 => "Access token expired",
        31034 => "Request too frequent",
        _ => return None,
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_errno_uses_table_message() {
        let err = Error::remote(111, Some("ignored".to_owned()));
        assert_eq!(err.to_string(), "Baidu API error (111): Access token expired");
        assert_eq!(err.errno(), Some(111));
    }

    #[test]
    fn unknown_errno_falls_back_to_server_message() {
        let err = Error::remote(31061, Some("file already exists".to_owned()));
        assert_eq!(err.to_string(), "Baidu API error (31061): file already exists");

        let err = Error::remote(42, None);
        assert_eq!(err.to_string(), "Baidu API error (42): Unknown error: 42");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Http { status: 429, body: String::new() }.is_transient());
        assert!(Error::Http { status: 503, body: String::new() }.is_transient());
        assert!(!Error::Http { status: 404, body: String::new() }.is_transient());
        assert!(!Error::remote(-6, None).is_transient());
        assert!(!Error::Protocol("missing uploadid".into()).is_transient());
    }
}
