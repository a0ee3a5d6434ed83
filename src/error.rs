//! Wire-visible error kinds.
//!
//! Every lookup/schema/metadata reply that fails carries one of these
//! along with the `request_id` that originated it (spec §7).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolError,
    AuthenticationError,
    AuthorizationError,
    TooManyRequests,
    ServiceNotReady,
    MetadataError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::AuthenticationError => "AuthenticationError",
            ErrorKind::AuthorizationError => "AuthorizationError",
            ErrorKind::TooManyRequests => "TooManyRequests",
            ErrorKind::ServiceNotReady => "ServiceNotReady",
            ErrorKind::MetadataError => "MetadataError",
            ErrorKind::UnknownError => "UnknownError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply-bearing error: kind plus the request-id it should be attached to
/// (a bare `ProxyError` is used for connection-fatal conditions where the
/// connection is simply closed, with no request-id to correlate against).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{kind}: {message}")]
    Reply {
        kind: ErrorKind,
        request_id: Option<u64>,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn reply(kind: ErrorKind, request_id: Option<u64>, message: impl Into<String>) -> Self {
        ProxyError::Reply {
            kind,
            request_id,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::reply(ErrorKind::ProtocolError, None, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Reply { kind, .. } => *kind,
            ProxyError::Io(_) => ErrorKind::UnknownError,
            ProxyError::Other(_) => ErrorKind::UnknownError,
        }
    }
}
