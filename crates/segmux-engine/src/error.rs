use reqwest::StatusCode;
use std::fmt;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a manifest, probe or segment request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network(String),
    Timeout,
    HttpStatus(StatusCode),
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(reason) => write!(f, "network error: {reason}"),
            Self::Timeout => f.write_str("request timed out"),
            Self::HttpStatus(status) => write!(f, "HTTP {status}"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to fetch {url}: {kind}")]
pub struct FetchError {
    pub url: String,
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub fn new(url: impl Into<String>, kind: FetchErrorKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }

    pub fn http_status(url: impl Into<String>, status: StatusCode) -> Self {
        Self::new(url, FetchErrorKind::HttpStatus(status))
    }

    /// Classify a transport error from reqwest.
    pub fn from_reqwest(url: impl Into<String>, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if let Some(status) = err.status() {
            FetchErrorKind::HttpStatus(status)
        } else {
            FetchErrorKind::Network(err.to_string())
        };
        Self::new(url, kind)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("playlist {url} contains no segments")]
    EmptyPlaylist { url: String },

    #[error("remux failed: {details}")]
    Remux { details: String },

    #[error("artifact `{job_id}` is not ready")]
    NotReady { job_id: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    pub fn empty_playlist(url: impl Into<String>) -> Self {
        Self::EmptyPlaylist { url: url.into() }
    }

    pub fn remux(details: impl Into<String>) -> Self {
        Self::Remux {
            details: details.into(),
        }
    }

    pub fn not_ready(job_id: impl fmt::Display) -> Self {
        Self::NotReady {
            job_id: job_id.to_string(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Short machine-readable code, used by event streams and the HTTP layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FETCH_ERROR",
            Self::EmptyPlaylist { .. } => "EMPTY_PLAYLIST",
            Self::Remux { .. } => "REMUX_ERROR",
            Self::NotReady { .. } => "NOT_READY",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::Io { .. } => "IO_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_message_names_url_and_cause() {
        let err = FetchError::http_status("https://cdn.test/a.ts", StatusCode::NOT_FOUND);
        assert_eq!(
            err.to_string(),
            "failed to fetch https://cdn.test/a.ts: HTTP 404 Not Found"
        );

        let err: Error = err.into();
        assert_eq!(err.code(), "FETCH_ERROR");
    }

    #[test]
    fn not_ready_carries_job_id() {
        let err = Error::not_ready("abc");
        assert!(matches!(&err, Error::NotReady { job_id } if job_id == "abc"));
        assert_eq!(err.code(), "NOT_READY");
    }
}
