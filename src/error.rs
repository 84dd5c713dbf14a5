use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ufc::VariationType;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching configuration or evaluating flags.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No configuration snapshot has been published yet.
    #[error("configuration has not been fetched yet")]
    ConfigurationUnavailable,

    /// The server rejected the API key. This is not recoverable.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// The server asked us to slow down (429 Too Many Requests or 408 Request Timeout).
    #[error("configuration request was throttled (status {status})")]
    RateLimited {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// Any other non-successful HTTP status.
    #[error("unexpected status while fetching configuration (status {status})")]
    UnexpectedStatus {
        /// HTTP status code returned by the server.
        status: u16,
    },

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Server returned a configuration that cannot be decoded.
    #[error("malformed configuration: {0}")]
    MalformedConfiguration(Arc<serde_json::Error>),

    /// Error evaluating a flag or a bandit.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// The poller thread exited before it managed to fetch any configuration.
    #[error("poller thread was stopped before configuration was fetched")]
    PollerThreadStopped,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl Error {
    /// Returns `true` if the poller should keep the previous configuration and try again later.
    /// Any other error stops the poller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::UnexpectedStatus { .. }
                | Error::Network(_)
                | Error::MalformedConfiguration(_)
                | Error::Io(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::MalformedConfiguration(Arc::new(value))
    }
}

/// Errors produced while evaluating a single flag or bandit.
///
/// In graceful mode these are logged and replaced with the caller-supplied default. In strict mode
/// they are returned to the caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The requested flag does not exist in the configuration.
    #[error("flag not found")]
    FlagNotFound,

    /// The flag exists but its configuration could not be decoded.
    #[error("error parsing flag configuration, try upgrading the SDK")]
    ConfigurationParseError,

    /// Requested flag has a different type than expected.
    #[error("invalid flag type (expected: {expected:?}, found: {found:?})")]
    TypeMismatch {
        /// Expected type of the flag.
        expected: VariationType,
        /// Actual type of the flag.
        found: VariationType,
    },

    /// A split points to a variation that is missing from the flag.
    #[error("variation {variation_key:?} referenced by a split does not exist")]
    VariationNotFound {
        /// Dangling variation key.
        variation_key: String,
    },

    /// Variation value cannot be represented under the flag's variation type.
    #[error("variation {variation_key:?} has a value that does not match the flag type")]
    InvalidVariationValue {
        /// Offending variation key.
        variation_key: String,
    },

    /// A numeric targeting operator was applied to a non-numeric value.
    #[error("attribute {attribute:?} cannot be compared numerically")]
    NonNumericOperand {
        /// Attribute the condition was testing.
        attribute: String,
    },

    /// A regex targeting operator has an invalid pattern.
    #[error("invalid regex pattern {pattern:?}")]
    InvalidRegex {
        /// The pattern that failed to compile.
        pattern: String,
    },

    /// The bandit configuration names a model that this SDK cannot evaluate.
    #[error("unknown bandit model {model_name:?}")]
    UnknownBanditModel {
        /// Model identifier found in the bandit parameters.
        model_name: String,
    },

    /// A flag variation is bandit-controlled but the bandit parameters are not loaded.
    #[error("bandit {bandit_key:?} is referenced but its parameters are missing")]
    BanditNotFound {
        /// Bandit key from the bandit reference.
        bandit_key: String,
    },

    /// Bandit evaluation was requested with an empty action set.
    #[error("no actions supplied for bandit evaluation")]
    NoActionsSupplied,
}

#[cfg(test)]
mod tests {
    use super::{Error, EvaluationError};

    #[test]
    fn classifies_transient_errors() {
        assert!(Error::RateLimited { status: 429 }.is_transient());
        assert!(Error::UnexpectedStatus { status: 503 }.is_transient());
        assert!(Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_transient());
        assert!(Error::from(serde_json::from_str::<u32>("{").unwrap_err()).is_transient());

        assert!(!Error::Unauthorized.is_transient());
        assert!(!Error::InvalidBaseUrl(url::ParseError::EmptyHost).is_transient());
        assert!(!Error::PollerThreadStopped.is_transient());
        assert!(!Error::from(EvaluationError::FlagNotFound).is_transient());
    }
}
