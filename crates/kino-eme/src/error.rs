//! Error types for Kino EME

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for key broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a native content protection runtime.
///
/// Mirrors the shape of a DOM exception: a name such as `NotSupportedError`,
/// a message, and for the legacy dialects the numeric key error codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct NativeError {
    pub name: String,
    pub message: String,
    pub code: Option<u32>,
    pub system_code: Option<u32>,
}

impl NativeError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            system_code: None,
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new("NotSupportedError", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }
}

/// Result of a native operation
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Key broker error types
///
/// Errors are `Clone` because a single provisioning failure rejects every
/// request queued behind the barrier.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid {scope} configuration: {message}")]
    Configuration { scope: String, message: String },

    #[error("No supported key system: {0}")]
    Negotiation(String),

    #[error("Key system provisioning failed: {message}")]
    Provisioning {
        message: String,
        cause: Option<Bytes>,
    },

    #[error("Unable to create or initialize key session: {0}")]
    SessionCreation(String),

    #[error("License request failed: {message}")]
    LicenseRequest {
        message: String,
        status: Option<u16>,
        cause: Option<Bytes>,
    },

    #[error("Unexpected key error from key session with code: {code} and systemCode: {system_code}")]
    KeySession { code: u32, system_code: u32 },

    #[error("Key session expired {renewals} times without a usable key")]
    RenewalLimit { renewals: u32 },

    #[error("Native content protection error: {0}")]
    Native(#[from] NativeError),

    #[error("Source context closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn configuration(scope: &str, message: impl Into<String>) -> Self {
        Error::Configuration {
            scope: scope.to_string(),
            message: message.into(),
        }
    }

    pub fn license(message: impl Into<String>) -> Self {
        Error::LicenseRequest {
            message: message.into(),
            status: None,
            cause: None,
        }
    }

    /// Wrap a failure from the provisioning sequence, keeping its cause payload.
    pub fn provisioning(err: impl Into<Error>) -> Self {
        match err.into() {
            err @ (Error::Provisioning { .. } | Error::Configuration { .. } | Error::Closed) => err,
            other => Error::Provisioning {
                message: other.to_string(),
                cause: other.cause().cloned(),
            },
        }
    }

    /// Response body attached to the failure, if any
    pub fn cause(&self) -> Option<&Bytes> {
        match self {
            Error::Provisioning { cause, .. } | Error::LicenseRequest { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    /// Returns true if the error is fatal for the current source
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. }
                | Error::Negotiation(_)
                | Error::Provisioning { .. }
                | Error::RenewalLimit { .. }
        )
    }

    /// Returns the error code for the host error sink
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Configuration { .. } => "EME_CONFIGURATION",
            Error::Negotiation(_) => "EME_NEGOTIATION",
            Error::Provisioning { .. } => "EME_PROVISIONING",
            Error::SessionCreation(_) => "EME_SESSION_CREATION",
            Error::LicenseRequest { .. } => "EME_LICENSE_REQUEST",
            Error::KeySession { .. } => "EME_KEY_SESSION",
            Error::RenewalLimit { .. } => "EME_RENEWAL_LIMIT",
            Error::Native(_) => "EME_NATIVE",
            Error::Closed => "EME_CLOSED",
            Error::Internal(_) => "EME_INTERNAL",
        }
    }

    /// Numeric code in the media error range reserved for encrypted media
    pub fn code(&self) -> u32 {
        match self {
            Error::Configuration { .. } => 5001,
            Error::Negotiation(_) => 5002,
            Error::Provisioning { .. } => 5003,
            Error::SessionCreation(_) => 5004,
            Error::LicenseRequest { .. } => 5005,
            Error::KeySession { .. } => 5006,
            Error::RenewalLimit { .. } => 5007,
            Error::Native(_) => 5008,
            Error::Closed => 5009,
            Error::Internal(_) => 5010,
        }
    }

    /// Normalized shape delivered to the host error sink
    pub fn report(&self) -> ErrorReport {
        let cause = self.cause().map(|c| String::from_utf8_lossy(c).into_owned());
        ErrorReport {
            code: self.code(),
            kind: self.error_code(),
            message: self.to_string(),
            cause_length: self.cause().map(|c| c.len()),
            cause,
        }
    }
}

/// Error as surfaced to the host, independent of the stage that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code: u32,
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_length: Option<usize>,
}
