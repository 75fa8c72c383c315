//! Unified error type for the oxibridge core library.
//!
//! Each module keeps its own error enum ([`LinkError`], [`HandshakeError`],
//! [`DecodeError`], [`SinkError`], [`ConfigError`]). [`OxibridgeError`] folds
//! them into one type for callers that only need to report and classify a
//! failure, such as the daemon's startup path.
//!
//! Most of these never escape the session: link and decode failures are
//! handled by reconnecting. They surface here when the daemon sets up the
//! link, verifies the sink or loads configuration.
//!
//! # Example
//!
//! ```rust
//! use oxibridge_core::error::{OxibridgeError, Result};
//!
//! fn require_token(token: Option<&str>) -> Result<&str> {
//!     token.ok_or(OxibridgeError::MissingCredential)
//! }
//!
//! assert_eq!(require_token(None).unwrap_err().exit_code(), 1);
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::DecodeError;
use crate::link::{HandshakeError, LinkError};
use crate::sink::{SinkError, SinkErrorKind};

/// The unified error type for oxibridge operations.
#[derive(Debug, Error)]
pub enum OxibridgeError {
    // =========================================================================
    // LINK ERRORS
    // =========================================================================
    /// The local Bluetooth stack could not be used.
    #[error("Bluetooth unavailable: {0}. Check that bluetoothd is running and the adapter is powered.")]
    BluetoothUnavailable(String),

    /// Connecting to the oximeter failed.
    #[error("Could not connect to {address}: {message}")]
    ConnectFailed {
        /// Device address.
        address: String,
        /// What went wrong.
        message: String,
    },

    /// The peer dropped the link.
    #[error("Connection to the oximeter was lost")]
    TransportLost,

    /// A link operation did not finish in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Elapsed seconds.
        seconds: u64,
    },

    /// The device does not expose the expected GATT layout.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A notification could not be decoded.
    #[error("Malformed notification: {0}")]
    MalformedFrame(#[from] DecodeError),

    // =========================================================================
    // SINK ERRORS
    // =========================================================================
    /// The sink refused the request and retrying will not help.
    #[error("Sink rejected the request: {0}. Check the URL, token, org and bucket.")]
    SinkRejected(String),

    /// The sink could not be reached.
    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// A configuration source could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// No sink token is available.
    #[error("No sink token configured. Set INFLUXDB_TOKEN or INFLUXDB_TOKEN_FILE.")]
    MissingCredential,

    // =========================================================================
    // I/O ERRORS
    // =========================================================================
    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for oxibridge operations.
pub type Result<T> = std::result::Result<T, OxibridgeError>;

impl OxibridgeError {
    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_)
                | Self::ConfigParseError(_)
                | Self::ConfigValidationError(_)
                | Self::MissingCredential
        )
    }

    /// Process exit code for a startup failure.
    ///
    /// Configuration and credential problems exit with 1, everything else
    /// with 2.
    #[inline]
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_config_error() || matches!(self, Self::SinkRejected(_)) {
            1
        } else {
            2
        }
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothUnavailable(_) => "BLUETOOTH_UNAVAILABLE",
            Self::ConnectFailed { .. } => "CONNECT_FAILED",
            Self::TransportLost => "TRANSPORT_LOST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HandshakeFailed(_) => "HANDSHAKE_FAILED",
            Self::MalformedFrame(_) => "MALFORMED_FRAME",
            Self::SinkRejected(_) => "SINK_REJECTED",
            Self::SinkUnavailable(_) => "SINK_UNAVAILABLE",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<LinkError> for OxibridgeError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::InvalidAddress { address } => {
                Self::ConfigValidationError(format!("invalid Bluetooth address: {address}"))
            }
            LinkError::ConnectFailed { address, message } => {
                Self::ConnectFailed { address, message }
            }
            LinkError::Timeout { operation, after } => Self::Timeout {
                operation,
                seconds: after.as_secs(),
            },
            LinkError::TransportLost => Self::TransportLost,
            LinkError::NotArmed => Self::HandshakeFailed("link is not armed".to_string()),
            LinkError::Bluetooth(message) => Self::BluetoothUnavailable(message),
        }
    }
}

impl From<HandshakeError> for OxibridgeError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Link(inner) => inner.into(),
            other => Self::HandshakeFailed(other.to_string()),
        }
    }
}

impl From<SinkError> for OxibridgeError {
    fn from(err: SinkError) -> Self {
        match err.kind {
            SinkErrorKind::Retryable => Self::SinkUnavailable(err.message),
            SinkErrorKind::Fatal => Self::SinkRejected(err.message),
        }
    }
}

impl From<ConfigError> for OxibridgeError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Load(config::ConfigError::NotFound(what)) => {
                Self::ConfigNotFound(PathBuf::from(what))
            }
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::TokenFile { path, source } => Self::ConfigValidationError(format!(
                "failed to read token file {}: {source}",
                path.display()
            )),
            ConfigError::MissingCredential => Self::MissingCredential,
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}
