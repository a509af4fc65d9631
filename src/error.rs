//! Error types for device communication and session control.
//!
//! All errors produced by this crate are structured values a calling
//! application can branch on, never bare strings. The taxonomy follows the
//! protocol layers:
//!
//! - **Transport errors**: the physical link failed (unplugged, busy, I/O)
//! - **Decode errors**: a malformed frame or payload
//! - **Reply timeouts**: no matching reply arrived within the window
//! - **Device nacks**: the device rejected a command with a firmware error code
//! - **Registry errors**: unknown parameter or payload length mismatch,
//!   indicating protocol version skew between host and firmware
//!
//! Use [`VelodromeError::is_retryable`] to decide whether an operation is
//! worth repeating:
//!
//! ```rust
//! use velodrome::VelodromeError;
//!
//! let err = VelodromeError::busy("/dev/ttyUSB0");
//! assert!(err.is_retryable());
//! ```

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for velodrome operations.
pub type Result<T, E = VelodromeError> = std::result::Result<T, E>;

/// Error code reported by the device in a nack reply.
///
/// The numeric values are fixed by the firmware's packet handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackCode {
    /// 0x00 — command code not recognized
    UnknownCmd,
    /// 0x01 — command syntax invalid
    InvalidCmdSyntax,
    /// 0x04 — parameter syntax invalid
    InvalidParamSyntax,
    /// 0x05 — value outside the parameter's allowed range
    RangeError,
    /// 0x06 — parameter identifier not known to the firmware
    ParamNotFound,
    /// 0x07 — validation of the written value failed
    ValidFail,
    /// 0x08 — parameter is not writable in the current device state
    AccessViolation,
    /// Any code outside the documented table
    Other(u8),
}

impl NackCode {
    /// Map a raw error byte from a nack payload to its symbolic code.
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => NackCode::UnknownCmd,
            0x01 => NackCode::InvalidCmdSyntax,
            0x04 => NackCode::InvalidParamSyntax,
            0x05 => NackCode::RangeError,
            0x06 => NackCode::ParamNotFound,
            0x07 => NackCode::ValidFail,
            0x08 => NackCode::AccessViolation,
            other => NackCode::Other(other),
        }
    }

    /// The raw byte the firmware uses for this code.
    pub const fn raw(self) -> u8 {
        match self {
            NackCode::UnknownCmd => 0x00,
            NackCode::InvalidCmdSyntax => 0x01,
            NackCode::InvalidParamSyntax => 0x04,
            NackCode::RangeError => 0x05,
            NackCode::ParamNotFound => 0x06,
            NackCode::ValidFail => 0x07,
            NackCode::AccessViolation => 0x08,
            NackCode::Other(raw) => raw,
        }
    }

    /// Symbolic name matching the firmware's error table.
    pub const fn name(self) -> &'static str {
        match self {
            NackCode::UnknownCmd => "PACKET_FAIL_UNKNOWNCMD",
            NackCode::InvalidCmdSyntax => "PACKET_FAIL_INVALIDCMDSYNTAX",
            NackCode::InvalidParamSyntax => "PACKET_FAIL_INVALIDPARAMSYNTAX",
            NackCode::RangeError => "PACKET_FAIL_RANGEERROR",
            NackCode::ParamNotFound => "PACKET_FAIL_PARAMNOTFOUND",
            NackCode::ValidFail => "PACKET_FAIL_VALIDFAIL",
            NackCode::AccessViolation => "PACKET_FAIL_ACCESSVIOLATION",
            NackCode::Other(_) => "PACKET_FAIL_UNDOCUMENTED",
        }
    }
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.raw())
    }
}

/// Main error type for device and session operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum VelodromeError {
    #[error("transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("device busy: {port}")]
    Busy { port: String },

    #[error("no device found")]
    NotFound,

    #[error("malformed frame in {context}: {details}")]
    Decode { context: &'static str, details: String },

    #[error("failed to encode frame: {details}")]
    Encode { details: String },

    #[error("no reply from device within {after:?}")]
    NoReply { after: Duration },

    #[error("device rejected command: {code}")]
    Nack { code: NackCode },

    #[error("unknown parameter {id:#04x}")]
    UnknownParameter { id: u8 },

    #[error("payload length mismatch for {name}: expected {expected} bytes, got {actual}")]
    PayloadLength { name: &'static str, expected: usize, actual: usize },

    #[error("session is {state} and cannot accept this operation")]
    NotReady { state: &'static str },

    #[error("configuration error in {context}: {details}")]
    Config {
        context: String,
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("log sink error: {details}")]
    Sink {
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl VelodromeError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Transient link conditions (busy port, missing device, reply timeout,
    /// transport failure) are retryable; protocol and configuration errors
    /// are not, since repeating the operation cannot change the outcome.
    /// Registry-level errors in particular indicate protocol version skew
    /// and must never be silently retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            VelodromeError::Transport { .. } => true,
            VelodromeError::Busy { .. } => true,
            VelodromeError::NotFound => true,
            VelodromeError::NoReply { .. } => true,
            VelodromeError::Decode { .. } => false,
            VelodromeError::Encode { .. } => false,
            VelodromeError::Nack { .. } => false,
            VelodromeError::UnknownParameter { .. } => false,
            VelodromeError::PayloadLength { .. } => false,
            VelodromeError::NotReady { .. } => false,
            VelodromeError::Config { .. } => false,
            VelodromeError::Sink { .. } => false,
        }
    }

    /// Helper constructor for transport failures.
    pub fn transport(reason: impl Into<String>) -> Self {
        VelodromeError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport failures with an underlying cause.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        VelodromeError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for "device in use" failures.
    pub fn busy(port: impl Into<String>) -> Self {
        VelodromeError::Busy { port: port.into() }
    }

    /// Helper constructor for frame decode failures.
    pub fn decode(context: &'static str, details: impl Into<String>) -> Self {
        VelodromeError::Decode { context, details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(context: impl Into<String>, details: impl Into<String>) -> Self {
        VelodromeError::Config { context: context.into(), details: details.into(), source: None }
    }
}

impl From<std::io::Error> for VelodromeError {
    fn from(err: std::io::Error) -> Self {
        VelodromeError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<serde_yaml_ng::Error> for VelodromeError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        VelodromeError::Config {
            context: "level yaml".to_string(),
            details: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_code_roundtrip() {
        for raw in [0x00u8, 0x01, 0x04, 0x05, 0x06, 0x07, 0x08, 0x42] {
            assert_eq!(NackCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn nack_code_names_match_firmware_table() {
        assert_eq!(NackCode::from_raw(0x06).name(), "PACKET_FAIL_PARAMNOTFOUND");
        assert_eq!(NackCode::from_raw(0x08).name(), "PACKET_FAIL_ACCESSVIOLATION");
        assert_eq!(NackCode::from_raw(0x33), NackCode::Other(0x33));
    }

    #[test]
    fn retryable_classification() {
        assert!(VelodromeError::busy("/dev/ttyUSB0").is_retryable());
        assert!(VelodromeError::NotFound.is_retryable());
        assert!(VelodromeError::NoReply { after: Duration::from_millis(250) }.is_retryable());
        assert!(!VelodromeError::UnknownParameter { id: 0x99 }.is_retryable());
        assert!(
            !VelodromeError::PayloadLength { name: "ENCVEL", expected: 5, actual: 4 }
                .is_retryable()
        );
        assert!(!VelodromeError::Nack { code: NackCode::RangeError }.is_retryable());
    }

    #[test]
    fn io_error_converts_to_transport() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: VelodromeError = io_err.into();
        assert!(matches!(err, VelodromeError::Transport { .. }));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn error_traits() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<VelodromeError>();
    }
}
