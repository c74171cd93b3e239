//! Error types for QMI port operations.
//!
//! Every fallible operation in this crate returns [`Result<T>`]. Port state
//! violations (`WrongState`, `InProgress`, `Exists`, `Unsupported`) are kept
//! apart from firmware protocol errors and device/IPC failures, which are
//! passed through with a context prefix.
//!
//! Prefixed errors arrive as [`Error::Context`]; match on [`Error::root`]
//! to classify them. A firmware get/set failure during data format
//! negotiation, for instance, surfaces as `Context { Protocol { .. } }`.

use std::fmt;

use thiserror::Error;

// ── QMI protocol error codes ────────────────────────────────────────

/// A QMI protocol error code as reported in a response's result TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolError(pub u16);

impl ProtocolError {
    pub const MISSING_ARGUMENT: Self = Self(0x0011);
    pub const INVALID_ARGUMENT: Self = Self(0x0030);
    pub const INVALID_QMI_COMMAND: Self = Self(0x0047);
    pub const NOT_SUPPORTED: Self = Self(0x005E);

    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::MISSING_ARGUMENT => Some("missing-argument"),
            Self::INVALID_ARGUMENT => Some("invalid-argument"),
            Self::INVALID_QMI_COMMAND => Some("invalid-qmi-command"),
            Self::NOT_SUPPORTED => Some("not-supported"),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "0x{:04x}", self.0),
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Error {
    /// The port is closed when it must be open, or vice versa.
    #[error("wrong state: {0}")]
    WrongState(String),

    /// Another open/close operation is already running on this port.
    #[error("QMI device open/close operation in progress")]
    InProgress,

    /// A client for the same (service, flag) pair is already allocated.
    #[error("{0}")]
    Exists(String),

    /// Data format negotiation through the firmware is not available.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Generic operation failure (no combination left, malformed response).
    #[error("{0}")]
    Failed(String),

    /// The firmware rejected a request.
    #[error("QMI protocol error ({code}): {message}")]
    Protocol { code: ProtocolError, message: String },

    /// A single request did not complete within its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The device or its IPC channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration could not be parsed or validated.
    #[error("invalid config: {0}")]
    Config(String),

    /// An underlying error with a description of what was being attempted.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn protocol(code: ProtocolError, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Wrap this error with a prefix describing the failed step.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context layers peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the operation's cancellation token fired, at any depth.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// Whether the firmware reported a missing mandatory argument.
    pub fn is_missing_argument(&self) -> bool {
        matches!(
            self.root(),
            Error::Protocol {
                code: ProtocolError::MISSING_ARGUMENT,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
