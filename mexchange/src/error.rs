//! Error taxonomy for the exchange layer.
//!
//! [`ExchangeError`] covers everything an operation hands back to its caller:
//! contention, routing and lost connections. [`FatalError`] covers transport
//! exhaustion and protocol violations, which never reach a caller and go to
//! the [`FatalHook`] instead.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::error;

use crate::{ack::AckError, protocol::WireError};

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Wire code for [`ExchangeError::AlreadyExists`].
pub const CODE_ALREADY_EXISTS: u8 = 1;
/// Wire code for [`ExchangeError::NotFound`].
pub const CODE_NOT_FOUND: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("ERR_ALREADY_EXISTS")]
    AlreadyExists,

    #[error("ERR_NOT_FOUND")]
    NotFound,

    /// The broker answered with a code this client does not know.
    #[error("unknown error (code {0})")]
    Unknown(u8),

    /// `replace_message_handler` was given a handler that is not the current one.
    #[error("handler mismatch")]
    HandlerMismatch,

    #[error("connection lost")]
    ConnectionLost,

    /// The encoded command would exceed the wire frame limit. Nothing was sent.
    #[error("frame of {0} bytes exceeds the wire limit")]
    FrameTooLarge(u64),
}

impl ExchangeError {
    /// Translates an ACK error byte into an error kind.
    pub fn from_code(code: u8) -> Self {
        match code {
            CODE_ALREADY_EXISTS => ExchangeError::AlreadyExists,
            CODE_NOT_FOUND => ExchangeError::NotFound,
            other => ExchangeError::Unknown(other),
        }
    }

    /// The byte carried by an ACK frame, for the kinds that travel on the wire.
    pub fn code(&self) -> Option<u8> {
        match self {
            ExchangeError::AlreadyExists => Some(CODE_ALREADY_EXISTS),
            ExchangeError::NotFound => Some(CODE_NOT_FOUND),
            ExchangeError::Unknown(code) => Some(*code),
            ExchangeError::HandlerMismatch
            | ExchangeError::ConnectionLost
            | ExchangeError::FrameTooLarge(_) => None,
        }
    }
}

/// Conditions that end the process.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("could not connect to broker at {addr} after {attempts} attempts: {last_error}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        last_error: String,
    },

    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),

    #[error("protocol violation: {0}")]
    Ack(#[from] AckError),
}

/// Callback run when a [`FatalError`] occurs.
///
/// The default logs the error and exits with status 1, leaving restarts to
/// an external supervisor. Tests install a hook that records the error.
#[derive(Clone)]
pub struct FatalHook(Arc<dyn Fn(&FatalError) + Send + Sync>);

impl FatalHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&FatalError) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    pub fn exit_process() -> Self {
        Self::new(|err| {
            error!(error = %err, "fatal exchange error, terminating process");
            std::process::exit(1);
        })
    }

    pub fn invoke(&self, err: &FatalError) {
        (self.0)(err)
    }
}

impl Default for FatalHook {
    fn default() -> Self {
        Self::exit_process()
    }
}

impl fmt::Debug for FatalHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FatalHook")
    }
}
