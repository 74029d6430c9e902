//! Error types.
//!
//! Contention is never an error: the retry loops absorb it, and bounded loops report it through
//! [`CasResult::succeeded`](crate::cas::CasResult). An abandoned handshake round is a
//! [`Round`](crate::handshake::Round), not an error either.

use std::io;
use thiserror::Error;

/// The stack's backing arena has no vacant slot left.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("stack arena exhausted: all {capacity} entries are allocated")]
    Exhausted { capacity: usize },
}

/// A configuration value is out of range.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("stack capacity must be in 1..={max}, got {capacity}")]
    Capacity { capacity: usize, max: usize },
    #[error("stack chunk length must be in 1..={capacity} (the capacity), got {chunk_len}")]
    ChunkLen { chunk_len: usize, capacity: usize },
    #[error("signal offset {offset} is outside the {available} usable signals")]
    SignalOffset { offset: i32, available: i32 },
}

/// Failure to install or send the phase signal.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to install the handler for signal {signo}")]
    Install {
        signo:  i32,
        #[source]
        source: io::Error,
    },
    #[error("phase signal already installed as {installed}, requested {requested}")]
    Conflict { installed: i32, requested: i32 },
    #[error("failed to send signal {signo}")]
    Send {
        signo:  i32,
        #[source]
        source: io::Error,
    },
    #[error("asynchronous signal delivery is not supported on this platform")]
    Unsupported,
}

impl SignalError {
    /// Returns true if the signal could not be sent because the target thread no longer exists.
    pub fn thread_gone(&self) -> bool {
        match self {
            SignalError::Send { source, .. } => source.raw_os_error() == Some(libc::ESRCH),
            _ => false,
        }
    }
}

/// Any error produced while setting up or using a [`Handshake`](crate::handshake::Handshake).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),
    #[error("phase signal error")]
    Signal(#[from] SignalError),
    #[error("allocation failed")]
    Alloc(#[from] AllocError),
    #[error("the calling thread is already registered with a different handshake")]
    AlreadyRegistered,
}
