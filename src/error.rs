//! # Error taxonomy
//!
//! A single error type covering every failure kind the core surfaces
//! (spec §7). Each variant's disposition (retried, fatal, surfaced
//! immediately, ...) is documented at its construction site rather than
//! here; this module only defines the shape.

use std::path::PathBuf;
use thiserror::Error;

use crate::oid::Oid;

/// Top-level error type for the whole crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt blob {oid}: {message}")]
    CorruptBlob { oid: Oid, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("conflicting writer detected: {0}")]
    Concurrent(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("blob store upload failed: {0}")]
    Store(Box<Error>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this kind is ever worth retrying at the object-store
    /// transport layer (spec §7: only transient `Io` subcodes are retried).
    pub fn is_transient_io(&self) -> bool {
        matches!(self, Error::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        ))
    }

    /// Fatal errors abort a save/restore outright rather than being
    /// recorded per-item and continued past (spec §7/§4.8/§4.9). A failure
    /// to write a required tree blob (`Error::Store`) is always fatal
    /// regardless of its underlying cause, since the save can no longer
    /// reference that blob at all; a plain filesystem `Io` error reading a
    /// source file is not, since that failure is scoped to one entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_)
                | Error::Config(_)
                | Error::Cancelled
                | Error::Concurrent(_)
                | Error::Store(_)
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn corrupt(oid: Oid, message: impl Into<String>) -> Self {
        Error::CorruptBlob {
            oid,
            message: message.into(),
        }
    }

    pub fn permission(path: impl Into<PathBuf>) -> Self {
        Error::Permission(path.into().display().to_string())
    }

    /// Maps this error to a CLI exit code: 1 for any fatal error, as per
    /// spec §6 (usage errors, handled separately by clap, map to 2).
    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, Error>;
