//! Error taxonomy shared across the suite.
//!
//! Each variant maps to one failure policy: configuration-time errors abort
//! the suite before any test runs, setup and runtime errors mark a single
//! test and let the suite continue, optional-modification errors are logged
//! and absorbed at the packet level.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration: bad JSON, unknown field, type mismatch.
    #[error("config: {0}")]
    Config(String),

    /// A modification name that no registry entry answers to.
    #[error("unknown modification '{0}'")]
    UnknownModification(String),

    /// Bad shape or value in a modification's options.
    #[error("bad arguments for '{mod_name}': {reason}")]
    Argument { mod_name: String, reason: String },

    /// A registry entry that cannot be used (duplicate or misnamed).
    /// Does not affect the other entries.
    #[error("modification '{name}' failed to load: {reason}")]
    ModificationLoad { name: String, reason: String },

    /// Rule installation, queue open, or process spawn failure.
    #[error("setup: {0}")]
    Setup(String),

    /// A modification raised while transforming packets.
    #[error("modification '{mod_name}' failed: {reason}")]
    ModificationRuntime { mod_name: String, reason: String },

    /// The user command exited non-zero.
    #[error("command exited with status {0}")]
    Command(i32),

    /// The suite was interrupted from outside.
    #[error("cancelled")]
    Cancelled,

    /// A broken internal invariant; not recoverable.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn argument(mod_name: &str, reason: impl Into<String>) -> Self {
        Error::Argument {
            mod_name: mod_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn setup(msg: impl Into<String>) -> Self {
        Error::Setup(msg.into())
    }

    pub fn runtime(mod_name: &str, reason: impl Into<String>) -> Self {
        Error::ModificationRuntime {
            mod_name: mod_name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
