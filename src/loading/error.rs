use thiserror::Error;

use crate::cache::CacheError;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Asset {path} does not exist")]
    NotFound { path: String },

    #[error("Reading {path} failed")]
    ReadError { path: String, source: std::io::Error },

    /// The payload could be read, but it is violating the expected format.
    #[error("Asset {identity} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
}

#[derive(Error, Debug)]
pub enum LoadError {
    /// The payload was unreadable or corrupt. Recoverable: the object is marked errored and the
    /// loader continues with other work.
    #[error("Decoding {identity} failed")]
    Decode {
        identity: String,
        #[source]
        source: DecodeError,
    },

    #[error("{parent} could not reference {child}")]
    ChildDependency {
        parent: String,
        child: String,
        #[source]
        source: CacheError,
    },

    #[error("Objects required for saving failed to load: {}", identities.join(", "))]
    CriticalAssetMissing { identities: Vec<String> },

    /// Anything unexpected at the worker boundary, converted instead of killing the worker.
    #[error("Loading {identity} panicked: {message}")]
    Panicked { identity: String, message: String },

    #[error("Waiting for {identity} on a loader thread would deadlock the pool")]
    WouldDeadlock { identity: String },
}

impl LoadError {
    pub fn decode(identity: impl Into<String>, source: DecodeError) -> Self {
        LoadError::Decode {
            identity: identity.into(),
            source,
        }
    }
}
