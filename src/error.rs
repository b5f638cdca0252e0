//! Error types for shared memory block management

use crate::{Handle, ShmFlags};

use thiserror::Error;

/// Result type alias using this crate's `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong when managing shared memory blocks
///
/// All of these are reported as values. Under correct API usage, none of
/// them is surfaced as a fault.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad size, alignment, name or flag combination (caller error)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry is full, or the backing arena cannot fit the request
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The platform does not provide the requested optional feature
    #[error("feature unavailable: {0:?}")]
    FeatureUnavailable(ShmFlags),

    /// Operation on a handle that does not name a live block
    #[error("unknown or stale block handle {0}")]
    UnknownHandle(Handle),

    /// The shared region itself could not be set up
    #[error("shared region initialization failed: {0}")]
    Fatal(#[source] std::io::Error),

    /// An operating system query failed after initialization
    #[error("system error: {0}")]
    Os(#[from] std::io::Error),
}

impl Error {
    /// Truth that this outcome is expected in normal operation
    ///
    /// Callers are expected to skip (feature missing) or retry with a smaller
    /// request (exhaustion) rather than treat these as test failures.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::FeatureUnavailable(_))
    }
}
