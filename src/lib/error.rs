//! # Error Taxonomy
//!
//! Failures surfaced by the streaming layer. Transport exhaustion that can be
//! absorbed by backpressure never reaches this type; only allocations that
//! genuinely cannot be satisfied do. "Not yet" outcomes of waits are not
//! errors either, they are reported through [`Status`].

use std::os::fd::OwnedFd;

use thiserror::Error;

/// Errors returned by the driver-side streaming and synchronization code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("initialization failed: {0}")]
    InitializationFailed(String),
    #[error("requested API version is not supported by this driver")]
    IncompatibleDriver,
    #[error("too many objects")]
    TooManyObjects,
    #[error("invalid external handle")]
    InvalidExternalHandle,
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("shared memory error: {0}")]
    Shm(String),
    #[error("malformed command stream: {0}")]
    MalformedStream(String),
}

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Non-error completion status of a query or a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The object is signaled / the condition holds.
    Success,
    /// A zero-timeout poll found the condition unsatisfied.
    NotReady,
    /// A bounded wait expired before the condition held.
    Timeout,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Failed descriptor import. Ownership of the descriptor is handed back.
#[derive(Error, Debug)]
#[error("failed to import external handle: {error}")]
pub struct ImportFdError {
    #[source]
    pub error: Error,
    pub fd: Option<OwnedFd>,
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        match err {
            nix::Error::ENOMEM => Error::OutOfHostMemory,
            nix::Error::EMFILE | nix::Error::ENFILE => Error::TooManyObjects,
            other => Error::Shm(other.to_string()),
        }
    }
}
