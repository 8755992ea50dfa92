//! Error types shared by the engine, the hub and the server harness.

use std::{io, os::fd::RawFd};

use thiserror::Error;

/// Failures reported by the native event loop and its handles.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The handle was closed; it can no longer be started, stopped or re-referenced.
    #[error("handle is closed")]
    HandleClosed,
    /// The loop that owned the handle no longer exists.
    #[error("event loop has been dropped")]
    LoopDropped,
    /// `run` was called from inside one of the loop's own callbacks.
    #[error("event loop is already running")]
    Reentrant,
    /// Another poll handle already watches this fd for the requested interest.
    #[error("fd {fd} is already watched for this interest by another poll handle")]
    FdBusy { fd: RawFd },
    /// A loop supports a single async wake-up handle.
    #[error("an async handle already exists on this loop")]
    AsyncInUse,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sys(#[from] nix::Error),
}

/// Failures reported by the [`Hub`](crate::hub::Hub).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("the hub's runloop is already running")]
    AlreadyRunning,
    /// The listener was already torn down; its native handle is gone.
    #[error("listener was already removed")]
    ListenerRemoved,
    /// An interrupt (SIGINT) aborted the loop while a fiber was waiting on it.
    #[error("interrupted")]
    Interrupted,
    /// The loop returned before the driven future completed.
    #[error("hub loop was aborted before the future completed")]
    Aborted,
    /// Nothing left in the loop could ever wake the driven future.
    #[error("hub loop went idle before the future completed")]
    Deadlock,
    /// The driven future panicked; the panic was squelched by the hub.
    #[error("future panicked")]
    Panicked,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<HubError> for io::Error {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Engine(EngineError::Io(err)) => err,
            HubError::Interrupted => io::Error::new(io::ErrorKind::Interrupted, err),
            other => io::Error::other(other),
        }
    }
}

/// Failures that end [`Server::start`](crate::server::Server::start).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Hub(#[from] HubError),
}
