//! The container capability the attach runtime consumes.
//!
//! Lifecycle management lives elsewhere; the runtime only needs to
//! identify a container, signal its init process, and run exec/attach
//! sessions against it.

use std::future::Future;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use tether_common::detach::DetachKeys;
use tether_common::error::TetherError;
use tether_common::types::{ContainerId, TerminalSize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::streams::AttachStreams;

/// Stream of terminal geometry changes for the container's TTY.
pub type ResizeEvents = mpsc::Receiver<TerminalSize>;

/// Completion of an attach session, resolved when the container exits or
/// the user detaches.
pub type AttachDone = oneshot::Receiver<Result<(), ContainerError>>;

/// Errors reported by a [`Container`].
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container is not in a state that allows the operation,
    /// typically because it has already stopped.
    #[error("container {id} is in an invalid state: {reason}")]
    InvalidState {
        /// Container the operation targeted.
        id: ContainerId,
        /// Description of the conflicting state.
        reason: String,
    },

    /// The user typed the detach sequence.
    #[error("detached from container")]
    Detached,

    /// The operation was refused by the host.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Stream plumbing failed.
    #[error("container I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Any other runtime failure.
    #[error(transparent)]
    Runtime(#[from] TetherError),
}

impl ContainerError {
    /// Returns whether the error means the container is gone or stopped.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// Returns whether the error is a user-requested detach.
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        matches!(self, Self::Detached)
    }
}

/// Configuration for a command executed in a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Whether the command gets a TTY.
    pub tty: bool,
    /// Working directory inside the container.
    pub workdir: Option<PathBuf>,
    /// User to run as.
    pub user: Option<String>,
    /// Sequence that detaches from the session.
    pub detach_keys: DetachKeys,
}

/// A container the client can signal and attach to.
///
/// Implementors wrap whatever actually runs the container; the attach
/// runtime only borrows them.
pub trait Container: Send + Sync + 'static {
    /// Returns the container's identifier.
    fn id(&self) -> &ContainerId;

    /// Returns whether the container's init process owns a TTY.
    fn has_tty(&self) -> bool;

    /// Sends `signal` to the container's init process.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::InvalidState`] if the container is not
    /// running, or another error if delivery fails.
    fn kill(&self, signal: Signal) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Runs a command in the container and waits for it, returning its
    /// exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started or its streams
    /// fail.
    fn exec(
        &self,
        config: &ExecConfig,
        streams: AttachStreams,
        resize: Option<ResizeEvents>,
    ) -> impl Future<Output = Result<i32, ContainerError>> + Send;

    /// Attaches `streams` to the container, starting it first when
    /// `start` is set. Returns once attached; the receiver resolves when
    /// the session ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started or attached.
    fn attach(
        &self,
        streams: AttachStreams,
        detach_keys: &DetachKeys,
        resize: Option<ResizeEvents>,
        start: bool,
    ) -> impl Future<Output = Result<AttachDone, ContainerError>> + Send;
}
