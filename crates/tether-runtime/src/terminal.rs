//! Interactive terminal sessions.
//!
//! A [`TerminalSession`] puts the local terminal in raw mode for the
//! duration of an attach and streams its geometry to the container. The
//! captured mode is restored exactly once, either explicitly through
//! [`TerminalSession::restore`] or when the session is dropped, so an
//! attach that errors, panics or is cancelled still hands the user back a
//! cooked terminal.

use std::fmt;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tether_common::constants::RESIZE_BUFFER;
use tether_common::error::TetherError;
use tether_common::types::TerminalSize;
use tether_core::signal::{SignalSource, Subscription};
use tether_core::terminal::TerminalDevice;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::ResizeEvents;

/// Pending `SIGWINCH` deliveries kept before the dispatcher starts
/// dropping them. Bursts collapse into one size read anyway.
const WINCH_BUFFER: usize = 16;

/// Errors raised while entering or leaving a terminal session.
#[derive(Debug, Error)]
pub enum TerminalError {
    /// `SIGWINCH` could not be subscribed to.
    #[error("cannot watch terminal resizes: {0}")]
    Resize(#[source] TetherError),

    /// The terminal mode could not be captured.
    #[error("cannot save terminal state: {0}")]
    SaveState(#[source] TetherError),

    /// The terminal could not be switched to raw mode.
    #[error("cannot switch terminal to raw mode: {0}")]
    RawMode(#[source] TetherError),

    /// The captured mode could not be put back.
    #[error("cannot restore terminal state: {0}")]
    Restore(#[source] TetherError),
}

/// A terminal held in raw mode with a background resize watcher.
pub struct TerminalSession<T: TerminalDevice> {
    device: Arc<T>,
    saved: Option<T::State>,
    resize: Option<ResizeEvents>,
    cancel: CancellationToken,
}

impl<T: TerminalDevice> TerminalSession<T> {
    /// Starts the resize watcher, captures the terminal mode, and switches
    /// the terminal to raw mode.
    ///
    /// Call this only once `device` is known to be an interactive
    /// terminal. The first resize event carries the current size.
    ///
    /// # Errors
    ///
    /// - [`TerminalError::Resize`] if `SIGWINCH` cannot be subscribed to.
    /// - [`TerminalError::SaveState`] if the mode cannot be captured; the
    ///   terminal is left untouched.
    /// - [`TerminalError::RawMode`] if raw mode cannot be entered; no
    ///   state is kept for restoration.
    ///
    /// In every error case the resize watcher has been cancelled.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn begin(device: Arc<T>, signals: &dyn SignalSource) -> Result<Self, TerminalError> {
        let winch = signals
            .subscribe(&[Signal::SIGWINCH], WINCH_BUFFER)
            .map_err(TerminalError::Resize)?;
        let (events, resize) = mpsc::channel(RESIZE_BUFFER);
        let cancel = CancellationToken::new();
        let _ = tokio::spawn(watch_resize(
            Arc::clone(&device),
            winch,
            events,
            cancel.clone(),
        ));

        let mut session = Self {
            device,
            saved: None,
            resize: Some(resize),
            cancel,
        };
        session.saved = Some(session.device.save_state().map_err(TerminalError::SaveState)?);
        if let Err(e) = session.device.set_raw() {
            session.saved = None;
            return Err(TerminalError::RawMode(e));
        }
        tracing::debug!("terminal session started");
        Ok(session)
    }

    /// Takes the resize event stream. Returns `None` after the first call.
    pub const fn take_resize(&mut self) -> Option<ResizeEvents> {
        self.resize.take()
    }

    /// Returns whether a captured mode is still waiting to be restored.
    pub const fn is_raw(&self) -> bool {
        self.saved.is_some()
    }

    /// Stops the resize watcher. The event stream closes shortly after.
    pub fn cancel_resize(&self) {
        self.cancel.cancel();
    }

    /// Restores the captured terminal mode. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns [`TerminalError::Restore`] if the mode cannot be applied;
    /// the state is not retried.
    pub fn restore(&mut self) -> Result<(), TerminalError> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        self.device.restore(&saved).map_err(TerminalError::Restore)?;
        tracing::debug!("terminal session restored");
        Ok(())
    }
}

impl<T: TerminalDevice> Drop for TerminalSession<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Err(e) = self.restore() {
            tracing::warn!(error = %e, "terminal left in raw mode");
        }
    }
}

impl<T: TerminalDevice> fmt::Debug for TerminalSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("raw", &self.is_raw())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn watch_resize<T: TerminalDevice>(
    device: Arc<T>,
    mut winch: Subscription,
    events: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
) {
    'watch: loop {
        match device.size() {
            Ok(size) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break 'watch,
                    sent = events.send(size) => {
                        if sent.is_err() {
                            break 'watch;
                        }
                        tracing::trace!(%size, "terminal resized");
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "cannot read terminal size, skipping"),
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => break 'watch,
            received = winch.recv() => {
                if received.is_none() {
                    break 'watch;
                }
            }
        }
    }
    winch.unsubscribe();
}
