//! Forwarding host signals to an attached container.
//!
//! While a container is attached to the user's terminal, signals aimed at
//! the client are meant for the container. [`SignalProxy::attach`] takes
//! signal interception over from the [`ShutdownCoordinator`] and forwards
//! every delivery to the container's init process. Once the container is
//! gone the proxy lets go of the signals and re-raises the one it could
//! not deliver, so the client reacts the way it would have without a
//! proxy.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::Signal;
use tether_common::constants::SIGNAL_BUFFER_SIZE;
use tether_common::error::TetherError;
use tether_common::types::ContainerId;
use tether_core::signal::{SignalSource, Subscription, catchable_signals};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::container::Container;
use crate::shutdown::ShutdownCoordinator;

/// Signals that are never forwarded.
///
/// They concern the client process itself; they are also left
/// unregistered so their dispositions stay untouched.
pub const IGNORED_SIGNALS: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGPIPE, Signal::SIGURG];

/// Errors raised when setting up a proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The signals to forward could not be subscribed to.
    #[error("cannot intercept signals for proxying: {0}")]
    Subscribe(#[source] TetherError),
}

/// Why a proxy session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyExit {
    /// The owner stopped the session.
    Stopped,
    /// The container was no longer running; `signal` was re-raised
    /// against the current process.
    TargetGone {
        /// The signal that could not be delivered.
        signal: Signal,
    },
    /// The signal source went away.
    SourceClosed,
}

/// Creates signal-forwarding sessions.
pub struct SignalProxy {
    signals: Arc<dyn SignalSource>,
    shutdown: Arc<ShutdownCoordinator>,
    buffer: usize,
}

impl SignalProxy {
    /// Creates a proxy that suspends `shutdown` while forwarding.
    #[must_use]
    pub fn new(signals: Arc<dyn SignalSource>, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self {
            signals,
            shutdown,
            buffer: SIGNAL_BUFFER_SIZE,
        }
    }

    /// Sets how many undelivered signals may queue up. Values below
    /// [`SIGNAL_BUFFER_SIZE`] are raised to it.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(SIGNAL_BUFFER_SIZE);
        self
    }

    /// Returns the configured queue capacity.
    #[must_use]
    pub const fn buffer(&self) -> usize {
        self.buffer
    }

    /// Starts forwarding signals to `container`.
    ///
    /// The shutdown coordinator is stopped first so that `SIGINT` and
    /// `SIGTERM` reach the container instead of triggering client cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Subscribe`] if the signals cannot be
    /// intercepted.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub async fn attach<C: Container>(&self, container: Arc<C>) -> Result<ProxySession, ProxyError> {
        if let Err(e) = self.shutdown.stop().await {
            tracing::debug!(error = %e, "shutdown coordinator was not running");
        }

        let forwarded: Vec<Signal> = catchable_signals()
            .into_iter()
            .filter(|signal| !IGNORED_SIGNALS.contains(signal))
            .collect();
        let subscription = self
            .signals
            .subscribe(&forwarded, self.buffer)
            .map_err(ProxyError::Subscribe)?;

        let id = container.id().clone();
        let active = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(
            container,
            Arc::clone(&self.signals),
            subscription,
            cancel.clone(),
            Arc::clone(&active),
        ));
        tracing::info!(id = %id, signals = forwarded.len(), "proxying signals to container");
        Ok(ProxySession {
            id,
            active,
            cancel,
            task: Some(task),
        })
    }
}

impl fmt::Debug for SignalProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalProxy")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// A running signal-forwarding session.
///
/// Dropping the handle stops forwarding without waiting for the task.
#[derive(Debug)]
pub struct ProxySession {
    id: ContainerId,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<ProxyExit>>,
}

impl ProxySession {
    /// Returns the container signals are forwarded to.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Returns whether signals are still being forwarded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops forwarding and waits until the signals are released.
    pub async fn stop(mut self) -> ProxyExit {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the session to end on its own, which happens once the
    /// container is gone.
    pub async fn join(mut self) -> ProxyExit {
        self.wait().await
    }

    async fn wait(&mut self) -> ProxyExit {
        let Some(task) = self.task.take() else {
            return ProxyExit::Stopped;
        };
        match task.await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "signal proxy task ended abnormally");
                self.active.store(false, Ordering::SeqCst);
                ProxyExit::Stopped
            }
        }
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward<C: Container>(
    container: Arc<C>,
    signals: Arc<dyn SignalSource>,
    mut subscription: Subscription,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
) -> ProxyExit {
    let id = container.id();
    let exit = loop {
        let signal = tokio::select! {
            biased;
            () = cancel.cancelled() => break ProxyExit::Stopped,
            received = subscription.recv() => match received {
                Some(signal) => signal,
                None => break ProxyExit::SourceClosed,
            },
        };
        if IGNORED_SIGNALS.contains(&signal) {
            continue;
        }
        match container.kill(signal).await {
            Ok(()) => tracing::debug!(id = %id, %signal, "forwarded signal"),
            Err(e) if e.is_invalid_state() => {
                tracing::info!(id = %id, %signal, "container is not running, re-raising signal");
                break ProxyExit::TargetGone { signal };
            }
            Err(e) => tracing::error!(id = %id, %signal, error = %e, "failed to forward signal"),
        }
    };

    active.store(false, Ordering::SeqCst);
    subscription.unsubscribe();
    if let ProxyExit::TargetGone { signal } = exit {
        if let Err(e) = signals.raise(signal) {
            tracing::error!(%signal, error = %e, "failed to re-raise signal");
        }
    }
    tracing::debug!(id = %id, ?exit, "signal proxy finished");
    exit
}
