//! Shutdown-signal coordination.
//!
//! The process owns one [`ShutdownCoordinator`]. Once started it intercepts
//! `SIGINT` and `SIGTERM`; the first delivery runs every registered
//! handler exactly once and then hands the signals back to their default
//! dispositions.
//!
//! Short critical sections (writing state to disk, for instance) hold an
//! [`InhibitGuard`] so that a shutdown cannot tear them down mid-way: the
//! handlers run under the write side of a fair reader/writer lock and wait
//! for every outstanding inhibit to be released. Because the lock is fair,
//! an inhibit requested after the shutdown started waiting queues behind
//! it instead of starving it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::signal::Signal;
use tether_common::constants::SHUTDOWN_SIGNAL_BUFFER;
use tether_common::error::TetherError;
use tether_core::signal::{SHUTDOWN_SIGNALS, SignalSource, Subscription};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of a shutdown handler.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn() -> HandlerResult + Send + Sync>;

/// Errors returned by the [`ShutdownCoordinator`] API.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// `stop` was called before `start`.
    #[error("shutdown signal handling has not been started")]
    NotStarted,

    /// A handler with this name already exists.
    #[error("shutdown handler {name:?} is already registered")]
    DuplicateHandler {
        /// Name that was registered twice.
        name: String,
    },

    /// No handler with this name exists.
    #[error("shutdown handler {name:?} is not registered")]
    HandlerNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// The shutdown signals could not be intercepted.
    #[error("cannot intercept shutdown signals: {0}")]
    Signal(#[from] TetherError),
}

/// Observable lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Never started.
    Idle,
    /// Intercepting shutdown signals.
    Running,
    /// Stopped explicitly, or after running the handlers.
    Stopped,
}

enum Phase {
    Idle,
    Running {
        generation: u64,
        stop: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    generation: u64,
}

struct Shared {
    handlers: Mutex<Vec<(String, Handler)>>,
    inhibit: Arc<RwLock<()>>,
    lifecycle: Mutex<Lifecycle>,
    triggered: Mutex<Option<Signal>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs named cleanup handlers when the process is asked to terminate.
pub struct ShutdownCoordinator {
    signals: Arc<dyn SignalSource>,
    shared: Arc<Shared>,
}

impl ShutdownCoordinator {
    /// Creates an idle coordinator reading signals from `signals`.
    #[must_use]
    pub fn new(signals: Arc<dyn SignalSource>) -> Self {
        Self {
            signals,
            shared: Arc::new(Shared {
                handlers: Mutex::new(Vec::new()),
                inhibit: Arc::new(RwLock::new(())),
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Idle,
                    generation: 0,
                }),
                triggered: Mutex::new(None),
            }),
        }
    }

    /// Starts intercepting shutdown signals. Does nothing if already
    /// running; re-arms interception after a previous stop or run.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::Signal`] if the signals cannot be
    /// subscribed to.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(&self) -> Result<(), ShutdownError> {
        let mut lifecycle = lock(&self.shared.lifecycle);
        if matches!(lifecycle.phase, Phase::Running { .. }) {
            return Ok(());
        }
        let subscription = self
            .signals
            .subscribe(&SHUTDOWN_SIGNALS, SHUTDOWN_SIGNAL_BUFFER)?;
        *lock(&self.shared.triggered) = None;
        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let stop = CancellationToken::new();
        let task = tokio::spawn(watch(
            Arc::clone(&self.shared),
            subscription,
            stop.clone(),
            generation,
        ));
        lifecycle.phase = Phase::Running {
            generation,
            stop,
            task,
        };
        tracing::debug!(generation, "shutdown signal handling started");
        Ok(())
    }

    /// Stops intercepting shutdown signals and waits until the signals
    /// have been released. Succeeds without effect if already stopped.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::NotStarted`] if `start` was never called.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        let (stop, task) = {
            let mut lifecycle = lock(&self.shared.lifecycle);
            match std::mem::replace(&mut lifecycle.phase, Phase::Stopped) {
                Phase::Idle => {
                    lifecycle.phase = Phase::Idle;
                    return Err(ShutdownError::NotStarted);
                }
                Phase::Stopped => return Ok(()),
                Phase::Running { stop, task, .. } => (stop, task),
            }
        };
        stop.cancel();
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "shutdown signal task ended abnormally");
        }
        tracing::debug!("shutdown signal handling stopped");
        Ok(())
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ShutdownState {
        match lock(&self.shared.lifecycle).phase {
            Phase::Idle => ShutdownState::Idle,
            Phase::Running { .. } => ShutdownState::Running,
            Phase::Stopped => ShutdownState::Stopped,
        }
    }

    /// Returns the signal that last triggered the handlers, if any.
    ///
    /// Set before the first handler runs, so handlers may consult it.
    pub fn triggered_by(&self) -> Option<Signal> {
        *lock(&self.shared.triggered)
    }

    /// Holds off shutdown handlers until the returned guard is released.
    ///
    /// Waits if a triggered shutdown is already running its handlers.
    pub async fn inhibit(&self) -> InhibitGuard {
        let guard = Arc::clone(&self.shared.inhibit).read_owned().await;
        tracing::trace!("shutdown inhibited");
        InhibitGuard { _guard: guard }
    }

    /// Releases an inhibit. Equivalent to dropping the guard.
    pub fn uninhibit(&self, guard: InhibitGuard) {
        drop(guard);
        tracing::trace!("shutdown uninhibited");
    }

    /// Registers a handler to run on shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::DuplicateHandler`] if `name` is taken.
    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> Result<(), ShutdownError>
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        let name = name.into();
        let mut handlers = lock(&self.shared.handlers);
        if handlers.iter().any(|(existing, _)| *existing == name) {
            return Err(ShutdownError::DuplicateHandler { name });
        }
        tracing::debug!(handler = %name, "registered shutdown handler");
        handlers.push((name, Arc::new(handler)));
        Ok(())
    }

    /// Removes a previously registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`ShutdownError::HandlerNotFound`] if `name` is unknown.
    pub fn unregister(&self, name: &str) -> Result<(), ShutdownError> {
        let mut handlers = lock(&self.shared.handlers);
        let index = handlers
            .iter()
            .position(|(existing, _)| existing == name)
            .ok_or_else(|| ShutdownError::HandlerNotFound {
                name: name.to_owned(),
            })?;
        let _ = handlers.remove(index);
        tracing::debug!(handler = %name, "unregistered shutdown handler");
        Ok(())
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("handlers", &lock(&self.shared.handlers).len())
            .finish_non_exhaustive()
    }
}

/// A shared hold that defers shutdown handlers while alive.
pub struct InhibitGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

impl fmt::Debug for InhibitGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InhibitGuard").finish_non_exhaustive()
    }
}

async fn watch(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    stop: CancellationToken,
    generation: u64,
) {
    tokio::select! {
        biased;
        () = stop.cancelled() => {}
        received = subscription.recv() => {
            if let Some(signal) = received {
                tracing::info!(%signal, "received shutdown signal, running handlers");
                *lock(&shared.triggered) = Some(signal);
                shared.run_handlers().await;
            }
        }
    }
    subscription.unsubscribe();

    let mut lifecycle = lock(&shared.lifecycle);
    if let Phase::Running { generation: current, .. } = lifecycle.phase {
        if current == generation {
            lifecycle.phase = Phase::Stopped;
        }
    }
}

impl Shared {
    async fn run_handlers(&self) {
        let guard = Arc::clone(&self.inhibit).write_owned().await;
        // Handlers may register or unregister others, so run a snapshot.
        let handlers: Vec<(String, Handler)> = lock(&self.handlers)
            .iter()
            .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
            .collect();
        let run = tokio::task::spawn_blocking(move || {
            for (name, handler) in &handlers {
                tracing::debug!(handler = %name, "running shutdown handler");
                if let Err(e) = handler() {
                    tracing::error!(handler = %name, error = %e, "shutdown handler failed");
                }
            }
            drop(guard);
        });
        if let Err(e) = run.await {
            tracing::error!(error = %e, "shutdown handlers panicked");
        }
    }
}
