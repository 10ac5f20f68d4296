//! Signal subscription as message passing.
//!
//! A [`SignalSource`] hands out [`Subscription`]s: bounded queues that
//! receive every delivery of the subscribed signals until the subscription
//! is closed. The host implementation runs one dispatcher thread per
//! process over `signal-hook` and fans deliveries out to live subscribers.
//! A delivery nobody is subscribed to gets the signal's default
//! disposition, so closing the last subscription for `SIGTERM` makes the
//! process terminable again.

use std::fmt;

use nix::sys::signal::Signal;
use tether_common::error::Result;
use tokio::sync::mpsc;

/// Signals the shutdown coordinator intercepts.
pub const SHUTDOWN_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

/// Signals that can never be intercepted, or only at the cost of
/// swallowing a synchronous fault.
const UNCATCHABLE: [Signal; 5] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// Returns every signal on this platform that may be subscribed to.
#[must_use]
pub fn catchable_signals() -> Vec<Signal> {
    Signal::iterator()
        .filter(|signal| !UNCATCHABLE.contains(signal))
        .collect()
}

/// Source of OS signal notifications.
pub trait SignalSource: Send + Sync {
    /// Subscribes to `signals`, buffering up to `capacity` pending
    /// deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS facility cannot be set up.
    fn subscribe(&self, signals: &[Signal], capacity: usize) -> Result<Subscription>;

    /// Delivers `signal` to the current process.
    ///
    /// Subscribers still registered for `signal` receive it; otherwise the
    /// default disposition applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be raised.
    fn raise(&self, signal: Signal) -> Result<()>;
}

/// A live registration for a set of signals.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    receiver: mpsc::Receiver<Signal>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a receiver fed by a signal source. `on_close` runs exactly
    /// once, when the subscription is closed or dropped.
    pub fn new(receiver: mpsc::Receiver<Signal>, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Waits for the next signal. Returns `None` once the source has gone
    /// away or the subscription was closed.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.receiver.recv().await
    }

    /// Stops receiving signals.
    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.on_close.is_none())
            .finish_non_exhaustive()
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub use host::HostSignals;

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
mod host {
    use std::collections::HashSet;
    use std::ffi::c_int;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use nix::sys::signal::Signal;
    use signal_hook::iterator::{Handle, Signals};
    use tether_common::error::{Result, TetherError};
    use tokio::sync::mpsc::{self, error::TrySendError};

    use super::{SignalSource, Subscription};

    /// The process has one dispatcher; every `HostSignals` shares it.
    static DISPATCHER: Mutex<Option<Arc<Dispatcher>>> = Mutex::new(None);

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// OS signal source for Linux and FreeBSD.
    #[derive(Debug, Clone)]
    pub struct HostSignals {
        dispatcher: Arc<Dispatcher>,
    }

    impl HostSignals {
        /// Returns a handle on the process-wide dispatcher, starting it on
        /// first use.
        ///
        /// # Errors
        ///
        /// Returns an error if the signal pipe or dispatcher thread cannot
        /// be created.
        pub fn new() -> Result<Self> {
            let mut slot = lock(&DISPATCHER);
            if let Some(dispatcher) = slot.as_ref() {
                return Ok(Self {
                    dispatcher: Arc::clone(dispatcher),
                });
            }
            let dispatcher = Dispatcher::spawn()?;
            *slot = Some(Arc::clone(&dispatcher));
            Ok(Self { dispatcher })
        }
    }

    impl SignalSource for HostSignals {
        fn subscribe(&self, signals: &[Signal], capacity: usize) -> Result<Subscription> {
            self.dispatcher.watch(signals)?;
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            let id = self.dispatcher.add_route(signals, sender);
            let dispatcher = Arc::clone(&self.dispatcher);
            Ok(Subscription::new(receiver, move || dispatcher.remove_route(id)))
        }

        fn raise(&self, signal: Signal) -> Result<()> {
            tracing::debug!(%signal, "raising signal against self");
            signal_hook::low_level::raise(signal as c_int).map_err(|e| TetherError::Os {
                facility: "signal raise",
                source: e,
            })
        }
    }

    struct Route {
        id: u64,
        signals: Vec<Signal>,
        sender: mpsc::Sender<Signal>,
    }

    #[derive(Default)]
    struct Routes {
        next_id: u64,
        entries: Vec<Route>,
    }

    struct Dispatcher {
        handle: Handle,
        registered: Mutex<HashSet<c_int>>,
        routes: Mutex<Routes>,
    }

    impl std::fmt::Debug for Dispatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Dispatcher")
                .field("registered", &lock(&self.registered).len())
                .field("routes", &lock(&self.routes).entries.len())
                .finish_non_exhaustive()
        }
    }

    impl Dispatcher {
        fn spawn() -> Result<Arc<Self>> {
            let mut signals = Signals::new(Vec::<c_int>::new()).map_err(|e| TetherError::Os {
                facility: "signal registration",
                source: e,
            })?;
            let dispatcher = Arc::new(Self {
                handle: signals.handle(),
                registered: Mutex::new(HashSet::new()),
                routes: Mutex::new(Routes::default()),
            });
            let worker = Arc::clone(&dispatcher);
            let _ = std::thread::Builder::new()
                .name("tether-signals".into())
                .spawn(move || {
                    for raw in signals.forever() {
                        worker.dispatch(raw);
                    }
                    tracing::debug!("signal dispatcher exited");
                })
                .map_err(|e| TetherError::Os {
                    facility: "signal dispatcher thread",
                    source: e,
                })?;
            Ok(dispatcher)
        }

        /// Registers OS handlers for signals not seen before.
        fn watch(&self, signals: &[Signal]) -> Result<()> {
            let mut registered = lock(&self.registered);
            for signal in signals {
                let raw = *signal as c_int;
                if registered.contains(&raw) {
                    continue;
                }
                self.handle.add_signal(raw).map_err(|e| TetherError::Os {
                    facility: "signal registration",
                    source: e,
                })?;
                let _ = registered.insert(raw);
            }
            Ok(())
        }

        fn add_route(&self, signals: &[Signal], sender: mpsc::Sender<Signal>) -> u64 {
            let mut routes = lock(&self.routes);
            let id = routes.next_id;
            routes.next_id += 1;
            routes.entries.push(Route {
                id,
                signals: signals.to_vec(),
                sender,
            });
            id
        }

        fn remove_route(&self, id: u64) {
            lock(&self.routes).entries.retain(|route| route.id != id);
        }

        fn dispatch(&self, raw: c_int) {
            let Ok(signal) = Signal::try_from(raw) else {
                return;
            };
            let mut delivered = false;
            for route in lock(&self.routes)
                .entries
                .iter()
                .filter(|route| route.signals.contains(&signal))
            {
                match route.sender.try_send(signal) {
                    Ok(()) => delivered = true,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(%signal, "signal queue full, dropping delivery");
                        delivered = true;
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            if !delivered {
                tracing::debug!(%signal, "no subscriber, applying default disposition");
                if let Err(e) = signal_hook::low_level::emulate_default_handler(raw) {
                    tracing::warn!(%signal, error = %e, "default disposition failed");
                }
            }
        }
    }

}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub use unsupported::HostSignals;

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
mod unsupported {
    use nix::sys::signal::Signal;
    use tether_common::error::{Result, TetherError};

    use super::{SignalSource, Subscription};

    /// Placeholder signal source for platforms without signal proxying.
    #[derive(Debug, Clone)]
    pub struct HostSignals {
        _private: (),
    }

    impl HostSignals {
        /// Always fails on this platform.
        ///
        /// # Errors
        ///
        /// Always returns [`TetherError::Unsupported`].
        pub fn new() -> Result<Self> {
            Err(TetherError::unsupported("signal subscription"))
        }
    }

    impl SignalSource for HostSignals {
        fn subscribe(&self, _signals: &[Signal], _capacity: usize) -> Result<Subscription> {
            Err(TetherError::unsupported("signal subscription"))
        }

        fn raise(&self, _signal: Signal) -> Result<()> {
            Err(TetherError::unsupported("signal raise"))
        }
    }
}
