//! In-memory stand-ins for the host facilities the attach runtime uses.
//!
//! - [`FakeSignals`]: a signal source driven by the test.
//! - [`FakeTerminal`]: a terminal that records mode changes.
//! - [`FakeContainer`]: a container with scripted kill and invocation
//!   outcomes.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::Signal;
use tether_common::detach::DetachKeys;
use tether_common::error::{Result, TetherError};
use tether_common::types::{ContainerId, TerminalSize};
use tether_core::signal::{SignalSource, Subscription};
use tether_core::terminal::TerminalDevice;
use tether_runtime::container::{
    AttachDone, Container, ContainerError, ExecConfig, ResizeEvents,
};
use tether_runtime::streams::AttachStreams;
use tokio::sync::{mpsc, oneshot};

/// Upper bound on every wait in the integration tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Window used to assert that something does *not* happen.
pub const QUIET: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

// ── Signals ──────────────────────────────────────────────────────────

struct Route {
    id: u64,
    signals: Vec<Signal>,
    sender: mpsc::Sender<Signal>,
}

#[derive(Default)]
struct SignalState {
    next_id: u64,
    routes: Vec<Route>,
    subscribed: Vec<Vec<Signal>>,
    raised: Vec<Raised>,
    fail_subscribe: bool,
    fail_on: Option<Signal>,
}

/// A signal raised through [`SignalSource::raise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised {
    /// The raised signal.
    pub signal: Signal,
    /// Whether a subscriber still intercepted it at the time.
    pub intercepted: bool,
}

/// Signal source whose deliveries come from the test.
#[derive(Default)]
pub struct FakeSignals {
    state: Arc<Mutex<SignalState>>,
}

impl FakeSignals {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns this source as the trait object the runtime consumes.
    pub fn source(self: &Arc<Self>) -> Arc<dyn SignalSource> {
        let source: Arc<Self> = Arc::clone(self);
        source
    }

    /// A source whose subscriptions always fail.
    pub fn failing() -> Arc<Self> {
        let fake = Self::default();
        lock(&fake.state).fail_subscribe = true;
        Arc::new(fake)
    }

    /// A source refusing any subscription that covers `signal`.
    pub fn failing_on(signal: Signal) -> Arc<Self> {
        let fake = Self::default();
        lock(&fake.state).fail_on = Some(signal);
        Arc::new(fake)
    }

    /// Delivers `signal` to every subscriber registered for it, returning
    /// how many received it.
    pub fn send(&self, signal: Signal) -> usize {
        let state = lock(&self.state);
        state
            .routes
            .iter()
            .filter(|route| route.signals.contains(&signal))
            .filter(|route| route.sender.try_send(signal).is_ok())
            .count()
    }

    /// Pushes `signal` to every live subscriber, whatever it asked for.
    pub fn inject(&self, signal: Signal) {
        for route in &lock(&self.state).routes {
            let _ = route.sender.try_send(signal);
        }
    }

    /// Number of live subscriptions covering `signal`.
    pub fn subscribers(&self, signal: Signal) -> usize {
        lock(&self.state)
            .routes
            .iter()
            .filter(|route| route.signals.contains(&signal))
            .count()
    }

    /// Signal sets passed to `subscribe`, in call order.
    pub fn subscribed(&self) -> Vec<Vec<Signal>> {
        lock(&self.state).subscribed.clone()
    }

    /// Signals raised against the "process", in order.
    pub fn raised(&self) -> Vec<Raised> {
        lock(&self.state).raised.clone()
    }
}

impl SignalSource for FakeSignals {
    fn subscribe(&self, signals: &[Signal], capacity: usize) -> Result<Subscription> {
        let mut state = lock(&self.state);
        let refused = state.fail_on.is_some_and(|signal| signals.contains(&signal));
        if state.fail_subscribe || refused {
            return Err(TetherError::Os {
                facility: "signal registration",
                source: std::io::Error::other("fake subscription failure"),
            });
        }
        state.subscribed.push(signals.to_vec());
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = state.next_id;
        state.next_id += 1;
        state.routes.push(Route {
            id,
            signals: signals.to_vec(),
            sender,
        });
        let shared = Arc::clone(&self.state);
        Ok(Subscription::new(receiver, move || {
            lock(&shared).routes.retain(|route| route.id != id);
        }))
    }

    fn raise(&self, signal: Signal) -> Result<()> {
        let intercepted = self.send(signal) > 0;
        lock(&self.state).raised.push(Raised {
            signal,
            intercepted,
        });
        Ok(())
    }
}

// ── Terminal ─────────────────────────────────────────────────────────

/// Terminal that records every mode change.
///
/// Captured states are numbered from 100 in capture order.
pub struct FakeTerminal {
    tty: bool,
    size: Mutex<Option<TerminalSize>>,
    fail_save: bool,
    fail_raw: bool,
    raw: AtomicBool,
    saves: AtomicU32,
    raw_calls: AtomicUsize,
    restored: Mutex<Vec<u32>>,
}

impl FakeTerminal {
    /// An interactive 24x80 terminal.
    pub fn tty() -> Self {
        Self::with(true)
    }

    /// A non-interactive input.
    pub fn not_tty() -> Self {
        Self::with(false)
    }

    fn with(tty: bool) -> Self {
        Self {
            tty,
            size: Mutex::new(Some(TerminalSize::new(24, 80))),
            fail_save: false,
            fail_raw: false,
            raw: AtomicBool::new(false),
            saves: AtomicU32::new(0),
            raw_calls: AtomicUsize::new(0),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_save(mut self) -> Self {
        self.fail_save = true;
        self
    }

    pub fn failing_raw(mut self) -> Self {
        self.fail_raw = true;
        self
    }

    /// Makes size queries fail until [`FakeTerminal::resize`] is called.
    pub fn without_size(self) -> Self {
        *lock(&self.size) = None;
        self
    }

    pub fn resize(&self, rows: u16, cols: u16) {
        *lock(&self.size) = Some(TerminalSize::new(rows, cols));
    }

    pub fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn raw_calls(&self) -> usize {
        self.raw_calls.load(Ordering::SeqCst)
    }

    /// States passed to `restore`, in call order.
    pub fn restored(&self) -> Vec<u32> {
        lock(&self.restored).clone()
    }
}

fn fake_os_error(facility: &'static str) -> TetherError {
    TetherError::Os {
        facility,
        source: std::io::Error::other("fake terminal failure"),
    }
}

impl TerminalDevice for FakeTerminal {
    type State = u32;

    fn is_terminal(&self) -> bool {
        self.tty
    }

    fn size(&self) -> Result<TerminalSize> {
        (*lock(&self.size)).ok_or_else(|| fake_os_error("terminal size query"))
    }

    fn save_state(&self) -> Result<u32> {
        if self.fail_save {
            return Err(fake_os_error("terminal state save"));
        }
        Ok(100 + self.saves.fetch_add(1, Ordering::SeqCst))
    }

    fn set_raw(&self) -> Result<()> {
        let _ = self.raw_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_raw {
            return Err(fake_os_error("terminal raw mode"));
        }
        self.raw.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn restore(&self, state: &u32) -> Result<()> {
        lock(&self.restored).push(*state);
        self.raw.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ── Container ────────────────────────────────────────────────────────

/// How [`FakeContainer::kill`] responds.
#[derive(Debug, Clone, Copy)]
pub enum KillBehavior {
    /// Every signal is delivered.
    Deliver,
    /// The container is always gone.
    Gone,
    /// Delivery always fails for another reason.
    Fail,
}

/// How an exec or attach call ends.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// The session ends normally with this exit code.
    Exit(i32),
    /// The user detaches.
    Detach,
    /// The command may not be executed.
    Denied,
    /// The call never returns.
    Hang,
    /// The call panics.
    Panic,
}

/// What the orchestrator handed to the container.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Whether the terminal was raw when the call started.
    pub raw: bool,
    /// First resize event, if a stream was passed.
    pub first_size: Option<TerminalSize>,
    /// Whether a resize stream was passed at all.
    pub had_resize: bool,
    pub attach_input: bool,
    pub attach_output: bool,
    pub attach_error: bool,
    /// The `start` flag of an attach call.
    pub start: Option<bool>,
    /// Detach keys of an attach call.
    pub detach_keys: Option<DetachKeys>,
}

pub struct FakeContainer {
    id: ContainerId,
    tty: bool,
    kill: KillBehavior,
    outcome: Outcome,
    terminal: Option<Arc<FakeTerminal>>,
    killed: Mutex<Vec<Signal>>,
    invocations: Mutex<Vec<Invocation>>,
    pending: Mutex<Vec<oneshot::Sender<std::result::Result<(), ContainerError>>>>,
}

impl FakeContainer {
    pub fn new(id: &str) -> Self {
        Self {
            id: ContainerId::new(id),
            tty: false,
            kill: KillBehavior::Deliver,
            outcome: Outcome::Exit(0),
            terminal: None,
            killed: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tty(mut self) -> Self {
        self.tty = true;
        self
    }

    pub fn with_kill(mut self, kill: KillBehavior) -> Self {
        self.kill = kill;
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Observes `terminal` when invoked.
    pub fn observing(mut self, terminal: Arc<FakeTerminal>) -> Self {
        self.terminal = Some(terminal);
        self
    }

    pub fn killed(&self) -> Vec<Signal> {
        lock(&self.killed).clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Reads the first resize event and snapshots what was handed over.
    ///
    /// Stream flags are read before awaiting since the streams themselves
    /// are not `Sync`.
    async fn invoke(&self, flags: [bool; 3], resize: Option<ResizeEvents>) -> Invocation {
        let had_resize = resize.is_some();
        let raw = self.terminal.as_ref().is_some_and(|t| t.is_raw());
        let first_size = match resize {
            Some(mut events) => tokio::time::timeout(WAIT, events.recv()).await.ok().flatten(),
            None => None,
        };
        let [attach_input, attach_output, attach_error] = flags;
        Invocation {
            raw,
            first_size,
            had_resize,
            attach_input,
            attach_output,
            attach_error,
            start: None,
            detach_keys: None,
        }
    }

    fn record(&self, invocation: Invocation) {
        lock(&self.invocations).push(invocation);
    }

    async fn finish(&self) -> std::result::Result<i32, ContainerError> {
        match self.outcome {
            Outcome::Exit(code) => Ok(code),
            Outcome::Detach => Err(ContainerError::Detached),
            Outcome::Denied => Err(ContainerError::PermissionDenied {
                message: "exec format error".into(),
            }),
            Outcome::Hang => std::future::pending().await,
            Outcome::Panic => panic!("container runtime crashed"),
        }
    }
}

fn flags(streams: &AttachStreams) -> [bool; 3] {
    [
        streams.attach_input(),
        streams.attach_output(),
        streams.attach_error(),
    ]
}

impl Container for FakeContainer {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn has_tty(&self) -> bool {
        self.tty
    }

    async fn kill(&self, signal: Signal) -> std::result::Result<(), ContainerError> {
        lock(&self.killed).push(signal);
        match self.kill {
            KillBehavior::Deliver => Ok(()),
            KillBehavior::Gone => Err(ContainerError::InvalidState {
                id: self.id.clone(),
                reason: "container has exited".into(),
            }),
            KillBehavior::Fail => Err(ContainerError::Io(std::io::Error::other(
                "runtime temporarily unavailable",
            ))),
        }
    }

    async fn exec(
        &self,
        _config: &ExecConfig,
        streams: AttachStreams,
        resize: Option<ResizeEvents>,
    ) -> std::result::Result<i32, ContainerError> {
        let invocation = self.invoke(flags(&streams), resize).await;
        drop(streams);
        self.record(invocation);
        self.finish().await
    }

    async fn attach(
        &self,
        streams: AttachStreams,
        detach_keys: &DetachKeys,
        resize: Option<ResizeEvents>,
        start: bool,
    ) -> std::result::Result<AttachDone, ContainerError> {
        let background = streams.is_detached();
        let mut invocation = self.invoke(flags(&streams), resize).await;
        drop(streams);
        invocation.start = Some(start);
        invocation.detach_keys = Some(detach_keys.clone());
        self.record(invocation);

        let (sender, done) = oneshot::channel();
        if background {
            // Detached sessions only end when the container exits.
            lock(&self.pending).push(sender);
            return Ok(done);
        }
        let result = self.finish().await.map(|_| ());
        let _ = sender.send(result);
        Ok(done)
    }
}

// ── Output ───────────────────────────────────────────────────────────

/// Cloneable in-memory writer.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(lock(&self.0).clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
