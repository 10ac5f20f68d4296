//! Signal proxy behaviour against fake signals and containers.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{FakeContainer, FakeSignals, KillBehavior, QUIET, Raised, WAIT, eventually};
use nix::sys::signal::Signal;
use tether_runtime::shutdown::{ShutdownCoordinator, ShutdownState};
use tether_runtime::sigproxy::{IGNORED_SIGNALS, ProxyError, ProxyExit, SignalProxy};

struct Fixture {
    signals: Arc<FakeSignals>,
    shutdown: Arc<ShutdownCoordinator>,
    proxy: SignalProxy,
}

fn fixture() -> Fixture {
    let signals = FakeSignals::new();
    let shutdown = Arc::new(ShutdownCoordinator::new(signals.source()));
    let proxy = SignalProxy::new(signals.source(), Arc::clone(&shutdown));
    Fixture {
        signals,
        shutdown,
        proxy,
    }
}

// ── Forwarding ───────────────────────────────────────────────────────

#[tokio::test]
async fn signals_are_forwarded_in_order() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1"));
    let session = f.proxy.attach(Arc::clone(&container)).await.unwrap();
    assert!(session.is_active());
    assert_eq!(session.id().as_str(), "c1");

    for signal in [Signal::SIGHUP, Signal::SIGUSR1, Signal::SIGWINCH] {
        assert_eq!(f.signals.send(signal), 1);
    }
    eventually("three forwarded signals", || container.killed().len() == 3).await;
    assert_eq!(
        container.killed(),
        [Signal::SIGHUP, Signal::SIGUSR1, Signal::SIGWINCH]
    );

    assert_eq!(session.stop().await, ProxyExit::Stopped);
    assert_eq!(f.signals.subscribers(Signal::SIGHUP), 0);
}

#[tokio::test]
async fn proxy_takes_shutdown_signals_over_from_the_coordinator() {
    let f = fixture();
    let ran = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&ran);
    f.shutdown
        .register("cleanup", move || {
            let _ = hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    f.shutdown.start().unwrap();

    let container = Arc::new(FakeContainer::new("c1"));
    let _session = f.proxy.attach(Arc::clone(&container)).await.unwrap();

    assert_eq!(f.shutdown.state(), ShutdownState::Stopped);
    assert_eq!(f.signals.subscribers(Signal::SIGTERM), 1, "only the proxy");
    let _ = f.signals.send(Signal::SIGTERM);
    eventually("SIGTERM forwarded", || container.killed() == [Signal::SIGTERM]).await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn attach_works_without_a_running_coordinator() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1"));
    let session = f.proxy.attach(container).await.unwrap();
    assert_eq!(f.shutdown.state(), ShutdownState::Idle);
    assert_eq!(session.stop().await, ProxyExit::Stopped);
}

#[tokio::test]
async fn ignored_signals_are_never_forwarded() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1"));
    let _session = f.proxy.attach(Arc::clone(&container)).await.unwrap();

    let subscribed = f.signals.subscribed();
    let forwarded = subscribed.last().unwrap();
    for signal in IGNORED_SIGNALS {
        assert!(!forwarded.contains(&signal), "{signal} must stay unregistered");
        f.signals.inject(signal);
    }
    assert!(!forwarded.contains(&Signal::SIGKILL));
    assert!(!forwarded.contains(&Signal::SIGSTOP));

    let _ = f.signals.send(Signal::SIGUSR2);
    eventually("SIGUSR2 forwarded", || !container.killed().is_empty()).await;
    assert_eq!(container.killed(), [Signal::SIGUSR2]);
}

#[tokio::test]
async fn other_kill_errors_keep_the_proxy_running() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1").with_kill(KillBehavior::Fail));
    let session = f.proxy.attach(Arc::clone(&container)).await.unwrap();

    let _ = f.signals.send(Signal::SIGHUP);
    let _ = f.signals.send(Signal::SIGHUP);
    eventually("both attempts", || container.killed().len() == 2).await;
    assert!(session.is_active());
    assert!(f.signals.raised().is_empty());
    assert_eq!(session.stop().await, ProxyExit::Stopped);
}

#[tokio::test]
async fn subscription_failure_is_returned() {
    let signals = FakeSignals::failing();
    let shutdown = Arc::new(ShutdownCoordinator::new(signals.source()));
    let proxy = SignalProxy::new(signals.source(), shutdown);
    let err = proxy
        .attach(Arc::new(FakeContainer::new("c1")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Subscribe(_)));
}

#[test]
fn buffer_never_drops_below_the_minimum() {
    let f = fixture();
    assert_eq!(f.proxy.buffer(), 2048);
    let proxy = SignalProxy::new(f.signals.source(), f.shutdown).with_buffer(16);
    assert_eq!(proxy.buffer(), 2048);
}

// ── Target gone ──────────────────────────────────────────────────────

#[tokio::test]
async fn gone_container_gets_the_signal_reraised_once() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1").with_kill(KillBehavior::Gone));
    let session = f.proxy.attach(Arc::clone(&container)).await.unwrap();

    let _ = f.signals.send(Signal::SIGTERM);
    let exit = tokio::time::timeout(WAIT, session.join())
        .await
        .expect("proxy should end once the container is gone");

    assert_eq!(
        exit,
        ProxyExit::TargetGone {
            signal: Signal::SIGTERM
        }
    );
    assert_eq!(container.killed(), [Signal::SIGTERM]);
    assert_eq!(
        f.signals.raised(),
        [Raised {
            signal: Signal::SIGTERM,
            intercepted: false
        }],
        "re-raised once, after letting go of the signal"
    );
}

#[tokio::test]
async fn signals_after_target_gone_are_not_forwarded() {
    let f = fixture();
    let container = Arc::new(FakeContainer::new("c1").with_kill(KillBehavior::Gone));
    let session = f.proxy.attach(Arc::clone(&container)).await.unwrap();

    let _ = f.signals.send(Signal::SIGINT);
    eventually("proxy to stop", || !session.is_active()).await;
    assert_eq!(f.signals.send(Signal::SIGINT), 0);
    assert_eq!(f.signals.subscribers(Signal::SIGHUP), 0);
    assert_eq!(container.killed(), [Signal::SIGINT]);
    assert_eq!(f.signals.raised().len(), 1);
}
