//! Attach runtime for tether.
//!
//! Composes the host facilities from `tether-core` around a single
//! attach or exec call against a [`Container`](container::Container):
//!
//! - [`shutdown`]: the process's shutdown-signal coordinator.
//! - [`terminal`]: raw-mode terminal sessions with a resize-event stream.
//! - [`sigproxy`]: forwarding host signals to an attached container.
//! - [`attach`]: the orchestrator tying the three together.
//! - [`state`]: the on-disk record of attach sessions.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod attach;
pub mod container;
pub mod shutdown;
pub mod sigproxy;
pub mod state;
pub mod streams;
pub mod terminal;
