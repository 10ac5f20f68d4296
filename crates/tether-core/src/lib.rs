//! # tether-core
//!
//! Host facilities the attach runtime is built on:
//! - **Signals**: subscribing to named signals as a bounded stream, and
//!   re-raising a signal with its default disposition.
//! - **Terminal**: saving, restoring and switching the local terminal to
//!   raw mode, and reading its geometry.
//! - **I/O**: copying an input stream while watching for the detach key
//!   sequence.
//!
//! Linux and FreeBSD get full implementations. Other platforms compile,
//! but every host facility fails with an `Unsupported` error.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod io;
pub mod signal;
pub mod terminal;
