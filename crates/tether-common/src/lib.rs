//! # tether-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the tether workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and carries the primitives the signal, terminal and
//! attach layers agree on: container identifiers, terminal geometry,
//! detach key sequences and the common error type.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod detach;
pub mod error;
pub mod types;
