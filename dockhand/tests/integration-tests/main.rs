// Copyright 2025 Oxide Computer Company

//! Integration tests for dockhand.
//!
//! These are all combined into the same file to ensure that a single binary is
//! generated, speeding up link times.

mod auth;
mod common;
mod locking;
mod panic_handling;
mod routing;
mod streaming;
mod tls;
