//! # berth-core
//!
//! Connection layer between Berth and the container runtime.
//!
//! This crate provides:
//! - **API**: the [`api::ContainerApi`] trait every higher layer talks to.
//! - **Docker**: [`docker::DockerApi`], the bollard-backed implementation.
//! - **Stream**: decoding of the daemon's newline-delimited JSON progress
//!   streams into [`stream::ContainerEvent`]s, fanned into one session.
//! - **Archive**: tar packing and unpacking for copies and build contexts.
//!
//! With the `test-util` feature, [`mock::MockApi`] offers an in-memory
//! runtime that records every call.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod api;
pub mod archive;
pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod stream;
