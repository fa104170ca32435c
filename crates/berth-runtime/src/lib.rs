//! # berth-runtime
//!
//! Ephemeral container lifecycle for Berth.
//!
//! A [`run::Run`] sweeps stale containers carrying its label, pulls the
//! image if needed, creates and starts a long-sleeping container,
//! provisions the run user, mirrors volumes in, executes commands one by
//! one, mirrors changed volume entries back out, and always tears the
//! container down.
//!
//! Volumes are bind-mounted when Berth runs on the host. When it runs
//! inside a container itself (see [`probe`]) they are copied through the
//! runtime's archive API instead.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod context;
pub mod exec;
pub mod probe;
pub mod run;
pub mod sync;
pub mod teardown;
pub mod volume;
