//! # berth-image
//!
//! Everything that deals with images rather than containers:
//! - **Reference**: parsing `name[:tag]` / `name@digest` strings.
//! - **Auth**: resolving registry credentials from the Docker client config.
//! - **Registry**: fetching a remote manifest digest over the distribution API.
//! - **Dockerfile**: validating a Dockerfile, building it, and pushing its tags.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod auth;
pub mod dockerfile;
pub mod reference;
pub mod registry;
