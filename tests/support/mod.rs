//! Helpers shared by the integration test binaries.
#![allow(dead_code)]

pub mod fetcher;
pub mod fixtures;
pub mod socket_guard;
