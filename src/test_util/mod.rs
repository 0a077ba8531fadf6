//! Test doubles for xgress functionality. They are used for testing this crate, but they are also
//!  exported for testing applications and transport bindings built on it, which is why they are
//!  part of the crate's regular (non-#[cfg(test)]) code.

pub mod connection;
pub mod forwarder;
pub mod handlers;
