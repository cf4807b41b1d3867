// SPDX-License-Identifier: Apache-2.0
//! Primary side of the data stream protocol.
//!
//! A client opens a stream against a primary. The primary forwards every packet to the
//! replicas of its group, and once the stream closes it commits the result through the
//! consensus layer, following leader redirects if it does not hold leadership itself.

#![allow(missing_docs)]

mod commit;
mod handler;
mod primary;
mod registry;
mod replication;
mod resolver;
mod server;
mod session;

pub use handler::{StreamFailure, StreamHandler};
pub use primary::{DataStreamPrimary, StreamRole};
pub use registry::{SessionRegistry, SessionStats};
pub use resolver::StaticReplicaResolver;
pub use server::{serve_connection, ServerHandle};
pub use session::{SessionState, StreamSession};

#[cfg(test)]
#[path = "tests/handler_tests.rs"]
mod handler_tests;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
