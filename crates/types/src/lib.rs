// SPDX-License-Identifier: Apache-2.0
//! Types shared by every data stream crate: packet headers, request and reply packets,
//! collaborator interfaces and the error taxonomy.

#[macro_use]
pub mod error;
mod commit;
mod packet;
mod peer;
mod traits;
pub use commit::*;
pub use error::*;
pub use packet::*;
pub use peer::*;
pub use traits::*;

// re-exports for easier maintainability
pub use bytes::{Bytes, BytesMut};

#[cfg(feature = "test-utils")]
pub mod test_utils;
