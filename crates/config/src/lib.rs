//! Crate for configuring a data stream server.
//!
//! Node-specific parameters and loading them from disk.
mod parameters;
pub use parameters::*;
mod traits;
pub use traits::*;
