// SPDX-License-Identifier: Apache-2.0
//! Wire protocol for data stream packets.
//!
//! ```text
//! +----------------+----------------------+----------------------+
//! | header_len     | header record        | data                 |
//! | 4 bytes (BE)   | header_len bytes     | data_length bytes    |
//! +----------------+----------------------+----------------------+
//! ```
//!
//! The header record is the BCS encoding of a [ds_types::PacketHeader] (requests) or
//! [ds_types::ReplyHeader] (replies). The data region is not part of the length-prefixed
//! region; its size comes from the header record.

mod client;
mod codec;
mod error;
mod forwarder;
mod framer;
mod io;

pub use client::{DataStreamClient, DataStreamOutput};
pub use codec::{HeaderCodec, HeaderRecord, HEADER_LEN_PREFIX_SIZE};
pub use error::{FrameError, FrameResult};
pub use forwarder::TcpReplicaForwarder;
pub use framer::PacketFramer;
pub use io::{PacketReader, PacketWriter};
