//! Packet headers and the request/reply packets that carry them.
//!
//! A request payload is a [Bytes] view into the connection's receive buffer. Cloning or
//! slicing it bumps a reference count instead of copying, and dropping the last view
//! releases the region back to the buffer. A reply payload is always an owned copy.

use crate::MalformedHeaderError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical stream. Assigned by the client.
pub type StreamId = u64;

/// Byte offset of a packet's payload within its stream.
pub type StreamOffset = u64;

/// The role of a packet within its stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Opens a stream. Payload, if any, is metadata.
    StreamHeader,
    /// A chunk of stream data.
    StreamData,
    /// Ends the stream and triggers the commit.
    StreamClose,
}

impl PacketKind {
    /// Name used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamHeader => "STREAM_HEADER",
            Self::StreamData => "STREAM_DATA",
            Self::StreamClose => "STREAM_CLOSE",
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header record shared by requests and replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    stream_id: StreamId,
    stream_offset: StreamOffset,
    kind: PacketKind,
    data_length: u64,
}

impl PacketHeader {
    /// Create a new header.
    pub fn new(
        stream_id: StreamId,
        stream_offset: StreamOffset,
        kind: PacketKind,
        data_length: u64,
    ) -> Self {
        Self { stream_id, stream_offset, kind, data_length }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn stream_offset(&self) -> StreamOffset {
        self.stream_offset
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    /// Check the declared data length against `max_data_len`.
    pub fn validate_length(&self, max_data_len: u64) -> Result<(), MalformedHeaderError> {
        if self.data_length > max_data_len {
            return Err(MalformedHeaderError::DataTooLong {
                len: self.data_length,
                max: max_data_len,
            });
        }
        Ok(())
    }

    /// Check a request header: length limits, and data packets must carry data.
    pub fn validate(&self, max_data_len: u64) -> Result<(), MalformedHeaderError> {
        self.validate_length(max_data_len)?;
        if self.kind == PacketKind::StreamData && self.data_length == 0 {
            return Err(MalformedHeaderError::EmptyData(self.stream_id));
        }
        Ok(())
    }
}

impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(stream={}, offset={}, len={})",
            self.kind, self.stream_id, self.stream_offset, self.data_length
        )
    }
}

/// Header record of a reply: the request's header fields followed by the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    packet: PacketHeader,
    bytes_written: u64,
    success: bool,
}

impl ReplyHeader {
    pub fn new(packet: PacketHeader, bytes_written: u64, success: bool) -> Self {
        Self { packet, bytes_written, success }
    }

    pub fn packet(&self) -> &PacketHeader {
        &self.packet
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Check a reply header.
    ///
    /// The data length here is the reply payload, which is empty on success for every kind.
    pub fn validate(&self, max_data_len: u64) -> Result<(), MalformedHeaderError> {
        self.packet.validate_length(max_data_len)
    }
}

/// A request packet whose payload borrows the receive buffer.
///
/// This type is immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestPacket {
    header: PacketHeader,
    data: Bytes,
}

impl RequestPacket {
    /// Build a request around `data`. The header's data length is taken from `data`.
    pub fn new(stream_id: StreamId, stream_offset: StreamOffset, kind: PacketKind, data: Bytes) -> Self {
        let header = PacketHeader::new(stream_id, stream_offset, kind, data.len() as u64);
        Self { header, data }
    }

    /// Pair a decoded header with its payload region.
    ///
    /// Returns `None` if the payload length disagrees with the header.
    pub fn from_parts(header: PacketHeader, data: Bytes) -> Option<Self> {
        (header.data_length() == data.len() as u64).then_some(Self { header, data })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn stream_id(&self) -> StreamId {
        self.header.stream_id()
    }

    pub fn kind(&self) -> PacketKind {
        self.header.kind()
    }

    pub fn data_length(&self) -> u64 {
        self.header.data_length()
    }

    /// A fresh view of the payload. The region stays pinned until every view is dropped.
    pub fn slice(&self) -> Bytes {
        self.data.clone()
    }

    /// Give up the packet, keeping only the payload view.
    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// A reply packet with an owned payload.
///
/// This type is immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyPacket {
    header: ReplyHeader,
    data: Bytes,
}

impl ReplyPacket {
    /// Build a reply, copying `data` into owned memory.
    pub fn new(request: &PacketHeader, bytes_written: u64, success: bool, data: &[u8]) -> Self {
        let packet = PacketHeader::new(
            request.stream_id(),
            request.stream_offset(),
            request.kind(),
            data.len() as u64,
        );
        Self { header: ReplyHeader::new(packet, bytes_written, success), data: Bytes::copy_from_slice(data) }
    }

    /// Successful reply to `request`.
    pub fn success(request: &PacketHeader, bytes_written: u64) -> Self {
        Self::new(request, bytes_written, true, &[])
    }

    /// Failed reply to `request` carrying the reason as UTF-8.
    pub fn failure(request: &PacketHeader, bytes_written: u64, reason: &str) -> Self {
        Self::new(request, bytes_written, false, reason.as_bytes())
    }

    /// Pair a decoded header with a copy of its payload region.
    ///
    /// Returns `None` if the payload length disagrees with the header.
    pub fn from_parts(header: ReplyHeader, data: &[u8]) -> Option<Self> {
        (header.packet().data_length() == data.len() as u64)
            .then(|| Self { header, data: Bytes::copy_from_slice(data) })
    }

    pub fn header(&self) -> &ReplyHeader {
        &self.header
    }

    pub fn stream_id(&self) -> StreamId {
        self.header.packet().stream_id()
    }

    pub fn kind(&self) -> PacketKind {
        self.header.packet().kind()
    }

    pub fn bytes_written(&self) -> u64 {
        self.header.bytes_written()
    }

    pub fn is_success(&self) -> bool {
        self.header.is_success()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The failure reason of an unsuccessful reply.
    pub fn reason(&self) -> Option<String> {
        (!self.is_success()).then(|| String::from_utf8_lossy(&self.data).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_request_length_follows_data() {
        let request = RequestPacket::new(42, 100, PacketKind::StreamData, Bytes::from_static(b"hello"));
        assert_eq!(request.data_length(), 5);
        assert_eq!(request.header().stream_offset(), 100);
        assert_eq!(&request.slice()[..], b"hello");
    }

    #[test]
    fn test_request_slice_shares_memory() {
        let request = RequestPacket::new(1, 0, PacketKind::StreamData, Bytes::from(vec![7u8; 64]));
        let view = request.slice();
        assert_eq!(view.as_ptr(), request.slice().as_ptr());
        drop(request);
        // view stays valid after the packet is released
        assert_eq!(view.len(), 64);
    }

    #[test]
    fn test_from_parts_rejects_length_mismatch() {
        let header = PacketHeader::new(1, 0, PacketKind::StreamData, 10);
        assert!(RequestPacket::from_parts(header, Bytes::from_static(b"short")).is_none());
        let reply = ReplyHeader::new(header, 0, true);
        assert!(ReplyPacket::from_parts(reply, b"short").is_none());
    }

    #[test]
    fn test_validate_data_packet() {
        let empty = PacketHeader::new(9, 0, PacketKind::StreamData, 0);
        assert_matches!(empty.validate(1024), Err(MalformedHeaderError::EmptyData(9)));

        let huge = PacketHeader::new(9, 0, PacketKind::StreamData, 2048);
        assert_matches!(
            huge.validate(1024),
            Err(MalformedHeaderError::DataTooLong { len: 2048, max: 1024 })
        );

        // header and close packets may be empty
        assert!(PacketHeader::new(9, 0, PacketKind::StreamHeader, 0).validate(1024).is_ok());
        assert!(PacketHeader::new(9, 0, PacketKind::StreamClose, 0).validate(1024).is_ok());
    }

    #[test]
    fn test_validate_empty_reply() {
        let request = PacketHeader::new(9, 0, PacketKind::StreamData, 100);
        let reply = ReplyPacket::success(&request, 100);
        assert_eq!(reply.header().packet().data_length(), 0);
        assert!(reply.header().validate(1024).is_ok());

        let huge = ReplyHeader::new(PacketHeader::new(9, 0, PacketKind::StreamData, 2048), 0, false);
        assert_matches!(
            huge.validate(1024),
            Err(MalformedHeaderError::DataTooLong { len: 2048, max: 1024 })
        );
    }

    #[test]
    fn test_reply_mirrors_request() {
        let request = PacketHeader::new(42, 150, PacketKind::StreamClose, 0);
        let reply = ReplyPacket::success(&request, 150);
        assert_eq!(reply.stream_id(), 42);
        assert_eq!(reply.kind(), PacketKind::StreamClose);
        assert_eq!(reply.header().packet().stream_offset(), 150);
        assert!(reply.is_success());
        assert_eq!(reply.reason(), None);

        let failed = ReplyPacket::failure(&request, 100, "replica down");
        assert!(!failed.is_success());
        assert_eq!(failed.bytes_written(), 100);
        assert_eq!(failed.header().packet().data_length(), 12);
        assert_eq!(failed.reason().as_deref(), Some("replica down"));
    }
}
