//! Header codec: `[4-byte BE length][BCS header record]`.
//!
//! The codec never touches the data that follows a header. Exposing the data region is the
//! framer's job.

use crate::FrameResult;
use bytes::{BufMut as _, Bytes, BytesMut};
use ds_config::Parameters;
use ds_types::{MalformedHeaderError, PacketHeader, ReplyHeader};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Size of the big-endian length prefix in front of every header record.
pub const HEADER_LEN_PREFIX_SIZE: usize = 4;

/// A header record that can travel on the wire.
pub trait HeaderRecord: Serialize + DeserializeOwned + Copy + fmt::Debug + Send + 'static {
    /// The fields shared by requests and replies.
    fn packet_header(&self) -> &PacketHeader;

    /// Range checks applied after decoding.
    fn validate(&self, max_data_len: u64) -> Result<(), MalformedHeaderError>;
}

impl HeaderRecord for PacketHeader {
    fn packet_header(&self) -> &PacketHeader {
        self
    }

    fn validate(&self, max_data_len: u64) -> Result<(), MalformedHeaderError> {
        PacketHeader::validate(self, max_data_len)
    }
}

impl HeaderRecord for ReplyHeader {
    fn packet_header(&self) -> &PacketHeader {
        self.packet()
    }

    fn validate(&self, max_data_len: u64) -> Result<(), MalformedHeaderError> {
        ReplyHeader::validate(self, max_data_len)
    }
}

/// Stateless encoder/decoder for header records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderCodec {
    /// Largest accepted header record.
    max_header_len: usize,
    /// Largest accepted data length.
    max_data_len: u64,
}

impl HeaderCodec {
    /// Create a new instance of Self.
    pub fn new(max_header_len: usize, max_data_len: u64) -> Self {
        Self { max_header_len, max_data_len }
    }

    /// Codec with the limits configured in `parameters`.
    pub fn from_parameters(parameters: &Parameters) -> Self {
        Self::new(parameters.max_header_len, parameters.max_data_len)
    }

    pub fn max_data_len(&self) -> u64 {
        self.max_data_len
    }

    /// Encode the length prefix and header record.
    pub fn encode<H: HeaderRecord>(&self, header: &H) -> FrameResult<Bytes> {
        let record = bcs::to_bytes(header)?;
        if record.len() > self.max_header_len {
            return Err(MalformedHeaderError::HeaderTooLong {
                len: record.len(),
                max: self.max_header_len,
            }
            .into());
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN_PREFIX_SIZE + record.len());
        // NOTE: record length is bounded by max_header_len, far below u32::MAX
        buf.put_u32(record.len() as u32);
        buf.extend_from_slice(&record);
        Ok(buf.freeze())
    }

    /// Decode a header from `bytes`, which must start with the length prefix.
    ///
    /// Bytes after the header record are ignored.
    pub fn decode<H: HeaderRecord>(&self, bytes: &[u8]) -> Result<H, MalformedHeaderError> {
        let header_len = self.header_len(bytes)?.ok_or(MalformedHeaderError::Truncated {
            expected: HEADER_LEN_PREFIX_SIZE,
            found: bytes.len(),
        })?;
        let end = HEADER_LEN_PREFIX_SIZE + header_len;
        if bytes.len() < end {
            return Err(MalformedHeaderError::Truncated { expected: end, found: bytes.len() });
        }
        self.decode_record(&bytes[HEADER_LEN_PREFIX_SIZE..end])
    }

    /// Peek at the length prefix.
    ///
    /// Returns `None` if fewer than [HEADER_LEN_PREFIX_SIZE] bytes are available.
    pub fn header_len(&self, bytes: &[u8]) -> Result<Option<usize>, MalformedHeaderError> {
        let Some(prefix) = bytes.get(..HEADER_LEN_PREFIX_SIZE) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; HEADER_LEN_PREFIX_SIZE];
        len_bytes.copy_from_slice(prefix);
        // NOTE: u32 -> usize is lossless on supported targets
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            return Err(MalformedHeaderError::EmptyHeader);
        }
        if len > self.max_header_len {
            return Err(MalformedHeaderError::HeaderTooLong { len, max: self.max_header_len });
        }
        Ok(Some(len))
    }

    /// Decode and validate a header record without its length prefix.
    pub fn decode_record<H: HeaderRecord>(&self, record: &[u8]) -> Result<H, MalformedHeaderError> {
        let header: H =
            bcs::from_bytes(record).map_err(|e| MalformedHeaderError::Decode(e.to_string()))?;
        header.validate(self.max_data_len)?;
        Ok(header)
    }
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new(Parameters::DEFAULT_MAX_HEADER_LEN, Parameters::DEFAULT_MAX_DATA_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use ds_types::{PacketKind, ReplyPacket};

    #[test]
    fn test_request_header_roundtrip() {
        let codec = HeaderCodec::default();
        let header = PacketHeader::new(42, 100, PacketKind::StreamData, 50);

        let encoded = codec.encode(&header).expect("encode");
        let declared = u32::from_be_bytes(encoded[..4].try_into().unwrap()) as usize;
        assert_eq!(encoded.len(), HEADER_LEN_PREFIX_SIZE + declared);

        let decoded: PacketHeader = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_reply_header_extends_request_fields() {
        let codec = HeaderCodec::default();
        let packet = PacketHeader::new(42, 150, PacketKind::StreamClose, 0);
        let reply = ReplyHeader::new(packet, 150, true);

        let request_bytes = codec.encode(&packet).expect("encode request");
        let reply_bytes = codec.encode(&reply).expect("encode reply");
        // same leading fields, then bytes_written (8) and success (1)
        assert_eq!(reply_bytes.len(), request_bytes.len() + 9);
        assert_eq!(&reply_bytes[4..request_bytes.len()], &request_bytes[4..]);

        let decoded: ReplyHeader = codec.decode(&reply_bytes).expect("decode");
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_successful_reply_roundtrip_every_kind() {
        let codec = HeaderCodec::default();
        for (kind, len) in
            [(PacketKind::StreamHeader, 8), (PacketKind::StreamData, 100), (PacketKind::StreamClose, 0)]
        {
            let request = PacketHeader::new(42, 100, kind, len);
            let reply = ReplyPacket::success(&request, 200);
            let encoded = codec.encode(reply.header()).expect("encode");
            let decoded: ReplyHeader = codec.decode(&encoded).expect("decode");
            assert_eq!(&decoded, reply.header());
            assert_eq!(decoded.packet().kind(), kind);
            assert_eq!(decoded.packet().data_length(), 0);
        }
    }

    #[test]
    fn test_empty_data_request_is_malformed() {
        let codec = HeaderCodec::default();
        let header = PacketHeader::new(5, 0, PacketKind::StreamData, 0);
        let encoded = codec.encode(&header).expect("encode");
        assert_matches!(
            codec.decode::<PacketHeader>(&encoded),
            Err(MalformedHeaderError::EmptyData(5))
        );
    }

    #[test]
    fn test_unknown_kind_tag_is_malformed() {
        let codec = HeaderCodec::default();
        let header = PacketHeader::new(1, 0, PacketKind::StreamHeader, 0);
        let mut encoded = codec.encode(&header).expect("encode").to_vec();
        // kind tag follows stream_id (8) and stream_offset (8)
        encoded[HEADER_LEN_PREFIX_SIZE + 16] = 7;
        assert_matches!(codec.decode::<PacketHeader>(&encoded), Err(MalformedHeaderError::Decode(_)));
    }

    #[test]
    fn test_length_prefix_limits() {
        let codec = HeaderCodec::new(16, 1024);
        assert_matches!(codec.header_len(&[0, 0]), Ok(None));
        assert_matches!(codec.header_len(&[0, 0, 0, 0]), Err(MalformedHeaderError::EmptyHeader));
        assert_matches!(
            codec.header_len(&[0, 0, 0, 17]),
            Err(MalformedHeaderError::HeaderTooLong { len: 17, max: 16 })
        );
        assert_matches!(codec.header_len(&[0, 0, 0, 16, 0xff]), Ok(Some(16)));
    }

    #[test]
    fn test_decode_truncated_record() {
        let codec = HeaderCodec::default();
        let header = PacketHeader::new(1, 0, PacketKind::StreamClose, 0);
        let encoded = codec.encode(&header).expect("encode");
        assert_matches!(
            codec.decode::<PacketHeader>(&encoded[..encoded.len() - 1]),
            Err(MalformedHeaderError::Truncated { .. })
        );
    }

    #[test]
    fn test_decode_rejects_oversized_data_length() {
        let codec = HeaderCodec::new(1024, 100);
        let header = PacketHeader::new(3, 0, PacketKind::StreamData, 101);
        let encoded = HeaderCodec::default().encode(&header).expect("encode");
        assert_matches!(
            codec.decode::<PacketHeader>(&encoded),
            Err(MalformedHeaderError::DataTooLong { len: 101, max: 100 })
        );
    }

    #[test]
    fn test_encode_enforces_max_header_len() {
        let codec = HeaderCodec::new(8, 1024);
        let header = PacketHeader::new(3, 0, PacketKind::StreamHeader, 0);
        assert!(codec.encode(&header).is_err());
    }
}
