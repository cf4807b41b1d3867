//! Extract complete frames from a receive buffer.
//!
//! Bytes arrive in arbitrary fragments. The framer peeks at the buffer and only consumes a
//! frame once all of it is present, so a partial frame leaves the buffer untouched for the
//! next attempt.

use crate::{codec::HeaderRecord, HeaderCodec, HEADER_LEN_PREFIX_SIZE};
use bytes::{Buf as _, BytesMut};
use ds_types::{MalformedHeaderError, PacketHeader, ReplyHeader, ReplyPacket, RequestPacket};
use tracing::trace;

/// Splits length-prefixed packets off a [BytesMut].
#[derive(Clone, Copy, Debug, Default)]
pub struct PacketFramer {
    codec: HeaderCodec,
}

impl PacketFramer {
    /// Create a new instance of Self.
    pub fn new(codec: HeaderCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &HeaderCodec {
        &self.codec
    }

    /// Extract one request packet.
    ///
    /// The payload is split off the buffer without copying.
    pub fn try_extract_request(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<RequestPacket>, MalformedHeaderError> {
        let Some((header, data_len)) = self.peek_frame::<PacketHeader>(buf)? else {
            return Ok(None);
        };
        let data = buf.split_to(data_len).freeze();
        trace!(target: "datastream::framer", %header, "extracted request");
        RequestPacket::from_parts(header, data).map(Some).ok_or(MalformedHeaderError::Truncated {
            expected: data_len,
            found: 0,
        })
    }

    /// Extract one reply packet.
    ///
    /// Reply payloads are small, so the region is copied and released right away.
    pub fn try_extract_reply(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<ReplyPacket>, MalformedHeaderError> {
        let Some((header, data_len)) = self.peek_frame::<ReplyHeader>(buf)? else {
            return Ok(None);
        };
        let reply = ReplyPacket::from_parts(header, &buf[..data_len]);
        buf.advance(data_len);
        trace!(target: "datastream::framer", header = %header.packet(), "extracted reply");
        reply.map(Some).ok_or(MalformedHeaderError::Truncated { expected: data_len, found: 0 })
    }

    /// Decode the header of the frame at the front of `buf` if the whole frame is buffered.
    ///
    /// On success the prefix and header record are consumed and the data length is returned.
    /// The buffer is untouched when `None` or an error is returned.
    fn peek_frame<H: HeaderRecord>(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(H, usize)>, MalformedHeaderError> {
        let Some(header_len) = self.codec.header_len(&buf[..])? else {
            return Ok(None);
        };
        let header_end = HEADER_LEN_PREFIX_SIZE + header_len;
        if buf.len() < header_end {
            return Ok(None);
        }

        let header: H = self.codec.decode_record(&buf[HEADER_LEN_PREFIX_SIZE..header_end])?;
        let declared = header.packet_header().data_length();
        let data_len = usize::try_from(declared).map_err(|_| MalformedHeaderError::DataTooLong {
            len: declared,
            max: self.codec.max_data_len(),
        })?;
        let frame_end = header_end.checked_add(data_len).ok_or(
            MalformedHeaderError::DataTooLong { len: declared, max: self.codec.max_data_len() },
        )?;
        if buf.len() < frame_end {
            // the reader grows the buffer as bytes arrive
            return Ok(None);
        }

        buf.advance(header_end);
        Ok(Some((header, data_len)))
    }
}
