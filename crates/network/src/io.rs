//! Read and write packets over an async byte stream.

use crate::{FrameError, FrameResult, HeaderCodec, PacketFramer};
use bytes::BytesMut;
use ds_types::{ReplyPacket, RequestPacket};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Reads packets from the receive side of a connection.
///
/// Payloads of request packets are views into this reader's buffer. The buffer reclaims a
/// region once every view of it is dropped.
#[derive(Debug)]
pub struct PacketReader<R> {
    io: R,
    buffer: BytesMut,
    framer: PacketFramer,
    capacity: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Create a new instance of Self.
    pub fn new(io: R, codec: HeaderCodec, capacity: usize) -> Self {
        Self { io, buffer: BytesMut::with_capacity(capacity), framer: PacketFramer::new(codec), capacity }
    }

    /// Read the next request.
    ///
    /// Returns `None` if the peer closed the connection between packets.
    pub async fn read_request(&mut self) -> FrameResult<Option<RequestPacket>> {
        loop {
            if let Some(packet) = self.framer.try_extract_request(&mut self.buffer)? {
                return Ok(Some(packet));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Read the next reply.
    ///
    /// Returns `None` if the peer closed the connection between packets.
    pub async fn read_reply(&mut self) -> FrameResult<Option<ReplyPacket>> {
        loop {
            if let Some(packet) = self.framer.try_extract_reply(&mut self.buffer)? {
                return Ok(Some(packet));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    /// Read more bytes into the buffer. Returns false on a clean end of stream.
    async fn fill(&mut self) -> FrameResult<bool> {
        if self.buffer.capacity() == self.buffer.len() {
            self.buffer.reserve(self.capacity);
        }
        let read = self.io.read_buf(&mut self.buffer).await?;
        if read == 0 {
            if self.buffer.is_empty() {
                return Ok(false);
            }
            return Err(FrameError::Truncated(self.buffer.len()));
        }
        Ok(true)
    }
}

/// Writes packets to the send side of a connection.
#[derive(Debug)]
pub struct PacketWriter<W> {
    io: W,
    codec: HeaderCodec,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Create a new instance of Self.
    pub fn new(io: W, codec: HeaderCodec) -> Self {
        Self { io, codec }
    }

    /// Write a request. The header and payload go out as separate buffers.
    pub async fn write_request(&mut self, packet: &RequestPacket) -> FrameResult<()> {
        let header = self.codec.encode(packet.header())?;
        self.io.write_all(&header).await?;
        self.io.write_all(&packet.slice()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Write a reply.
    pub async fn write_reply(&mut self, packet: &ReplyPacket) -> FrameResult<()> {
        let header = self.codec.encode(packet.header())?;
        self.io.write_all(&header).await?;
        self.io.write_all(packet.data()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Shut down the write side.
    pub async fn shutdown(&mut self) -> FrameResult<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
