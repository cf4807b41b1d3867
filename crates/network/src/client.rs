//! Client side of the data stream protocol.

use crate::{FrameError, FrameResult, HeaderCodec, PacketReader, PacketWriter};
use bytes::Bytes;
use ds_config::Parameters;
use ds_types::{PacketKind, ReplyPacket, RequestPacket, StreamId, StreamOffset};
use std::net::SocketAddr;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tracing::debug;

/// A connection to a primary's client listener.
///
/// Requests are answered in order, one reply per request.
#[derive(Debug)]
pub struct DataStreamClient {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
}

impl DataStreamClient {
    /// Connect to the primary at `addr`.
    pub async fn connect(addr: SocketAddr, parameters: &Parameters) -> FrameResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let codec = HeaderCodec::from_parameters(parameters);
        debug!(target: "datastream::client", %addr, "connected");
        Ok(Self {
            reader: PacketReader::new(read, codec, parameters.read_buffer_capacity),
            writer: PacketWriter::new(write, codec),
        })
    }

    /// Send a request and wait for its reply.
    pub async fn send(&mut self, packet: RequestPacket) -> FrameResult<ReplyPacket> {
        self.writer.write_request(&packet).await?;
        self.reader.read_reply().await?.ok_or(FrameError::Closed)
    }

    /// Start writing stream `stream_id` at offset zero.
    pub fn stream(&mut self, stream_id: StreamId) -> DataStreamOutput<'_> {
        DataStreamOutput { client: self, stream_id, offset: 0 }
    }

    /// Close the write side of the connection.
    pub async fn shutdown(mut self) -> FrameResult<()> {
        self.writer.shutdown().await
    }
}

/// Writes one stream over a [DataStreamClient], tracking its offset.
#[derive(Debug)]
pub struct DataStreamOutput<'a> {
    client: &'a mut DataStreamClient,
    stream_id: StreamId,
    offset: StreamOffset,
}

impl DataStreamOutput<'_> {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Offset the next data packet will carry.
    pub fn offset(&self) -> StreamOffset {
        self.offset
    }

    /// Send `STREAM_HEADER` with optional metadata.
    pub async fn open(&mut self, metadata: Bytes) -> FrameResult<ReplyPacket> {
        self.send(RequestPacket::new(self.stream_id, 0, PacketKind::StreamHeader, metadata)).await
    }

    /// Send one `STREAM_DATA` packet. The offset advances when the primary acknowledges it.
    pub async fn write(&mut self, data: Bytes) -> FrameResult<ReplyPacket> {
        let len = data.len() as u64;
        let reply = self
            .send(RequestPacket::new(self.stream_id, self.offset, PacketKind::StreamData, data))
            .await?;
        if reply.is_success() {
            self.offset += len;
        }
        Ok(reply)
    }

    /// Send `STREAM_CLOSE` at the current offset.
    pub async fn close(&mut self) -> FrameResult<ReplyPacket> {
        self.send(RequestPacket::new(self.stream_id, self.offset, PacketKind::StreamClose, Bytes::new()))
            .await
    }

    /// Send an arbitrary packet on this stream's connection.
    pub async fn send(&mut self, packet: RequestPacket) -> FrameResult<ReplyPacket> {
        self.client.send(packet).await
    }
}
