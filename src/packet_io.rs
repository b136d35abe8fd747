//! Sequential packet IO used before a connection enters its steady
//! session loop, plus the byte-pump writer task the session feeds.

use std::io;
use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use gale_protocol::{
    CompressionThreshold, Packet, PacketDecoder, PacketEncoder, PacketFrame, ProtocolVersion,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

pub const READ_BUF_SIZE: usize = 4096;

/// A connection still being handled step by step: the handshake,
/// status, and login exchanges, and the proxy-side backend dial.
pub struct PacketIo {
    stream: TcpStream,
    enc: PacketEncoder,
    dec: PacketDecoder,
    read_timeout: Duration,
}

impl PacketIo {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> Self {
        Self {
            stream,
            enc: PacketEncoder::new(),
            dec: PacketDecoder::new(),
            read_timeout,
        }
    }

    pub async fn send_packet<P: Packet>(
        &mut self,
        pkt: &P,
        version: ProtocolVersion,
    ) -> anyhow::Result<()> {
        self.enc.append_packet(pkt, version)?;
        let bytes = self.enc.take();
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Reads the next whole frame. EOF surfaces as an
    /// `UnexpectedEof` IO error.
    pub async fn recv_frame(&mut self) -> anyhow::Result<PacketFrame> {
        loop {
            if let Some(frame) = self.dec.try_next_packet()? {
                return Ok(frame);
            }

            self.dec.reserve(READ_BUF_SIZE);
            let mut buf = self.dec.take_capacity();

            let read = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut buf))
                .await
                .map_err(|_| io::Error::new(ErrorKind::TimedOut, "read timed out"))??;

            if read == 0 {
                return Err(io::Error::from(ErrorKind::UnexpectedEof).into());
            }

            // O(1) unsplit: the capacity was reserved on the decoder's
            // buffer before the read.
            self.dec.queue_bytes(buf);
        }
    }

    /// Reads and decodes a frame that must be packet `P`.
    pub async fn recv_packet<P: Packet>(&mut self, version: ProtocolVersion) -> anyhow::Result<P> {
        let frame = self.recv_frame().await?;

        let expected = P::KIND
            .id(version)
            .ok_or_else(|| anyhow::anyhow!("packet '{}' does not exist at {version}", P::NAME))?;

        anyhow::ensure!(
            frame.id == expected,
            "expected '{}' (id {expected:#04x}), got id {:#04x}",
            P::NAME,
            frame.id
        );

        frame.decode(version)
    }

    pub fn set_compression(&mut self, threshold: CompressionThreshold) {
        self.enc.set_compression(threshold);
        self.dec.set_compression(threshold);
    }

    pub fn set_compression_level(&mut self, level: u32) {
        self.enc.set_compression_level(level);
    }

    pub fn enable_encryption(&mut self, key: &[u8; 16]) {
        self.enc.enable_encryption(key);
        self.dec.enable_encryption(key);
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Splits into the session-loop halves, keeping whatever codec
    /// state (threshold, cipher, buffered bytes) was negotiated.
    pub fn into_parts(self) -> (tokio::net::tcp::OwnedReadHalf, OwnedWriteHalf, PacketDecoder, PacketEncoder) {
        let (reader, writer) = self.stream.into_split();
        (reader, writer, self.dec, self.enc)
    }
}

/// Spawns the write pump for one socket. The session encodes frames
/// and hands finished byte chunks over; the pump exists only so a slow
/// peer cannot stall the session loop.
pub fn spawn_byte_writer(mut writer: OwnedWriteHalf) -> mpsc::Sender<BytesMut> {
    let (tx, mut rx) = mpsc::channel::<BytesMut>(64);

    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("error writing to stream: {e}");
                break;
            }
        }

        // Channel closed or write failed: drop the half, sending FIN.
        let _ = writer.shutdown().await;
    });

    tx
}
