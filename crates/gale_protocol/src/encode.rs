#[cfg(feature = "encryption")]
use aes::cipher::generic_array::GenericArray;
#[cfg(feature = "encryption")]
use aes::cipher::{BlockEncryptMut, BlockSizeUser, KeyIvInit};
use anyhow::{ensure, Context};
use bytes::{BufMut, BytesMut};

use crate::decode::PacketFrame;
use crate::var_int::VarInt;
use crate::version::ProtocolVersion;
#[cfg(feature = "compression")]
use crate::CompressionThreshold;
use crate::{Encode, Packet, MAX_PACKET_SIZE};

/// The AES block cipher with a 128 bit key, using the CFB-8 mode of
/// operation.
#[cfg(feature = "encryption")]
type Cipher = cfb8::Encryptor<aes::Aes128>;

/// Assembles the outbound half of a connection: frames are appended to
/// an internal buffer and flushed with [`take`](Self::take), which
/// applies the cipher.
#[derive(Default)]
pub struct PacketEncoder {
    buf: BytesMut,
    #[cfg(feature = "compression")]
    compress_buf: Vec<u8>,
    #[cfg(feature = "compression")]
    threshold: CompressionThreshold,
    /// zlib level 0-9; `None` is the balanced default.
    #[cfg(feature = "compression")]
    level: Option<u32>,
    #[cfg(feature = "encryption")]
    cipher: Option<Cipher>,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames the bytes from `from` to the end of the buffer: prepends
    /// the packet length VarInt and, when compression is on, the data
    /// length VarInt plus the deflated body.
    fn enframe_from(&mut self, from: usize) -> anyhow::Result<()> {
        let data_len = self.buf.len() - from;

        #[cfg(feature = "compression")]
        if self.threshold.0 >= 0 {
            use std::io::Read;

            use flate2::bufread::ZlibEncoder;
            use flate2::Compression;

            if data_len > self.threshold.0 as usize {
                let level = Compression::new(self.level.unwrap_or(4));
                let mut z = ZlibEncoder::new(&self.buf[from..], level);

                self.compress_buf.clear();

                let data_len_size = VarInt(data_len as i32).written_size();

                let packet_len = data_len_size + z.read_to_end(&mut self.compress_buf)?;

                ensure!(
                    packet_len <= MAX_PACKET_SIZE as usize,
                    "packet exceeds maximum length"
                );

                drop(z);

                self.buf.truncate(from);

                let mut writer = (&mut self.buf).writer();

                VarInt(packet_len as i32).encode(&mut writer)?;
                VarInt(data_len as i32).encode(&mut writer)?;
                self.buf.extend_from_slice(&self.compress_buf);
            } else {
                let data_len_size = 1;
                let packet_len = data_len_size + data_len;

                ensure!(
                    packet_len <= MAX_PACKET_SIZE as usize,
                    "packet exceeds maximum length"
                );

                let packet_len_size = VarInt(packet_len as i32).written_size();

                let data_prefix_len = packet_len_size + data_len_size;

                self.buf.put_bytes(0, data_prefix_len);
                self.buf
                    .copy_within(from..from + data_len, from + data_prefix_len);

                let mut front = &mut self.buf[from..];

                VarInt(packet_len as i32).encode(&mut front)?;
                // Zero for no compression on this packet.
                VarInt(0).encode(front)?;
            }

            return Ok(());
        }

        let packet_len = data_len;

        ensure!(
            packet_len <= MAX_PACKET_SIZE as usize,
            "packet exceeds maximum length"
        );

        let packet_len_size = VarInt(packet_len as i32).written_size();

        self.buf.put_bytes(0, packet_len_size);
        self.buf
            .copy_within(from..from + data_len, from + packet_len_size);

        let front = &mut self.buf[from..];
        VarInt(packet_len as i32).encode(front)?;

        Ok(())
    }

    fn move_to_front(&mut self, from: usize) {
        // 1) Grow by the length of the new packet.
        // 2) Shift the old contents back.
        // 3) Move the new packet into the space at the front.
        let to = self.buf.len();
        let len = to - from;

        self.buf.put_bytes(0, len);
        self.buf.copy_within(..to, len);
        self.buf.copy_within(to.., 0);
        self.buf.truncate(to);
    }

    /// Encodes a typed packet, resolving its id through the catalog for
    /// `version`.
    pub fn append_packet<P: Packet>(
        &mut self,
        pkt: &P,
        version: ProtocolVersion,
    ) -> anyhow::Result<()> {
        let id = P::KIND
            .id(version)
            .with_context(|| format!("packet '{}' does not exist at {version}", P::NAME))?;

        let start_len = self.buf.len();
        let mut writer = (&mut self.buf).writer();

        VarInt(id).encode(&mut writer)?;
        pkt.encode(&mut writer, version)?;

        self.enframe_from(start_len)
    }

    /// Like [`append_packet`](Self::append_packet), but the packet ends
    /// up *before* everything already buffered.
    pub fn prepend_packet<P: Packet>(
        &mut self,
        pkt: &P,
        version: ProtocolVersion,
    ) -> anyhow::Result<()> {
        let start_len = self.buf.len();
        self.append_packet(pkt, version)?;
        self.move_to_front(start_len);
        Ok(())
    }

    /// Re-frames a decoded frame for this connection's parameters. Used
    /// when relaying opaque packets between the two halves of a proxy
    /// session.
    pub fn append_packet_frame(&mut self, frame: &PacketFrame) -> anyhow::Result<()> {
        let start_len = self.buf.len();
        VarInt(frame.id).encode((&mut self.buf).writer())?;
        self.buf.extend_from_slice(&frame.body);
        self.enframe_from(start_len)
    }

    /// Frames `body` (a VarInt id followed by the payload) verbatim.
    pub fn append_raw_frame(&mut self, body: &[u8]) -> anyhow::Result<()> {
        let start_len = self.buf.len();
        self.buf.extend_from_slice(body);
        self.enframe_from(start_len)
    }

    /// Takes all the packets written so far and encrypts them if
    /// encryption is enabled.
    pub fn take(&mut self) -> BytesMut {
        #[cfg(feature = "encryption")]
        if let Some(cipher) = &mut self.cipher {
            for chunk in self.buf.chunks_mut(Cipher::block_size()) {
                let gen_arr = GenericArray::from_mut_slice(chunk);
                cipher.encrypt_block_mut(gen_arr);
            }
        }

        self.buf.split()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg(feature = "compression")]
    pub fn set_compression(&mut self, threshold: CompressionThreshold) {
        self.threshold = threshold;
    }

    /// Overrides the zlib level (0-9) used above the threshold.
    #[cfg(feature = "compression")]
    pub fn set_compression_level(&mut self, level: u32) {
        self.level = Some(level.min(9));
    }

    /// Initializes the cipher with the given key. All future packets
    /// **and any that have not been [taken](Self::take) yet** are
    /// encrypted.
    ///
    /// # Panics
    ///
    /// Panics if encryption is already enabled.
    #[cfg(feature = "encryption")]
    pub fn enable_encryption(&mut self, key: &[u8; 16]) {
        assert!(self.cipher.is_none(), "encryption is already enabled");
        self.cipher = Some(Cipher::new_from_slices(key, key).expect("invalid key"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::PacketDecoder;

    #[test]
    fn prepend_orders_before_append() {
        let mut enc = PacketEncoder::new();

        enc.append_raw_frame(&[0x02, 1]).unwrap();

        // Inject a frame ahead of everything already buffered.
        let start_len = enc.buf.len();
        enc.append_raw_frame(&[0x01]).unwrap();
        enc.move_to_front(start_len);

        let mut dec = PacketDecoder::new();
        dec.queue_bytes(enc.take());

        assert_eq!(dec.try_next_packet().unwrap().unwrap().id, 0x01);
        assert_eq!(dec.try_next_packet().unwrap().unwrap().id, 0x02);
    }

    #[test]
    fn reframe_across_thresholds() {
        // Relay a frame decoded from an uncompressed link onto a
        // compressed one.
        let mut enc = PacketEncoder::new();
        let payload = {
            let mut body = vec![0x2A];
            body.extend_from_slice(&[0xEE; 700]);
            body
        };
        enc.append_raw_frame(&payload).unwrap();

        let mut dec = PacketDecoder::new();
        dec.queue_bytes(enc.take());
        let frame = dec.try_next_packet().unwrap().unwrap();

        let mut enc2 = PacketEncoder::new();
        enc2.set_compression(CompressionThreshold(128));
        enc2.append_packet_frame(&frame).unwrap();

        let mut dec2 = PacketDecoder::new();
        dec2.set_compression(CompressionThreshold(128));
        dec2.queue_bytes(enc2.take());

        let relayed = dec2.try_next_packet().unwrap().unwrap();
        assert_eq!(relayed.id, 0x2A);
        assert_eq!(relayed.body, frame.body);
    }
}
