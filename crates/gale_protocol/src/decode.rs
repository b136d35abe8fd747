#[cfg(feature = "encryption")]
use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockSizeUser, KeyIvInit};
use anyhow::{bail, ensure, Context};
use bytes::{Buf, BytesMut};

use crate::var_int::{VarInt, VarIntDecodeError};
use crate::version::ProtocolVersion;
#[cfg(feature = "compression")]
use crate::CompressionThreshold;
use crate::{Decode, Packet, MAX_PACKET_SIZE};

/// The AES block cipher with a 128 bit key, using the CFB-8 mode of
/// operation.
#[cfg(feature = "encryption")]
type Cipher = cfb8::Decryptor<aes::Aes128>;

/// Reassembles the inbound half of a connection into packet frames:
/// length-delimited, optionally decompressed, optionally decrypted.
#[derive(Default)]
pub struct PacketDecoder {
    buf: BytesMut,
    #[cfg(feature = "compression")]
    decompress_buf: BytesMut,
    #[cfg(feature = "compression")]
    threshold: CompressionThreshold,
    #[cfg(feature = "encryption")]
    cipher: Option<Cipher>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extracts the next whole frame from the internal buffer, or
    /// `None` if more data must arrive first.
    pub fn try_next_packet(&mut self) -> anyhow::Result<Option<PacketFrame>> {
        let mut r = &self.buf[..];

        let packet_len = match VarInt::decode_partial(&mut r) {
            Ok(len) => len,
            Err(VarIntDecodeError::Incomplete) => return Ok(None),
            Err(VarIntDecodeError::TooLarge) => bail!("malformed packet length VarInt"),
        };

        ensure!(
            (0..=MAX_PACKET_SIZE).contains(&packet_len),
            "packet length of {packet_len} is out of bounds"
        );

        if r.len() < packet_len as usize {
            // Not enough data arrived yet.
            return Ok(None);
        }

        let packet_len_len = VarInt(packet_len).written_size();

        let mut data;

        #[cfg(feature = "compression")]
        if self.threshold.0 >= 0 {
            use std::io::Write;

            use bytes::BufMut;
            use flate2::write::ZlibDecoder;

            r = &r[..packet_len as usize];

            let data_len = VarInt::decode(&mut r)?.0;

            ensure!(
                (0..MAX_PACKET_SIZE).contains(&data_len),
                "decompressed packet length of {data_len} is out of bounds"
            );

            if data_len > 0 {
                // Compressed frame; the declared length must hold.
                ensure!(
                    data_len > self.threshold.0,
                    "decompressed packet length of {data_len} is <= the compression threshold of \
                     {}",
                    self.threshold.0
                );

                debug_assert!(self.decompress_buf.is_empty());

                self.decompress_buf.put_bytes(0, data_len as usize);

                let mut z = ZlibDecoder::new(&mut self.decompress_buf[..]);

                z.write_all(r)
                    .context("decompressed packet length is longer than declared")?;

                ensure!(
                    z.finish()?.is_empty(),
                    "decompressed packet length is shorter than declared"
                );

                let total_packet_len = VarInt(packet_len).written_size() + packet_len as usize;

                self.buf.advance(total_packet_len);

                data = self.decompress_buf.split();
            } else {
                debug_assert_eq!(data_len, 0);

                ensure!(
                    r.len() <= self.threshold.0 as usize,
                    "uncompressed packet length of {} exceeds compression threshold of {}",
                    r.len(),
                    self.threshold.0
                );

                let remaining_len = r.len();

                self.buf.advance(packet_len_len + 1);

                data = self.buf.split_to(remaining_len);
            }
        } else {
            self.buf.advance(packet_len_len);
            data = self.buf.split_to(packet_len as usize);
        }

        #[cfg(not(feature = "compression"))]
        {
            self.buf.advance(packet_len_len);
            data = self.buf.split_to(packet_len as usize);
        }

        // Decode the leading packet ID.
        let mut body = &data[..];
        let packet_id = VarInt::decode(&mut body)
            .context("failed to decode packet ID")?
            .0;

        data.advance(data.len() - body.len());

        Ok(Some(PacketFrame {
            id: packet_id,
            body: data,
        }))
    }

    #[cfg(feature = "compression")]
    pub fn compression(&self) -> CompressionThreshold {
        self.threshold
    }

    #[cfg(feature = "compression")]
    pub fn set_compression(&mut self, threshold: CompressionThreshold) {
        self.threshold = threshold;
    }

    /// Enables the stream cipher. May only be called once; the protocol
    /// has no rekey.
    #[cfg(feature = "encryption")]
    pub fn enable_encryption(&mut self, key: &[u8; 16]) {
        assert!(self.cipher.is_none(), "encryption is already enabled");

        let mut cipher = Cipher::new_from_slices(key, key).expect("invalid key");

        // Don't forget to decrypt the data we already have.
        Self::decrypt_bytes(&mut cipher, &mut self.buf);

        self.cipher = Some(cipher);
    }

    /// Decrypts the provided byte slice in place using the cipher,
    /// without consuming the cipher.
    #[cfg(feature = "encryption")]
    fn decrypt_bytes(cipher: &mut Cipher, bytes: &mut [u8]) {
        for chunk in bytes.chunks_mut(Cipher::block_size()) {
            let gen_arr = GenericArray::from_mut_slice(chunk);
            cipher.decrypt_block_mut(gen_arr);
        }
    }

    pub fn queue_bytes(&mut self, mut bytes: BytesMut) {
        #![allow(unused_mut)]

        #[cfg(feature = "encryption")]
        if let Some(cipher) = &mut self.cipher {
            Self::decrypt_bytes(cipher, &mut bytes);
        }

        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        #[cfg(feature = "encryption")]
        let len = self.buf.len();

        self.buf.extend_from_slice(bytes);

        #[cfg(feature = "encryption")]
        if let Some(cipher) = &mut self.cipher {
            let slice = &mut self.buf[len..];
            Self::decrypt_bytes(cipher, slice);
        }
    }

    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

/// A raw frame extracted from the stream: the packet id plus the
/// undecoded body.
#[derive(Clone, Debug)]
pub struct PacketFrame {
    /// The ID of the decoded packet.
    pub id: i32,
    /// The contents of the packet after the leading VarInt ID.
    pub body: BytesMut,
}

impl PacketFrame {
    /// Decodes this frame's body as packet type `P`. The id must
    /// already have been matched against the catalog; this only checks
    /// that the body is fully consumed.
    pub fn decode<P: Packet>(&self, version: ProtocolVersion) -> anyhow::Result<P> {
        let mut r = &self.body[..];

        let pkt = P::decode(&mut r, version)
            .with_context(|| format!("failed to decode '{}'", P::NAME))?;

        ensure!(
            r.is_empty(),
            "missed {} bytes while decoding '{}'",
            r.len(),
            P::NAME
        );

        Ok(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::PacketEncoder;
    use crate::Encode;

    fn roundtrip_raw(threshold: i32, key: Option<[u8; 16]>, payloads: &[&[u8]]) {
        let mut enc = PacketEncoder::new();
        let mut dec = PacketDecoder::new();

        if threshold >= 0 {
            enc.set_compression(CompressionThreshold(threshold));
            dec.set_compression(CompressionThreshold(threshold));
        }

        if let Some(key) = key {
            enc.enable_encryption(&key);
            dec.enable_encryption(&key);
        }

        for payload in payloads {
            enc.append_raw_frame(payload).unwrap();
        }

        dec.queue_bytes(enc.take());

        for payload in payloads {
            let frame = dec.try_next_packet().unwrap().expect("frame missing");

            let mut expected = *payload;
            let id = VarInt::decode(&mut expected).unwrap().0;

            assert_eq!(frame.id, id);
            assert_eq!(&frame.body[..], expected);
        }

        assert!(dec.try_next_packet().unwrap().is_none());
    }

    #[test]
    fn frame_roundtrip_plain() {
        roundtrip_raw(-1, None, &[&[0x00, 1, 2, 3], &[0x10], &[0x7F; 300]]);
    }

    #[test]
    fn frame_roundtrip_compressed() {
        // One frame below the threshold, one far above.
        roundtrip_raw(64, None, &[&[0x05, 9, 9], &[0x22; 4096]]);
    }

    #[test]
    fn frame_roundtrip_encrypted() {
        roundtrip_raw(-1, Some([7; 16]), &[&[0x01, 0xAA], &[0x02, 0xBB, 0xCC]]);
        roundtrip_raw(256, Some([3; 16]), &[&[0x09; 2048]]);
    }

    #[test]
    fn oversize_frame_rejected() {
        let mut dec = PacketDecoder::new();

        let mut buf = vec![];
        VarInt(MAX_PACKET_SIZE + 1).encode(&mut buf).unwrap();
        dec.queue_slice(&buf);

        assert!(dec.try_next_packet().is_err());
    }

    #[test]
    fn max_size_frame_accepted() {
        let mut enc = PacketEncoder::new();

        // Frame length (id byte + body) is exactly MAX_PACKET_SIZE.
        let payload = vec![0u8; MAX_PACKET_SIZE as usize - 1];
        let mut frame = vec![0x55];
        frame.extend_from_slice(&payload);
        enc.append_raw_frame(&frame).unwrap();

        let mut dec = PacketDecoder::new();
        dec.queue_bytes(enc.take());

        let frame = dec.try_next_packet().unwrap().expect("frame missing");
        assert_eq!(frame.id, 0x55);
        assert_eq!(frame.body.len(), MAX_PACKET_SIZE as usize - 1);
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut enc = PacketEncoder::new();
        enc.append_raw_frame(&[0x03, 1, 2, 3, 4, 5]).unwrap();
        let bytes = enc.take();

        let mut dec = PacketDecoder::new();
        dec.queue_slice(&bytes[..3]);
        assert!(dec.try_next_packet().unwrap().is_none());

        dec.queue_slice(&bytes[3..]);
        assert!(dec.try_next_packet().unwrap().is_some());
    }

    #[test]
    fn declared_decompressed_length_must_match() {
        use std::io::Read;

        use flate2::bufread::ZlibEncoder;
        use flate2::Compression;

        // Hand-build a compressed frame that lies about its
        // decompressed size.
        let body = vec![0xAB_u8; 512];
        let mut z = ZlibEncoder::new(&body[..], Compression::new(6));
        let mut compressed = vec![];
        z.read_to_end(&mut compressed).unwrap();

        let mut inner = vec![];
        VarInt(1024).encode(&mut inner).unwrap(); // wrong: actual is 512
        inner.extend_from_slice(&compressed);

        let mut wire = vec![];
        VarInt(inner.len() as i32).encode(&mut wire).unwrap();
        wire.extend_from_slice(&inner);

        let mut dec = PacketDecoder::new();
        dec.set_compression(CompressionThreshold(64));
        dec.queue_slice(&wire);

        assert!(dec.try_next_packet().is_err());
    }
}
