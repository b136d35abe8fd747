use std::io::{Read, Write};

use anyhow::bail;
use byteorder::ReadBytesExt;
use thiserror::Error;

use crate::{Decode, Encode};

/// A protocol `i32` written in 7-bit groups, low bits first, with the
/// high bit of each byte flagging a continuation.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct VarInt(pub i32);

impl VarInt {
    /// A VarInt never spans more than five bytes on the wire.
    pub const MAX_SIZE: usize = 5;

    /// How many bytes [`Encode::encode`] will emit for this value.
    pub fn written_size(self) -> usize {
        match self.0 {
            0 => 1,
            n => (31 - n.leading_zeros() as usize) / 7 + 1,
        }
    }

    /// Decodes from a reader that may not hold a complete VarInt yet,
    /// telling a short read apart from a malformed one. The framer
    /// leans on this to know when to wait for more bytes.
    pub fn decode_partial(mut r: impl Read) -> Result<i32, VarIntDecodeError> {
        let mut val = 0;
        for i in 0..Self::MAX_SIZE {
            let byte = r.read_u8().map_err(|_| VarIntDecodeError::Incomplete)?;
            val |= (byte as i32 & 0b01111111) << (i * 7);
            if byte & 0b10000000 == 0 {
                return Ok(val);
            }
        }

        Err(VarIntDecodeError::TooLarge)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
pub enum VarIntDecodeError {
    #[error("incomplete VarInt decode")]
    Incomplete,
    #[error("VarInt is too large")]
    TooLarge,
}

impl Encode for VarInt {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        let mut remaining = self.0 as u32;

        loop {
            let byte = (remaining & 0b01111111) as u8;
            remaining >>= 7;

            if remaining == 0 {
                w.write_all(&[byte])?;
                return Ok(());
            }

            w.write_all(&[byte | 0b10000000])?;
        }
    }
}

impl Decode<'_> for VarInt {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let mut val = 0;
        for i in 0..Self::MAX_SIZE {
            let byte = r.read_u8()?;
            val |= (byte as i32 & 0b01111111) << (i * 7);
            if byte & 0b10000000 == 0 {
                return Ok(VarInt(val));
            }
        }
        bail!("VarInt is too large")
    }
}

impl From<i32> for VarInt {
    fn from(i: i32) -> Self {
        VarInt(i)
    }
}

impl From<VarInt> for i32 {
    fn from(i: VarInt) -> Self {
        i.0
    }
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    #[test]
    fn varint_written_size() {
        let mut rng = thread_rng();
        let mut buf = vec![];

        for n in (0..100_000)
            .map(|_| rng.gen())
            .chain([0, i32::MIN, i32::MAX])
            .map(VarInt)
        {
            buf.clear();
            n.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), n.written_size());
        }
    }

    #[test]
    fn varint_round_trip() {
        let mut rng = thread_rng();
        let mut buf = vec![];

        for n in (0..1_000_000)
            .map(|_| rng.gen())
            .chain([0, i32::MIN, i32::MAX])
        {
            VarInt(n).encode(&mut buf).unwrap();

            let mut slice = buf.as_slice();
            assert!(slice.len() <= VarInt::MAX_SIZE);

            assert_eq!(n, VarInt::decode(&mut slice).unwrap().0);

            assert!(slice.is_empty());
            buf.clear();
        }
    }

    #[test]
    fn varint_wire_layout() {
        // Known encodings from the protocol: single byte below 128,
        // continuation bit above, negatives always five bytes.
        let cases: [(i32, &[u8]); 5] = [
            (0, &[0x00]),
            (1, &[0x01]),
            (300, &[0xac, 0x02]),
            (2097151, &[0xff, 0xff, 0x7f]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        ];

        for (value, wire) in cases {
            let mut buf = vec![];
            VarInt(value).encode(&mut buf).unwrap();
            assert_eq!(buf, wire, "{value}");
        }
    }

    #[test]
    fn varint_incomplete_vs_oversize() {
        // A lone continuation byte is incomplete, not malformed.
        assert_eq!(
            VarInt::decode_partial(&mut &[0x80][..]),
            Err(VarIntDecodeError::Incomplete)
        );

        // Five continuation bytes can never terminate a valid VarInt.
        assert_eq!(
            VarInt::decode_partial(&mut &[0x80, 0x80, 0x80, 0x80, 0x80][..]),
            Err(VarIntDecodeError::TooLarge)
        );
    }
}
