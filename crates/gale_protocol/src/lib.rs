//! Wire-protocol primitives shared by every connection the proxy owns:
//! the framed codec stack, the version-aware packet catalog, and the
//! small set of packets the proxy inspects rather than forwards.

pub mod catalog;
pub mod decode;
pub mod encode;
mod impls;
pub mod nbt;
pub mod packets;
pub mod profile;
mod raw;
pub mod text;
pub mod var_int;
pub mod version;

use std::io::Write;

pub use catalog::{PacketKind, PacketSide, PacketState};
pub use decode::{PacketDecoder, PacketFrame};
pub use encode::PacketEncoder;
pub use raw::RawBytes;
pub use text::TextComponent;
pub use var_int::VarInt;
pub use version::ProtocolVersion;

/// The maximum number of bytes in a single Minecraft packet.
pub const MAX_PACKET_SIZE: i32 = 2097152;

/// How large a packet should be before it is compressed by the packet
/// encoder.
///
/// If the inner value is >= 0, then packets with encoded lengths >= to
/// this value will be compressed. If the value is negative, then
/// compression is disabled and no packets are compressed.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CompressionThreshold(pub i32);

impl CompressionThreshold {
    /// No compression.
    pub const DEFAULT: Self = Self(-1);
}

impl Default for CompressionThreshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i32> for CompressionThreshold {
    fn from(t: i32) -> Self {
        Self(t)
    }
}

/// The `Encode` trait allows objects to be written to the Minecraft
/// protocol. It is the inverse of [`Decode`].
///
/// Components are encoded in the order they appear in the type
/// definition.
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to
    /// this function returning `Ok(())` must always successfully
    /// [`decode`](Decode::decode) using the data that was written to the
    /// writer. The exact number of bytes that were originally written
    /// must be consumed during the decoding.
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;

    /// Like [`Encode::encode`], except that a whole slice of values is
    /// encoded with no leading length prefix.
    ///
    /// This exists so `u8` slices can be written in a single call while
    /// staying on stable Rust without impl specialization.
    fn encode_slice(slice: &[Self], mut w: impl Write) -> anyhow::Result<()>
    where
        Self: Sized,
    {
        for value in slice {
            value.encode(&mut w)?;
        }

        Ok(())
    }
}

/// The `Decode` trait allows objects to be read from the Minecraft
/// protocol. It is the inverse of [`Encode`].
///
/// `Decode` is parameterized by a lifetime. This allows the decoded
/// value to borrow data from the byte slice it was read from.
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice.
    ///
    /// Implementations must advance the slice past the bytes they
    /// consumed.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// A packet the proxy understands, as opposed to the opaque frames it
/// forwards verbatim.
///
/// Field layouts shift across protocol versions, so both halves take
/// the negotiated [`ProtocolVersion`]. The id on the wire is *not* part
/// of the body; it is resolved through the [`catalog`] from
/// [`Packet::KIND`].
pub trait Packet: Sized {
    /// The catalog entry identifying this packet.
    const KIND: PacketKind;

    /// The name of this packet for debugging purposes.
    const NAME: &'static str;

    fn encode(&self, w: impl Write, version: ProtocolVersion) -> anyhow::Result<()>;

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self>;
}
