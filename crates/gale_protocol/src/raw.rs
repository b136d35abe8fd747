use std::io::Write;
use std::mem;

use crate::{Decode, Encode};

/// The unframed tail of a packet body.
///
/// Several packets end in a blob whose length is implied by the frame
/// boundary rather than a prefix (plugin message payloads, login plugin
/// data). Encoding writes the bytes as-is; decoding takes everything
/// left in the input, leaving it empty.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct RawBytes<'a>(pub &'a [u8]);

impl Encode for RawBytes<'_> {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_all(self.0)?)
    }
}

impl<'a> Decode<'a> for RawBytes<'a> {
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self> {
        Ok(Self(mem::take(r)))
    }
}

impl<'a> From<&'a [u8]> for RawBytes<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }
}
