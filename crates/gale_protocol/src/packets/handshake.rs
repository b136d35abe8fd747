use std::io::Write;

use anyhow::bail;

use crate::catalog::PacketKind;
use crate::var_int::VarInt;
use crate::version::ProtocolVersion;
use crate::{Decode, Encode, Packet};

/// The state the client wants to continue in after the handshake.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum NextState {
    Status,
    Login,
    /// A protocol-level transfer from another server; continues in
    /// LOGIN.
    Transfer,
}

/// The first packet of every connection.
#[derive(Clone, Debug)]
pub struct HandshakeC2s {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Packet for HandshakeC2s {
    const KIND: PacketKind = PacketKind::Handshake;
    const NAME: &'static str = "HandshakeC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        VarInt(self.protocol_version).encode(&mut w)?;
        self.server_address.encode(&mut w)?;
        self.server_port.encode(&mut w)?;

        let next = match self.next_state {
            NextState::Status => 1,
            NextState::Login => 2,
            NextState::Transfer => 3,
        };
        VarInt(next).encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        let protocol_version = VarInt::decode(r)?.0;
        let server_address = String::decode(r)?;
        let server_port = u16::decode(r)?;

        let next_state = match VarInt::decode(r)?.0 {
            1 => NextState::Status,
            2 => NextState::Login,
            3 => NextState::Transfer,
            n => bail!("invalid next state {n}"),
        };

        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trip() {
        let pkt = HandshakeC2s {
            protocol_version: ProtocolVersion::V1_21.number(),
            server_address: "play.example.org".into(),
            server_port: 25565,
            next_state: NextState::Login,
        };

        let mut buf = vec![];
        pkt.encode(&mut buf, ProtocolVersion::V1_21).unwrap();

        let mut r = buf.as_slice();
        let back = HandshakeC2s::decode(&mut r, ProtocolVersion::V1_21).unwrap();
        assert!(r.is_empty());

        assert_eq!(back.protocol_version, pkt.protocol_version);
        assert_eq!(back.server_address, pkt.server_address);
        assert_eq!(back.server_port, pkt.server_port);
        assert_eq!(back.next_state, pkt.next_state);
    }

    #[test]
    fn transfer_intent_decodes() {
        let mut buf = vec![];
        HandshakeC2s {
            protocol_version: ProtocolVersion::V1_20_5.number(),
            server_address: "hub".into(),
            server_port: 25577,
            next_state: NextState::Transfer,
        }
        .encode(&mut buf, ProtocolVersion::V1_20_5)
        .unwrap();

        let back = HandshakeC2s::decode(&mut buf.as_slice(), ProtocolVersion::V1_20_5).unwrap();
        assert_eq!(back.next_state, NextState::Transfer);
    }
}
