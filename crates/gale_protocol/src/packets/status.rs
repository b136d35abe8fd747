use std::io::Write;

use crate::catalog::PacketKind;
use crate::version::ProtocolVersion;
use crate::{Decode, Encode, Packet};

#[derive(Copy, Clone, Debug)]
pub struct StatusRequestC2s;

impl Packet for StatusRequestC2s {
    const KIND: PacketKind = PacketKind::StatusRequest;
    const NAME: &'static str = "StatusRequestC2s";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// The server-list response; the payload is the status JSON document.
#[derive(Clone, Debug)]
pub struct StatusResponseS2c {
    pub json: String,
}

impl Packet for StatusResponseS2c {
    const KIND: PacketKind = PacketKind::StatusResponse;
    const NAME: &'static str = "StatusResponseS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.json.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            json: String::decode(r)?,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StatusPingC2s {
    pub payload: i64,
}

impl Packet for StatusPingC2s {
    const KIND: PacketKind = PacketKind::StatusPing;
    const NAME: &'static str = "StatusPingC2s";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.payload.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            payload: i64::decode(r)?,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StatusPongS2c {
    pub payload: i64,
}

impl Packet for StatusPongS2c {
    const KIND: PacketKind = PacketKind::StatusPong;
    const NAME: &'static str = "StatusPongS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.payload.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            payload: i64::decode(r)?,
        })
    }
}
