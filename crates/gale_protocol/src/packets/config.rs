use std::io::Write;

use uuid::Uuid;

use crate::catalog::PacketKind;
use crate::text::TextComponent;
use crate::var_int::VarInt;
use crate::version::ProtocolVersion;
use crate::{Decode, Encode, Packet};

/// Ends the configuration phase; the client answers with
/// [`FinishConfigAckC2s`].
#[derive(Copy, Clone, Debug)]
pub struct FinishConfigurationS2c;

impl Packet for FinishConfigurationS2c {
    const KIND: PacketKind = PacketKind::ConfigFinish;
    const NAME: &'static str = "FinishConfigurationS2c";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct FinishConfigAckC2s;

impl Packet for FinishConfigAckC2s {
    const KIND: PacketKind = PacketKind::ConfigFinishAck;
    const NAME: &'static str = "FinishConfigAckC2s";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ConfigKeepAliveS2c {
    pub id: i64,
}

impl Packet for ConfigKeepAliveS2c {
    const KIND: PacketKind = PacketKind::ConfigKeepAliveS2c;
    const NAME: &'static str = "ConfigKeepAliveS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.id.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: i64::decode(r)?,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ConfigKeepAliveC2s {
    pub id: i64,
}

impl Packet for ConfigKeepAliveC2s {
    const KIND: PacketKind = PacketKind::ConfigKeepAliveC2s;
    const NAME: &'static str = "ConfigKeepAliveC2s";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.id.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: i64::decode(r)?,
        })
    }
}

/// A kick during configuration.
#[derive(Clone, Debug)]
pub struct ConfigDisconnectS2c {
    pub reason: TextComponent,
}

impl Packet for ConfigDisconnectS2c {
    const KIND: PacketKind = PacketKind::ConfigDisconnect;
    const NAME: &'static str = "ConfigDisconnectS2c";

    fn encode(&self, w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.reason.encode(w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            reason: TextComponent::decode(r, version)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ConfigPluginMessageS2c {
    pub channel: String,
    pub data: Vec<u8>,
}

impl Packet for ConfigPluginMessageS2c {
    const KIND: PacketKind = PacketKind::ConfigPluginMessageS2c;
    const NAME: &'static str = "ConfigPluginMessageS2c";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.channel.encode(&mut w)?;
        Ok(w.write_all(&self.data)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            channel: String::decode(r)?,
            data: std::mem::take(r).to_vec(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ConfigPluginMessageC2s {
    pub channel: String,
    pub data: Vec<u8>,
}

impl Packet for ConfigPluginMessageC2s {
    const KIND: PacketKind = PacketKind::ConfigPluginMessageC2s;
    const NAME: &'static str = "ConfigPluginMessageC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.channel.encode(&mut w)?;
        Ok(w.write_all(&self.data)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            channel: String::decode(r)?,
            data: std::mem::take(r).to_vec(),
        })
    }
}

/// Pushes a resource pack during configuration.
#[derive(Clone, Debug)]
pub struct AddResourcePackS2c {
    pub id: Uuid,
    pub url: String,
    pub hash: String,
    pub forced: bool,
    pub prompt: Option<TextComponent>,
}

impl Packet for AddResourcePackS2c {
    const KIND: PacketKind = PacketKind::ConfigResourcePackAdd;
    const NAME: &'static str = "AddResourcePackS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        if version >= ProtocolVersion::V1_20_3 {
            self.id.encode(&mut w)?;
        }
        self.url.encode(&mut w)?;
        self.hash.encode(&mut w)?;
        self.forced.encode(&mut w)?;
        match &self.prompt {
            Some(prompt) => {
                true.encode(&mut w)?;
                prompt.encode(w, version)
            }
            None => false.encode(w),
        }
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: if version >= ProtocolVersion::V1_20_3 {
                Uuid::decode(r)?
            } else {
                Uuid::nil()
            },
            url: String::decode(r)?,
            hash: String::decode(r)?,
            forced: bool::decode(r)?,
            prompt: match bool::decode(r)? {
                true => Some(TextComponent::decode(r, version)?),
                false => None,
            },
        })
    }
}

/// Removes one pack, or all of them when `id` is `None`.
#[derive(Clone, Debug)]
pub struct RemoveResourcePackS2c {
    pub id: Option<Uuid>,
}

impl Packet for RemoveResourcePackS2c {
    const KIND: PacketKind = PacketKind::ConfigResourcePackRemove;
    const NAME: &'static str = "RemoveResourcePackS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.id.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: Option::<Uuid>::decode(r)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ResourcePackResponseC2s {
    pub id: Option<Uuid>,
    pub result: i32,
}

impl Packet for ResourcePackResponseC2s {
    const KIND: PacketKind = PacketKind::ConfigResourcePackResponse;
    const NAME: &'static str = "ResourcePackResponseC2s";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        if version >= ProtocolVersion::V1_20_3 {
            self.id.unwrap_or_else(Uuid::nil).encode(&mut w)?;
        }
        VarInt(self.result).encode(w)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: if version >= ProtocolVersion::V1_20_3 {
                Some(Uuid::decode(r)?)
            } else {
                None
            },
            result: VarInt::decode(r)?.0,
        })
    }
}

/// A labeled link shown on the client's pause screen.
#[derive(Clone, Debug)]
pub enum ServerLinkLabel {
    /// One of the client's built-in labels (bug report, support, ...).
    BuiltIn(i32),
    Component(TextComponent),
}

#[derive(Clone, Debug)]
pub struct ServerLink {
    pub label: ServerLinkLabel,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct ServerLinksS2c {
    pub links: Vec<ServerLink>,
}

impl Packet for ServerLinksS2c {
    const KIND: PacketKind = PacketKind::ConfigServerLinks;
    const NAME: &'static str = "ServerLinksS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        VarInt(self.links.len() as i32).encode(&mut w)?;

        for link in &self.links {
            match &link.label {
                ServerLinkLabel::BuiltIn(id) => {
                    true.encode(&mut w)?;
                    VarInt(*id).encode(&mut w)?;
                }
                ServerLinkLabel::Component(text) => {
                    false.encode(&mut w)?;
                    text.encode(&mut w, version)?;
                }
            }
            link.url.encode(&mut w)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let len = VarInt::decode(r)?.0;
        anyhow::ensure!(len >= 0, "negative server link count");

        let mut links = Vec::with_capacity((len as usize).min(64));
        for _ in 0..len {
            let label = match bool::decode(r)? {
                true => ServerLinkLabel::BuiltIn(VarInt::decode(r)?.0),
                false => ServerLinkLabel::Component(TextComponent::decode(r, version)?),
            };
            links.push(ServerLink {
                label,
                url: String::decode(r)?,
            });
        }

        Ok(Self { links })
    }
}
