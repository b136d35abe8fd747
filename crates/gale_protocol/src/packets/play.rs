use std::io::Write;

use uuid::Uuid;

use crate::catalog::PacketKind;
use crate::text::TextComponent;
use crate::var_int::VarInt;
use crate::version::ProtocolVersion;
use crate::{Decode, Encode, Packet};

/// Keep-alive ids were an i32 on 1.7, a VarInt through 1.12.1, and an
/// i64 since 1.12.2.
fn encode_keepalive_id(id: i64, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
    if version.keepalive_is_long() {
        id.encode(w)
    } else if version >= ProtocolVersion::V1_8 {
        VarInt(id as i32).encode(w)
    } else {
        (id as i32).encode(&mut w)
    }
}

fn decode_keepalive_id(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<i64> {
    if version.keepalive_is_long() {
        i64::decode(r)
    } else if version >= ProtocolVersion::V1_8 {
        Ok(i64::from(VarInt::decode(r)?.0))
    } else {
        Ok(i64::from(i32::decode(r)?))
    }
}

#[derive(Copy, Clone, Debug)]
pub struct KeepAliveS2c {
    pub id: i64,
}

impl Packet for KeepAliveS2c {
    const KIND: PacketKind = PacketKind::KeepAliveS2c;
    const NAME: &'static str = "KeepAliveS2c";

    fn encode(&self, w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        encode_keepalive_id(self.id, w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: decode_keepalive_id(r, version)?,
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct KeepAliveC2s {
    pub id: i64,
}

impl Packet for KeepAliveC2s {
    const KIND: PacketKind = PacketKind::KeepAliveC2s;
    const NAME: &'static str = "KeepAliveC2s";

    fn encode(&self, w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        encode_keepalive_id(self.id, w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            id: decode_keepalive_id(r, version)?,
        })
    }
}

/// A kick in the play state.
#[derive(Clone, Debug)]
pub struct DisconnectS2c {
    pub reason: TextComponent,
}

impl Packet for DisconnectS2c {
    const KIND: PacketKind = PacketKind::DisconnectPlay;
    const NAME: &'static str = "DisconnectS2c";

    fn encode(&self, w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.reason.encode(w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            reason: TextComponent::decode(r, version)?,
        })
    }
}

/// Plugin message payloads had an i16 length prefix before 1.8.
fn encode_plugin_payload(
    data: &[u8],
    mut w: impl Write,
    version: ProtocolVersion,
) -> anyhow::Result<()> {
    if version < ProtocolVersion::V1_8 {
        anyhow::ensure!(
            i16::try_from(data.len()).is_ok(),
            "plugin message payload too large for pre-1.8"
        );
        (data.len() as i16).encode(&mut w)?;
    }
    Ok(w.write_all(data)?)
}

fn decode_plugin_payload(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Vec<u8>> {
    if version < ProtocolVersion::V1_8 {
        let len = i16::decode(r)?;
        anyhow::ensure!(len >= 0, "negative plugin payload length");
        let len = len as usize;
        anyhow::ensure!(len <= r.len(), "plugin payload overruns the input");

        let (data, remaining) = r.split_at(len);
        *r = remaining;
        Ok(data.to_vec())
    } else {
        Ok(std::mem::take(r).to_vec())
    }
}

#[derive(Clone, Debug)]
pub struct PluginMessageS2c {
    pub channel: String,
    pub data: Vec<u8>,
}

impl Packet for PluginMessageS2c {
    const KIND: PacketKind = PacketKind::PluginMessageS2c;
    const NAME: &'static str = "PluginMessageS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.channel.encode(&mut w)?;
        encode_plugin_payload(&self.data, w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            channel: String::decode(r)?,
            data: decode_plugin_payload(r, version)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct PluginMessageC2s {
    pub channel: String,
    pub data: Vec<u8>,
}

impl Packet for PluginMessageC2s {
    const KIND: PacketKind = PacketKind::PluginMessageC2s;
    const NAME: &'static str = "PluginMessageC2s";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.channel.encode(&mut w)?;
        encode_plugin_payload(&self.data, w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            channel: String::decode(r)?,
            data: decode_plugin_payload(r, version)?,
        })
    }
}

/// Toggles bundle buffering on the client.
#[derive(Copy, Clone, Debug)]
pub struct BundleDelimiterS2c;

impl Packet for BundleDelimiterS2c {
    const KIND: PacketKind = PacketKind::BundleDelimiter;
    const NAME: &'static str = "BundleDelimiterS2c";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// Sends the client back to the configuration phase.
#[derive(Copy, Clone, Debug)]
pub struct StartConfigurationS2c;

impl Packet for StartConfigurationS2c {
    const KIND: PacketKind = PacketKind::StartConfiguration;
    const NAME: &'static str = "StartConfigurationS2c";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct ConfigurationAckC2s;

impl Packet for ConfigurationAckC2s {
    const KIND: PacketKind = PacketKind::ConfigurationAck;
    const NAME: &'static str = "ConfigurationAckC2s";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// A chat line from the client. On 1.19+ the trailing signature
/// material is kept as opaque bytes.
#[derive(Clone, Debug)]
pub struct ChatMessageC2s {
    pub message: String,
    pub rest: Vec<u8>,
}

impl Packet for ChatMessageC2s {
    const KIND: PacketKind = PacketKind::ChatMessage;
    const NAME: &'static str = "ChatMessageC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.message.encode(&mut w)?;
        Ok(w.write_all(&self.rest)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            message: String::decode(r)?,
            rest: std::mem::take(r).to_vec(),
        })
    }
}

/// A slash command from the client (1.19+), without the leading slash.
#[derive(Clone, Debug)]
pub struct ChatCommandC2s {
    pub command: String,
    pub rest: Vec<u8>,
}

impl Packet for ChatCommandC2s {
    const KIND: PacketKind = PacketKind::ChatCommand;
    const NAME: &'static str = "ChatCommandC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.command.encode(&mut w)?;
        Ok(w.write_all(&self.rest)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            command: String::decode(r)?,
            rest: std::mem::take(r).to_vec(),
        })
    }
}

/// The signed command variant split out in 1.20.5.
#[derive(Clone, Debug)]
pub struct SignedChatCommandC2s {
    pub command: String,
    pub rest: Vec<u8>,
}

impl Packet for SignedChatCommandC2s {
    const KIND: PacketKind = PacketKind::SignedChatCommand;
    const NAME: &'static str = "SignedChatCommandC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.command.encode(&mut w)?;
        Ok(w.write_all(&self.rest)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            command: String::decode(r)?,
            rest: std::mem::take(r).to_vec(),
        })
    }
}

/// Unsigned server-to-client chat, 1.19+. `overlay` selects the action
/// bar.
#[derive(Clone, Debug)]
pub struct SystemChatS2c {
    pub content: TextComponent,
    pub overlay: bool,
}

impl Packet for SystemChatS2c {
    const KIND: PacketKind = PacketKind::SystemChat;
    const NAME: &'static str = "SystemChatS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.content.encode(&mut w, version)?;

        if version >= ProtocolVersion::V1_19_1 {
            self.overlay.encode(w)
        } else {
            // 1.19.0 uses a chat type id; 2 is the action bar.
            VarInt(if self.overlay { 2 } else { 1 }).encode(w)
        }
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let content = TextComponent::decode(r, version)?;

        let overlay = if version >= ProtocolVersion::V1_19_1 {
            bool::decode(r)?
        } else {
            VarInt::decode(r)?.0 == 2
        };

        Ok(Self { content, overlay })
    }
}

/// Server-to-client chat before 1.19. `position` 2 is the action bar.
#[derive(Clone, Debug)]
pub struct LegacyChatS2c {
    pub content: TextComponent,
    pub position: i8,
    pub sender: Uuid,
}

impl Packet for LegacyChatS2c {
    const KIND: PacketKind = PacketKind::LegacyChat;
    const NAME: &'static str = "LegacyChatS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.content.to_json_string().encode(&mut w)?;

        if version >= ProtocolVersion::V1_8 {
            self.position.encode(&mut w)?;
        }
        if version >= ProtocolVersion::V1_16 {
            self.sender.encode(w)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            content: TextComponent::from_json_str(<&str>::decode(r)?)?,
            position: if version >= ProtocolVersion::V1_8 {
                i8::decode(r)?
            } else {
                0
            },
            sender: if version >= ProtocolVersion::V1_16 {
                Uuid::decode(r)?
            } else {
                Uuid::nil()
            },
        })
    }
}

/// Replaces the tab list header and footer; the proxy clears both
/// during a server switch.
#[derive(Clone, Debug)]
pub struct TabListHeaderFooterS2c {
    pub header: TextComponent,
    pub footer: TextComponent,
}

impl Packet for TabListHeaderFooterS2c {
    const KIND: PacketKind = PacketKind::TabListHeaderFooter;
    const NAME: &'static str = "TabListHeaderFooterS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.header.encode(&mut w, version)?;
        self.footer.encode(w, version)
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            header: TextComponent::decode(r, version)?,
            footer: TextComponent::decode(r, version)?,
        })
    }
}

/// Hands the client to another host entirely (1.20.5+).
#[derive(Clone, Debug)]
pub struct TransferS2c {
    pub host: String,
    pub port: i32,
}

impl Packet for TransferS2c {
    const KIND: PacketKind = PacketKind::TransferPlay;
    const NAME: &'static str = "TransferS2c";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.host.encode(&mut w)?;
        VarInt(self.port).encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            host: String::decode(r)?,
            port: VarInt::decode(r)?.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_id_forms() {
        for (version, expected_len) in [
            (ProtocolVersion::V1_7_2, 4), // i32
            (ProtocolVersion::V1_8, 1),   // VarInt(5)
            (ProtocolVersion::V1_12_2, 8), // i64
            (ProtocolVersion::V1_21, 8),
        ] {
            let mut buf = vec![];
            KeepAliveS2c { id: 5 }.encode(&mut buf, version).unwrap();
            assert_eq!(buf.len(), expected_len, "{version}");

            let back = KeepAliveS2c::decode(&mut buf.as_slice(), version).unwrap();
            assert_eq!(back.id, 5);
        }
    }

    #[test]
    fn plugin_message_pre_1_8_prefix() {
        let pkt = PluginMessageC2s {
            channel: "BungeeCord".into(),
            data: vec![0, 1, 2, 3],
        };

        let mut old = vec![];
        pkt.encode(&mut old, ProtocolVersion::V1_7_2).unwrap();
        let mut new = vec![];
        pkt.encode(&mut new, ProtocolVersion::V1_8).unwrap();

        // The pre-1.8 form carries the extra i16 length.
        assert_eq!(old.len(), new.len() + 2);

        let back = PluginMessageC2s::decode(&mut old.as_slice(), ProtocolVersion::V1_7_2).unwrap();
        assert_eq!(back.data, pkt.data);
    }

    #[test]
    fn chat_keeps_signature_tail() {
        let mut buf = vec![];
        ChatMessageC2s {
            message: "hello".into(),
            rest: vec![9, 9, 9],
        }
        .encode(&mut buf, ProtocolVersion::V1_19_4)
        .unwrap();

        let back = ChatMessageC2s::decode(&mut buf.as_slice(), ProtocolVersion::V1_19_4).unwrap();
        assert_eq!(back.message, "hello");
        assert_eq!(back.rest, vec![9, 9, 9]);
    }
}
