//! The packet catalog: a static table resolving
//! `(state, direction, protocol version)` to numeric packet ids.
//!
//! Ids are recorded *step-wise*: each packet carries the list of
//! versions at which its id changed, and the effective id for a version
//! is the latest step at or below it. A negative id marks the version
//! at which the packet left the protocol.

use crate::version::ProtocolVersion;

/// The protocol stage a connection is in.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PacketState {
    Handshake,
    Status,
    Login,
    Config,
    Play,
}

/// Which endpoint emits a packet.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PacketSide {
    /// Client to server.
    Serverbound,
    /// Server to client.
    Clientbound,
}

macro_rules! packet_catalog {
    (
        $(
            $kind:ident, $state:ident, $side:ident => [$(($from:ident, $id:expr)),+ $(,)?];
        )*
    ) => {
        /// Every packet the proxy can name. Packets not listed here are
        /// opaque frames forwarded verbatim.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        pub enum PacketKind {
            $($kind,)*
        }

        impl PacketKind {
            pub const ALL: &'static [Self] = &[$(Self::$kind,)*];

            pub const fn state(self) -> PacketState {
                match self {
                    $(Self::$kind => PacketState::$state,)*
                }
            }

            pub const fn side(self) -> PacketSide {
                match self {
                    $(Self::$kind => PacketSide::$side,)*
                }
            }

            fn mappings(self) -> &'static [(ProtocolVersion, i32)] {
                match self {
                    $(Self::$kind => &[$((ProtocolVersion::$from, $id),)+],)*
                }
            }
        }
    };
}

impl PacketKind {
    /// The wire id of this packet at `version`, or `None` if the packet
    /// does not exist there.
    pub fn id(self, version: ProtocolVersion) -> Option<i32> {
        let mut resolved = None;

        for &(from, id) in self.mappings() {
            if from > version {
                break;
            }
            resolved = (id >= 0).then_some(id);
        }

        resolved
    }
}

/// Resolves an incoming frame's id to a known packet, or `None` for the
/// frames the proxy forwards opaquely.
pub fn lookup(
    state: PacketState,
    side: PacketSide,
    version: ProtocolVersion,
    id: i32,
) -> Option<PacketKind> {
    PacketKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.state() == state && kind.side() == side)
        .find(|kind| kind.id(version) == Some(id))
}

packet_catalog! {
    // Handshake.
    Handshake, Handshake, Serverbound => [(V1_7_2, 0x00)];

    // Status.
    StatusRequest, Status, Serverbound => [(V1_7_2, 0x00)];
    StatusPing, Status, Serverbound => [(V1_7_2, 0x01)];
    StatusResponse, Status, Clientbound => [(V1_7_2, 0x00)];
    StatusPong, Status, Clientbound => [(V1_7_2, 0x01)];

    // Login, client to server.
    LoginStart, Login, Serverbound => [(V1_7_2, 0x00)];
    EncryptionResponse, Login, Serverbound => [(V1_7_2, 0x01)];
    LoginPluginResponse, Login, Serverbound => [(V1_13, 0x02)];
    LoginAcknowledged, Login, Serverbound => [(V1_20_2, 0x03)];
    LoginCookieResponse, Login, Serverbound => [(V1_20_5, 0x04)];

    // Login, server to client.
    LoginDisconnect, Login, Clientbound => [(V1_7_2, 0x00)];
    EncryptionRequest, Login, Clientbound => [(V1_7_2, 0x01)];
    LoginSuccess, Login, Clientbound => [(V1_7_2, 0x02)];
    SetCompression, Login, Clientbound => [(V1_7_2, 0x03)];
    LoginPluginRequest, Login, Clientbound => [(V1_13, 0x04)];
    LoginCookieRequest, Login, Clientbound => [(V1_20_5, 0x05)];

    // Configuration, client to server.
    ConfigClientSettings, Config, Serverbound => [(V1_20_2, 0x00)];
    ConfigCookieResponse, Config, Serverbound => [(V1_20_5, 0x01)];
    ConfigPluginMessageC2s, Config, Serverbound => [(V1_20_2, 0x01), (V1_20_5, 0x02)];
    ConfigFinishAck, Config, Serverbound => [(V1_20_2, 0x02), (V1_20_5, 0x03)];
    ConfigKeepAliveC2s, Config, Serverbound => [(V1_20_2, 0x03), (V1_20_5, 0x04)];
    ConfigPong, Config, Serverbound => [(V1_20_2, 0x04), (V1_20_5, 0x05)];
    ConfigResourcePackResponse, Config, Serverbound => [(V1_20_2, 0x05), (V1_20_5, 0x06)];

    // Configuration, server to client.
    ConfigCookieRequest, Config, Clientbound => [(V1_20_5, 0x00)];
    ConfigPluginMessageS2c, Config, Clientbound => [(V1_20_2, 0x00), (V1_20_5, 0x01)];
    ConfigDisconnect, Config, Clientbound => [(V1_20_2, 0x01), (V1_20_5, 0x02)];
    ConfigFinish, Config, Clientbound => [(V1_20_2, 0x02), (V1_20_5, 0x03)];
    ConfigKeepAliveS2c, Config, Clientbound => [(V1_20_2, 0x03), (V1_20_5, 0x04)];
    ConfigPing, Config, Clientbound => [(V1_20_2, 0x04), (V1_20_5, 0x05)];
    ConfigResourcePackRemove, Config, Clientbound => [(V1_20_3, 0x06), (V1_20_5, 0x08)];
    ConfigResourcePackAdd, Config, Clientbound => [(V1_20_2, 0x06), (V1_20_3, 0x07), (V1_20_5, 0x09)];
    ConfigStoreCookie, Config, Clientbound => [(V1_20_5, 0x0A)];
    ConfigTransfer, Config, Clientbound => [(V1_20_5, 0x0B)];
    ConfigServerLinks, Config, Clientbound => [(V1_21, 0x10)];

    // Play, client to server.
    KeepAliveC2s, Play, Serverbound => [
        (V1_7_2, 0x00), (V1_9, 0x0B), (V1_12, 0x0C), (V1_12_1, 0x0B), (V1_13, 0x0E),
        (V1_14, 0x0F), (V1_16, 0x10), (V1_17, 0x0F), (V1_19, 0x11), (V1_19_1, 0x12),
        (V1_19_3, 0x11), (V1_19_4, 0x12), (V1_20_2, 0x14), (V1_20_3, 0x15), (V1_20_5, 0x18),
    ];
    ChatMessage, Play, Serverbound => [
        (V1_7_2, 0x01), (V1_9, 0x02), (V1_12, 0x03), (V1_12_1, 0x02), (V1_14, 0x03),
        (V1_19, 0x04), (V1_19_1, 0x05), (V1_20_5, 0x06),
    ];
    ChatCommand, Play, Serverbound => [(V1_19, 0x03), (V1_19_1, 0x04)];
    SignedChatCommand, Play, Serverbound => [(V1_20_5, 0x05)];
    PluginMessageC2s, Play, Serverbound => [
        (V1_7_2, 0x17), (V1_9, 0x09), (V1_12, 0x0A), (V1_12_1, 0x09), (V1_13, 0x0A),
        (V1_14, 0x0B), (V1_17, 0x0A), (V1_19, 0x0C), (V1_19_1, 0x0D), (V1_19_3, 0x0C),
        (V1_19_4, 0x0D), (V1_20_2, 0x0F), (V1_20_3, 0x10), (V1_20_5, 0x12),
    ];
    ClientSettingsPlay, Play, Serverbound => [
        (V1_7_2, 0x15), (V1_9, 0x04), (V1_12, 0x05), (V1_12_1, 0x04), (V1_14, 0x05),
        (V1_19, 0x07), (V1_19_1, 0x08), (V1_19_3, 0x07), (V1_19_4, 0x08), (V1_20_2, 0x09),
        (V1_20_5, 0x0A),
    ];
    ConfigurationAck, Play, Serverbound => [(V1_20_2, 0x0B), (V1_20_5, 0x0C)];
    ResourcePackResponsePlay, Play, Serverbound => [
        (V1_8, 0x19), (V1_9, 0x16), (V1_12, 0x18), (V1_13, 0x1D), (V1_14, 0x1F),
        (V1_16, 0x20), (V1_16_2, 0x21), (V1_19, 0x23), (V1_19_1, 0x24), (V1_20_2, 0x27),
        (V1_20_3, 0x28), (V1_20_5, 0x2B),
    ];
    CookieResponsePlay, Play, Serverbound => [(V1_20_5, 0x11)];

    // Play, server to client.
    KeepAliveS2c, Play, Clientbound => [
        (V1_7_2, 0x00), (V1_9, 0x1F), (V1_13, 0x21), (V1_14, 0x20), (V1_15, 0x21),
        (V1_16, 0x20), (V1_17, 0x21), (V1_19, 0x1E), (V1_19_1, 0x20), (V1_19_3, 0x1F),
        (V1_19_4, 0x23), (V1_20_2, 0x24), (V1_20_5, 0x26),
    ];
    JoinGame, Play, Clientbound => [
        (V1_7_2, 0x01), (V1_9, 0x23), (V1_13, 0x25), (V1_15, 0x26), (V1_16, 0x25),
        (V1_16_2, 0x24), (V1_17, 0x26), (V1_19, 0x23), (V1_19_1, 0x25), (V1_19_3, 0x24),
        (V1_19_4, 0x28), (V1_20_2, 0x29), (V1_20_5, 0x2B),
    ];
    Respawn, Play, Clientbound => [
        (V1_7_2, 0x07), (V1_9, 0x33), (V1_13, 0x38), (V1_14, 0x3A), (V1_15, 0x3B),
        (V1_16, 0x3A), (V1_16_2, 0x39), (V1_17, 0x3D), (V1_19, 0x3B), (V1_19_1, 0x3E),
        (V1_19_3, 0x3D), (V1_19_4, 0x41), (V1_20_2, 0x43), (V1_20_3, 0x45), (V1_20_5, 0x47),
    ];
    DisconnectPlay, Play, Clientbound => [
        (V1_7_2, 0x40), (V1_9, 0x1A), (V1_13, 0x1B), (V1_14, 0x1A), (V1_15, 0x1B),
        (V1_16, 0x19), (V1_17, 0x1A), (V1_19, 0x17), (V1_19_1, 0x19), (V1_19_3, 0x17),
        (V1_19_4, 0x1A), (V1_20_2, 0x1B), (V1_20_5, 0x1D),
    ];
    PluginMessageS2c, Play, Clientbound => [
        (V1_7_2, 0x3F), (V1_9, 0x18), (V1_13, 0x19), (V1_14, 0x18), (V1_15, 0x19),
        (V1_16, 0x17), (V1_17, 0x18), (V1_19, 0x15), (V1_19_1, 0x16), (V1_19_3, 0x15),
        (V1_19_4, 0x17), (V1_20_2, 0x18), (V1_20_5, 0x19),
    ];
    BundleDelimiter, Play, Clientbound => [(V1_19_4, 0x00)];
    StartConfiguration, Play, Clientbound => [(V1_20_2, 0x65), (V1_20_3, 0x67), (V1_20_5, 0x69)];
    LegacyChat, Play, Clientbound => [
        (V1_7_2, 0x02), (V1_9, 0x0F), (V1_13, 0x0E), (V1_15, 0x0F), (V1_16, 0x0E),
        (V1_17, 0x0F), (V1_19, -1),
    ];
    SystemChat, Play, Clientbound => [
        (V1_19, 0x5F), (V1_19_1, 0x62), (V1_19_3, 0x60), (V1_19_4, 0x64), (V1_20_2, 0x69),
        (V1_20_5, 0x6C),
    ];
    TabListHeaderFooter, Play, Clientbound => [
        (V1_8, 0x47), (V1_9, 0x48), (V1_12, 0x49), (V1_12_1, 0x4A), (V1_13, 0x4E),
        (V1_14, 0x53), (V1_15, 0x54), (V1_16, 0x53), (V1_17, 0x5E), (V1_18, 0x5F),
        (V1_19, 0x60), (V1_19_1, 0x63), (V1_19_3, 0x61), (V1_19_4, 0x65), (V1_20_2, 0x6A),
        (V1_20_5, 0x6D),
    ];
    ResourcePackAddPlay, Play, Clientbound => [
        (V1_8, 0x48), (V1_9, 0x32), (V1_13, 0x37), (V1_14, 0x39), (V1_15, 0x3A),
        (V1_16, 0x39), (V1_16_2, 0x38), (V1_17, 0x3C), (V1_19, 0x3A), (V1_19_1, 0x3D),
        (V1_19_3, 0x3C), (V1_19_4, 0x40), (V1_20_2, 0x42), (V1_20_3, 0x44), (V1_20_5, 0x46),
    ];
    ResourcePackRemovePlay, Play, Clientbound => [(V1_20_3, 0x43), (V1_20_5, 0x45)];
    StoreCookiePlay, Play, Clientbound => [(V1_20_5, 0x6B)];
    CookieRequestPlay, Play, Clientbound => [(V1_20_5, 0x16)];
    TransferPlay, Play, Clientbound => [(V1_20_5, 0x73)];
    ServerLinksPlay, Play, Clientbound => [(V1_21, 0x7B)];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepwise_resolution() {
        use PacketKind::*;

        assert_eq!(Handshake.id(ProtocolVersion::V1_7_2), Some(0x00));
        assert_eq!(Handshake.id(ProtocolVersion::V1_21), Some(0x00));

        // Steps pick the latest mapping at or below the version.
        assert_eq!(KeepAliveS2c.id(ProtocolVersion::V1_8), Some(0x00));
        assert_eq!(KeepAliveS2c.id(ProtocolVersion::V1_9_4), Some(0x1F));
        assert_eq!(KeepAliveS2c.id(ProtocolVersion::V1_20_3), Some(0x24));

        // Not yet introduced.
        assert_eq!(LoginAcknowledged.id(ProtocolVersion::V1_20), None);
        assert_eq!(BundleDelimiter.id(ProtocolVersion::V1_19_3), None);

        // Removed from the protocol.
        assert_eq!(LegacyChat.id(ProtocolVersion::V1_18_2), Some(0x0F));
        assert_eq!(LegacyChat.id(ProtocolVersion::V1_19), None);
    }

    #[test]
    fn lookup_inverts_id() {
        for &version in ProtocolVersion::ALL {
            for &kind in PacketKind::ALL {
                if let Some(id) = kind.id(version) {
                    assert_eq!(
                        lookup(kind.state(), kind.side(), version, id),
                        Some(kind),
                        "{kind:?} at {version}"
                    );
                }
            }
        }
    }

    #[test]
    fn no_id_collisions() {
        use std::collections::HashMap;

        for &version in ProtocolVersion::ALL {
            let mut seen = HashMap::new();

            for &kind in PacketKind::ALL {
                if let Some(id) = kind.id(version) {
                    let key = (kind.state(), kind.side(), id);
                    if let Some(prev) = seen.insert(key, kind) {
                        panic!("{prev:?} and {kind:?} share id {id:#04x} at {version}");
                    }
                }
            }
        }
    }

    #[test]
    fn unknown_ids_are_opaque() {
        assert_eq!(
            lookup(
                PacketState::Play,
                PacketSide::Clientbound,
                ProtocolVersion::V1_20_2,
                0x7E
            ),
            None
        );
    }
}
