//! Protocol version numbers and the feature gates that hang off them.

use std::fmt;

macro_rules! protocol_versions {
    (
        $($variant:ident = $number:literal, $name:literal;)*
    ) => {
        /// A Minecraft protocol version understood by the proxy.
        ///
        /// Variants are declared in ascending wire order, so the derived
        /// `Ord` matches the protocol's own notion of "newer than".
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        #[repr(i32)]
        pub enum ProtocolVersion {
            $($variant,)*
        }

        impl ProtocolVersion {
            /// Every known version, oldest first.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// The protocol number sent in the handshake.
            pub const fn number(self) -> i32 {
                match self {
                    $(Self::$variant => $number,)*
                }
            }

            /// The display name of the oldest game version using this
            /// protocol number.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Resolves a handshake protocol number, or `None` for
            /// numbers the proxy does not speak.
            pub fn from_number(number: i32) -> Option<Self> {
                match number {
                    $($number => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

protocol_versions! {
    V1_7_2 = 4, "1.7.2";
    V1_7_6 = 5, "1.7.6";
    V1_8 = 47, "1.8";
    V1_9 = 107, "1.9";
    V1_9_1 = 108, "1.9.1";
    V1_9_2 = 109, "1.9.2";
    V1_9_4 = 110, "1.9.4";
    V1_10 = 210, "1.10";
    V1_11 = 315, "1.11";
    V1_11_1 = 316, "1.11.1";
    V1_12 = 335, "1.12";
    V1_12_1 = 338, "1.12.1";
    V1_12_2 = 340, "1.12.2";
    V1_13 = 393, "1.13";
    V1_13_1 = 401, "1.13.1";
    V1_13_2 = 404, "1.13.2";
    V1_14 = 477, "1.14";
    V1_14_1 = 480, "1.14.1";
    V1_14_2 = 485, "1.14.2";
    V1_14_3 = 490, "1.14.3";
    V1_14_4 = 498, "1.14.4";
    V1_15 = 573, "1.15";
    V1_15_1 = 575, "1.15.1";
    V1_15_2 = 578, "1.15.2";
    V1_16 = 735, "1.16";
    V1_16_1 = 736, "1.16.1";
    V1_16_2 = 751, "1.16.2";
    V1_16_3 = 753, "1.16.3";
    V1_16_4 = 754, "1.16.4";
    V1_17 = 755, "1.17";
    V1_17_1 = 756, "1.17.1";
    V1_18 = 757, "1.18";
    V1_18_2 = 758, "1.18.2";
    V1_19 = 759, "1.19";
    V1_19_1 = 760, "1.19.1";
    V1_19_3 = 761, "1.19.3";
    V1_19_4 = 762, "1.19.4";
    V1_20 = 763, "1.20";
    V1_20_2 = 764, "1.20.2";
    V1_20_3 = 765, "1.20.3";
    V1_20_5 = 766, "1.20.5";
    V1_21 = 767, "1.21";
}

impl ProtocolVersion {
    /// The oldest version the proxy accepts.
    pub const MINIMUM: Self = Self::V1_7_2;

    /// The newest version the proxy accepts.
    pub const MAXIMUM: Self = Self::V1_21;

    /// Keep-alive ids are a full `i64` from 1.12.2 onward; older
    /// versions use a VarInt.
    pub fn keepalive_is_long(self) -> bool {
        self >= Self::V1_12_2
    }

    /// Plugin channels are namespaced identifiers from 1.13 onward, and
    /// login-state plugin messages exist.
    pub fn has_login_plugin_messages(self) -> bool {
        self >= Self::V1_13
    }

    /// LoginStart carries the client's claimed uuid.
    pub fn login_start_has_uuid(self) -> bool {
        self >= Self::V1_19_1
    }

    /// The uuid in LoginStart is mandatory rather than optional.
    pub fn login_start_uuid_is_required(self) -> bool {
        self >= Self::V1_20_2
    }

    /// The CONFIG state (and the StartConfiguration round trip) exists.
    pub fn has_config_state(self) -> bool {
        self >= Self::V1_20_2
    }

    /// Clientbound bundles delimited by BundleDelimiter exist.
    pub fn has_bundles(self) -> bool {
        self >= Self::V1_19_4
    }

    /// The protocol-level Transfer packet exists.
    pub fn supports_transfers(self) -> bool {
        self >= Self::V1_20_5
    }

    /// Chat components are binary NBT on the wire instead of JSON.
    pub fn uses_nbt_components(self) -> bool {
        self >= Self::V1_20_3
    }

    /// Commands travel in a dedicated ChatCommand packet instead of the
    /// chat message packet.
    pub fn has_chat_commands(self) -> bool {
        self >= Self::V1_19
    }

    /// Unsigned commands are split from signed ones.
    pub fn has_unsigned_command_packet(self) -> bool {
        self >= Self::V1_20_5
    }

    /// Chat uses the session-keyed signature scheme.
    pub fn uses_session_chat(self) -> bool {
        self >= Self::V1_19_3
    }

    /// The ServerLinks packet exists.
    pub fn supports_server_links(self) -> bool {
        self >= Self::V1_21
    }

    /// ClientSettings lives in the PLAY state (pre-config-state
    /// versions); the proxy must replay it after a server switch.
    pub fn client_settings_in_play(self) -> bool {
        self < Self::V1_20_2
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (protocol {})", self.name(), self.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_wire_numbers() {
        for pair in ProtocolVersion::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].number() < pair[1].number());
        }
    }

    #[test]
    fn from_number_round_trips() {
        for &v in ProtocolVersion::ALL {
            assert_eq!(ProtocolVersion::from_number(v.number()), Some(v));
        }

        assert_eq!(ProtocolVersion::from_number(3), None);
        assert_eq!(ProtocolVersion::from_number(768), None);
    }

    #[test]
    fn feature_gates() {
        assert!(!ProtocolVersion::V1_8.has_config_state());
        assert!(ProtocolVersion::V1_20_2.has_config_state());
        assert!(ProtocolVersion::V1_19_4.has_bundles());
        assert!(!ProtocolVersion::V1_19_3.has_bundles());
        assert!(ProtocolVersion::V1_20_5.supports_transfers());
        assert!(ProtocolVersion::V1_20_3.uses_nbt_components());
        assert!(!ProtocolVersion::V1_20_2.uses_nbt_components());
    }
}
