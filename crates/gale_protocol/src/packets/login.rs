use std::io::Write;

use anyhow::ensure;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::catalog::PacketKind;
use crate::profile::{GameProfile, Property};
use crate::raw::RawBytes;
use crate::text::TextComponent;
use crate::var_int::VarInt;
use crate::version::ProtocolVersion;
use crate::{Decode, Encode, Packet};

/// Byte arrays in the login state were i16-length-prefixed before 1.8.
fn encode_blob(blob: &[u8], mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
    if version >= ProtocolVersion::V1_8 {
        blob.encode(w)
    } else {
        ensure!(
            i16::try_from(blob.len()).is_ok(),
            "login blob of {} bytes exceeds the pre-1.8 length prefix",
            blob.len()
        );
        w.write_i16::<BigEndian>(blob.len() as i16)?;
        Ok(w.write_all(blob)?)
    }
}

fn decode_blob(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Vec<u8>> {
    if version >= ProtocolVersion::V1_8 {
        Ok(<&[u8]>::decode(r)?.to_vec())
    } else {
        let len = r.read_i16::<BigEndian>()?;
        ensure!(len >= 0, "login blob with negative length");
        let len = len as usize;
        ensure!(len <= r.len(), "login blob overruns the input");

        let (blob, remaining) = r.split_at(len);
        *r = remaining;
        Ok(blob.to_vec())
    }
}

/// The client's first login packet.
///
/// Between 1.19 and 1.19.2 this carried the player's chat-signing key;
/// the proxy reads past it and discards it. The claimed uuid is
/// optional from 1.19.1 and mandatory from 1.20.2.
#[derive(Clone, Debug)]
pub struct LoginStartC2s {
    pub username: String,
    pub uuid: Option<Uuid>,
}

impl Packet for LoginStartC2s {
    const KIND: PacketKind = PacketKind::LoginStart;
    const NAME: &'static str = "LoginStartC2s";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.username.encode(&mut w)?;

        if version >= ProtocolVersion::V1_19 && version < ProtocolVersion::V1_19_3 {
            // No signing key on the proxy-to-backend handshake.
            false.encode(&mut w)?;
        }

        if version.login_start_uuid_is_required() {
            self.uuid.unwrap_or_else(Uuid::nil).encode(w)?;
        } else if version.login_start_has_uuid() {
            self.uuid.encode(w)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let username = String::decode(r)?;

        if version >= ProtocolVersion::V1_19 && version < ProtocolVersion::V1_19_3 {
            if bool::decode(r)? {
                let _expires_at = i64::decode(r)?;
                let _public_key = <&[u8]>::decode(r)?;
                let _signature = <&[u8]>::decode(r)?;
            }
        }

        let uuid = if version.login_start_uuid_is_required() {
            Some(Uuid::decode(r)?)
        } else if version.login_start_has_uuid() {
            Option::<Uuid>::decode(r)?
        } else {
            None
        };

        Ok(Self { username, uuid })
    }
}

/// Starts the encryption handshake in online mode.
#[derive(Clone, Debug)]
pub struct EncryptionRequestS2c {
    pub server_id: String,
    pub public_key: Vec<u8>,
    pub verify_token: Vec<u8>,
}

impl Packet for EncryptionRequestS2c {
    const KIND: PacketKind = PacketKind::EncryptionRequest;
    const NAME: &'static str = "EncryptionRequestS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        self.server_id.encode(&mut w)?;
        encode_blob(&self.public_key, &mut w, version)?;
        encode_blob(&self.verify_token, &mut w, version)?;

        if version.supports_transfers() {
            // should_authenticate: the proxy always checks the session
            // service when it encrypts.
            true.encode(&mut w)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let server_id = String::decode(r)?;
        let public_key = decode_blob(r, version)?;
        let verify_token = decode_blob(r, version)?;

        if version.supports_transfers() {
            let _should_authenticate = bool::decode(r)?;
        }

        Ok(Self {
            server_id,
            public_key,
            verify_token,
        })
    }
}

/// The client's half of the encryption handshake.
///
/// Between 1.19 and 1.19.2 the verify token could be replaced by a
/// salted signature from the chat-signing key.
#[derive(Clone, Debug)]
pub struct EncryptionResponseC2s {
    pub shared_secret: Vec<u8>,
    pub verify_token: Option<Vec<u8>>,
    pub salted_signature: Option<(i64, Vec<u8>)>,
}

impl Packet for EncryptionResponseC2s {
    const KIND: PacketKind = PacketKind::EncryptionResponse;
    const NAME: &'static str = "EncryptionResponseC2s";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        encode_blob(&self.shared_secret, &mut w, version)?;

        if version >= ProtocolVersion::V1_19 && version < ProtocolVersion::V1_19_3 {
            match (&self.verify_token, &self.salted_signature) {
                (Some(token), _) => {
                    true.encode(&mut w)?;
                    encode_blob(token, &mut w, version)?;
                }
                (None, Some((salt, signature))) => {
                    false.encode(&mut w)?;
                    salt.encode(&mut w)?;
                    encode_blob(signature, &mut w, version)?;
                }
                (None, None) => anyhow::bail!("encryption response without token or signature"),
            }
        } else {
            let token = self
                .verify_token
                .as_deref()
                .unwrap_or_default();
            encode_blob(token, &mut w, version)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let shared_secret = decode_blob(r, version)?;

        if version >= ProtocolVersion::V1_19 && version < ProtocolVersion::V1_19_3 {
            if bool::decode(r)? {
                Ok(Self {
                    shared_secret,
                    verify_token: Some(decode_blob(r, version)?),
                    salted_signature: None,
                })
            } else {
                let salt = i64::decode(r)?;
                let signature = decode_blob(r, version)?;
                Ok(Self {
                    shared_secret,
                    verify_token: None,
                    salted_signature: Some((salt, signature)),
                })
            }
        } else {
            Ok(Self {
                shared_secret,
                verify_token: Some(decode_blob(r, version)?),
                salted_signature: None,
            })
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SetCompressionS2c {
    pub threshold: i32,
}

impl Packet for SetCompressionS2c {
    const KIND: PacketKind = PacketKind::SetCompression;
    const NAME: &'static str = "SetCompressionS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        VarInt(self.threshold).encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            threshold: VarInt::decode(r)?.0,
        })
    }
}

/// Completes the login and carries the authoritative profile.
#[derive(Clone, Debug)]
pub struct LoginSuccessS2c {
    pub profile: GameProfile,
}

impl Packet for LoginSuccessS2c {
    const KIND: PacketKind = PacketKind::LoginSuccess;
    const NAME: &'static str = "LoginSuccessS2c";

    fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        if version >= ProtocolVersion::V1_16 {
            self.profile.id.encode(&mut w)?;
        } else if version >= ProtocolVersion::V1_7_6 {
            self.profile.id.hyphenated().to_string().encode(&mut w)?;
        } else {
            self.profile.id.simple().to_string().encode(&mut w)?;
        }

        self.profile.name.encode(&mut w)?;

        if version >= ProtocolVersion::V1_19 {
            self.profile.properties.encode(&mut w)?;
        }

        if version >= ProtocolVersion::V1_20_5 {
            // strict_error_handling, removed again after 1.21.
            true.encode(&mut w)?;
        }

        Ok(())
    }

    fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        let id = if version >= ProtocolVersion::V1_16 {
            Uuid::decode(r)?
        } else {
            <&str>::decode(r)?.parse()?
        };

        let name = String::decode(r)?;

        let properties = if version >= ProtocolVersion::V1_19 {
            Vec::<Property>::decode(r)?
        } else {
            vec![]
        };

        if version >= ProtocolVersion::V1_20_5 {
            let _strict_error_handling = bool::decode(r)?;
        }

        Ok(Self {
            profile: GameProfile {
                id,
                name,
                properties,
            },
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LoginAcknowledgedC2s;

impl Packet for LoginAcknowledgedC2s {
    const KIND: PacketKind = PacketKind::LoginAcknowledged;
    const NAME: &'static str = "LoginAcknowledgedC2s";

    fn encode(&self, _w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        Ok(())
    }

    fn decode(_r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// A kick during login. The reason is always JSON text, even on
/// versions whose play-state components are NBT.
#[derive(Clone, Debug)]
pub struct LoginDisconnectS2c {
    pub reason: TextComponent,
}

impl Packet for LoginDisconnectS2c {
    const KIND: PacketKind = PacketKind::LoginDisconnect;
    const NAME: &'static str = "LoginDisconnectS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.reason.to_json_string().encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            reason: TextComponent::from_json_str(<&str>::decode(r)?)?,
        })
    }
}

/// A backend's request for login-state plugin data; modern player-info
/// forwarding arrives as one of these.
#[derive(Clone, Debug)]
pub struct LoginPluginRequestS2c {
    pub message_id: i32,
    pub channel: String,
    pub data: Vec<u8>,
}

impl Packet for LoginPluginRequestS2c {
    const KIND: PacketKind = PacketKind::LoginPluginRequest;
    const NAME: &'static str = "LoginPluginRequestS2c";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        VarInt(self.message_id).encode(&mut w)?;
        self.channel.encode(&mut w)?;
        Ok(w.write_all(&self.data)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            message_id: VarInt::decode(r)?.0,
            channel: String::decode(r)?,
            data: RawBytes::decode(r)?.0.to_vec(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct LoginPluginResponseC2s {
    pub message_id: i32,
    pub successful: bool,
    pub data: Vec<u8>,
}

impl Packet for LoginPluginResponseC2s {
    const KIND: PacketKind = PacketKind::LoginPluginResponse;
    const NAME: &'static str = "LoginPluginResponseC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        VarInt(self.message_id).encode(&mut w)?;
        self.successful.encode(&mut w)?;
        Ok(w.write_all(&self.data)?)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            message_id: VarInt::decode(r)?.0,
            successful: bool::decode(r)?,
            data: RawBytes::decode(r)?.0.to_vec(),
        })
    }
}

/// Asks the client for a stored cookie (transfer flows).
#[derive(Clone, Debug)]
pub struct CookieRequestS2c {
    pub key: String,
}

impl Packet for CookieRequestS2c {
    const KIND: PacketKind = PacketKind::LoginCookieRequest;
    const NAME: &'static str = "CookieRequestS2c";

    fn encode(&self, w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.key.encode(w)
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            key: String::decode(r)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct CookieResponseC2s {
    pub key: String,
    pub payload: Option<Vec<u8>>,
}

impl Packet for CookieResponseC2s {
    const KIND: PacketKind = PacketKind::LoginCookieResponse;
    const NAME: &'static str = "CookieResponseC2s";

    fn encode(&self, mut w: impl Write, _version: ProtocolVersion) -> anyhow::Result<()> {
        self.key.encode(&mut w)?;
        match &self.payload {
            Some(payload) => {
                true.encode(&mut w)?;
                payload.as_slice().encode(w)
            }
            None => false.encode(w),
        }
    }

    fn decode(r: &mut &[u8], _version: ProtocolVersion) -> anyhow::Result<Self> {
        Ok(Self {
            key: String::decode(r)?,
            payload: match bool::decode(r)? {
                true => Some(<&[u8]>::decode(r)?.to_vec()),
                false => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_start_uuid_by_version() {
        let pkt = LoginStartC2s {
            username: "Alice".into(),
            uuid: Some(Uuid::from_u128(42)),
        };

        // 1.8: no uuid on the wire.
        let mut buf = vec![];
        pkt.encode(&mut buf, ProtocolVersion::V1_8).unwrap();
        let back = LoginStartC2s::decode(&mut buf.as_slice(), ProtocolVersion::V1_8).unwrap();
        assert_eq!(back.uuid, None);

        // 1.19.4: optional uuid.
        let mut buf = vec![];
        pkt.encode(&mut buf, ProtocolVersion::V1_19_4).unwrap();
        let back = LoginStartC2s::decode(&mut buf.as_slice(), ProtocolVersion::V1_19_4).unwrap();
        assert_eq!(back.uuid, pkt.uuid);

        // 1.20.5: mandatory uuid.
        let mut buf = vec![];
        pkt.encode(&mut buf, ProtocolVersion::V1_20_5).unwrap();
        let back = LoginStartC2s::decode(&mut buf.as_slice(), ProtocolVersion::V1_20_5).unwrap();
        assert_eq!(back.uuid, pkt.uuid);
    }

    #[test]
    fn encryption_blobs_pre_and_post_1_8() {
        let pkt = EncryptionRequestS2c {
            server_id: String::new(),
            public_key: vec![1, 2, 3],
            verify_token: vec![9, 9, 9, 9],
        };

        for version in [ProtocolVersion::V1_7_2, ProtocolVersion::V1_8, ProtocolVersion::V1_21] {
            let mut buf = vec![];
            pkt.encode(&mut buf, version).unwrap();

            let mut r = buf.as_slice();
            let back = EncryptionRequestS2c::decode(&mut r, version).unwrap();
            assert!(r.is_empty(), "{version}");

            assert_eq!(back.public_key, pkt.public_key);
            assert_eq!(back.verify_token, pkt.verify_token);
        }
    }

    #[test]
    fn login_success_uuid_forms() {
        let pkt = LoginSuccessS2c {
            profile: GameProfile {
                id: Uuid::from_u128(0xdead_beef),
                name: "Alice".into(),
                properties: vec![],
            },
        };

        for version in [
            ProtocolVersion::V1_7_2,
            ProtocolVersion::V1_7_6,
            ProtocolVersion::V1_8,
            ProtocolVersion::V1_16,
            ProtocolVersion::V1_19,
            ProtocolVersion::V1_20_5,
        ] {
            let mut buf = vec![];
            pkt.encode(&mut buf, version).unwrap();

            let mut r = buf.as_slice();
            let back = LoginSuccessS2c::decode(&mut r, version).unwrap();
            assert!(r.is_empty(), "{version}");
            assert_eq!(back.profile.id, pkt.profile.id, "{version}");
            assert_eq!(back.profile.name, pkt.profile.name);
        }
    }
}
