use std::io::Write;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Decode, Encode};

/// A property from the game profile. Typically the `textures` entry
/// carrying the skin and cape.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Encode for Property {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.name.encode(&mut w)?;
        self.value.encode(&mut w)?;
        self.signature.encode(w)
    }
}

impl Decode<'_> for Property {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            name: String::decode(r)?,
            value: String::decode(r)?,
            signature: Option::<String>::decode(r)?,
        })
    }
}

/// The authoritative identity of a player, as returned by the session
/// service in online mode or synthesized locally in offline mode.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GameProfile {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl GameProfile {
    /// Serializes the property list the way the legacy player-info
    /// forwarding handshake carries it.
    pub fn properties_json(&self) -> String {
        serde_json::to_string(&self.properties).unwrap_or_else(|_| "[]".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_json_shape() {
        let profile: GameProfile = serde_json::from_str(
            r#"{
                "id": "af74a02d19cb445bb07f6866a861f783",
                "name": "Alice",
                "properties": [
                    {"name": "textures", "value": "e30=", "signature": "sig"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(profile.name, "Alice");
        assert_eq!(profile.properties.len(), 1);
        assert_eq!(profile.properties[0].name, "textures");
    }

    #[test]
    fn property_wire_round_trip() {
        let prop = Property {
            name: "textures".into(),
            value: "value".into(),
            signature: None,
        };

        let mut buf = vec![];
        prop.encode(&mut buf).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(Property::decode(&mut r).unwrap(), prop);
        assert!(r.is_empty());
    }
}
