//! Chat components, held opaquely.
//!
//! The proxy almost never cares what is inside a component; it stores
//! one as structured JSON and converts lazily to whichever wire form
//! the connection's version wants (JSON string pre-1.20.3, network NBT
//! from 1.20.3). The only inspection the proxy performs is flattening
//! to plain text.

use std::fmt;
use std::io::Write;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};

use crate::nbt::{self, Compound, Value as Nbt};
use crate::version::ProtocolVersion;
use crate::{Decode, Encode};

/// An opaque chat component.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextComponent(Json);

impl TextComponent {
    /// A component displaying `text` literally.
    pub fn plain(text: impl Into<String>) -> Self {
        Self(json!({ "text": text.into() }))
    }

    /// A component the client renders through its own translation
    /// table.
    pub fn translatable(key: impl Into<String>) -> Self {
        Self(json!({ "translate": key.into() }))
    }

    /// Like [`translatable`](Self::translatable) with positional
    /// arguments.
    pub fn translatable_with(key: impl Into<String>, args: Vec<TextComponent>) -> Self {
        let args: Vec<Json> = args.into_iter().map(|c| c.0).collect();
        Self(json!({ "translate": key.into(), "with": args }))
    }

    pub fn from_json(value: Json) -> Self {
        Self(value)
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        Ok(Self(serde_json::from_str(s).context("parsing component JSON")?))
    }

    pub fn as_json(&self) -> &Json {
        &self.0
    }

    pub fn to_json_string(&self) -> String {
        self.0.to_string()
    }

    /// Concatenates all literal text in the component, depth first:
    /// `text`, then `translate` keys verbatim, then every `extra` and
    /// `with` child. This is what kick-reason matching runs over.
    pub fn flatten(&self) -> String {
        let mut out = String::new();
        flatten_json(&self.0, &mut out);
        out
    }

    /// Byte-wise substring test over the flattened component. No case
    /// folding, no Unicode normalization.
    pub fn contains(&self, needle: &str) -> bool {
        self.flatten().contains(needle)
    }

    /// Converts to the network NBT form used from 1.20.3.
    pub fn to_nbt(&self) -> Nbt {
        json_to_nbt(&self.0)
    }

    /// Builds a component back from its network NBT form.
    pub fn from_nbt(value: &Nbt) -> Self {
        Self(nbt_to_json(value))
    }

    /// Writes the component in the wire form `version` expects.
    pub fn encode(&self, mut w: impl Write, version: ProtocolVersion) -> anyhow::Result<()> {
        if version.uses_nbt_components() {
            nbt::to_binary(&self.to_nbt(), w)
        } else {
            self.to_json_string().encode(&mut w)
        }
    }

    /// Reads a component in the wire form `version` uses.
    pub fn decode(r: &mut &[u8], version: ProtocolVersion) -> anyhow::Result<Self> {
        if version.uses_nbt_components() {
            Ok(Self::from_nbt(&nbt::from_binary(r)?))
        } else {
            Self::from_json_str(<&str>::decode(r)?)
        }
    }
}

impl fmt::Display for TextComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flatten())
    }
}

impl From<&str> for TextComponent {
    fn from(s: &str) -> Self {
        Self::plain(s)
    }
}

impl From<String> for TextComponent {
    fn from(s: String) -> Self {
        Self::plain(s)
    }
}

fn flatten_json(value: &Json, out: &mut String) {
    match value {
        Json::String(s) => out.push_str(s),
        Json::Array(arr) => {
            for child in arr {
                flatten_json(child, out);
            }
        }
        Json::Object(obj) => {
            if let Some(Json::String(text)) = obj.get("text") {
                out.push_str(text);
            }
            if let Some(Json::String(key)) = obj.get("translate") {
                out.push_str(key);
            }
            if let Some(Json::Array(with)) = obj.get("with") {
                for child in with {
                    flatten_json(child, out);
                }
            }
            if let Some(Json::Array(extra)) = obj.get("extra") {
                for child in extra {
                    flatten_json(child, out);
                }
            }
        }
        _ => {}
    }
}

fn json_to_nbt(value: &Json) -> Nbt {
    match value {
        Json::Null => Nbt::String(String::new()),
        Json::Bool(b) => Nbt::Byte(i8::from(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    Nbt::Int(i as i32)
                } else {
                    Nbt::Long(i)
                }
            } else {
                Nbt::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Nbt::String(s.clone()),
        Json::Array(arr) => {
            let mut items: Vec<Nbt> = arr.iter().map(json_to_nbt).collect();

            // NBT lists are homogeneous; mixed component lists get each
            // element promoted to a compound, mirroring what the game
            // itself does with mixed "extra" arrays.
            let mixed = items
                .windows(2)
                .any(|w| std::mem::discriminant(&w[0]) != std::mem::discriminant(&w[1]));

            if mixed {
                items = items
                    .into_iter()
                    .map(|item| match item {
                        Nbt::Compound(c) => Nbt::Compound(c),
                        Nbt::String(s) => {
                            let mut c = Compound::new();
                            c.insert("text".into(), Nbt::String(s));
                            Nbt::Compound(c)
                        }
                        other => {
                            let mut c = Compound::new();
                            c.insert("text".into(), other);
                            Nbt::Compound(c)
                        }
                    })
                    .collect();
            }

            Nbt::List(items)
        }
        Json::Object(obj) => {
            let mut compound = Compound::new();
            for (k, v) in obj {
                compound.insert(k.clone(), json_to_nbt(v));
            }
            Nbt::Compound(compound)
        }
    }
}

fn nbt_to_json(value: &Nbt) -> Json {
    match value {
        Nbt::Byte(v) => json!(*v),
        Nbt::Short(v) => json!(*v),
        Nbt::Int(v) => json!(*v),
        Nbt::Long(v) => json!(*v),
        Nbt::Float(v) => json!(*v),
        Nbt::Double(v) => json!(*v),
        Nbt::ByteArray(v) => Json::Array(v.iter().map(|b| json!(*b)).collect()),
        Nbt::String(v) => Json::String(v.clone()),
        Nbt::List(v) => Json::Array(v.iter().map(nbt_to_json).collect()),
        Nbt::Compound(v) => {
            let mut map = Map::new();
            for (k, val) in v {
                map.insert(k.clone(), nbt_to_json(val));
            }
            Json::Object(map)
        }
        Nbt::IntArray(v) => Json::Array(v.iter().map(|n| json!(*n)).collect()),
        Nbt::LongArray(v) => Json::Array(v.iter().map(|n| json!(*n)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn flatten_walks_children() {
        let c = TextComponent::from_json(json!({
            "text": "You are ",
            "extra": [
                {"text": "banned"},
                {"text": " from ", "extra": [{"text": "this server"}]}
            ]
        }));

        assert_eq!(c.flatten(), "You are banned from this server");
        assert!(c.contains("banned"));
    }

    #[test]
    fn contains_is_case_sensitive() {
        // Matching is byte-wise; "Banned" must not satisfy a
        // lowercase pattern.
        let c = TextComponent::plain("You are Banned");

        assert!(c.contains("Banned"));
        assert!(!c.contains("banned"));
    }

    #[test]
    fn json_nbt_round_trip() {
        let c = TextComponent::from_json(json!({
            "translate": "multiplayer.disconnect.duplicate_login",
            "with": [{"text": "Alice"}],
            "bold": true
        }));

        let back = TextComponent::from_nbt(&c.to_nbt());

        // Booleans become NBT bytes; everything else survives intact.
        assert_eq!(back.as_json()["translate"], c.as_json()["translate"]);
        assert_eq!(back.as_json()["with"], c.as_json()["with"]);
        assert_eq!(back.as_json()["bold"], json!(1));

        // The NBT form itself is stable from there on.
        let again = TextComponent::from_nbt(&back.to_nbt());
        assert_eq!(again, back);
    }

    #[test]
    fn wire_forms_by_version() {
        let c = TextComponent::plain("hi");

        let mut json_wire = vec![];
        c.encode(&mut json_wire, ProtocolVersion::V1_20_2).unwrap();
        let mut r = json_wire.as_slice();
        assert_eq!(
            TextComponent::decode(&mut r, ProtocolVersion::V1_20_2).unwrap(),
            c
        );

        let mut nbt_wire = vec![];
        c.encode(&mut nbt_wire, ProtocolVersion::V1_20_3).unwrap();
        let mut r = nbt_wire.as_slice();
        assert_eq!(
            TextComponent::decode(&mut r, ProtocolVersion::V1_20_3).unwrap(),
            c
        );

        assert_ne!(json_wire, nbt_wire);
    }
}
