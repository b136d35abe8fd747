//! Server-list ping composition, modern and legacy.

use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use gale_protocol::version::ProtocolVersion;

use crate::Proxy;

/// An entry shown when hovering the player count.
#[derive(Clone, Debug, Serialize)]
pub struct PlayerSampleEntry {
    pub name: String,
    pub id: Uuid,
}

/// Builds the status JSON for one ping, virtual-host aware so forced
/// hosts can advertise their own world later without a protocol
/// change.
pub fn status_json(proxy: &Proxy, client_protocol: i32, _virtual_host: Option<&str>) -> Value {
    let config = proxy.config();

    // Report the client's own version when we speak it, so every
    // supported client sees itself as compatible.
    let protocol = match ProtocolVersion::from_number(client_protocol) {
        Some(_) => client_protocol,
        None => ProtocolVersion::MAXIMUM.number(),
    };

    let sample: Vec<PlayerSampleEntry> = proxy
        .players()
        .all()
        .into_iter()
        .take(12)
        .map(|player| PlayerSampleEntry {
            name: player.username.clone(),
            id: player.uuid,
        })
        .collect();

    let mut status = json!({
        "version": {
            "name": format!(
                "{}-{}",
                ProtocolVersion::MINIMUM.name(),
                ProtocolVersion::MAXIMUM.name()
            ),
            "protocol": protocol,
        },
        "players": {
            "online": proxy.total_players(),
            "max": config.show_max_players,
            "sample": sample,
        },
        "description": { "text": config.motd.clone() },
    });

    if config.announce_forge {
        // Forge clients refuse servers whose ping lacks the FML
        // marker.
        status["modinfo"] = json!({ "type": "FML", "modList": [] });
    }

    if let Some(favicon) = &proxy.0.favicon {
        status["favicon"] = Value::String(favicon.clone());
    }

    status
}

/// The three pre-Netty ping formats.
#[derive(PartialEq, Debug, Clone, Copy)]
pub enum LegacyPingFormat {
    /// Beta 1.8 through 1.3: bare 0xFE.
    Pre1_4,
    /// 1.4 through 1.5: 0xFE 0x01.
    Pre1_6,
    /// 1.6: 0xFE 0x01 0xFA plus a payload.
    Pre1_7,
}

/// Renders the legacy ping reply payload (the body of the 0xFF kick
/// packet, as UTF-16BE with a character-count prefix).
pub fn legacy_ping_response(proxy: &Proxy, format: LegacyPingFormat) -> Vec<u8> {
    let config = proxy.config();

    let online = proxy.total_players();
    let max = config.show_max_players;
    let motd = strip_legacy_formatting(&config.motd);

    let body = match format {
        LegacyPingFormat::Pre1_4 => {
            format!("{motd}\u{a7}{online}\u{a7}{max}")
        }
        _ => format!(
            "\u{a7}1\0{protocol}\0{version}\0{motd}\0{online}\0{max}",
            protocol = ProtocolVersion::MAXIMUM.number(),
            version = ProtocolVersion::MAXIMUM.name(),
        ),
    };

    let utf16: Vec<u16> = body.encode_utf16().collect();

    let mut buf = Vec::with_capacity(3 + utf16.len() * 2);
    buf.push(0xff);
    buf.extend_from_slice(&(utf16.len() as u16).to_be_bytes());
    for unit in utf16 {
        buf.extend_from_slice(&unit.to_be_bytes());
    }

    buf
}

/// Removes `§x` formatting codes, which the pre-1.4 ping cannot carry.
fn strip_legacy_formatting(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\u{a7}' {
            chars.next();
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_formatting() {
        assert_eq!(strip_legacy_formatting("§aHello §lworld"), "Hello world");
        assert_eq!(strip_legacy_formatting("plain"), "plain");
        assert_eq!(strip_legacy_formatting("trailing§"), "trailing");
    }

    #[test]
    fn legacy_payload_shape() {
        let proxy = Proxy::new(crate::config::Config::default()).unwrap();

        let buf = legacy_ping_response(&proxy, LegacyPingFormat::Pre1_6);

        assert_eq!(buf[0], 0xff);

        let chars = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        assert_eq!(buf.len(), 3 + chars * 2);

        // 1.4+ replies start with the §1 marker.
        let first: Vec<u16> = buf[3..9]
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16_lossy(&first), "\u{a7}1\0");
    }

    #[test]
    fn status_reports_client_protocol_when_supported() {
        let proxy = Proxy::new(crate::config::Config::default()).unwrap();

        let status = status_json(&proxy, ProtocolVersion::V1_19_4.number(), None);
        assert_eq!(
            status["version"]["protocol"],
            ProtocolVersion::V1_19_4.number()
        );

        let status = status_json(&proxy, 3, None);
        assert_eq!(
            status["version"]["protocol"],
            ProtocolVersion::MAXIMUM.number()
        );
    }
}
