//! The packets proxies exchange over the pub/sub channel.
//!
//! Every message on the wire is a JSON envelope `{"id": ..., "obj":
//! ...}` so a receiver can dispatch on the id without touching the
//! body. Bodies are camelCase JSON.

use std::collections::HashMap;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fleet-wide record of a player, replicated to every proxy.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayerInfo {
    pub proxy_id: String,
    pub uuid: Uuid,
    pub username: String,
    #[serde(default)]
    pub current_server: Option<String>,
    /// Queue priority per target server name, plus the "all" key.
    #[serde(default)]
    pub priorities: HashMap<String, i32>,
    #[serde(default)]
    pub full_bypass: bool,
    #[serde(default)]
    pub queue_bypass: bool,
    /// Set while the player is mid-transfer between proxies, so the
    /// receiving side can tell the arrival from a fresh connect.
    #[serde(default)]
    pub being_transferred: bool,
}

/// Outcome of one queue dispatch attempt, reported back to the master.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    Successful,
    ConnectionInProgress,
    ConnectionCancelled,
    ServerDisconnected,
    AlreadyConnected,
}

impl SendStatus {
    /// Whether the attempt consumed the queue entry.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Successful | Self::ConnectionInProgress)
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdAnnouncement {
    pub proxy_id: String,
    pub wants_reply: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoin {
    pub info: RemotePlayerInfo,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeave {
    pub proxy_id: String,
    pub uuid: Uuid,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerServerChange {
    pub proxy_id: String,
    pub uuid: Uuid,
    #[serde(default)]
    pub server: Option<String>,
}

/// A queue request for `uuid`; applied by the master proxies.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQueuedServer {
    pub uuid: Uuid,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTransferRequest {
    pub uuid: Uuid,
    pub transferring: bool,
    #[serde(default)]
    pub currently_connected_server: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuttingDown {
    pub proxy_id: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueLeave {
    pub uuid: Uuid,
    /// `None` leaves every queue.
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePause {
    pub server: String,
    pub paused: bool,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSendStatus {
    pub attempt_id: Uuid,
    pub uuid: Uuid,
    pub server: String,
    pub status: SendStatus,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAlreadyJoined {
    pub uuid: Uuid,
    pub server: String,
}

/// Chat delivered to one player, wherever they are.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub uuid: Uuid,
    /// Component JSON.
    pub message: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendActionbarRequest {
    pub uuid: Uuid,
    pub message: String,
}

/// Broadcast chat to every player on every proxy.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAlert {
    pub message: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickPlayer {
    pub uuid: Uuid,
    /// Component JSON.
    pub reason: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sudo {
    pub uuid: Uuid,
    pub command: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCommandRequest {
    pub uuid: Uuid,
    pub host: String,
    pub port: u16,
}

/// The master's order to the proxy hosting `uuid`: switch them to
/// `server` and report back under `attempt_id`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchServer {
    pub proxy_id: String,
    pub uuid: Uuid,
    pub server: String,
    #[serde(default)]
    pub attempt_id: Option<Uuid>,
}

/// Ping probe; the hosting proxy republishes it with `ping` filled in.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPlayerPing {
    pub request_id: Uuid,
    pub requester: String,
    pub uuid: Uuid,
    #[serde(default)]
    pub ping: Option<u64>,
}

/// Administrative request addressed to one proxy or the whole fleet.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericCommandRequest {
    #[serde(default)]
    pub target: Option<String>,
    pub command: String,
}

macro_rules! fleet_packets {
    ($($id:literal => $variant:ident($body:ty);)*) => {
        /// Every packet understood on the fleet channel.
        #[derive(Clone, PartialEq, Debug)]
        pub enum FleetPacket {
            $($variant($body),)*
        }

        impl FleetPacket {
            /// The envelope id for this packet.
            pub fn id(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $id,)*
                }
            }

            /// Serializes into the `{"id", "obj"}` envelope.
            pub fn to_envelope(&self) -> anyhow::Result<String> {
                let obj = match self {
                    $(Self::$variant(body) => serde_json::to_value(body)?,)*
                };

                Ok(serde_json::json!({ "id": self.id(), "obj": obj }).to_string())
            }

            /// Parses an envelope. Returns `Ok(None)` for ids this
            /// build does not know, which receivers skip.
            pub fn from_envelope(raw: &str) -> anyhow::Result<Option<Self>> {
                #[derive(Deserialize)]
                struct Envelope {
                    id: String,
                    obj: serde_json::Value,
                }

                let envelope: Envelope =
                    serde_json::from_str(raw).context("malformed fleet envelope")?;

                fn body<T: DeserializeOwned>(obj: serde_json::Value) -> anyhow::Result<T> {
                    serde_json::from_value(obj).context("malformed fleet packet body")
                }

                Ok(match envelope.id.as_str() {
                    $($id => Some(Self::$variant(body(envelope.obj)?)),)*
                    _ => None,
                })
            }
        }
    };
}

fleet_packets! {
    "id-announcement" => IdAnnouncement(IdAnnouncement);
    "player-join" => PlayerJoin(PlayerJoin);
    "player-leave" => PlayerLeave(PlayerLeave);
    "player-server-change" => PlayerServerChange(PlayerServerChange);
    "set-queued-server" => SetQueuedServer(SetQueuedServer);
    "set-transfer-request" => SetTransferRequest(SetTransferRequest);
    "shutting-down" => ShuttingDown(ShuttingDown);
    "redis-queue-leave" => QueueLeave(QueueLeave);
    "redis-queue-pause" => QueuePause(QueuePause);
    "redis-queue-send-status" => QueueSendStatus(QueueSendStatus);
    "redis-queue-already-joined" => QueueAlreadyJoined(QueueAlreadyJoined);
    "send-message" => SendMessage(SendMessage);
    "redis-send-actionbar-request" => SendActionbarRequest(SendActionbarRequest);
    "server-alert" => ServerAlert(ServerAlert);
    "kick-player" => KickPlayer(KickPlayer);
    "sudo" => Sudo(Sudo);
    "transfer-command-request" => TransferCommandRequest(TransferCommandRequest);
    "switch-server" => SwitchServer(SwitchServer);
    "get-player-ping" => GetPlayerPing(GetPlayerPing);
    "generic-command-request" => GenericCommandRequest(GenericCommandRequest);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn envelope_round_trip() {
        let packet = FleetPacket::PlayerJoin(PlayerJoin {
            info: RemotePlayerInfo {
                proxy_id: "proxy-1".into(),
                uuid: Uuid::from_u128(7),
                username: "Alice".into(),
                current_server: Some("lobby".into()),
                priorities: HashMap::from([("hub".into(), 50)]),
                full_bypass: false,
                queue_bypass: true,
                being_transferred: false,
            },
        });

        let raw = packet.to_envelope().unwrap();
        let back = FleetPacket::from_envelope(&raw).unwrap().unwrap();

        assert_eq!(back, packet);
    }

    #[test]
    fn envelope_id_is_outermost() {
        let raw = FleetPacket::ShuttingDown(ShuttingDown {
            proxy_id: "proxy-2".into(),
        })
        .to_envelope()
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["id"], "shutting-down");
        assert_eq!(value["obj"]["proxyId"], "proxy-2");
    }

    #[test]
    fn unknown_id_is_skipped() {
        let raw = r#"{"id": "from-the-future", "obj": {"x": 1}}"#;
        assert!(FleetPacket::from_envelope(raw).unwrap().is_none());
    }

    #[test]
    fn malformed_body_is_an_error() {
        let raw = r#"{"id": "player-leave", "obj": {"proxyId": 5}}"#;
        assert!(FleetPacket::from_envelope(raw).is_err());
    }

    #[test]
    fn send_status_consumption() {
        assert!(SendStatus::Successful.is_success());
        assert!(SendStatus::ConnectionInProgress.is_success());
        assert!(!SendStatus::ServerDisconnected.is_success());
        assert!(!SendStatus::ConnectionCancelled.is_success());
        assert!(!SendStatus::AlreadyConnected.is_success());
    }
}
