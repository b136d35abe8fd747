//! The BungeeCord plugin-message responder.
//!
//! Backend plugins talk to their proxy over the `BungeeCord` custom
//! payload channel; the bodies are Java `DataOutput` encoded. Gale
//! answers the classic sub-channel set bit-for-bit, plus the queue
//! sub-channels, so backend plugins keep working unchanged.

use anyhow::{bail, ensure};
use gale_protocol::text::TextComponent;
use gale_protocol::version::ProtocolVersion;
use gale_redis::packet::{FleetPacket, SendMessage, SetQueuedServer, SwitchServer};
use tracing::debug;

use crate::player::{Player, PlayerCommand};
use crate::Proxy;

/// The plugin channel names, pre- and post-1.13 flattening.
pub fn is_bungee_channel(channel: &str) -> bool {
    channel == "BungeeCord" || channel == "bungeecord:main"
}

/// The channel replies go out on.
pub fn reply_channel(version: ProtocolVersion) -> &'static str {
    if version >= ProtocolVersion::V1_13 {
        "bungeecord:main"
    } else {
        "BungeeCord"
    }
}

// ---- Java DataOutput compatible primitives -----------------------------

fn write_utf(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_int(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_short(out: &mut Vec<u8>, v: i16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn read_utf(input: &mut &[u8]) -> anyhow::Result<String> {
    ensure!(input.len() >= 2, "truncated DataOutput string");

    let len = u16::from_be_bytes([input[0], input[1]]) as usize;
    *input = &input[2..];

    ensure!(input.len() >= len, "DataOutput string overruns the body");

    let (bytes, rest) = input.split_at(len);
    *input = rest;

    Ok(std::str::from_utf8(bytes)?.to_owned())
}

fn read_short(input: &mut &[u8]) -> anyhow::Result<i16> {
    ensure!(input.len() >= 2, "truncated DataOutput short");

    let v = i16::from_be_bytes([input[0], input[1]]);
    *input = &input[2..];
    Ok(v)
}

/// Handles one message from a backend. Returns the reply bodies to
/// send back to that backend on the symmetric channel.
pub async fn handle_message(
    proxy: &Proxy,
    player: &Player,
    data: &[u8],
) -> Vec<Vec<u8>> {
    match dispatch(proxy, player, data).await {
        Ok(replies) => replies,
        Err(e) => {
            debug!(player = %player.username, "bad BungeeCord message: {e:#}");
            vec![]
        }
    }
}

async fn dispatch(proxy: &Proxy, player: &Player, data: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut input = data;
    let sub_channel = read_utf(&mut input)?;

    let mut replies = vec![];

    match sub_channel.as_str() {
        "Connect" => {
            let server = read_utf(&mut input)?;
            let through_queue = proxy.config().queue.override_bungee_messaging;
            connect_routed(proxy, player, &server, through_queue).await;
        }
        "ConnectDirect" => {
            let server = read_utf(&mut input)?;
            connect_routed(proxy, player, &server, false).await;
        }
        "ConnectQueue" => {
            let server = read_utf(&mut input)?;
            connect_routed(proxy, player, &server, true).await;
        }
        "ConnectOther" | "ConnectOtherDirect" | "ConnectOtherQueue" => {
            let name = read_utf(&mut input)?;
            let server = read_utf(&mut input)?;

            let queued = match sub_channel.as_str() {
                "ConnectOtherDirect" => false,
                "ConnectOtherQueue" => true,
                _ => proxy.config().queue.override_bungee_messaging,
            };

            if let Some(other) = proxy.players().by_name(&name) {
                connect_routed(proxy, &other, &server, queued).await;
            } else if let Some(fleet) = proxy.fleet() {
                if let Some(info) = fleet.remote_player_by_name(&name) {
                    let packet = if queued {
                        FleetPacket::SetQueuedServer(SetQueuedServer {
                            uuid: info.uuid,
                            server: Some(server),
                        })
                    } else {
                        FleetPacket::SwitchServer(SwitchServer {
                            proxy_id: info.proxy_id,
                            uuid: info.uuid,
                            server,
                            attempt_id: None,
                        })
                    };
                    fleet.publish(packet).await;
                }
            }
        }
        "IP" => {
            let mut reply = vec![];
            write_utf(&mut reply, "IP");
            write_utf(&mut reply, &player.remote_addr.ip().to_string());
            write_int(&mut reply, i32::from(player.remote_addr.port()));
            replies.push(reply);
        }
        "IPOther" => {
            let name = read_utf(&mut input)?;

            if let Some(other) = proxy.players().by_name(&name) {
                let mut reply = vec![];
                write_utf(&mut reply, "IPOther");
                write_utf(&mut reply, &other.username);
                write_utf(&mut reply, &other.remote_addr.ip().to_string());
                write_int(&mut reply, i32::from(other.remote_addr.port()));
                replies.push(reply);
            }
        }
        "PlayerCount" => {
            let server = read_utf(&mut input)?;

            let count = if server == "ALL" {
                proxy.total_players()
            } else {
                proxy.total_player_count(&server)
            };

            let mut reply = vec![];
            write_utf(&mut reply, "PlayerCount");
            write_utf(&mut reply, &server);
            write_int(&mut reply, count as i32);
            replies.push(reply);
        }
        "PlayerList" => {
            let server = read_utf(&mut input)?;

            let mut names: Vec<String> = proxy
                .players()
                .all()
                .into_iter()
                .filter(|p| server == "ALL" || p.current_server().as_deref() == Some(&server))
                .map(|p| p.username.clone())
                .collect();

            if let Some(fleet) = proxy.fleet() {
                names.extend(
                    fleet
                        .remote_players()
                        .into_iter()
                        .filter(|info| {
                            server == "ALL" || info.current_server.as_deref() == Some(&server)
                        })
                        .map(|info| info.username),
                );
            }

            names.sort();

            let mut reply = vec![];
            write_utf(&mut reply, "PlayerList");
            write_utf(&mut reply, &server);
            write_utf(&mut reply, &names.join(", "));
            replies.push(reply);
        }
        "GetServers" => {
            let names: Vec<String> = proxy
                .servers()
                .into_iter()
                .map(|server| server.name)
                .collect();

            let mut reply = vec![];
            write_utf(&mut reply, "GetServers");
            write_utf(&mut reply, &names.join(", "));
            replies.push(reply);
        }
        "Message" | "MessageRaw" => {
            let name = read_utf(&mut input)?;
            let message = read_utf(&mut input)?;

            let text = if sub_channel == "MessageRaw" {
                TextComponent::from_json_str(&message)?
            } else {
                TextComponent::plain(&*message)
            };

            if name == "ALL" {
                for target in proxy.players().all() {
                    target.send_message(text.clone());
                }
            } else if let Some(target) = proxy.players().by_name(&name) {
                target.send_message(text);
            } else if let Some(fleet) = proxy.fleet() {
                if let Some(info) = fleet.remote_player_by_name(&name) {
                    fleet
                        .publish(FleetPacket::SendMessage(SendMessage {
                            uuid: info.uuid,
                            message: text.to_json_string(),
                        }))
                        .await;
                }
            }
        }
        "GetServer" => {
            let mut reply = vec![];
            write_utf(&mut reply, "GetServer");
            write_utf(&mut reply, &player.current_server().unwrap_or_default());
            replies.push(reply);
        }
        "GetPlayerServer" => {
            let name = read_utf(&mut input)?;

            let server = proxy
                .players()
                .by_name(&name)
                .and_then(|p| p.current_server())
                .or_else(|| {
                    proxy
                        .fleet()
                        .and_then(|fleet| fleet.remote_player_by_name(&name))
                        .and_then(|info| info.current_server)
                })
                .unwrap_or_default();

            let mut reply = vec![];
            write_utf(&mut reply, "GetPlayerServer");
            write_utf(&mut reply, &name);
            write_utf(&mut reply, &server);
            replies.push(reply);
        }
        "UUID" => {
            let mut reply = vec![];
            write_utf(&mut reply, "UUID");
            write_utf(&mut reply, &player.uuid.simple().to_string());
            replies.push(reply);
        }
        "UUIDOther" => {
            let name = read_utf(&mut input)?;

            if let Some(other) = proxy.players().by_name(&name) {
                let mut reply = vec![];
                write_utf(&mut reply, "UUIDOther");
                write_utf(&mut reply, &other.username);
                write_utf(&mut reply, &other.uuid.simple().to_string());
                replies.push(reply);
            }
        }
        "ServerIP" => {
            let name = read_utf(&mut input)?;

            if let Some(address) = proxy.server_address(&name) {
                let (host, port) = address
                    .rsplit_once(':')
                    .map(|(h, p)| (h.to_owned(), p.parse().unwrap_or(25565_u16)))
                    .unwrap_or((address, 25565));

                let mut reply = vec![];
                write_utf(&mut reply, "ServerIP");
                write_utf(&mut reply, &name);
                write_utf(&mut reply, &host);
                write_short(&mut reply, port as i16);
                replies.push(reply);
            }
        }
        "KickPlayer" | "KickPlayerRaw" => {
            let name = read_utf(&mut input)?;
            let reason = read_utf(&mut input)?;

            let text = if sub_channel == "KickPlayerRaw" {
                TextComponent::from_json_str(&reason)?
            } else {
                TextComponent::plain(&*reason)
            };

            if let Some(target) = proxy.players().by_name(&name) {
                target.kick(text);
            } else if let Some(fleet) = proxy.fleet() {
                if let Some(info) = fleet.remote_player_by_name(&name) {
                    fleet
                        .publish(FleetPacket::KickPlayer(gale_redis::packet::KickPlayer {
                            uuid: info.uuid,
                            reason: text.to_json_string(),
                        }))
                        .await;
                }
            }
        }
        "Ping" => {
            let mut reply = vec![];
            write_utf(&mut reply, "Ping");
            write_int(&mut reply, player.ping_ms().unwrap_or(0) as i32);
            replies.push(reply);
        }
        "Forward" => {
            let target = read_utf(&mut input)?;
            let channel = read_utf(&mut input)?;
            let len = read_short(&mut input)?;
            ensure!(len >= 0 && input.len() >= len as usize, "bad Forward body");
            let payload = &input[..len as usize];

            let mut body = vec![];
            write_utf(&mut body, &channel);
            write_short(&mut body, len);
            body.extend_from_slice(payload);

            forward_to_servers(proxy, player, &target, body);
        }
        "ForwardToPlayer" => {
            let name = read_utf(&mut input)?;
            let channel = read_utf(&mut input)?;
            let len = read_short(&mut input)?;
            ensure!(len >= 0 && input.len() >= len as usize, "bad Forward body");
            let payload = &input[..len as usize];

            let mut body = vec![];
            write_utf(&mut body, &channel);
            write_short(&mut body, len);
            body.extend_from_slice(payload);

            if let Some(target) = proxy.players().by_name(&name) {
                target.send_command(PlayerCommand::BackendPluginMessage {
                    channel: reply_channel(target.version).to_owned(),
                    data: body,
                });
            }
        }
        "QueuedServer" => {
            let mut reply = vec![];
            write_utf(&mut reply, "QueuedServer");
            write_utf(
                &mut reply,
                &proxy.queues().queued_target(player.uuid).unwrap_or_default(),
            );
            replies.push(reply);
        }
        "QueuedPosition" => {
            let (position, total) = proxy
                .queues()
                .queued_target(player.uuid)
                .and_then(|target| proxy.queues().position(player.uuid, &target))
                .unwrap_or((0, 0));

            let mut reply = vec![];
            write_utf(&mut reply, "QueuedPosition");
            write_int(&mut reply, position as i32);
            write_int(&mut reply, total as i32);
            replies.push(reply);
        }
        "MaxQueuedPosition" => {
            let server = read_utf(&mut input)?;
            let total = proxy
                .queues()
                .summaries()
                .into_iter()
                .find(|(target, _, _)| *target == server)
                .map_or(0, |(_, len, _)| len);

            let mut reply = vec![];
            write_utf(&mut reply, "MaxQueuedPosition");
            write_utf(&mut reply, &server);
            write_int(&mut reply, total as i32);
            replies.push(reply);
        }
        "QueuedPausedChannel" => {
            let server = read_utf(&mut input)?;

            let mut reply = vec![];
            write_utf(&mut reply, "QueuedPausedChannel");
            write_utf(&mut reply, &server);
            reply.push(u8::from(proxy.queues().is_paused(&server)));
            replies.push(reply);
        }
        other => bail!("unknown sub-channel {other}"),
    }

    Ok(replies)
}

async fn connect_routed(proxy: &Proxy, player: &Player, server: &str, through_queue: bool) {
    if !proxy.has_server(server) {
        return;
    }

    if through_queue {
        use crate::queue::EnqueueOutcome;

        if proxy.queues().enqueue_or_connect(proxy, player, server).await
            == EnqueueOutcome::ConnectNow
        {
            player.connect(server);
        }
    } else {
        player.connect(server);
    }
}

/// Delivers a Forward body to each matching backend, once per server,
/// riding any one player connected there.
fn forward_to_servers(proxy: &Proxy, sender: &Player, target: &str, body: Vec<u8>) {
    let mut seen: Vec<String> = vec![];

    for player in proxy.players().all() {
        if player.uuid == sender.uuid {
            continue;
        }

        let Some(server) = player.current_server() else {
            continue;
        };

        let matches = match target {
            "ALL" | "ONLINE" => true,
            name => server == name,
        };

        if !matches || seen.contains(&server) {
            continue;
        }

        seen.push(server);
        player.send_command(PlayerCommand::BackendPluginMessage {
            channel: reply_channel(player.version).to_owned(),
            data: body.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_output_round_trip() {
        let mut body = vec![];
        write_utf(&mut body, "PlayerCount");
        write_utf(&mut body, "lobby");
        write_int(&mut body, 17);

        let mut input = body.as_slice();
        assert_eq!(read_utf(&mut input).unwrap(), "PlayerCount");
        assert_eq!(read_utf(&mut input).unwrap(), "lobby");
        assert_eq!(input, 17_i32.to_be_bytes());
    }

    #[test]
    fn utf_rejects_truncation() {
        let mut body = vec![];
        write_utf(&mut body, "Connect");
        body.truncate(body.len() - 3);

        let mut input = body.as_slice();
        assert!(read_utf(&mut input).is_err());
    }

    #[test]
    fn channel_names_by_version() {
        assert!(is_bungee_channel("BungeeCord"));
        assert!(is_bungee_channel("bungeecord:main"));
        assert!(!is_bungee_channel("minecraft:brand"));

        assert_eq!(reply_channel(ProtocolVersion::V1_12_2), "BungeeCord");
        assert_eq!(reply_channel(ProtocolVersion::V1_13), "bungeecord:main");
    }
}
