//! The built-in command surface: thin drivers over the player
//! registry, the switch engine, the queues, and the fleet plane.

use anyhow::Context;
use gale_protocol::text::TextComponent;
use gale_redis::packet::{
    FleetPacket, GenericCommandRequest, ServerAlert, TransferCommandRequest,
};
use tracing::{info, warn};

use crate::player::{Player, PermissionValue, PlayerCommand};
use crate::queue::EnqueueOutcome;
use crate::{switch, Proxy, PROXY_VERSION};

/// Every top-level command name the proxy owns.
const COMMANDS: &[&str] = &[
    "server",
    "hub",
    "lobby",
    "find",
    "send",
    "alert",
    "alertraw",
    "glist",
    "plist",
    "ping",
    "showall",
    "queue",
    "leavequeue",
    "queueadmin",
    "transfer",
    "gale",
];

/// Whether a chat line names a proxy command (as opposed to something
/// the backend should see).
pub fn is_proxy_command(_proxy: &Proxy, line: &str) -> bool {
    let name = line.split_whitespace().next().unwrap_or("");
    COMMANDS.contains(&name.to_lowercase().as_str())
}

/// Permission gate: `gale.command.<name>`, with a per-command default
/// for resolvers that answer `Undefined`.
fn allowed(player: &Player, name: &str, default_allow: bool) -> bool {
    match (player.permissions)(&format!("gale.command.{name}")) {
        PermissionValue::True => true,
        PermissionValue::False => false,
        PermissionValue::Undefined => default_allow,
    }
}

fn deny(player: &Player) {
    player.send_message(TextComponent::plain(
        "You do not have permission to run this command.",
    ));
}

/// Runs one already-identified proxy command on behalf of a player.
pub async fn dispatch(proxy: &Proxy, player: &Player, line: &str) {
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or("").to_lowercase();
    let args: Vec<&str> = words.collect();

    match name.as_str() {
        "server" => cmd_server(proxy, player, &args).await,
        "hub" | "lobby" => cmd_hub(proxy, player).await,
        "find" => cmd_find(proxy, player, &args),
        "send" => cmd_send(proxy, player, &args).await,
        "alert" => cmd_alert(proxy, player, &args, false).await,
        "alertraw" => cmd_alert(proxy, player, &args, true).await,
        "glist" => cmd_glist(proxy, player, &args),
        "plist" => cmd_plist(proxy, player),
        "ping" => cmd_ping(proxy, player, &args).await,
        "showall" => cmd_showall(proxy, player, &args),
        "queue" => cmd_queue(proxy, player, &args).await,
        "leavequeue" => cmd_leavequeue(proxy, player).await,
        "queueadmin" => cmd_queueadmin(proxy, player, &args).await,
        "transfer" => cmd_transfer(proxy, player, &args).await,
        "gale" => cmd_gale(proxy, player, &args).await,
        _ => {}
    }
}

async fn cmd_server(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "server", true) {
        return deny(player);
    }

    match args.first() {
        None => {
            let names: Vec<String> = proxy.servers().into_iter().map(|s| s.name).collect();
            let current = player.current_server().unwrap_or_default();

            player.send_message(TextComponent::plain(format!(
                "You are on {current}. Available servers: {}",
                names.join(", ")
            )));
        }
        Some(name) => {
            if !proxy.has_server(name) {
                player.send_message(TextComponent::plain(format!("Unknown server {name}.")));
                return;
            }

            connect_through_queue(proxy, player, name).await;
        }
    }
}

async fn cmd_hub(proxy: &Proxy, player: &Player) {
    if !allowed(player, "hub", true) {
        return deny(player);
    }

    let candidates = switch::candidate_servers(
        proxy,
        player.virtual_host.as_deref(),
        &[],
        player.current_server().as_deref(),
        None,
    );

    let filter = proxy.config().servers.dynamic_fallbacks_filter;
    match switch::pick_fallback(filter, &candidates, |name| proxy.total_player_count(name)) {
        Some(server) => connect_through_queue(proxy, player, &server).await,
        None => player.send_message(TextComponent::translatable(
            "velocity.error.no-available-servers",
        )),
    }
}

async fn connect_through_queue(proxy: &Proxy, player: &Player, server: &str) {
    if proxy.queues().enqueue_or_connect(proxy, player, server).await
        == EnqueueOutcome::ConnectNow
    {
        player.connect(server);
    } else {
        player.send_message(TextComponent::plain(format!("Queued for {server}.")));
    }
}

fn cmd_find(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "find", false) {
        return deny(player);
    }

    let Some(name) = args.first() else {
        player.send_message(TextComponent::plain("Usage: /find <player>"));
        return;
    };

    if let Some(target) = proxy.players().by_name(name) {
        player.send_message(TextComponent::plain(format!(
            "{} is on {} (this proxy).",
            target.username,
            target.current_server().unwrap_or_else(|| "no server".into())
        )));
        return;
    }

    if let Some(info) = proxy
        .fleet()
        .and_then(|fleet| fleet.remote_player_by_name(name))
    {
        player.send_message(TextComponent::plain(format!(
            "{} is on {} (proxy {}).",
            info.username,
            info.current_server.unwrap_or_else(|| "no server".into()),
            info.proxy_id
        )));
        return;
    }

    player.send_message(TextComponent::plain(format!("{name} is not online.")));
}

async fn cmd_send(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "send", false) {
        return deny(player);
    }

    let (Some(who), Some(server)) = (args.first(), args.get(1)) else {
        player.send_message(TextComponent::plain("Usage: /send <player|all|current> <server>"));
        return;
    };

    if !proxy.has_server(server) {
        player.send_message(TextComponent::plain(format!("Unknown server {server}.")));
        return;
    }

    match *who {
        "all" => {
            for target in proxy.players().all() {
                target.connect(*server);
            }
        }
        "current" => {
            let Some(current) = player.current_server() else {
                return;
            };
            for target in proxy.players().on_server(&current) {
                target.connect(*server);
            }
        }
        name => match proxy.players().by_name(name) {
            Some(target) => target.connect(*server),
            None => {
                if let Some(fleet) = proxy.fleet() {
                    if let Some(info) = fleet.remote_player_by_name(name) {
                        fleet
                            .publish(FleetPacket::SwitchServer(
                                gale_redis::packet::SwitchServer {
                                    proxy_id: info.proxy_id,
                                    uuid: info.uuid,
                                    server: (*server).to_owned(),
                                    attempt_id: None,
                                },
                            ))
                            .await;
                        return;
                    }
                }

                player.send_message(TextComponent::plain(format!("{name} is not online.")));
            }
        },
    }
}

async fn cmd_alert(proxy: &Proxy, player: &Player, args: &[&str], raw: bool) {
    if !allowed(player, "alert", false) {
        return deny(player);
    }

    let message = args.join(" ");
    if message.is_empty() {
        player.send_message(TextComponent::plain("Usage: /alert <message>"));
        return;
    }

    let text = if raw {
        match TextComponent::from_json_str(&message) {
            Ok(text) => text,
            Err(e) => {
                player.send_message(TextComponent::plain(format!("Bad component: {e}")));
                return;
            }
        }
    } else {
        TextComponent::plain(format!("[Alert] {message}"))
    };

    for target in proxy.players().all() {
        target.send_message(text.clone());
    }

    if let Some(fleet) = proxy.fleet() {
        fleet
            .publish(FleetPacket::ServerAlert(ServerAlert {
                message: text.to_json_string(),
            }))
            .await;
    }
}

fn cmd_glist(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "glist", true) {
        return deny(player);
    }

    match args.first() {
        Some(server) => {
            player.send_message(TextComponent::plain(format!(
                "{server}: {} players",
                proxy.total_player_count(server)
            )));
        }
        None => {
            let mut lines: Vec<String> = proxy
                .servers()
                .into_iter()
                .map(|server| {
                    format!("{}: {}", server.name, proxy.total_player_count(&server.name))
                })
                .collect();
            lines.sort();

            player.send_message(TextComponent::plain(format!(
                "Players online: {} | {}",
                proxy.total_players(),
                lines.join(", ")
            )));
        }
    }
}

fn cmd_plist(proxy: &Proxy, player: &Player) {
    if !allowed(player, "plist", false) {
        return deny(player);
    }

    let local = proxy.players().count();
    let mut lines = vec![format!("this proxy: {local}")];

    if let Some(fleet) = proxy.fleet() {
        for peer in fleet.peers() {
            lines.push(format!(
                "{}: {} ({:?})",
                peer.id,
                fleet.peer_player_count(&peer.id),
                peer.status
            ));
        }
    }

    player.send_message(TextComponent::plain(lines.join(" | ")));
}

async fn cmd_ping(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "ping", true) {
        return deny(player);
    }

    match args.first() {
        None => {
            let ping = player.ping_ms().map_or_else(
                || "unknown".to_owned(),
                |ms| format!("{ms} ms"),
            );
            player.send_message(TextComponent::plain(format!("Your ping: {ping}")));
        }
        Some(name) => {
            if let Some(target) = proxy.players().by_name(name) {
                let ping = target.ping_ms().map_or_else(
                    || "unknown".to_owned(),
                    |ms| format!("{ms} ms"),
                );
                player.send_message(TextComponent::plain(format!(
                    "{}'s ping: {ping}",
                    target.username
                )));
            } else if let Some(fleet) = proxy.fleet() {
                match fleet.remote_player_by_name(name) {
                    Some(info) => {
                        let answer = fleet.request_ping(info.uuid).await;
                        let ping = answer.map_or_else(
                            || "unknown".to_owned(),
                            |ms| format!("{ms} ms"),
                        );
                        player.send_message(TextComponent::plain(format!(
                            "{}'s ping: {ping}",
                            info.username
                        )));
                    }
                    None => {
                        player
                            .send_message(TextComponent::plain(format!("{name} is not online.")));
                    }
                }
            }
        }
    }
}

fn cmd_showall(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "showall", false) {
        return deny(player);
    }

    let Some(server) = args.first() else {
        player.send_message(TextComponent::plain("Usage: /showall <server>"));
        return;
    };

    let mut names: Vec<String> = proxy
        .players()
        .on_server(server)
        .into_iter()
        .map(|p| p.username.clone())
        .collect();

    if let Some(fleet) = proxy.fleet() {
        names.extend(
            fleet
                .remote_players()
                .into_iter()
                .filter(|info| info.current_server.as_deref() == Some(*server))
                .map(|info| info.username),
        );
    }

    names.sort();

    player.send_message(TextComponent::plain(format!(
        "{server} ({}): {}",
        names.len(),
        names.join(", ")
    )));
}

async fn cmd_queue(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "queue", true) {
        return deny(player);
    }

    let Some(server) = args.first() else {
        match proxy
            .queues()
            .queued_target(player.uuid)
            .and_then(|target| {
                proxy
                    .queues()
                    .position(player.uuid, &target)
                    .map(|(pos, total)| (target, pos, total))
            }) {
            Some((target, pos, total)) => {
                player.send_message(TextComponent::plain(format!(
                    "In queue for {target}: position {pos} of {total}."
                )));
            }
            None => player.send_message(TextComponent::plain("Usage: /queue <server>")),
        }
        return;
    };

    if !proxy.has_server(server) {
        player.send_message(TextComponent::plain(format!("Unknown server {server}.")));
        return;
    }

    connect_through_queue(proxy, player, server).await;
}

async fn cmd_leavequeue(proxy: &Proxy, player: &Player) {
    if !allowed(player, "leavequeue", true) {
        return deny(player);
    }

    proxy.queues().leave(proxy, player.uuid, None).await;
    player.send_message(TextComponent::plain("Left all queues."));
}

async fn cmd_queueadmin(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "queueadmin", false) {
        return deny(player);
    }

    match args {
        ["listqueues"] => {
            let mut lines: Vec<String> = proxy
                .queues()
                .summaries()
                .into_iter()
                .map(|(target, len, paused)| {
                    format!("{target}: {len}{}", if paused { " (paused)" } else { "" })
                })
                .collect();
            lines.sort();

            player.send_message(TextComponent::plain(if lines.is_empty() {
                "No active queues.".to_owned()
            } else {
                lines.join(", ")
            }));
        }
        ["pause", server] => {
            proxy.queues().set_paused(proxy, server, true).await;
            player.send_message(TextComponent::plain(format!("Paused queue {server}.")));
        }
        ["unpause", server] => {
            proxy.queues().set_paused(proxy, server, false).await;
            player.send_message(TextComponent::plain(format!("Unpaused queue {server}.")));
        }
        ["add", who, server] => {
            if let Some(target) = proxy.players().by_name(who) {
                connect_through_queue(proxy, &target, server).await;
            } else {
                player.send_message(TextComponent::plain(format!("{who} is not online.")));
            }
        }
        ["addall", from, to] => {
            for target in proxy.players().on_server(from) {
                connect_through_queue(proxy, &target, to).await;
            }
        }
        ["remove", who] => {
            if let Some(target) = proxy.players().by_name(who) {
                proxy.queues().leave(proxy, target.uuid, None).await;
            }
        }
        ["remove", who, server] => {
            if let Some(target) = proxy.players().by_name(who) {
                proxy.queues().leave(proxy, target.uuid, Some(server)).await;
            }
        }
        ["removeall", server] => {
            let entries: Vec<_> = proxy
                .players()
                .all()
                .into_iter()
                .filter(|p| {
                    proxy.queues().position(p.uuid, server).is_some()
                })
                .collect();

            for target in entries {
                proxy.queues().leave(proxy, target.uuid, Some(server)).await;
            }
        }
        _ => player.send_message(TextComponent::plain(
            "Usage: /queueadmin <listqueues|pause|unpause|add|addall|remove|removeall> ...",
        )),
    }
}

async fn cmd_transfer(proxy: &Proxy, player: &Player, args: &[&str]) {
    if !allowed(player, "transfer", false) {
        return deny(player);
    }

    let (Some(who), Some(host)) = (args.first(), args.get(1)) else {
        player.send_message(TextComponent::plain("Usage: /transfer <player> <host> [port]"));
        return;
    };

    let port: u16 = args
        .get(2)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(25565);

    if let Some(target) = proxy.players().by_name(who) {
        if !target.version.supports_transfers() {
            player.send_message(TextComponent::plain(format!(
                "{} is on {}, which cannot be transferred.",
                target.username, target.version
            )));
            return;
        }

        target.send_command(PlayerCommand::Transfer {
            host: (*host).to_owned(),
            port,
        });
    } else if let Some(fleet) = proxy.fleet() {
        if let Some(info) = fleet.remote_player_by_name(who) {
            fleet
                .publish(FleetPacket::TransferCommandRequest(TransferCommandRequest {
                    uuid: info.uuid,
                    host: (*host).to_owned(),
                    port,
                }))
                .await;
        } else {
            player.send_message(TextComponent::plain(format!("{who} is not online.")));
        }
    }
}

async fn cmd_gale(proxy: &Proxy, player: &Player, args: &[&str]) {
    match args.first().copied() {
        Some("uptime") => {
            if !allowed(player, "uptime", true) {
                return deny(player);
            }

            let uptime = proxy.uptime();
            let (h, m, s) = (
                uptime.as_secs() / 3600,
                (uptime.as_secs() % 3600) / 60,
                uptime.as_secs() % 60,
            );
            player.send_message(TextComponent::plain(format!("Uptime: {h}h {m}m {s}s")));
        }
        Some("version") | None => {
            if !allowed(player, "version", true) {
                return deny(player);
            }

            player.send_message(TextComponent::plain(format!("Gale {PROXY_VERSION}")));
        }
        Some("plugins") => {
            if !allowed(player, "plugins", true) {
                return deny(player);
            }

            // The plugin host is external; the core has nothing loaded.
            player.send_message(TextComponent::plain("No plugins loaded."));
        }
        Some("reload") => {
            if !allowed(player, "reload", false) {
                return deny(player);
            }

            match reload(proxy).await {
                Ok(()) => player.send_message(TextComponent::plain("Configuration reloaded.")),
                Err(e) => {
                    player.send_message(TextComponent::plain(format!("Reload failed: {e:#}")));
                }
            }

            if let Some(fleet) = proxy.fleet() {
                fleet
                    .publish(FleetPacket::GenericCommandRequest(GenericCommandRequest {
                        target: None,
                        command: "reload".into(),
                    }))
                    .await;
            }
        }
        Some("dump") => {
            if !allowed(player, "dump", false) {
                return deny(player);
            }

            info!(
                players = proxy.players().count(),
                servers = proxy.servers().len(),
                uptime_secs = proxy.uptime().as_secs(),
                "state dump requested"
            );
            player.send_message(TextComponent::plain("State dumped to the proxy log."));
        }
        Some(other) => {
            player.send_message(TextComponent::plain(format!(
                "Unknown subcommand {other}. Try uptime, reload, dump, plugins, version."
            )));
        }
    }
}

/// Re-reads the configuration file. Players on servers that vanished
/// are moved through the normal fallback pass; queues for vanished
/// targets are dropped.
pub async fn reload(proxy: &Proxy) -> anyhow::Result<()> {
    let path = proxy
        .config_path()
        .context("no configuration path recorded")?;

    let config = crate::config::Config::load(&path)?;

    proxy.replace_config(config);
    info!("configuration reloaded");

    proxy
        .queues()
        .retain_targets(|target| proxy.has_server(target));

    // Evacuate players whose backend no longer exists.
    for player in proxy.players().all() {
        let Some(current) = player.current_server() else {
            continue;
        };

        if proxy.has_server(&current) {
            continue;
        }

        warn!(
            player = %player.username,
            server = %current,
            "server removed by reload; evacuating"
        );

        match switch::decide(proxy, &player, true, None) {
            switch::KickVerb::RedirectPlayer { server, .. } => player.connect(server),
            switch::KickVerb::DisconnectPlayer(reason) | switch::KickVerb::Notify(reason) => {
                player.kick(reason);
            }
        }
    }

    Ok(())
}
