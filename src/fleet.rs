//! The fleet coordination plane: replicated player presence, peer
//! liveness, cross-proxy administration, and the shutdown handoff.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use gale_protocol::text::TextComponent;
use gale_redis::packet::{
    FleetPacket, GetPlayerPing, IdAnnouncement, PlayerJoin, PlayerLeave, PlayerServerChange,
    QueueSendStatus, SendStatus, SetTransferRequest, ShuttingDown,
};
use gale_redis::{RedisBus, RemotePlayerInfo, HEARTBEAT_TTL};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::player::{Player, PlayerCommand, ConnectionStatus};
use crate::{command, Proxy};

/// How long a just-transferred player stays marked, so the receiving
/// proxy can tell the arrival from a fresh connect.
const TRANSFER_MARK_TTL: Duration = Duration::from_secs(30);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PeerStatus {
    Healthy,
    TimedOut,
    Shutdown,
}

/// What this proxy knows about one peer.
#[derive(Clone, Debug)]
pub struct OtherProxy {
    pub id: String,
    pub last_seen: Instant,
    pub status: PeerStatus,
}

/// The connected fleet plane of one proxy.
pub struct Fleet {
    bus: RedisBus,
    peers: Mutex<HashMap<String, OtherProxy>>,
    remote_players: Mutex<HashMap<Uuid, RemotePlayerInfo>>,
    transferring: Mutex<HashMap<Uuid, Instant>>,
    ping_waiters: Mutex<HashMap<Uuid, oneshot::Sender<u64>>>,
}

impl Fleet {
    pub fn proxy_id(&self) -> &str {
        self.bus.proxy_id()
    }

    pub async fn publish(&self, packet: FleetPacket) {
        if let Err(e) = self.bus.publish(&packet).await {
            // Degraded mode: the local proxy keeps serving players.
            warn!("fleet publish failed: {e:#}");
        }
    }

    // ---- presence ------------------------------------------------------

    fn build_info(&self, proxy: &Proxy, player: &Player) -> RemotePlayerInfo {
        let mut priorities = HashMap::new();

        for server in proxy.config().servers.servers.keys() {
            let priority = player.queue_priority(server);
            if priority > 0 {
                priorities.insert(server.clone(), priority);
            }
        }

        let all = player.queue_priority("all");
        if all > 0 {
            priorities.insert("all".into(), all);
        }

        RemotePlayerInfo {
            proxy_id: self.proxy_id().to_owned(),
            uuid: player.uuid,
            username: player.username.clone(),
            current_server: player.current_server(),
            priorities,
            full_bypass: player.has_permission("queue.bypass.full"),
            queue_bypass: player.has_permission("queue.bypass"),
            being_transferred: false,
        }
    }

    pub async fn announce_join(&self, proxy: &Proxy, player: &Player) {
        let info = self.build_info(proxy, player);

        if let Err(e) = self.bus.put_remote_player(&info).await {
            warn!("failed to write player to the fleet registry: {e:#}");
        }

        self.publish(FleetPacket::PlayerJoin(PlayerJoin { info })).await;
    }

    pub async fn announce_leave(&self, player: &Player) {
        if let Err(e) = self.bus.remove_remote_player(player.uuid).await {
            warn!("failed to remove player from the fleet registry: {e:#}");
        }

        self.publish(FleetPacket::PlayerLeave(PlayerLeave {
            proxy_id: self.proxy_id().to_owned(),
            uuid: player.uuid,
        }))
        .await;
    }

    pub async fn announce_server_change(&self, player: &Player, server: Option<String>) {
        self.publish(FleetPacket::PlayerServerChange(PlayerServerChange {
            proxy_id: self.proxy_id().to_owned(),
            uuid: player.uuid,
            server,
        }))
        .await;
    }

    // ---- remote views --------------------------------------------------

    pub fn remote_count(&self) -> usize {
        self.remote_players.lock().len()
    }

    pub fn remote_count_on_server(&self, server: &str) -> usize {
        self.remote_players
            .lock()
            .values()
            .filter(|info| info.current_server.as_deref() == Some(server))
            .count()
    }

    pub fn remote_players(&self) -> Vec<RemotePlayerInfo> {
        self.remote_players.lock().values().cloned().collect()
    }

    pub fn remote_player_by_name(&self, name: &str) -> Option<RemotePlayerInfo> {
        self.remote_players
            .lock()
            .values()
            .find(|info| info.username.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn peers(&self) -> Vec<OtherProxy> {
        self.peers.lock().values().cloned().collect()
    }

    pub fn is_peer_healthy(&self, proxy_id: &str) -> bool {
        self.peers
            .lock()
            .get(proxy_id)
            .is_some_and(|peer| peer.status == PeerStatus::Healthy)
    }

    pub fn peer_player_count(&self, proxy_id: &str) -> usize {
        self.remote_players
            .lock()
            .values()
            .filter(|info| info.proxy_id == proxy_id)
            .count()
    }

    pub fn is_transferring(&self, uuid: Uuid) -> bool {
        self.transferring
            .lock()
            .get(&uuid)
            .is_some_and(|marked| marked.elapsed() < TRANSFER_MARK_TTL)
    }

    pub async fn mark_transferring(&self, uuid: Uuid, server: Option<String>) {
        self.transferring.lock().insert(uuid, Instant::now());

        self.publish(FleetPacket::SetTransferRequest(SetTransferRequest {
            uuid,
            transferring: true,
            currently_connected_server: server,
        }))
        .await;
    }

    pub async fn send_action_bar(&self, uuid: Uuid, text: &TextComponent) {
        self.publish(FleetPacket::SendActionbarRequest(
            gale_redis::packet::SendActionbarRequest {
                uuid,
                message: text.to_json_string(),
            },
        ))
        .await;
    }

    /// Cross-proxy ping probe with a short answer window.
    pub async fn request_ping(&self, uuid: Uuid) -> Option<u64> {
        let (tx, rx) = oneshot::channel();
        self.ping_waiters.lock().insert(uuid, tx);

        self.publish(FleetPacket::GetPlayerPing(GetPlayerPing {
            request_id: Uuid::new_v4(),
            requester: self.proxy_id().to_owned(),
            uuid,
            ping: None,
        }))
        .await;

        let answer = tokio::time::timeout(Duration::from_secs(2), rx).await;
        self.ping_waiters.lock().remove(&uuid);

        answer.ok().and_then(Result::ok)
    }

    fn touch_peer(&self, proxy_id: &str) {
        if proxy_id == self.proxy_id() {
            return;
        }

        let mut peers = self.peers.lock();

        let peer = peers.entry(proxy_id.to_owned()).or_insert_with(|| {
            info!(proxy_id, "discovered peer proxy");

            OtherProxy {
                id: proxy_id.to_owned(),
                last_seen: Instant::now(),
                status: PeerStatus::Healthy,
            }
        });

        peer.last_seen = Instant::now();

        if peer.status == PeerStatus::TimedOut {
            peer.status = PeerStatus::Healthy;
        }
    }
}

/// Connects to the store, refuses stale-heartbeat split brain, installs
/// the fleet plane, and spawns its tasks.
pub async fn start(proxy: &Proxy) -> anyhow::Result<()> {
    let (url, proxy_id) = {
        let config = proxy.config();
        (config.redis.url(), config.redis.proxy_id.clone())
    };

    let bus = RedisBus::connect(&url, &proxy_id)
        .await
        .context("connecting to the fleet store")?;

    if bus.heartbeat_exists().await? {
        bail!(
            "a heartbeat key for proxy id `{proxy_id}` already exists; another instance is \
             running, or a crashed one's key has not expired yet (wait up to {}s)",
            HEARTBEAT_TTL.as_secs()
        );
    }

    bus.set_heartbeat().await?;

    let fleet = Fleet {
        bus: bus.clone(),
        peers: Mutex::new(HashMap::new()),
        remote_players: Mutex::new(HashMap::new()),
        transferring: Mutex::new(HashMap::new()),
        ping_waiters: Mutex::new(HashMap::new()),
    };

    proxy.install_fleet(fleet);
    let fleet = proxy.fleet().expect("fleet just installed");

    fleet
        .publish(FleetPacket::IdAnnouncement(IdAnnouncement {
            proxy_id: proxy_id.clone(),
            wants_reply: true,
        }))
        .await;

    // Heartbeat, liveness sweep, and registry reconciliation.
    {
        let proxy = proxy.clone();
        let bus = bus.clone();

        // Refresh at the configured cadence, but never slower than the
        // key's TTL.
        let period = Duration::from_millis(proxy.config().redis.ping_interval_ms).min(HEARTBEAT_TTL);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    () = proxy.wait_for_shutdown() => return,
                }

                if let Err(e) = bus.set_heartbeat().await {
                    warn!("heartbeat refresh failed: {e:#}");
                }

                let Some(fleet) = proxy.fleet() else { continue };

                // Liveness: silence past the timeout marks a peer dead.
                let timeout =
                    Duration::from_millis(proxy.config().redis.other_proxy_timeout_ms);
                {
                    let mut peers = fleet.peers.lock();
                    for peer in peers.values_mut() {
                        if peer.status == PeerStatus::Healthy
                            && peer.last_seen.elapsed() > timeout
                        {
                            warn!(proxy_id = %peer.id, "peer proxy timed out");
                            peer.status = PeerStatus::TimedOut;
                        }
                    }
                }

                // Expire transfer marks.
                fleet
                    .transferring
                    .lock()
                    .retain(|_, marked| marked.elapsed() < TRANSFER_MARK_TTL);

                // Reconciliation: remove registry rows we own for
                // players who are no longer here.
                match bus.all_remote_players().await {
                    Ok(entries) => {
                        for entry in entries {
                            if entry.proxy_id == bus.proxy_id()
                                && proxy.players().by_uuid(entry.uuid).is_none()
                            {
                                let _ = bus.remove_remote_player(entry.uuid).await;
                            }
                        }
                    }
                    Err(e) => warn!("registry sweep failed: {e:#}"),
                }
            }
        });
    }

    // The pub/sub listener: decode, then dispatch. Handlers never block
    // this task on player IO; anything slow goes through command
    // channels.
    {
        let proxy = proxy.clone();
        let mut rx = bus.start_listener().await?;

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                handle_packet(&proxy, packet).await;
            }
        });
    }

    info!(proxy_id, "fleet plane started");
    Ok(())
}

async fn handle_packet(proxy: &Proxy, packet: FleetPacket) {
    let Some(fleet) = proxy.fleet() else { return };
    let own_id = fleet.proxy_id().to_owned();

    match packet {
        FleetPacket::IdAnnouncement(pkt) => {
            fleet.touch_peer(&pkt.proxy_id);

            if pkt.wants_reply && pkt.proxy_id != own_id {
                fleet
                    .publish(FleetPacket::IdAnnouncement(IdAnnouncement {
                        proxy_id: own_id,
                        wants_reply: false,
                    }))
                    .await;
            }
        }

        FleetPacket::PlayerJoin(pkt) => {
            fleet.touch_peer(&pkt.info.proxy_id);

            if pkt.info.proxy_id == own_id {
                return;
            }

            // One uuid, one proxy: the local copy yields.
            if let Some(local) = proxy.players().by_uuid(pkt.info.uuid) {
                info!(
                    player = %local.username,
                    other_proxy = %pkt.info.proxy_id,
                    "kicking duplicate login connected to another proxy"
                );
                local.kick(TextComponent::translatable(
                    "velocity.error.already-connected-proxy.remote",
                ));
            }

            registry_apply_join(&mut fleet.remote_players.lock(), pkt.info);
        }

        FleetPacket::PlayerLeave(pkt) => {
            fleet.touch_peer(&pkt.proxy_id);

            registry_apply_leave(&mut fleet.remote_players.lock(), &pkt.proxy_id, pkt.uuid);
        }

        FleetPacket::PlayerServerChange(pkt) => {
            fleet.touch_peer(&pkt.proxy_id);

            registry_apply_change(&mut fleet.remote_players.lock(), pkt.uuid, pkt.server);
        }

        FleetPacket::SetQueuedServer(pkt) => {
            if !proxy.queues().is_master(proxy) {
                return;
            }

            match pkt.server {
                Some(server) => {
                    if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                        if proxy
                            .queues()
                            .enqueue_or_connect(proxy, &player, &server)
                            .await
                            == crate::queue::EnqueueOutcome::ConnectNow
                        {
                            player.connect(server);
                        }
                    } else if let Some(info) =
                        fleet.remote_players.lock().get(&pkt.uuid).cloned()
                    {
                        proxy.queues().enqueue_remote(proxy, &info, &server);
                    } else {
                        debug!(uuid = %pkt.uuid, "queue request for unknown player");
                    }
                }
                None => proxy.queues().leave(proxy, pkt.uuid, None).await,
            }
        }

        FleetPacket::SetTransferRequest(pkt) => {
            if pkt.transferring {
                fleet.transferring.lock().insert(pkt.uuid, Instant::now());
            } else {
                fleet.transferring.lock().remove(&pkt.uuid);
            }
        }

        FleetPacket::ShuttingDown(pkt) => {
            info!(proxy_id = %pkt.proxy_id, "peer proxy is shutting down");

            if let Some(peer) = fleet.peers.lock().get_mut(&pkt.proxy_id) {
                peer.status = PeerStatus::Shutdown;
            }

            fleet
                .remote_players
                .lock()
                .retain(|_, info| info.proxy_id != pkt.proxy_id);
        }

        FleetPacket::QueueLeave(pkt) => {
            if proxy.queues().is_master(proxy) {
                proxy
                    .queues()
                    .leave(proxy, pkt.uuid, pkt.server.as_deref())
                    .await;
            }
        }

        FleetPacket::QueuePause(pkt) => {
            if proxy.queues().is_master(proxy) {
                proxy.queues().set_paused(proxy, &pkt.server, pkt.paused).await;
            }
        }

        FleetPacket::QueueSendStatus(pkt) => {
            if proxy.queues().is_master(proxy) {
                proxy.queues().on_send_status(proxy, &pkt).await;
            }
        }

        FleetPacket::QueueAlreadyJoined(pkt) => {
            if proxy.queues().is_master(proxy) {
                proxy
                    .queues()
                    .apply_attempt_result(
                        proxy,
                        &pkt.server,
                        pkt.uuid,
                        SendStatus::AlreadyConnected,
                    )
                    .await;
            }
        }

        FleetPacket::SendMessage(pkt) => {
            if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                if let Ok(text) = TextComponent::from_json_str(&pkt.message) {
                    player.send_message(text);
                }
            }
        }

        FleetPacket::SendActionbarRequest(pkt) => {
            if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                if let Ok(text) = TextComponent::from_json_str(&pkt.message) {
                    player.send_action_bar(text);
                }
            }
        }

        FleetPacket::ServerAlert(pkt) => {
            if let Ok(text) = TextComponent::from_json_str(&pkt.message) {
                for player in proxy.players().all() {
                    player.send_message(text.clone());
                }
            }
        }

        FleetPacket::KickPlayer(pkt) => {
            if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                let reason = TextComponent::from_json_str(&pkt.reason)
                    .unwrap_or_else(|_| TextComponent::plain("Kicked from the network."));
                player.kick(reason);
            }
        }

        FleetPacket::Sudo(pkt) => {
            if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                player.send_command(PlayerCommand::Sudo {
                    command: pkt.command,
                });
            }
        }

        FleetPacket::TransferCommandRequest(pkt) => {
            if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                player.send_command(PlayerCommand::Transfer {
                    host: pkt.host,
                    port: pkt.port,
                });
            }
        }

        FleetPacket::SwitchServer(pkt) => {
            if pkt.proxy_id != own_id {
                return;
            }

            let Some(player) = proxy.players().by_uuid(pkt.uuid) else {
                return;
            };

            // The switch outcome travels back to the master, keyed by
            // the attempt.
            let proxy = proxy.clone();

            tokio::spawn(async move {
                let status = player.connect_with_result(pkt.server.clone()).await;

                if let Some(fleet) = proxy.fleet() {
                    fleet
                        .publish(FleetPacket::QueueSendStatus(QueueSendStatus {
                            attempt_id: pkt.attempt_id.unwrap_or_else(Uuid::new_v4),
                            uuid: pkt.uuid,
                            server: pkt.server,
                            status: to_send_status(status),
                        }))
                        .await;
                }
            });
        }

        FleetPacket::GetPlayerPing(pkt) => {
            match pkt.ping {
                // A probe: answer it if the player is ours.
                None => {
                    if pkt.requester == own_id {
                        return;
                    }

                    if let Some(player) = proxy.players().by_uuid(pkt.uuid) {
                        fleet
                            .publish(FleetPacket::GetPlayerPing(GetPlayerPing {
                                ping: Some(player.ping_ms().unwrap_or(0)),
                                ..pkt
                            }))
                            .await;
                    }
                }
                // An answer addressed to us.
                Some(ping) => {
                    if pkt.requester != own_id {
                        return;
                    }

                    if let Some(waiter) = fleet.ping_waiters.lock().remove(&pkt.uuid) {
                        let _ = waiter.send(ping);
                    }
                }
            }
        }

        FleetPacket::GenericCommandRequest(pkt) => {
            if pkt.target.as_deref().is_some_and(|target| target != own_id) {
                return;
            }

            match pkt.command.as_str() {
                "reload" => {
                    if let Err(e) = command::reload(proxy).await {
                        warn!("fleet-requested reload failed: {e:#}");
                    }
                }
                "uptime" => {
                    info!(
                        uptime_secs = proxy.uptime().as_secs(),
                        "uptime requested over the fleet bus"
                    );
                }
                other => debug!(command = other, "unknown generic fleet command"),
            }
        }
    }
}

// The registry transitions, kept as plain functions on the map: the
// handlers above stay idempotent, and interleavings of packets about
// different players commute.

fn registry_apply_join(map: &mut HashMap<Uuid, RemotePlayerInfo>, info: RemotePlayerInfo) {
    map.insert(info.uuid, info);
}

fn registry_apply_change(
    map: &mut HashMap<Uuid, RemotePlayerInfo>,
    uuid: Uuid,
    server: Option<String>,
) {
    if let Some(info) = map.get_mut(&uuid) {
        info.current_server = server;
    }
}

fn registry_apply_leave(map: &mut HashMap<Uuid, RemotePlayerInfo>, proxy_id: &str, uuid: Uuid) {
    // A leave only erases the entry its own proxy wrote; a stale leave
    // arriving after the player joined elsewhere is a no-op.
    if map.get(&uuid).is_some_and(|info| info.proxy_id == proxy_id) {
        map.remove(&uuid);
    }
}

fn to_send_status(status: ConnectionStatus) -> SendStatus {
    match status {
        ConnectionStatus::Successful => SendStatus::Successful,
        ConnectionStatus::ConnectionInProgress => SendStatus::ConnectionInProgress,
        ConnectionStatus::ConnectionCancelled => SendStatus::ConnectionCancelled,
        ConnectionStatus::ServerDisconnected => SendStatus::ServerDisconnected,
        ConnectionStatus::AlreadyConnected => SendStatus::AlreadyConnected,
    }
}

impl Fleet {
    pub async fn set_paused_key(&self, target: &str, paused: bool) {
        if let Err(e) = self.bus.set_queue_paused(target, paused).await {
            warn!("failed to update the paused-queues set: {e:#}");
        }
    }

    /// Mirrors the master's queue state into the shared cache hash.
    pub async fn cache_queue(&self, target: &str, snapshot_json: &str) {
        if let Err(e) = self.bus.cache_queue(target, snapshot_json).await {
            warn!("failed to cache queue snapshot: {e:#}");
        }
    }

    pub async fn drop_cached_queue(&self, target: &str) {
        if let Err(e) = self.bus.drop_cached_queue(target).await {
            warn!("failed to drop queue snapshot: {e:#}");
        }
    }

    /// Clean shutdown: tell the fleet, move players, drop the
    /// heartbeat.
    pub async fn shutdown(&self, proxy: &Proxy) {
        self.publish(FleetPacket::ShuttingDown(ShuttingDown {
            proxy_id: self.proxy_id().to_owned(),
        }))
        .await;

        let transfer_players = {
            let config = proxy.config();
            config.queue.queue_on_shutdown && config.accepts_transfers
        };

        let target = if transfer_players {
            proxy.pick_transfer_target()
        } else {
            None
        };

        for player in proxy.players().all() {
            match (&target, player.version.supports_transfers()) {
                (Some(peer), true) => {
                    self.mark_transferring(player.uuid, player.current_server())
                        .await;

                    player.send_command(PlayerCommand::Transfer {
                        host: peer.host.clone(),
                        port: peer.port,
                    });
                }
                _ => player.kick(TextComponent::plain("Proxy shutting down.")),
            }
        }

        if target.is_some() {
            // The transfer packet needs to reach the clients before the
            // sockets drop.
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if let Err(e) = self.bus.clear_heartbeat().await {
            warn!("failed to clear heartbeat on shutdown: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(proxy_id: &str, uuid: u128, server: Option<&str>) -> RemotePlayerInfo {
        RemotePlayerInfo {
            proxy_id: proxy_id.into(),
            uuid: Uuid::from_u128(uuid),
            username: format!("p{uuid}"),
            current_server: server.map(str::to_owned),
            priorities: HashMap::new(),
            full_bypass: false,
            queue_bypass: false,
            being_transferred: false,
        }
    }

    #[test]
    fn registry_interleavings_commute() {
        // Events about different players reach different proxies in
        // different orders; the terminal registry must not care.
        let mut a = HashMap::new();
        registry_apply_join(&mut a, info("p1", 1, None));
        registry_apply_join(&mut a, info("p2", 2, Some("hub")));
        registry_apply_change(&mut a, Uuid::from_u128(1), Some("lobby".into()));
        registry_apply_leave(&mut a, "p2", Uuid::from_u128(2));

        let mut b = HashMap::new();
        registry_apply_join(&mut b, info("p2", 2, Some("hub")));
        registry_apply_leave(&mut b, "p2", Uuid::from_u128(2));
        registry_apply_join(&mut b, info("p1", 1, None));
        registry_apply_change(&mut b, Uuid::from_u128(1), Some("lobby".into()));

        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(
            a[&Uuid::from_u128(1)].current_server.as_deref(),
            Some("lobby")
        );
    }

    #[test]
    fn registry_application_is_idempotent() {
        let mut once = HashMap::new();
        registry_apply_join(&mut once, info("p1", 7, Some("hub")));

        let mut twice = HashMap::new();
        registry_apply_join(&mut twice, info("p1", 7, Some("hub")));
        registry_apply_join(&mut twice, info("p1", 7, Some("hub")));

        assert_eq!(once, twice);
    }

    #[test]
    fn stale_leave_does_not_erase_a_rejoin() {
        // The player hopped to p2; p1's late leave must not remove the
        // new entry.
        let mut map = HashMap::new();
        registry_apply_join(&mut map, info("p2", 5, Some("hub")));
        registry_apply_leave(&mut map, "p1", Uuid::from_u128(5));

        assert!(map.contains_key(&Uuid::from_u128(5)));

        // A change for a player nobody has joined yet is dropped; the
        // periodic reconciliation sweep repairs any divergence.
        registry_apply_change(&mut map, Uuid::from_u128(9), Some("hub".into()));
        assert!(!map.contains_key(&Uuid::from_u128(9)));
    }
}
