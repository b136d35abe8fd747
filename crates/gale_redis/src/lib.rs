//! The fleet transport: a thin layer over one Redis deployment that
//! carries the pub/sub packet bus, the per-proxy heartbeat keys, and
//! the shared player/queue hashes.
//!
//! Handlers live in the proxy; this crate only moves packets and keys.

pub mod packet;

use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::packet::{FleetPacket, RemotePlayerInfo, SendStatus};

/// The pub/sub channel every proxy in the fleet subscribes to.
pub const CHANNEL: &str = "velocityredis";

/// Per-proxy liveness key; expires if the owner stops refreshing it.
pub const HEARTBEAT_PREFIX: &str = "PROXY_HEARTBEAT:";

/// TTL and refresh period of the heartbeat key.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(30);

/// Hash of `uuid -> RemotePlayerInfo` JSON, maintained cooperatively.
pub const REMOTE_PLAYERS_KEY: &str = "remote-players";

/// Hash of `server -> queue snapshot` JSON written by the master.
pub const QUEUE_CACHE_KEY: &str = "queue-cache";

/// Set of target servers whose queues are paused.
pub const PAUSED_QUEUES_KEY: &str = "PAUSED_QUEUES";

/// A connected fleet endpoint.
///
/// Cloning is cheap; all clones share the underlying multiplexed
/// connection.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    proxy_id: String,
}

impl RedisBus {
    /// Connects to the key/value store. `url` is a full `redis://` or
    /// `rediss://` URL; `proxy_id` names this proxy on the bus.
    pub async fn connect(url: &str, proxy_id: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;

        let conn = ConnectionManager::new(client.clone())
            .await
            .context("connecting to redis")?;

        info!(proxy_id, "connected to the fleet store");

        Ok(Self {
            client,
            conn,
            proxy_id: proxy_id.to_owned(),
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Publishes one packet to every proxy (including this one; the
    /// listener filters self-addressed traffic as it sees fit).
    pub async fn publish(&self, packet: &FleetPacket) -> anyhow::Result<()> {
        let payload = packet.to_envelope()?;
        let mut conn = self.conn.clone();

        let _: () = conn
            .publish(CHANNEL, payload)
            .await
            .context("publishing fleet packet")?;

        Ok(())
    }

    /// Spawns the pub/sub listener. Decoded packets arrive on the
    /// returned channel; schema errors are logged and dropped. The
    /// listener reconnects forever until the receiver is dropped.
    pub async fn start_listener(&self) -> anyhow::Result<mpsc::UnboundedReceiver<FleetPacket>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!("fleet pub/sub connect failed: {e}");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                if let Err(e) = pubsub.subscribe(CHANNEL).await {
                    warn!("fleet pub/sub subscribe failed: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();

                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            debug!("unreadable fleet payload: {e}");
                            continue;
                        }
                    };

                    match FleetPacket::from_envelope(&payload) {
                        Ok(Some(packet)) => {
                            if tx.send(packet).is_err() {
                                // Receiver gone; the proxy is shutting down.
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("dropping fleet packet: {e:#}"),
                    }
                }

                warn!("fleet pub/sub stream ended, reconnecting");
            }
        });

        Ok(rx)
    }

    fn heartbeat_key(&self) -> String {
        format!("{HEARTBEAT_PREFIX}{}", self.proxy_id)
    }

    /// Refreshes this proxy's heartbeat key with the standard TTL.
    pub async fn set_heartbeat(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .set_ex(self.heartbeat_key(), "online", HEARTBEAT_TTL.as_secs())
            .await
            .context("writing heartbeat")?;

        Ok(())
    }

    /// Whether a heartbeat key for this proxy id already exists. A
    /// stale key at boot means another instance with this id is (or
    /// recently was) alive, and startup must refuse.
    pub async fn heartbeat_exists(&self) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();

        conn.exists(self.heartbeat_key())
            .await
            .context("checking heartbeat")
    }

    /// Deletes this proxy's heartbeat key on clean shutdown.
    pub async fn clear_heartbeat(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .del(self.heartbeat_key())
            .await
            .context("clearing heartbeat")?;

        Ok(())
    }

    /// Upserts one player into the fleet registry hash.
    pub async fn put_remote_player(&self, info: &RemotePlayerInfo) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(info)?;

        let _: () = conn
            .hset(REMOTE_PLAYERS_KEY, info.uuid.to_string(), json)
            .await
            .context("writing remote player")?;

        Ok(())
    }

    pub async fn remove_remote_player(&self, uuid: Uuid) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .hdel(REMOTE_PLAYERS_KEY, uuid.to_string())
            .await
            .context("removing remote player")?;

        Ok(())
    }

    /// Reads the whole fleet registry. Entries that fail to parse are
    /// skipped with a log line rather than failing the sweep.
    pub async fn all_remote_players(&self) -> anyhow::Result<Vec<RemotePlayerInfo>> {
        let mut conn = self.conn.clone();

        let raw: std::collections::HashMap<String, String> = conn
            .hgetall(REMOTE_PLAYERS_KEY)
            .await
            .context("reading remote players")?;

        let mut players = Vec::with_capacity(raw.len());
        for (uuid, json) in raw {
            match serde_json::from_str(&json) {
                Ok(info) => players.push(info),
                Err(e) => warn!(uuid, "skipping unreadable registry entry: {e}"),
            }
        }

        Ok(players)
    }

    /// Marks a queue paused or resumed in the shared set.
    pub async fn set_queue_paused(&self, server: &str, paused: bool) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = if paused {
            conn.sadd(PAUSED_QUEUES_KEY, server).await
        } else {
            conn.srem(PAUSED_QUEUES_KEY, server).await
        }
        .context("updating paused queues")?;

        Ok(())
    }

    pub async fn paused_queues(&self) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();

        conn.smembers(PAUSED_QUEUES_KEY)
            .await
            .context("reading paused queues")
    }

    /// Stores the master's snapshot of one queue, for observability and
    /// master failover.
    pub async fn cache_queue(&self, server: &str, snapshot_json: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .hset(QUEUE_CACHE_KEY, server, snapshot_json)
            .await
            .context("caching queue snapshot")?;

        Ok(())
    }

    pub async fn drop_cached_queue(&self, server: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .hdel(QUEUE_CACHE_KEY, server)
            .await
            .context("dropping queue snapshot")?;

        Ok(())
    }
}
