//! Per-target-server connection queues: priority bands, paced
//! admission, pause state, and the master-proxy coordination used in
//! fleet mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use gale_protocol::text::TextComponent;
use gale_redis::packet::{
    FleetPacket, QueueLeave, QueuePause, QueueSendStatus, SendStatus, SetQueuedServer,
    SwitchServer,
};
use gale_redis::RemotePlayerInfo;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::player::{ConnectionStatus, Player};
use crate::Proxy;

/// How long one dispatch may stay unanswered before the head entry is
/// retried.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// What `enqueue_or_connect` decided.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EnqueueOutcome {
    /// No queueing applies; the caller connects directly.
    ConnectNow,
    /// The player is parked in the queue (locally or on the master).
    Queued,
}

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub player_uuid: Uuid,
    pub username: String,
    pub priority: i32,
    pub full_bypass: bool,
    pub queue_bypass: bool,
    pub attempts: u32,
    pub waiting_for_connection: bool,
    /// The proxy hosting the player (fleet mode); `None` means local.
    pub owner_proxy: Option<String>,
    /// Monotonic insertion stamp; FIFO order within a priority band.
    order: u64,
    enqueued_at: Instant,
    attempt_started: Option<Instant>,
    attempt_id: Option<Uuid>,
}

struct Queue {
    entries: Vec<QueueEntry>,
    paused: bool,
    last_dispatch: Instant,
    last_message: Instant,
}

impl Queue {
    fn new() -> Self {
        let past = Instant::now() - Duration::from_secs(3600);

        Self {
            entries: vec![],
            paused: false,
            last_dispatch: past,
            last_message: past,
        }
    }

    /// Inserts preserving the ordering invariant: higher priority
    /// first, then the monotonic insertion stamp within a band.
    fn insert(&mut self, entry: QueueEntry) {
        let at = self
            .entries
            .iter()
            .position(|existing| {
                existing.priority < entry.priority
                    || (existing.priority == entry.priority && existing.order > entry.order)
            })
            .unwrap_or(self.entries.len());

        self.entries.insert(at, entry);
    }

    fn remove(&mut self, uuid: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.player_uuid != uuid);
        before != self.entries.len()
    }

    fn position_of(&self, uuid: Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.player_uuid == uuid)
    }
}

/// All queues on this proxy, plus the ticker that paces them.
pub struct QueueManager {
    queues: Mutex<HashMap<String, Queue>>,
    counter: AtomicU64,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_order(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether this proxy applies queue state. True outside fleet mode
    /// and on configured masters.
    pub fn is_master(&self, proxy: &Proxy) -> bool {
        let config = proxy.config();

        if !config.redis.enabled {
            return true;
        }

        config
            .queue
            .master_proxy_ids
            .contains(&config.redis.proxy_id)
    }

    /// Routes a connection request through the queue subsystem.
    pub async fn enqueue_or_connect(
        &self,
        proxy: &Proxy,
        player: &Player,
        target: &str,
    ) -> EnqueueOutcome {
        let (queue_enabled, no_queue_target, allow_multi, fleet_mode) = {
            let config = proxy.config();
            (
                config.queue.enabled,
                config
                    .queue
                    .no_queue_servers
                    .iter()
                    .any(|name| name == target),
                config.queue.allow_multi_queue,
                config.redis.enabled,
            )
        };

        if !queue_enabled {
            return EnqueueOutcome::ConnectNow;
        }

        if no_queue_target {
            return EnqueueOutcome::ConnectNow;
        }

        let queue_bypass = player.has_permission("queue.bypass");
        if queue_bypass {
            return EnqueueOutcome::ConnectNow;
        }

        let entry = QueueEntry {
            player_uuid: player.uuid,
            username: player.username.clone(),
            priority: player.queue_priority(target),
            full_bypass: player.has_permission("queue.bypass.full"),
            queue_bypass,
            attempts: 0,
            waiting_for_connection: false,
            owner_proxy: proxy.fleet().map(|fleet| fleet.proxy_id().to_owned()),
            order: self.next_order(),
            enqueued_at: Instant::now(),
            attempt_started: None,
            attempt_id: None,
        };

        if fleet_mode && !self.is_master(proxy) {
            // Queue state lives on the master; forward the request.
            if let Some(fleet) = proxy.fleet() {
                fleet
                    .publish(FleetPacket::SetQueuedServer(SetQueuedServer {
                        uuid: player.uuid,
                        server: Some(target.to_owned()),
                    }))
                    .await;
            }
            return EnqueueOutcome::Queued;
        }

        self.add_entry(proxy, target, entry, allow_multi);
        self.sync_cache(proxy, target).await;

        EnqueueOutcome::Queued
    }

    /// Writes (or clears) the shared snapshot of one queue, so peers
    /// and operators can observe the master's state.
    async fn sync_cache(&self, proxy: &Proxy, target: &str) {
        let Some(fleet) = proxy.fleet() else { return };

        let snapshot = {
            let queues = self.queues.lock();

            queues.get(target).map(|queue| {
                let entries: Vec<serde_json::Value> = queue
                    .entries
                    .iter()
                    .map(|entry| {
                        serde_json::json!({
                            "uuid": entry.player_uuid,
                            "username": entry.username,
                            "priority": entry.priority,
                        })
                    })
                    .collect();

                serde_json::json!({ "paused": queue.paused, "entries": entries }).to_string()
            })
        };

        match snapshot {
            Some(snapshot) => fleet.cache_queue(target, &snapshot).await,
            None => fleet.drop_cached_queue(target).await,
        }
    }

    /// Master-side entry add for a player hosted on another proxy.
    pub fn enqueue_remote(&self, proxy: &Proxy, info: &RemotePlayerInfo, target: &str) {
        let priority = info
            .priorities
            .get(target)
            .or_else(|| info.priorities.get("all"))
            .copied()
            .unwrap_or(0);

        let entry = QueueEntry {
            player_uuid: info.uuid,
            username: info.username.clone(),
            priority,
            full_bypass: info.full_bypass,
            queue_bypass: info.queue_bypass,
            attempts: 0,
            waiting_for_connection: false,
            owner_proxy: Some(info.proxy_id.clone()),
            order: self.next_order(),
            enqueued_at: Instant::now(),
            attempt_started: None,
            attempt_id: None,
        };

        let allow_multi = proxy.config().queue.allow_multi_queue;
        self.add_entry(proxy, target, entry, allow_multi);
    }

    fn add_entry(&self, _proxy: &Proxy, target: &str, entry: QueueEntry, allow_multi: bool) {
        let mut queues = self.queues.lock();

        if !allow_multi {
            for queue in queues.values_mut() {
                queue.remove(entry.player_uuid);
            }
        }

        let queue = queues.entry(target.to_owned()).or_insert_with(Queue::new);

        if queue.position_of(entry.player_uuid).is_none() {
            queue.insert(entry);
        }
    }

    /// Removes the player from one queue, or from all when `target` is
    /// `None`. Non-masters forward the request instead.
    pub async fn leave(&self, proxy: &Proxy, uuid: Uuid, target: Option<&str>) {
        if proxy.config().redis.enabled && !self.is_master(proxy) {
            if let Some(fleet) = proxy.fleet() {
                fleet
                    .publish(FleetPacket::QueueLeave(QueueLeave {
                        uuid,
                        server: target.map(str::to_owned),
                    }))
                    .await;
            }
            return;
        }

        let mut queues = self.queues.lock();

        match target {
            Some(target) => {
                if let Some(queue) = queues.get_mut(target) {
                    queue.remove(uuid);
                }
            }
            None => {
                for queue in queues.values_mut() {
                    queue.remove(uuid);
                }
            }
        }

        queues.retain(|_, queue| !queue.entries.is_empty() || queue.paused);
    }

    /// Player teardown path: drop them from every queue.
    pub async fn remove_everywhere(&self, proxy: &Proxy, uuid: Uuid) {
        if !proxy.config().queue.enabled {
            return;
        }

        self.leave(proxy, uuid, None).await;
    }

    /// A player landed on `server`; clean their queue entries up.
    pub async fn on_player_connected(&self, proxy: &Proxy, player: &Player, server: &str) {
        let (queue_enabled, remove_all) = {
            let config = proxy.config();
            (config.queue.enabled, config.queue.remove_player_on_server_switch)
        };

        if !queue_enabled {
            return;
        }

        if remove_all {
            self.remove_everywhere(proxy, player.uuid).await;
        } else {
            self.leave(proxy, player.uuid, Some(server)).await;
        }
    }

    /// Pauses or resumes one target's queue. Non-masters forward.
    pub async fn set_paused(&self, proxy: &Proxy, target: &str, paused: bool) {
        if proxy.config().redis.enabled && !self.is_master(proxy) {
            if let Some(fleet) = proxy.fleet() {
                fleet
                    .publish(FleetPacket::QueuePause(QueuePause {
                        server: target.to_owned(),
                        paused,
                    }))
                    .await;
            }
            return;
        }

        self.queues
            .lock()
            .entry(target.to_owned())
            .or_insert_with(Queue::new)
            .paused = paused;

        if let Some(fleet) = proxy.fleet() {
            fleet.set_paused_key(target, paused).await;
        }
    }

    pub fn is_paused(&self, target: &str) -> bool {
        self.queues
            .lock()
            .get(target)
            .is_some_and(|queue| queue.paused)
    }

    /// 1-based position of the player, with the queue length.
    pub fn position(&self, uuid: Uuid, target: &str) -> Option<(usize, usize)> {
        let queues = self.queues.lock();
        let queue = queues.get(target)?;

        queue
            .position_of(uuid)
            .map(|index| (index + 1, queue.entries.len()))
    }

    /// The queue a player is waiting in, if any.
    pub fn queued_target(&self, uuid: Uuid) -> Option<String> {
        self.queues
            .lock()
            .iter()
            .find(|(_, queue)| queue.position_of(uuid).is_some())
            .map(|(target, _)| target.clone())
    }

    /// Target names with live queues, with lengths and pause state.
    pub fn summaries(&self) -> Vec<(String, usize, bool)> {
        self.queues
            .lock()
            .iter()
            .map(|(target, queue)| (target.clone(), queue.entries.len(), queue.paused))
            .collect()
    }

    /// Dispatch/message pacing. Called by the ticker task; only masters
    /// act.
    pub async fn tick(&self, proxy: &Proxy) {
        if !proxy.config().queue.enabled || !self.is_master(proxy) {
            return;
        }

        let (send_delay, message_delay, queue_delay, allow_paused) = {
            let config = proxy.config();
            (
                Duration::from_secs_f64(config.queue.send_delay),
                Duration::from_secs_f64(config.queue.message_delay),
                Duration::from_secs_f64(config.queue.queue_delay),
                config.queue.allow_paused_queue_joining,
            )
        };

        let now = Instant::now();
        let mut dispatches: Vec<(String, QueueEntry)> = vec![];
        let mut messages: Vec<(String, Vec<(QueueEntry, usize, usize)>)> = vec![];

        {
            let mut queues = self.queues.lock();

            for (target, queue) in queues.iter_mut() {
                if now.duration_since(queue.last_message) >= message_delay
                    && !queue.entries.is_empty()
                {
                    queue.last_message = now;

                    let total = queue.entries.len();
                    let listed = queue
                        .entries
                        .iter()
                        .enumerate()
                        .map(|(index, entry)| (entry.clone(), index + 1, total))
                        .collect();

                    messages.push((target.clone(), listed));
                }

                if queue.paused && !allow_paused {
                    continue;
                }

                if now.duration_since(queue.last_dispatch) < send_delay {
                    continue;
                }

                let Some(head) = queue.entries.first_mut() else {
                    continue;
                };

                if head.waiting_for_connection {
                    // A stuck attempt eventually counts as a failure.
                    if head
                        .attempt_started
                        .is_some_and(|started| now.duration_since(started) > ATTEMPT_TIMEOUT)
                    {
                        head.waiting_for_connection = false;
                        head.attempt_started = None;
                        head.attempts += 1;
                    }
                    continue;
                }

                if now.duration_since(head.enqueued_at) < queue_delay {
                    continue;
                }

                queue.last_dispatch = now;
                head.waiting_for_connection = true;
                head.attempt_started = Some(now);
                head.attempt_id = Some(Uuid::new_v4());

                dispatches.push((target.clone(), head.clone()));
            }
        }

        for (target, entry) in dispatches {
            self.dispatch(proxy, &target, entry).await;
        }

        let send_delay_secs = send_delay.as_secs().max(1);
        for (target, listed) in messages {
            for (entry, position, total) in listed {
                let eta = position as u64 * send_delay_secs;
                let text = TextComponent::plain(format!(
                    "In queue for {target}: position {position} of {total}, ETA ~{eta} s"
                ));

                self.deliver_action_bar(proxy, &entry, text).await;
            }
        }
    }

    async fn deliver_action_bar(&self, proxy: &Proxy, entry: &QueueEntry, text: TextComponent) {
        if let Some(player) = proxy.players().by_uuid(entry.player_uuid) {
            player.send_action_bar(text);
            return;
        }

        if let Some(fleet) = proxy.fleet() {
            fleet.send_action_bar(entry.player_uuid, &text).await;
        }
    }

    async fn dispatch(&self, proxy: &Proxy, target: &str, entry: QueueEntry) {
        debug!(
            target,
            player = %entry.username,
            attempt = entry.attempts + 1,
            "dispatching queue head"
        );

        if let Some(player) = proxy.players().by_uuid(entry.player_uuid) {
            // Local player: run the attempt and report back inline.
            let proxy = proxy.clone();
            let manager_target = target.to_owned();

            tokio::spawn(async move {
                let status = player.connect_with_result(manager_target.clone()).await;

                proxy
                    .queues()
                    .apply_attempt_result(
                        &proxy,
                        &manager_target,
                        player.uuid,
                        connection_status_to_send(status),
                    )
                    .await;
            });

            return;
        }

        // Remote player: order their proxy to switch; the result comes
        // back as a send-status packet.
        let Some(owner) = entry.owner_proxy.clone() else {
            warn!(player = %entry.username, "queued player is neither local nor owned; dropping");
            self.apply_attempt_result(
                proxy,
                target,
                entry.player_uuid,
                SendStatus::ConnectionCancelled,
            )
            .await;
            return;
        };

        if let Some(fleet) = proxy.fleet() {
            fleet
                .publish(FleetPacket::SwitchServer(SwitchServer {
                    proxy_id: owner,
                    uuid: entry.player_uuid,
                    server: target.to_owned(),
                    attempt_id: entry.attempt_id,
                }))
                .await;
        }
    }

    /// Applies an attempt outcome to the queue, local or fleet-reported.
    pub async fn apply_attempt_result(
        &self,
        proxy: &Proxy,
        target: &str,
        uuid: Uuid,
        status: SendStatus,
    ) {
        let max_retries = proxy.config().queue.max_send_retries;
        let mut notify_removed: Option<String> = None;

        {
            let mut queues = self.queues.lock();

            let Some(queue) = queues.get_mut(target) else {
                return;
            };
            let Some(index) = queue.position_of(uuid) else {
                return;
            };

            if status.is_success() {
                queue.entries.remove(index);
            } else {
                let entry = &mut queue.entries[index];
                entry.waiting_for_connection = false;
                entry.attempt_started = None;
                entry.attempt_id = None;
                entry.attempts += 1;

                if entry.attempts >= max_retries {
                    notify_removed = Some(entry.username.clone());
                    queue.entries.remove(index);
                }
            }

            queues.retain(|_, queue| !queue.entries.is_empty() || queue.paused);
        }

        if let Some(username) = notify_removed {
            debug!(target, player = %username, "queue entry exhausted its retries");

            if let Some(player) = proxy.players().by_uuid(uuid) {
                player.send_message(TextComponent::plain(format!(
                    "Could not connect you to {target}; giving up."
                )));
            }
        }

        self.sync_cache(proxy, target).await;
    }

    /// Master-side handler for the send-status packet.
    pub async fn on_send_status(&self, proxy: &Proxy, report: &QueueSendStatus) {
        self.apply_attempt_result(proxy, &report.server, report.uuid, report.status)
            .await;
    }

    /// Drops queues whose target no longer exists (config reload).
    pub fn retain_targets(&self, is_known: impl Fn(&str) -> bool) {
        self.queues.lock().retain(|target, _| is_known(target));
    }
}

fn connection_status_to_send(status: ConnectionStatus) -> SendStatus {
    match status {
        ConnectionStatus::Successful => SendStatus::Successful,
        ConnectionStatus::ConnectionInProgress => SendStatus::ConnectionInProgress,
        ConnectionStatus::ConnectionCancelled => SendStatus::ConnectionCancelled,
        ConnectionStatus::ServerDisconnected => SendStatus::ServerDisconnected,
        ConnectionStatus::AlreadyConnected => SendStatus::AlreadyConnected,
    }
}

/// The queue ticker: one task pacing every queue this proxy masters.
pub fn start_ticker(proxy: Proxy) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(250));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => proxy.queues().tick(&proxy).await,
                () = proxy.wait_for_shutdown() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uuid: u128, priority: i32, order: u64) -> QueueEntry {
        QueueEntry {
            player_uuid: Uuid::from_u128(uuid),
            username: format!("p{uuid}"),
            priority,
            full_bypass: false,
            queue_bypass: false,
            attempts: 0,
            waiting_for_connection: false,
            owner_proxy: None,
            order,
            enqueued_at: Instant::now(),
            attempt_started: None,
            attempt_id: None,
        }
    }

    #[test]
    fn ordering_is_priority_then_fifo() {
        let mut queue = Queue::new();

        queue.insert(entry(1, 0, 0)); // A
        queue.insert(entry(2, 0, 1)); // B
        queue.insert(entry(3, 50, 2)); // C jumps the band

        let order: Vec<u128> = queue
            .entries
            .iter()
            .map(|e| e.player_uuid.as_u128())
            .collect();

        assert_eq!(order, vec![3, 1, 2]);

        // Same priority keeps insertion order.
        queue.insert(entry(4, 50, 3));
        let order: Vec<u128> = queue
            .entries
            .iter()
            .map(|e| e.player_uuid.as_u128())
            .collect();
        assert_eq!(order, vec![3, 4, 1, 2]);
    }

    #[tokio::test]
    async fn attempt_failure_counts_and_removes() {
        let proxy = crate::Proxy::new({
            let mut config = crate::config::Config::default();
            config.queue.enabled = true;
            config.queue.max_send_retries = 2;
            config
        })
        .unwrap();

        let manager = QueueManager::new();

        {
            let mut queues = manager.queues.lock();
            let queue = queues.entry("hub".into()).or_insert_with(Queue::new);
            queue.insert(entry(7, 0, 0));
        }

        let uuid = Uuid::from_u128(7);

        manager
            .apply_attempt_result(&proxy, "hub", uuid, SendStatus::ServerDisconnected)
            .await;
        assert_eq!(manager.position(uuid, "hub"), Some((1, 1)));

        manager
            .apply_attempt_result(&proxy, "hub", uuid, SendStatus::ServerDisconnected)
            .await;
        assert_eq!(manager.position(uuid, "hub"), None);
    }

    #[tokio::test]
    async fn zero_retries_removes_on_first_failure() {
        let proxy = crate::Proxy::new({
            let mut config = crate::config::Config::default();
            config.queue.enabled = true;
            config.queue.max_send_retries = 0;
            config
        })
        .unwrap();

        let manager = QueueManager::new();

        {
            let mut queues = manager.queues.lock();
            let queue = queues.entry("hub".into()).or_insert_with(Queue::new);
            queue.insert(entry(9, 0, 0));
        }

        manager
            .apply_attempt_result(
                &proxy,
                "hub",
                Uuid::from_u128(9),
                SendStatus::ConnectionCancelled,
            )
            .await;

        assert_eq!(manager.position(Uuid::from_u128(9), "hub"), None);
    }

    #[tokio::test]
    async fn success_pops_head_only() {
        let proxy = crate::Proxy::new({
            let mut config = crate::config::Config::default();
            config.queue.enabled = true;
            config
        })
        .unwrap();

        let manager = QueueManager::new();

        {
            let mut queues = manager.queues.lock();
            let queue = queues.entry("hub".into()).or_insert_with(Queue::new);
            queue.insert(entry(1, 0, 0));
            queue.insert(entry(2, 0, 1));
            queue.insert(entry(3, 50, 2));
        }

        // The high-priority head succeeds; the band below shifts up.
        manager
            .apply_attempt_result(&proxy, "hub", Uuid::from_u128(3), SendStatus::Successful)
            .await;

        assert_eq!(manager.position(Uuid::from_u128(1), "hub"), Some((1, 2)));
        assert_eq!(manager.position(Uuid::from_u128(2), "hub"), Some((2, 2)));
    }
}
