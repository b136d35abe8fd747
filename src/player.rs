//! The logical player: identity, permission surface, mutable routing
//! state, and the dual-index registry every lookup goes through.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use gale_protocol::profile::GameProfile;
use gale_protocol::text::TextComponent;
use gale_protocol::version::ProtocolVersion;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::session::ClientHandle;

/// Tri-state permission answer from the external resolver.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PermissionValue {
    True,
    False,
    Undefined,
}

/// The pluggable permission function. The proxy core only ever asks
/// yes/no questions of it.
pub type PermissionFn = Arc<dyn Fn(&str) -> PermissionValue + Send + Sync>;

/// A permission function that answers `Undefined` to everything.
pub fn no_permissions() -> PermissionFn {
    Arc::new(|_| PermissionValue::Undefined)
}

/// Outcome of a connection request, also reported to queue dispatch.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionStatus {
    Successful,
    ConnectionInProgress,
    ConnectionCancelled,
    ServerDisconnected,
    AlreadyConnected,
}

/// Control messages delivered to a player's session task. All mutation
/// of the session happens there.
#[derive(Debug)]
pub enum PlayerCommand {
    /// Start a switch to `server`.
    Connect {
        server: String,
        /// Message shown after a successful redirect, if any.
        message: Option<TextComponent>,
        result: Option<oneshot::Sender<ConnectionStatus>>,
    },
    /// Disconnect the player with a reason.
    Kick { reason: TextComponent },
    Message(TextComponent),
    ActionBar(TextComponent),
    /// Deliver a plugin message to the player's client.
    PluginMessage { channel: String, data: Vec<u8> },
    /// Deliver a plugin message to the player's current backend.
    BackendPluginMessage { channel: String, data: Vec<u8> },
    /// Protocol-level transfer to another host (1.20.5+).
    Transfer { host: String, port: u16 },
    /// Run a proxy command as this player.
    Sudo { command: String },
}

/// Mutable routing state, owned logically by the session task but
/// readable everywhere.
#[derive(Default)]
pub struct PlayerState {
    pub current_server: Option<String>,
    /// Set only while a switch is being attempted.
    pub in_flight_server: Option<String>,
    /// Servers already tried during the current fallback cascade;
    /// cleared by a successful JoinGame.
    pub attempted_servers: Vec<String>,
    pub client_brand: Option<String>,
    pub locale: Option<String>,
    pub ping_ms: Option<u64>,
}

pub struct Player {
    pub uuid: Uuid,
    pub username: String,
    pub profile: GameProfile,
    pub remote_addr: SocketAddr,
    /// The hostname the client put in its handshake, for forced-host
    /// routing.
    pub virtual_host: Option<String>,
    pub version: ProtocolVersion,
    pub permissions: PermissionFn,
    pub client: ClientHandle,

    commands: mpsc::UnboundedSender<PlayerCommand>,
    state: Mutex<PlayerState>,
    teardown: watch::Sender<bool>,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: GameProfile,
        remote_addr: SocketAddr,
        virtual_host: Option<String>,
        version: ProtocolVersion,
        permissions: PermissionFn,
        client: ClientHandle,
        commands: mpsc::UnboundedSender<PlayerCommand>,
    ) -> Self {
        let (teardown, _) = watch::channel(false);

        Self {
            uuid: profile.id,
            username: profile.name.clone(),
            profile,
            remote_addr,
            virtual_host,
            version,
            permissions,
            client,
            commands,
            state: Mutex::new(PlayerState::default()),
            teardown,
        }
    }

    /// Queues a command onto the session task. Returns false if the
    /// session has already ended.
    pub fn send_command(&self, command: PlayerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn connect(&self, server: impl Into<String>) {
        self.send_command(PlayerCommand::Connect {
            server: server.into(),
            message: None,
            result: None,
        });
    }

    /// Starts a switch and yields its outcome.
    pub async fn connect_with_result(&self, server: impl Into<String>) -> ConnectionStatus {
        let (tx, rx) = oneshot::channel();

        let sent = self.send_command(PlayerCommand::Connect {
            server: server.into(),
            message: None,
            result: Some(tx),
        });

        if !sent {
            return ConnectionStatus::ConnectionCancelled;
        }

        rx.await.unwrap_or(ConnectionStatus::ConnectionCancelled)
    }

    pub fn kick(&self, reason: TextComponent) {
        self.send_command(PlayerCommand::Kick { reason });
    }

    pub fn send_message(&self, message: TextComponent) {
        self.send_command(PlayerCommand::Message(message));
    }

    pub fn send_action_bar(&self, message: TextComponent) {
        self.send_command(PlayerCommand::ActionBar(message));
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, PlayerState> {
        self.state.lock()
    }

    pub fn current_server(&self) -> Option<String> {
        self.state.lock().current_server.clone()
    }

    pub fn ping_ms(&self) -> Option<u64> {
        self.state.lock().ping_ms
    }

    /// True only for an explicit `TRUE` from the resolver.
    pub fn has_permission(&self, node: &str) -> bool {
        (self.permissions)(node) == PermissionValue::True
    }

    /// The player's queue priority for `target`: the highest granted
    /// band, server-specific or global, defaulting to zero.
    pub fn queue_priority(&self, target: &str) -> i32 {
        (1..=100)
            .rev()
            .find(|i| {
                self.has_permission(&format!("queue.priority.{target}.{i}"))
                    || self.has_permission(&format!("queue.priority.all.{i}"))
            })
            .unwrap_or(0)
    }

    /// Resolves once the player's disconnect handling has finished.
    pub async fn wait_for_teardown(&self) {
        let mut rx = self.teardown.subscribe();

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Marks teardown complete, releasing every waiter.
    pub fn complete_teardown(&self) {
        let _ = self.teardown.send(true);
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("uuid", &self.uuid)
            .field("username", &self.username)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Which index a duplicate registration collided on.
#[derive(Debug, PartialEq, Eq)]
pub enum DuplicateLogin {
    Uuid(Uuid),
    Username(String),
}

#[derive(Default)]
struct RegistryInner {
    by_uuid: HashMap<Uuid, Arc<Player>>,
    by_name_lower: HashMap<String, Arc<Player>>,
}

/// The proxy-wide player index. Players are findable by uuid and by
/// case-insensitive username; the two maps always hold the same set,
/// updated under one lock.
#[derive(Default)]
pub struct PlayerRegistry {
    inner: Mutex<RegistryInner>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a player under both indexes, or reports which index
    /// already holds a live entry.
    pub fn register(&self, player: Arc<Player>) -> Result<(), DuplicateLogin> {
        let mut inner = self.inner.lock();
        let name_key = player.username.to_lowercase();

        if inner.by_uuid.contains_key(&player.uuid) {
            return Err(DuplicateLogin::Uuid(player.uuid));
        }
        if inner.by_name_lower.contains_key(&name_key) {
            return Err(DuplicateLogin::Username(name_key));
        }

        inner.by_name_lower.insert(name_key, player.clone());
        inner.by_uuid.insert(player.uuid, player);

        Ok(())
    }

    /// Removes a player from both indexes. Only removes the entries if
    /// they still point at this exact player, so a kicked-and-replaced
    /// login cannot unregister its successor.
    pub fn unregister(&self, player: &Player) {
        let mut inner = self.inner.lock();
        let name_key = player.username.to_lowercase();

        if inner
            .by_uuid
            .get(&player.uuid)
            .is_some_and(|p| std::ptr::eq(p.as_ref(), player))
        {
            inner.by_uuid.remove(&player.uuid);
        }

        if inner
            .by_name_lower
            .get(&name_key)
            .is_some_and(|p| std::ptr::eq(p.as_ref(), player))
        {
            inner.by_name_lower.remove(&name_key);
        }
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<Player>> {
        self.inner.lock().by_uuid.get(&uuid).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Player>> {
        self.inner
            .lock()
            .by_name_lower
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Player>> {
        self.inner.lock().by_uuid.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().by_uuid.len()
    }

    /// Players currently connected to `server`.
    pub fn on_server(&self, server: &str) -> Vec<Arc<Player>> {
        self.inner
            .lock()
            .by_uuid
            .values()
            .filter(|p| p.current_server().as_deref() == Some(server))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn indexes_agree(&self) -> bool {
        let inner = self.inner.lock();

        inner.by_uuid.len() == inner.by_name_lower.len()
            && inner
                .by_uuid
                .values()
                .all(|p| inner.by_name_lower.contains_key(&p.username.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ClientHandle;

    fn test_player(name: &str, uuid: Uuid) -> Arc<Player> {
        let (commands, _rx) = mpsc::unbounded_channel();

        Arc::new(Player::new(
            GameProfile {
                id: uuid,
                name: name.into(),
                properties: vec![],
            },
            "127.0.0.1:5000".parse().unwrap(),
            None,
            ProtocolVersion::V1_21,
            no_permissions(),
            ClientHandle::detached(ProtocolVersion::V1_21),
            commands,
        ))
    }

    #[test]
    fn duplicate_uuid_and_name_rejected() {
        let registry = PlayerRegistry::new();

        registry.register(test_player("Alice", Uuid::from_u128(1))).unwrap();

        assert_eq!(
            registry.register(test_player("alice", Uuid::from_u128(2))),
            Err(DuplicateLogin::Username("alice".into()))
        );
        assert_eq!(
            registry.register(test_player("Other", Uuid::from_u128(1))),
            Err(DuplicateLogin::Uuid(Uuid::from_u128(1)))
        );

        assert!(registry.indexes_agree());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = PlayerRegistry::new();
        registry.register(test_player("Alice", Uuid::from_u128(1))).unwrap();

        assert!(registry.by_name("ALICE").is_some());
        assert!(registry.by_name("alice").is_some());
        assert!(registry.by_name("bob").is_none());
    }

    #[test]
    fn unregister_only_removes_same_instance() {
        let registry = PlayerRegistry::new();

        let first = test_player("Alice", Uuid::from_u128(1));
        registry.register(first.clone()).unwrap();

        // Simulate kick-existing-players: the old entry leaves, the
        // replacement registers, then the old session's teardown runs.
        registry.unregister(&first);

        let second = test_player("Alice", Uuid::from_u128(1));
        registry.register(second.clone()).unwrap();

        registry.unregister(&first);
        assert!(registry.by_uuid(Uuid::from_u128(1)).is_some());
        assert!(registry.indexes_agree());

        registry.unregister(&second);
        assert!(registry.by_uuid(Uuid::from_u128(1)).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn queue_priority_takes_highest_band() {
        let (commands, _rx) = mpsc::unbounded_channel();

        let permissions: PermissionFn = Arc::new(|node: &str| {
            if node == "queue.priority.hub.50" || node == "queue.priority.all.10" {
                PermissionValue::True
            } else {
                PermissionValue::Undefined
            }
        });

        let player = Player::new(
            GameProfile {
                id: Uuid::from_u128(9),
                name: "Queued".into(),
                properties: vec![],
            },
            "127.0.0.1:5001".parse().unwrap(),
            None,
            ProtocolVersion::V1_21,
            permissions,
            ClientHandle::detached(ProtocolVersion::V1_21),
            commands,
        );

        assert_eq!(player.queue_priority("hub"), 50);
        assert_eq!(player.queue_priority("other"), 10);
    }
}
