//! A fleet-coordinated Minecraft proxy.
//!
//! The per-player connection core: the protocol pipeline, the session
//! state machine, the server switch engine, the queue subsystem, and
//! the pub/sub coordination plane tying a fleet of proxies together.

pub mod backend;
pub mod bungee;
pub mod command;
pub mod config;
pub mod fleet;
pub mod listener;
pub mod login;
pub mod packet_io;
pub mod player;
pub mod queue;
pub mod session;
pub mod status;
pub mod switch;

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::player::PlayerRegistry;

pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A named backend the proxy can route players to.
#[derive(Clone, Debug)]
pub struct RegisteredServer {
    pub name: String,
    pub address: String,
}

/// The process-global proxy state, shared by handle. Everything a
/// connection task needs hangs off one of these.
#[derive(Clone)]
pub struct Proxy(Arc<ProxyInner>);

pub struct ProxyInner {
    config: RwLock<Config>,
    pub players: PlayerRegistry,
    pub queues: queue::QueueManager,
    fleet: OnceLock<fleet::Fleet>,

    /// The ephemeral RSA keypair for the encryption handshake. 1024
    /// bits: old clients reject anything larger.
    pub rsa_key: RsaPrivateKey,
    /// The public half, DER-encoded for EncryptionRequest.
    pub public_key_der: Box<[u8]>,

    pub http_client: reqwest::Client,
    /// Last allowed login instant per remote IP.
    login_attempts: Mutex<FxHashMap<IpAddr, Instant>>,

    /// `server-icon.png` as a data URL, if present.
    pub favicon: Option<String>,
    config_path: RwLock<Option<std::path::PathBuf>>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
    shutting_down: AtomicBool,
}

impl Proxy {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let rsa_key = RsaPrivateKey::new(&mut OsRng, 1024).context("generating RSA keypair")?;

        let public_key_der =
            rsa_der::public_key_to_der(&rsa_key.n().to_bytes_be(), &rsa_key.e().to_bytes_be())
                .into_boxed_slice();

        let favicon = std::fs::read("server-icon.png").ok().map(|png| {
            use base64::prelude::*;

            let mut url = "data:image/png;base64,".to_owned();
            BASE64_STANDARD.encode_string(png, &mut url);
            url
        });

        if favicon.is_some() {
            info!("loaded server-icon.png");
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self(Arc::new(ProxyInner {
            config: RwLock::new(config),
            players: PlayerRegistry::new(),
            queues: queue::QueueManager::new(),
            fleet: OnceLock::new(),
            rsa_key,
            public_key_der,
            http_client: reqwest::Client::new(),
            login_attempts: Mutex::new(FxHashMap::default()),
            favicon,
            config_path: RwLock::new(None),
            started_at: Instant::now(),
            shutdown,
            shutting_down: AtomicBool::new(false),
        })))
    }

    pub fn inner(&self) -> &ProxyInner {
        &self.0
    }

    /// Read access to the live configuration.
    pub fn config(&self) -> parking_lot::RwLockReadGuard<'_, Config> {
        self.0.config.read()
    }

    /// Swaps in a new configuration (reload).
    pub fn replace_config(&self, config: Config) {
        *self.0.config.write() = config;
    }

    pub fn set_config_path(&self, path: std::path::PathBuf) {
        *self.0.config_path.write() = Some(path);
    }

    pub fn config_path(&self) -> Option<std::path::PathBuf> {
        self.0.config_path.read().clone()
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.0.players
    }

    pub fn queues(&self) -> &queue::QueueManager {
        &self.0.queues
    }

    /// The fleet plane, if redis is enabled.
    pub fn fleet(&self) -> Option<&fleet::Fleet> {
        self.0.fleet.get()
    }

    pub(crate) fn install_fleet(&self, fleet: fleet::Fleet) {
        if self.0.fleet.set(fleet).is_err() {
            panic!("fleet installed twice");
        }
    }

    /// All configured backend servers.
    pub fn servers(&self) -> Vec<RegisteredServer> {
        self.config()
            .servers
            .servers
            .iter()
            .map(|(name, entry)| RegisteredServer {
                name: name.clone(),
                address: entry.address.clone(),
            })
            .collect()
    }

    pub fn server_address(&self, name: &str) -> Option<String> {
        self.config()
            .servers
            .servers
            .get(name)
            .map(|entry| entry.address.clone())
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.config().servers.servers.contains_key(name)
    }

    /// Players on `server` counted across the whole fleet.
    pub fn total_player_count(&self, server: &str) -> usize {
        let local = self.players().on_server(server).len();

        let remote = self
            .fleet()
            .map_or(0, |fleet| fleet.remote_count_on_server(server));

        local + remote
    }

    /// Total players across the fleet, local ones included.
    pub fn total_players(&self) -> usize {
        self.players().count() + self.fleet().map_or(0, |fleet| fleet.remote_count())
    }

    /// Applies the login rate limit for one remote address. Returns
    /// false when the attempt must be rejected.
    pub fn check_login_rate(&self, addr: IpAddr) -> bool {
        let window = Duration::from_millis(self.config().login_ratelimit);

        if window.is_zero() {
            return true;
        }

        let mut attempts = self.0.login_attempts.lock();
        let now = Instant::now();

        // Drop stale entries so the map cannot grow with one-shot IPs.
        attempts.retain(|_, last| now.duration_since(*last) < window);

        match attempts.get(&addr) {
            Some(last) if now.duration_since(*last) < window => false,
            _ => {
                attempts.insert(addr, now);
                true
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        self.0.started_at.elapsed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.shutting_down.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.0.shutting_down.store(true, Ordering::Release);
        let _ = self.0.shutdown.send(true);
    }

    /// Resolves when shutdown begins.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.0.shutdown.subscribe();

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Picks the peer proxy to hand players to at shutdown, per the
    /// configured filter.
    pub fn pick_transfer_target(&self) -> Option<config::ProxyAddress> {
        use config::ProxyFilter;

        let config = self.config();
        let fleet = self.fleet()?;

        let peers: Vec<_> = config
            .proxy_addresses
            .iter()
            .filter(|addr| addr.proxy_id != fleet.proxy_id())
            .filter(|addr| fleet.is_peer_healthy(&addr.proxy_id))
            .cloned()
            .collect();

        match config.dynamic_proxy_filter {
            ProxyFilter::None => peers.first().cloned(),
            ProxyFilter::MostEmpty => peers
                .into_iter()
                .min_by_key(|addr| fleet.peer_player_count(&addr.proxy_id)),
            ProxyFilter::LeastEmpty => peers
                .into_iter()
                .max_by_key(|addr| fleet.peer_player_count(&addr.proxy_id)),
        }
    }
}

/// Resolves a `host:port` string, defaulting the port.
pub fn parse_server_address(address: &str) -> anyhow::Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    let with_port: std::borrow::Cow<str> = if address.contains(':') {
        address.into()
    } else {
        format!("{address}:25565").into()
    };

    with_port
        .to_socket_addrs()
        .with_context(|| format!("resolving `{address}`"))?
        .next()
        .with_context(|| format!("`{address}` resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_rate_limit_window() {
        let mut config = config::Config::default();
        config.login_ratelimit = 50;
        let proxy = Proxy::new(config).unwrap();

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let other: IpAddr = "203.0.113.10".parse().unwrap();

        assert!(proxy.check_login_rate(ip));
        // An immediate retry is rejected without opening a session.
        assert!(!proxy.check_login_rate(ip));
        // Other addresses are unaffected.
        assert!(proxy.check_login_rate(other));

        std::thread::sleep(Duration::from_millis(60));
        assert!(proxy.check_login_rate(ip));
    }

    #[test]
    fn rate_limit_disabled_at_zero() {
        let mut config = config::Config::default();
        config.login_ratelimit = 0;
        let proxy = Proxy::new(config).unwrap();

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert!(proxy.check_login_rate(ip));
        assert!(proxy.check_login_rate(ip));
    }

    #[test]
    fn server_address_parsing() {
        assert!(parse_server_address("127.0.0.1:25566").is_ok());
        assert_eq!(
            parse_server_address("127.0.0.1").unwrap().port(),
            25565
        );
        assert!(parse_server_address("not a host:xyz").is_err());
    }
}
