//! `gale.toml` parsing and validation.
//!
//! Keys are kebab-case and stable across reloads. Numeric ranges are
//! checked at load time; a bad config at startup is fatal (exit code
//! 1), a bad config at reload keeps the previous one.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

/// How player identity is forwarded to backends.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardingMode {
    /// Backends see the proxy's address and no identity.
    #[default]
    None,
    /// BungeeCord-style handshake host rewrite.
    Legacy,
    /// Legacy rewrite plus a shared token appended for
    /// BungeeGuard-compatible backends.
    Bungeeguard,
    /// HMAC-signed login plugin response.
    Modern,
}

/// Fallback ordering for dynamically chosen servers.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackFilter {
    #[default]
    FirstAvailable,
    MostPopulated,
    LeastPopulated,
}

/// Peer-proxy choice when handing players off at shutdown.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyFilter {
    MostEmpty,
    LeastEmpty,
    #[default]
    None,
}

/// One advertised public address of a peer proxy.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyAddress {
    pub proxy_id: String,
    pub host: String,
    pub port: u16,
}

/// A single backend entry under `[servers]`.
#[derive(Clone, Debug)]
pub struct ServerEntry {
    pub address: String,
    /// Overrides the global forwarding mode for this backend.
    pub forwarding_mode: Option<ForwardingMode>,
}

/// The `[servers]` table: named backends plus the try list and the
/// fallback filter, all sharing one TOML table the way BungeeCord-line
/// proxies always have.
#[derive(Clone, Debug, Default)]
pub struct ServersSection {
    pub servers: HashMap<String, ServerEntry>,
    pub try_order: Vec<String>,
    pub dynamic_fallbacks_filter: FallbackFilter,
}

impl<'de> Deserialize<'de> for ServersSection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SectionVisitor;

        impl<'de> Visitor<'de> for SectionVisitor {
            type Value = ServersSection;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of servers plus `try` and `dynamic-fallbacks-filter`")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                #[derive(Deserialize)]
                #[serde(untagged)]
                enum Entry {
                    Address(String),
                    Detailed {
                        address: String,
                        #[serde(rename = "forwarding-mode")]
                        forwarding_mode: Option<ForwardingMode>,
                    },
                }

                let mut section = ServersSection::default();

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "try" => section.try_order = map.next_value()?,
                        "dynamic-fallbacks-filter" => {
                            section.dynamic_fallbacks_filter = map.next_value()?;
                        }
                        name => {
                            let entry = match map.next_value::<Entry>().map_err(|_| {
                                de::Error::custom(format!(
                                    "server `{name}` must be \"host:port\" or a table"
                                ))
                            })? {
                                Entry::Address(address) => ServerEntry {
                                    address,
                                    forwarding_mode: None,
                                },
                                Entry::Detailed {
                                    address,
                                    forwarding_mode,
                                } => ServerEntry {
                                    address,
                                    forwarding_mode,
                                },
                            };

                            section.servers.insert(name.to_owned(), entry);
                        }
                    }
                }

                Ok(section)
            }
        }

        deserializer.deserialize_map(SectionVisitor)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RedisSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: String,
    pub use_ssl: bool,
    pub max_concurrent_connections: u32,
    pub proxy_id: String,
    pub ping_interval_ms: u64,
    pub other_proxy_timeout_ms: u64,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 6379,
            username: None,
            password: String::new(),
            use_ssl: false,
            max_concurrent_connections: 8,
            proxy_id: "proxy-1".into(),
            ping_interval_ms: 30_000,
            other_proxy_timeout_ms: 60_000,
        }
    }
}

impl RedisSection {
    /// Builds the connection URL the store client takes.
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "rediss" } else { "redis" };

        let auth = match (&self.username, self.password.is_empty()) {
            (Some(user), false) => format!("{user}:{}@", self.password),
            (Some(user), true) => format!("{user}@"),
            (None, false) => format!(":{}@", self.password),
            (None, true) => String::new(),
        };

        format!("{scheme}://{auth}{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QueueSection {
    pub enabled: bool,
    pub master_proxy_ids: Vec<String>,
    pub no_queue_servers: Vec<String>,
    pub allow_multi_queue: bool,
    /// Seconds between dispatch attempts per target.
    pub send_delay: f64,
    /// Seconds a player waits before their first dispatch.
    pub queue_delay: f64,
    /// Seconds between position messages.
    pub message_delay: f64,
    /// Seconds between backend reachability probes.
    pub backend_ping_interval: f64,
    pub max_send_retries: u32,
    pub remove_player_on_server_switch: bool,
    pub forward_kick_reason: bool,
    pub allow_paused_queue_joining: bool,
    pub queue_on_shutdown: bool,
    /// Whether BungeeCord `Connect` messages honor the queue.
    pub override_bungee_messaging: bool,
    pub banned_reasons: Vec<String>,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            enabled: false,
            master_proxy_ids: vec![],
            no_queue_servers: vec![],
            allow_multi_queue: false,
            send_delay: 1.0,
            queue_delay: 0.0,
            message_delay: 5.0,
            backend_ping_interval: 5.0,
            max_send_retries: 5,
            remove_player_on_server_switch: true,
            forward_kick_reason: true,
            allow_paused_queue_joining: false,
            queue_on_shutdown: false,
            override_bungee_messaging: true,
            banned_reasons: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub bind: SocketAddr,
    pub motd: String,
    pub show_max_players: i32,
    pub online_mode: bool,
    pub prevent_client_proxy_connections: bool,
    /// When a second login arrives for a connected identity, kick the
    /// old session instead of rejecting the new one.
    pub kick_existing_players: bool,
    pub player_info_forwarding_mode: ForwardingMode,
    pub forwarding_secret: Option<String>,
    pub forwarding_secret_file: Option<PathBuf>,
    pub compression_threshold: i32,
    pub compression_level: i32,
    /// Milliseconds between allowed login attempts per IP; 0 disables.
    pub login_ratelimit: u64,
    pub connection_timeout: u64,
    pub read_timeout: u64,
    pub announce_forge: bool,
    pub disable_forge: bool,
    pub proxy_protocol: bool,
    pub tcp_fast_open: bool,
    pub enable_reuse_port: bool,
    pub bungee_plugin_message_channel: bool,
    pub failover_on_unexpected_server_disconnect: bool,
    pub announce_proxy_commands: bool,
    pub log_command_executions: bool,
    pub accepts_transfers: bool,
    pub proxy_addresses: Vec<ProxyAddress>,
    pub dynamic_proxy_filter: ProxyFilter,
    pub servers: ServersSection,
    pub forced_hosts: HashMap<String, Vec<String>>,
    pub redis: RedisSection,
    pub queue: QueueSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:25565".parse().unwrap(),
            motd: "A Gale Proxy".into(),
            show_max_players: 500,
            online_mode: true,
            prevent_client_proxy_connections: false,
            kick_existing_players: false,
            player_info_forwarding_mode: ForwardingMode::None,
            forwarding_secret: None,
            forwarding_secret_file: None,
            compression_threshold: 256,
            compression_level: -1,
            login_ratelimit: 3000,
            connection_timeout: 5000,
            read_timeout: 30_000,
            announce_forge: false,
            disable_forge: false,
            proxy_protocol: false,
            tcp_fast_open: false,
            enable_reuse_port: false,
            bungee_plugin_message_channel: true,
            failover_on_unexpected_server_disconnect: true,
            announce_proxy_commands: true,
            log_command_executions: false,
            accepts_transfers: false,
            proxy_addresses: vec![],
            dynamic_proxy_filter: ProxyFilter::None,
            servers: ServersSection::default(),
            forced_hosts: HashMap::new(),
            redis: RedisSection::default(),
            queue: QueueSection::default(),
        }
    }
}

impl Config {
    /// Parses and validates a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;

        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compression_threshold < -1 {
            bail!("compression-threshold must be >= -1");
        }
        if !(-1..=9).contains(&self.compression_level) {
            bail!("compression-level must be between -1 and 9");
        }
        if self.connection_timeout == 0 {
            bail!("connection-timeout must be positive");
        }
        if self.read_timeout == 0 {
            bail!("read-timeout must be positive");
        }
        if self.queue.send_delay <= 0.0 {
            bail!("queue.send-delay must be positive");
        }
        if self.queue.message_delay <= 0.0 {
            bail!("queue.message-delay must be positive");
        }

        for name in &self.servers.try_order {
            if !self.servers.servers.contains_key(name) {
                bail!("try list references unknown server `{name}`");
            }
        }

        for (host, targets) in &self.forced_hosts {
            for name in targets {
                if !self.servers.servers.contains_key(name) {
                    bail!("forced host `{host}` references unknown server `{name}`");
                }
            }
        }

        if self.needs_forwarding_secret() && self.resolve_forwarding_secret().is_err() {
            bail!(
                "player-info-forwarding-mode {:?} requires forwarding-secret or \
                 forwarding-secret-file",
                self.player_info_forwarding_mode
            );
        }

        if self.redis.enabled && self.redis.proxy_id.is_empty() {
            bail!("redis.proxy-id must not be empty");
        }

        if self.queue.enabled && self.redis.enabled && self.queue.master_proxy_ids.is_empty() {
            bail!("queue.master-proxy-ids must name at least one proxy in fleet mode");
        }

        Ok(())
    }

    fn needs_forwarding_secret(&self) -> bool {
        matches!(
            self.player_info_forwarding_mode,
            ForwardingMode::Modern | ForwardingMode::Bungeeguard
        )
    }

    /// The HMAC/BungeeGuard secret, from the inline key or the secret
    /// file.
    pub fn resolve_forwarding_secret(&self) -> anyhow::Result<Vec<u8>> {
        if let Some(secret) = &self.forwarding_secret {
            if !secret.is_empty() {
                return Ok(secret.as_bytes().to_vec());
            }
        }

        if let Some(path) = &self.forwarding_secret_file {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let trimmed = bytes.strip_suffix(b"\n").unwrap_or(&bytes);
            if !trimmed.is_empty() {
                return Ok(trimmed.to_vec());
            }
        }

        bail!("no forwarding secret configured")
    }

    /// The effective forwarding mode for one backend.
    pub fn forwarding_mode_for(&self, server: &str) -> ForwardingMode {
        self.servers
            .servers
            .get(server)
            .and_then(|entry| entry.forwarding_mode)
            .unwrap_or(self.player_info_forwarding_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: Config = toml::from_str(
            r#"
            bind = "0.0.0.0:25577"
            motd = "hello"

            [servers]
            lobby = "127.0.0.1:30066"
            factions = { address = "127.0.0.1:30067", forwarding-mode = "MODERN" }
            try = ["lobby"]
            dynamic-fallbacks-filter = "LEAST_POPULATED"

            [forced-hosts]
            "minigames.example.org" = ["factions"]
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 25577);
        assert_eq!(config.servers.servers["lobby"].address, "127.0.0.1:30066");
        assert_eq!(
            config.servers.servers["factions"].forwarding_mode,
            Some(ForwardingMode::Modern)
        );
        assert_eq!(config.servers.try_order, vec!["lobby"]);
        assert_eq!(
            config.servers.dynamic_fallbacks_filter,
            FallbackFilter::LeastPopulated
        );
        assert_eq!(config.forced_hosts["minigames.example.org"], vec!["factions"]);

        config.validate().unwrap();
    }

    #[test]
    fn per_server_forwarding_override() {
        let mut config = Config::default();
        config.player_info_forwarding_mode = ForwardingMode::Legacy;
        config.servers.servers.insert(
            "special".into(),
            ServerEntry {
                address: "127.0.0.1:1".into(),
                forwarding_mode: Some(ForwardingMode::None),
            },
        );

        assert_eq!(config.forwarding_mode_for("special"), ForwardingMode::None);
        assert_eq!(config.forwarding_mode_for("other"), ForwardingMode::Legacy);
    }

    #[test]
    fn bad_ranges_rejected() {
        let mut config = Config::default();
        config.compression_level = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.compression_threshold = -2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn modern_forwarding_requires_secret() {
        let mut config = Config::default();
        config.player_info_forwarding_mode = ForwardingMode::Modern;
        assert!(config.validate().is_err());

        config.forwarding_secret = Some("hunter2".into());
        config.validate().unwrap();
        assert_eq!(config.resolve_forwarding_secret().unwrap(), b"hunter2");
    }

    #[test]
    fn try_list_must_name_known_servers() {
        let config: Config = toml::from_str(
            r#"
            [servers]
            try = ["missing"]
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn redis_url_forms() {
        let mut redis = RedisSection::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379");

        redis.password = "pw".into();
        assert_eq!(redis.url(), "redis://:pw@127.0.0.1:6379");

        redis.username = Some("gale".into());
        redis.use_ssl = true;
        assert_eq!(redis.url(), "rediss://gale:pw@127.0.0.1:6379");
    }
}
