use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use gale::config::{Config, ServerEntry};
use gale::{fleet, listener, queue, Proxy};
use gale_protocol::text::TextComponent;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gale", version, about = "A fleet-coordinated Minecraft proxy.")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "gale.toml")]
    config: PathBuf,

    /// Overrides the listener port from the configuration.
    #[arg(long)]
    port: Option<u16>,

    /// Expects the HAProxy PROXY protocol on every connection.
    #[arg(long)]
    haproxy: bool,

    /// Ignores the `[servers]` table from the configuration.
    #[arg(long)]
    ignore_config_servers: bool,

    /// Registers an extra backend, as `name=host:port`. Repeatable.
    #[arg(long = "server")]
    servers: Vec<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(args, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal startup error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        info!(
            "no configuration at {}; starting with defaults",
            args.config.display()
        );
        Config::default()
    };

    if let Some(port) = args.port {
        config.bind.set_port(port);
    }

    if args.haproxy {
        config.proxy_protocol = true;
    }

    if args.ignore_config_servers {
        config.servers.servers.clear();
        config.servers.try_order.clear();
    }

    for raw in &args.servers {
        let (name, address) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--server takes name=host:port, got `{raw}`"))?;

        config.servers.servers.insert(
            name.to_owned(),
            ServerEntry {
                address: address.to_owned(),
                forwarding_mode: None,
            },
        );

        if !config.servers.try_order.iter().any(|n| n == name) {
            config.servers.try_order.push(name.to_owned());
        }
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let redis_enabled = config.redis.enabled;
    let queue_enabled = config.queue.enabled;

    let proxy = Proxy::new(config)?;
    proxy.set_config_path(args.config.clone());

    if redis_enabled {
        // A stale heartbeat for our own id refuses startup; operators
        // must wait out the TTL after a crash.
        fleet::start(&proxy).await?;
    }

    if queue_enabled {
        queue::start_ticker(proxy.clone());
    }

    info!("gale {} starting", gale::PROXY_VERSION);

    let listener_task = {
        let proxy = proxy.clone();
        tokio::spawn(async move { listener::run(proxy).await })
    };

    tokio::select! {
        result = listener_task => {
            match result {
                Ok(result) => result?,
                Err(e) => anyhow::bail!("listener task failed: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    shutdown(&proxy).await;
    Ok(())
}

/// Cooperative shutdown: hand players off (or kick them), then wait a
/// bounded time for their sessions to finish tearing down.
async fn shutdown(proxy: &Proxy) {
    proxy.begin_shutdown();

    if let Some(fleet) = proxy.fleet() {
        fleet.shutdown(proxy).await;
    } else {
        for player in proxy.players().all() {
            player.kick(TextComponent::plain("Proxy shutting down."));
        }
    }

    let players = proxy.players().all();

    let teardowns = async {
        for player in players {
            player.wait_for_teardown().await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(10), teardowns)
        .await
        .is_err()
    {
        warn!("shutdown proceeding with sessions still tearing down");
    }

    info!("goodbye");
}
