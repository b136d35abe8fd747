//! The per-player session: one task that owns the client connection,
//! the connected backend, and the orchestration of server switches.
//!
//! Every piece of session state is mutated here and only here; other
//! parts of the proxy talk to a session through its command channel.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use gale_protocol::catalog::{self, PacketKind, PacketSide, PacketState};
use gale_protocol::packets::{
    BundleDelimiterS2c, ConfigDisconnectS2c, ConfigKeepAliveS2c, DisconnectS2c,
    FinishConfigurationS2c, KeepAliveS2c, LegacyChatS2c, PluginMessageC2s, PluginMessageS2c,
    StartConfigurationS2c, SystemChatS2c, TabListHeaderFooterS2c, TransferS2c,
};
use gale_protocol::text::TextComponent;
use gale_protocol::version::ProtocolVersion;
use gale_protocol::{Packet, PacketDecoder, PacketEncoder, PacketFrame, VarInt};
use rustc_hash::FxHashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{self, ForwardInfo, InFlight, ReadyBackend, SwitchError, TransitionEvent};
use crate::packet_io::{spawn_byte_writer, PacketIo, READ_BUF_SIZE};
use crate::player::{ConnectionStatus, Player, PlayerCommand};
use crate::queue::EnqueueOutcome;
use crate::{bungee, command, switch, Proxy};

/// Protocol stage of the client connection.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnectionPhase {
    Handshake = 0,
    Status = 1,
    Login = 2,
    Config = 3,
    Play = 4,
    Closed = 5,
}

impl ConnectionPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Handshake,
            1 => Self::Status,
            2 => Self::Login,
            3 => Self::Config,
            4 => Self::Play,
            _ => Self::Closed,
        }
    }
}

/// The shareable view of a client connection: its version and current
/// phase. The session owns everything else.
#[derive(Clone)]
pub struct ClientHandle {
    version: ProtocolVersion,
    phase: Arc<AtomicU8>,
}

impl ClientHandle {
    pub fn new(version: ProtocolVersion, phase: ConnectionPhase) -> Self {
        Self {
            version,
            phase: Arc::new(AtomicU8::new(phase as u8)),
        }
    }

    /// A handle with no live connection behind it, for tests.
    pub fn detached(version: ProtocolVersion) -> Self {
        Self::new(version, ConnectionPhase::Play)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: ConnectionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// The attached backend connection.
struct Backend {
    server: String,
    reader: OwnedReadHalf,
    dec: PacketDecoder,
    enc: PacketEncoder,
    out: mpsc::Sender<BytesMut>,
    /// Outstanding keep-alives: id to send instant.
    pending_pings: FxHashMap<i64, Instant>,
    /// True while the backend is still in its CONFIG stage and the
    /// client participates live (backend-initiated reconfigs).
    in_config: bool,
    /// While true, clientbound frames are buffered in `held` instead
    /// of reaching the client (the client is still being moved over).
    hold_clientbound: bool,
    held: Vec<PacketFrame>,
}

/// Progress of moving the client onto an in-flight backend.
struct Handoff {
    /// Pre-config-state protocol: no StartConfiguration round trip.
    legacy: bool,
    ready: Option<ReadyBackend>,
    /// The client has acknowledged StartConfiguration (or never needed
    /// to).
    config_acked: bool,
    /// FinishConfiguration has been sent to the client.
    finish_sent: bool,
}

struct RateWindow {
    start: Instant,
    used: u32,
}

impl RateWindow {
    const WINDOW: Duration = Duration::from_secs(2);
    const LIMIT: u32 = 10;

    fn allow(&mut self) -> bool {
        let now = Instant::now();

        if now.duration_since(self.start) >= Self::WINDOW {
            self.start = now;
            self.used = 0;
        }

        self.used += 1;
        self.used <= Self::LIMIT
    }
}

enum Event {
    Command(Option<PlayerCommand>),
    ClientFrame(anyhow::Result<PacketFrame>),
    BackendFrame(anyhow::Result<PacketFrame>),
    Transition(Option<TransitionEvent>),
    KeepAliveTick,
}

pub(crate) struct Session {
    proxy: Proxy,
    player: Arc<Player>,
    version: ProtocolVersion,
    read_timeout: Duration,

    client_reader: OwnedReadHalf,
    client_dec: PacketDecoder,
    client_enc: PacketEncoder,
    client_out: mpsc::Sender<BytesMut>,

    commands: mpsc::UnboundedReceiver<PlayerCommand>,

    backend: Option<Backend>,
    in_flight: Option<InFlight>,
    handoff: Option<Handoff>,
    switch_result: Option<oneshot::Sender<ConnectionStatus>>,
    switch_message: Option<TextComponent>,
    /// Target to re-queue for after landing on a fallback.
    pending_requeue: Option<String>,

    bundle_open: bool,
    /// Body bytes of the last ClientSettings the client sent.
    client_settings: Option<Vec<u8>>,
    /// A backend sent StartConfiguration; the client's ack is still to
    /// be forwarded.
    backend_reconfig_pending: bool,

    cmd_rate: RateWindow,
    keepalive: tokio::time::Interval,
    closed: bool,
}

/// Drives a logged-in player until their connection ends. Returns when
/// the session is over; the caller unregisters the player.
pub async fn run(
    proxy: Proxy,
    player: Arc<Player>,
    io: PacketIo,
    commands: mpsc::UnboundedReceiver<PlayerCommand>,
) -> anyhow::Result<()> {
    let version = player.version;
    let read_timeout = Duration::from_millis(proxy.config().read_timeout);

    let (reader, writer, dec, enc) = io.into_parts();
    let client_out = spawn_byte_writer(writer);

    let mut keepalive = tokio::time::interval(Duration::from_secs(15));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut session = Session {
        proxy,
        player,
        version,
        read_timeout,
        client_reader: reader,
        client_dec: dec,
        client_enc: enc,
        client_out,
        commands,
        backend: None,
        in_flight: None,
        handoff: None,
        switch_result: None,
        switch_message: None,
        pending_requeue: None,
        bundle_open: false,
        client_settings: None,
        backend_reconfig_pending: false,
        cmd_rate: RateWindow {
            start: Instant::now(),
            used: 0,
        },
        keepalive,
        closed: false,
    };

    session.connect_initial().await?;

    let result = session.run_loop().await;

    if let Some(in_flight) = session.in_flight.take() {
        in_flight.abort();
    }

    session.player.client.set_phase(ConnectionPhase::Closed);

    result
}

impl Session {
    fn phase(&self) -> ConnectionPhase {
        self.player.client.phase()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        self.player.client.set_phase(phase);
    }

    fn forward_info(&self) -> ForwardInfo {
        ForwardInfo {
            username: self.player.username.clone(),
            uuid: self.player.uuid,
            properties: self.player.profile.properties.clone(),
            client_ip: self.player.remote_addr.ip(),
            virtual_host: self
                .player
                .virtual_host
                .clone()
                .unwrap_or_else(|| "localhost".into()),
            virtual_port: 25565,
            version: self.version,
        }
    }

    /// Picks and begins the first backend connection, possibly through
    /// the queue.
    async fn connect_initial(&mut self) -> anyhow::Result<()> {
        let candidates = switch::candidate_servers(
            &self.proxy,
            self.player.virtual_host.as_deref(),
            &[],
            None,
            None,
        );

        let filter = self.proxy.config().servers.dynamic_fallbacks_filter;
        let target = switch::pick_fallback(filter, &candidates, |name| {
            self.proxy.total_player_count(name)
        });

        let Some(target) = target else {
            self.kick_client(TextComponent::translatable(
                "velocity.error.no-available-servers",
            ))
            .await?;
            return Ok(());
        };

        match self
            .proxy
            .queues()
            .enqueue_or_connect(&self.proxy, &self.player, &target)
            .await
        {
            EnqueueOutcome::ConnectNow => self.start_switch(target, None, None).await,
            EnqueueOutcome::Queued => {
                self.send_chat(
                    TextComponent::translatable("gale.queue.joined"),
                    false,
                )
                .await?;
                Ok(())
            }
        }
    }

    async fn run_loop(&mut self) -> anyhow::Result<()> {
        while !self.closed {
            let event = self.next_event().await;

            match event {
                Event::Command(None) => break,
                Event::Command(Some(command)) => self.handle_command(command).await?,
                Event::ClientFrame(Ok(frame)) => self.handle_client_frame(frame).await?,
                Event::ClientFrame(Err(e)) => {
                    debug!(player = %self.player.username, "client read ended: {e:#}");
                    break;
                }
                Event::BackendFrame(Ok(frame)) => self.handle_backend_frame(frame).await?,
                Event::BackendFrame(Err(e)) => self.handle_backend_loss(e).await?,
                Event::Transition(Some(event)) => self.handle_transition_event(event).await?,
                Event::Transition(None) => self.handle_transition_complete().await?,
                Event::KeepAliveTick => self.handle_keepalive_tick().await?,
            }
        }

        Ok(())
    }

    async fn next_event(&mut self) -> Event {
        let Session {
            client_reader,
            client_dec,
            commands,
            backend,
            in_flight,
            keepalive,
            read_timeout,
            ..
        } = self;

        let has_backend = backend.is_some();
        let has_in_flight = in_flight.is_some();
        let timeout = *read_timeout;

        tokio::select! {
            command = commands.recv() => Event::Command(command),

            frame = read_frame(client_reader, client_dec, timeout) => {
                Event::ClientFrame(frame)
            }

            frame = async {
                let b = backend.as_mut().unwrap();
                read_frame(&mut b.reader, &mut b.dec, timeout).await
            }, if has_backend => Event::BackendFrame(frame),

            event = async {
                in_flight.as_mut().unwrap().events.recv().await
            }, if has_in_flight => Event::Transition(event),

            _ = keepalive.tick() => Event::KeepAliveTick,
        }
    }

    // ---- client writes -------------------------------------------------

    async fn flush_client(&mut self) -> anyhow::Result<()> {
        let bytes = self.client_enc.take();

        if !bytes.is_empty() && self.client_out.send(bytes).await.is_err() {
            anyhow::bail!("client connection closed");
        }

        Ok(())
    }

    async fn send_client<P: Packet>(&mut self, pkt: &P) -> anyhow::Result<()> {
        self.client_enc.append_packet(pkt, self.version)?;
        self.flush_client().await
    }

    async fn forward_to_client(&mut self, frame: &PacketFrame) -> anyhow::Result<()> {
        self.client_enc.append_packet_frame(frame)?;
        self.flush_client().await
    }

    async fn send_chat(&mut self, content: TextComponent, action_bar: bool) -> anyhow::Result<()> {
        if self.phase() != ConnectionPhase::Play {
            // The config stage has no chat surface; drop quietly.
            return Ok(());
        }

        if self.version >= ProtocolVersion::V1_19 {
            self.send_client(&SystemChatS2c {
                content,
                overlay: action_bar,
            })
            .await
        } else {
            self.send_client(&LegacyChatS2c {
                content,
                position: if action_bar { 2 } else { 0 },
                sender: Uuid::nil(),
            })
            .await
        }
    }

    async fn kick_client(&mut self, reason: TextComponent) -> anyhow::Result<()> {
        match self.phase() {
            ConnectionPhase::Play => {
                if self.bundle_open {
                    self.send_client(&BundleDelimiterS2c).await?;
                    self.bundle_open = false;
                }
                self.send_client(&DisconnectS2c { reason }).await?;
            }
            ConnectionPhase::Config => {
                self.send_client(&ConfigDisconnectS2c { reason }).await?;
            }
            _ => {}
        }

        self.closed = true;
        Ok(())
    }

    // ---- backend writes ------------------------------------------------

    async fn send_backend<P: Packet>(&mut self, pkt: &P) -> anyhow::Result<()> {
        let version = self.version;

        if let Some(backend) = &mut self.backend {
            backend.enc.append_packet(pkt, version)?;
            let bytes = backend.enc.take();

            if backend.out.send(bytes).await.is_err() {
                anyhow::bail!("backend connection closed");
            }
        }

        Ok(())
    }

    async fn forward_to_backend(&mut self, frame: &PacketFrame) -> anyhow::Result<()> {
        if let Some(backend) = &mut self.backend {
            backend.enc.append_packet_frame(frame)?;
            let bytes = backend.enc.take();

            if backend.out.send(bytes).await.is_err() {
                anyhow::bail!("backend connection closed");
            }
        }

        Ok(())
    }

    /// Re-frames a packet under a different id (config to play and the
    /// like) and sends it to the backend.
    async fn forward_to_backend_as(
        &mut self,
        kind: PacketKind,
        body: &[u8],
    ) -> anyhow::Result<()> {
        let Some(id) = kind.id(self.version) else {
            return Ok(());
        };

        let mut framed = Vec::with_capacity(body.len() + 2);
        gale_protocol::Encode::encode(&VarInt(id), &mut framed)?;
        framed.extend_from_slice(body);

        if let Some(backend) = &mut self.backend {
            backend.enc.append_raw_frame(&framed)?;
            let bytes = backend.enc.take();

            if backend.out.send(bytes).await.is_err() {
                anyhow::bail!("backend connection closed");
            }
        }

        Ok(())
    }

    // ---- commands ------------------------------------------------------

    async fn handle_command(&mut self, command: PlayerCommand) -> anyhow::Result<()> {
        match command {
            PlayerCommand::Connect {
                server,
                message,
                result,
            } => self.start_switch(server, message, result).await,
            PlayerCommand::Kick { reason } => self.kick_client(reason).await,
            PlayerCommand::Message(content) => self.send_chat(content, false).await,
            PlayerCommand::ActionBar(content) => self.send_chat(content, true).await,
            PlayerCommand::PluginMessage { channel, data } => {
                if self.phase() == ConnectionPhase::Play {
                    self.send_client(&PluginMessageS2c { channel, data }).await
                } else {
                    Ok(())
                }
            }
            PlayerCommand::BackendPluginMessage { channel, data } => {
                self.send_backend(&PluginMessageC2s { channel, data }).await
            }
            PlayerCommand::Transfer { host, port } => {
                if self.version.supports_transfers() && self.phase() == ConnectionPhase::Play {
                    self.send_client(&TransferS2c {
                        host,
                        port: i32::from(port),
                    })
                    .await
                } else {
                    self.kick_client(TextComponent::plain("Proxy shutting down."))
                        .await
                }
            }
            PlayerCommand::Sudo { command } => {
                command::dispatch(&self.proxy, &self.player, &command).await;
                Ok(())
            }
        }
    }

    // ---- switching -----------------------------------------------------

    async fn start_switch(
        &mut self,
        server: String,
        message: Option<TextComponent>,
        result: Option<oneshot::Sender<ConnectionStatus>>,
    ) -> anyhow::Result<()> {
        if self
            .backend
            .as_ref()
            .is_some_and(|backend| backend.server == server)
        {
            if let Some(result) = result {
                let _ = result.send(ConnectionStatus::AlreadyConnected);
            }
            self.send_chat(
                TextComponent::translatable("velocity.error.already-connected-to-server"),
                false,
            )
            .await?;
            return Ok(());
        }

        if self.handoff.is_some() {
            // The previous switch is in its final client exchange;
            // interrupting it now would wedge the connection.
            if let Some(result) = result {
                let _ = result.send(ConnectionStatus::ConnectionInProgress);
            }
            return Ok(());
        }

        if let Some(in_flight) = &self.in_flight {
            if in_flight.server == server {
                if let Some(result) = result {
                    let _ = result.send(ConnectionStatus::ConnectionInProgress);
                }
                return Ok(());
            }

            // A newer request supersedes the old attempt.
            let in_flight = self.in_flight.take().unwrap();
            in_flight.abort();
            self.handoff = None;

            if let Some(old_result) = self.switch_result.take() {
                let _ = old_result.send(ConnectionStatus::ConnectionCancelled);
            }
        }

        debug!(player = %self.player.username, %server, "starting backend switch");

        {
            let mut state = self.player.state();
            state.in_flight_server = Some(server.clone());
        }

        self.switch_result = result;
        self.switch_message = message;
        self.in_flight = Some(backend::start_transition(
            self.proxy.clone(),
            self.forward_info(),
            server,
        ));

        Ok(())
    }

    async fn handle_transition_event(&mut self, event: TransitionEvent) -> anyhow::Result<()> {
        match event {
            TransitionEvent::PluginMessage(frame) => {
                // Mod handshakes must reach the client even mid-switch.
                if let Ok(pkt) = frame.decode::<PluginMessageS2c>(self.version) {
                    if self.phase() == ConnectionPhase::Play {
                        self.send_client(&pkt).await?;
                    }
                }
                Ok(())
            }
            TransitionEvent::JoinGame => self.begin_handoff().await,
            TransitionEvent::Failed(error) => self.handle_switch_failure(error).await,
        }
    }

    /// The in-flight backend is live; move the client over.
    async fn begin_handoff(&mut self) -> anyhow::Result<()> {
        let switching_live = self.backend.is_some();

        if switching_live {
            // The old backend is done the moment the new one has a
            // world for the player.
            self.backend = None;

            self.send_client(&KeepAliveS2c {
                id: rand::random::<i32>() as i64,
            })
            .await?;

            if self.version >= ProtocolVersion::V1_8 {
                self.send_client(&TabListHeaderFooterS2c {
                    header: TextComponent::plain(""),
                    footer: TextComponent::plain(""),
                })
                .await?;
            }
        }

        let legacy = !self.version.has_config_state();
        let mut config_acked = true;

        if !legacy && self.phase() == ConnectionPhase::Play {
            if self.bundle_open {
                self.send_client(&BundleDelimiterS2c).await?;
                self.bundle_open = false;
            }

            self.send_client(&StartConfigurationS2c).await?;
            config_acked = false;
        }

        self.handoff = Some(Handoff {
            legacy,
            ready: None,
            config_acked,
            finish_sent: false,
        });

        if let Some(in_flight) = &mut self.in_flight {
            in_flight.request_handover();
        }

        Ok(())
    }

    /// The transition task ended: either it handed the backend over or
    /// it already reported failure.
    async fn handle_transition_complete(&mut self) -> anyhow::Result<()> {
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };

        match in_flight.task.await {
            Ok(Some(ready)) => {
                if let Some(handoff) = &mut self.handoff {
                    handoff.ready = Some(ready);
                    self.advance_handoff().await
                } else {
                    // No handoff in progress means the failure path
                    // already ran; nothing to do.
                    Ok(())
                }
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(player = %self.player.username, "transition task failed: {e}");
                self.handoff = None;

                {
                    let mut state = self.player.state();
                    state.in_flight_server = None;
                }

                if self.backend.is_none() {
                    self.kick_client(TextComponent::translatable(
                        "velocity.error.internal-server-connection-error",
                    ))
                    .await?;
                }
                Ok(())
            }
        }
    }

    /// Moves the handoff forward whenever one of its two prerequisites
    /// (backend handed over, client acked) lands.
    async fn advance_handoff(&mut self) -> anyhow::Result<()> {
        let Some(handoff) = &mut self.handoff else {
            return Ok(());
        };

        if handoff.ready.is_none() || !handoff.config_acked || handoff.finish_sent {
            return Ok(());
        }

        let mut ready = handoff.ready.take().unwrap();
        let legacy = handoff.legacy;

        let config_frames = std::mem::take(&mut ready.config_frames);
        self.attach_backend(ready, !legacy);

        if legacy {
            self.handoff = None;
            self.complete_switch_success().await?;

            if let Some(backend) = &mut self.backend {
                backend.hold_clientbound = false;
            }
            self.flush_held_frames().await?;
        } else {
            for frame in &config_frames {
                self.forward_to_client(frame).await?;
            }

            self.send_client(&FinishConfigurationS2c).await?;

            if let Some(handoff) = &mut self.handoff {
                handoff.finish_sent = true;
            }
        }

        Ok(())
    }

    fn attach_backend(&mut self, ready: ReadyBackend, hold: bool) {
        let out = spawn_byte_writer(ready.writer);

        self.backend = Some(Backend {
            server: ready.server,
            reader: ready.reader,
            dec: ready.dec,
            enc: ready.enc,
            out,
            pending_pings: FxHashMap::default(),
            in_config: false,
            hold_clientbound: hold,
            held: ready.play_frames,
        });
    }

    async fn flush_held_frames(&mut self) -> anyhow::Result<()> {
        let held = match &mut self.backend {
            Some(backend) => std::mem::take(&mut backend.held),
            None => return Ok(()),
        };

        for frame in &held {
            self.forward_to_client(frame).await?;
        }

        Ok(())
    }

    /// The switch reached its goal: bookkeeping, notifications, and the
    /// deferred re-queue.
    async fn complete_switch_success(&mut self) -> anyhow::Result<()> {
        let server = match &self.backend {
            Some(backend) => backend.server.clone(),
            None => return Ok(()),
        };

        info!(player = %self.player.username, %server, "connected to backend");

        {
            let mut state = self.player.state();
            state.current_server = Some(server.clone());
            state.in_flight_server = None;
            state.attempted_servers.clear();
        }

        self.set_phase(ConnectionPhase::Play);

        // The backend finished its configuration without the client;
        // whatever settings the client last declared still have to
        // reach it. The config and play bodies share a layout.
        if let Some(body) = self.client_settings.clone() {
            self.forward_to_backend_as(PacketKind::ClientSettingsPlay, &body)
                .await?;
        }

        if let Some(result) = self.switch_result.take() {
            let _ = result.send(ConnectionStatus::Successful);
        }

        if let Some(message) = self.switch_message.take() {
            self.send_chat(message, false).await?;
        }

        if let Some(fleet) = self.proxy.fleet() {
            fleet
                .announce_server_change(&self.player, Some(server.clone()))
                .await;
        }

        self.proxy
            .queues()
            .on_player_connected(&self.proxy, &self.player, &server)
            .await;

        if let Some(target) = self.pending_requeue.take() {
            self.proxy
                .queues()
                .enqueue_or_connect(&self.proxy, &self.player, &target)
                .await;
        }

        Ok(())
    }

    async fn handle_switch_failure(&mut self, error: SwitchError) -> anyhow::Result<()> {
        let in_flight_server = {
            let mut state = self.player.state();
            let server = state.in_flight_server.take();

            if let Some(server) = &server {
                if !state.attempted_servers.contains(server) {
                    state.attempted_servers.push(server.clone());
                }
            }

            server
        };

        self.in_flight = None;
        self.handoff = None;

        if let Some(result) = self.switch_result.take() {
            let _ = result.send(ConnectionStatus::ServerDisconnected);
        }
        self.switch_message = None;

        let (reason, safe) = match error {
            SwitchError::Unavailable(text) => {
                debug!(
                    player = %self.player.username,
                    server = in_flight_server.as_deref().unwrap_or("?"),
                    "backend unavailable: {text}"
                );
                (None, true)
            }
            SwitchError::Kicked { reason, safe } => (Some(reason), safe),
        };

        if !safe {
            // Mid-Forge-handshake failures leave the client wedged;
            // only a full disconnect recovers it.
            return self
                .kick_client(reason.unwrap_or_else(|| {
                    TextComponent::translatable("velocity.error.internal-server-connection-error")
                }))
                .await;
        }

        let from_current = self.backend.is_none();

        // Blocked reasons also block the automatic re-queue.
        if let (Some(reason), Some(server)) = (&reason, &in_flight_server) {
            let config = self.proxy.config();
            if config.queue.enabled
                && config.queue.queue_on_shutdown
                && !switch::reason_blocks_requeue(reason, &config.queue.banned_reasons)
            {
                drop(config);
                self.pending_requeue = Some(server.clone());
            }
        }

        match switch::decide(&self.proxy, &self.player, from_current, reason) {
            switch::KickVerb::DisconnectPlayer(reason) => self.kick_client(reason).await,
            switch::KickVerb::Notify(message) => self.send_chat(message, false).await,
            switch::KickVerb::RedirectPlayer { server, message } => {
                self.start_switch(server, message, None).await
            }
        }
    }

    /// The attached backend dropped without a Disconnect packet.
    async fn handle_backend_loss(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        let server = self.backend.take().map(|b| b.server);

        debug!(
            player = %self.player.username,
            server = server.as_deref().unwrap_or("?"),
            "lost backend: {error:#}"
        );

        {
            let mut state = self.player.state();
            state.current_server = None;
            if let Some(server) = &server {
                if !state.attempted_servers.contains(server) {
                    state.attempted_servers.push(server.clone());
                }
            }
        }

        if !self.proxy.config().failover_on_unexpected_server_disconnect {
            return self
                .kick_client(TextComponent::translatable(
                    "velocity.error.unexpected-disconnect",
                ))
                .await;
        }

        match switch::decide(&self.proxy, &self.player, true, None) {
            switch::KickVerb::DisconnectPlayer(reason) => self.kick_client(reason).await,
            switch::KickVerb::Notify(message) => self.send_chat(message, false).await,
            switch::KickVerb::RedirectPlayer { server, message } => {
                self.start_switch(server, message, None).await
            }
        }
    }

    // ---- frame routing: backend to client ------------------------------

    async fn handle_backend_frame(&mut self, frame: PacketFrame) -> anyhow::Result<()> {
        let (in_config, hold) = match &self.backend {
            Some(backend) => (backend.in_config, backend.hold_clientbound),
            None => return Ok(()),
        };

        let state = if in_config {
            PacketState::Config
        } else {
            PacketState::Play
        };

        let kind = catalog::lookup(state, PacketSide::Clientbound, self.version, frame.id);

        if hold {
            match kind {
                Some(PacketKind::KeepAliveS2c) => {
                    let pkt: KeepAliveS2c = frame.decode(self.version)?;
                    return self
                        .send_backend(&gale_protocol::packets::KeepAliveC2s { id: pkt.id })
                        .await;
                }
                Some(PacketKind::DisconnectPlay) => {
                    let pkt: DisconnectS2c = frame.decode(self.version)?;
                    self.backend = None;
                    return self
                        .handle_switch_failure(SwitchError::Kicked {
                            reason: pkt.reason,
                            safe: true,
                        })
                        .await;
                }
                _ => {
                    if let Some(backend) = &mut self.backend {
                        backend.held.push(frame);
                    }
                    return Ok(());
                }
            }
        }

        match kind {
            Some(PacketKind::KeepAliveS2c) => {
                let pkt: KeepAliveS2c = frame.decode(self.version)?;

                if let Some(backend) = &mut self.backend {
                    backend.pending_pings.insert(pkt.id, Instant::now());

                    // Keep the table bounded against servers that never
                    // see their answers.
                    if backend.pending_pings.len() > 64 {
                        backend.pending_pings.clear();
                    }
                }

                self.forward_to_client(&frame).await
            }
            Some(PacketKind::ConfigKeepAliveS2c) => self.forward_to_client(&frame).await,
            Some(PacketKind::DisconnectPlay) => {
                let pkt: DisconnectS2c = frame.decode(self.version)?;
                self.backend_kicked(pkt.reason).await
            }
            Some(PacketKind::ConfigDisconnect) => {
                let pkt: ConfigDisconnectS2c = frame.decode(self.version)?;
                self.backend_kicked(pkt.reason).await
            }
            Some(PacketKind::BundleDelimiter) => {
                self.bundle_open = !self.bundle_open;
                self.forward_to_client(&frame).await
            }
            Some(PacketKind::StartConfiguration) => {
                // Backend-initiated reconfiguration passes through; the
                // phases flip once the client acknowledges.
                self.backend_reconfig_pending = true;
                self.forward_to_client(&frame).await
            }
            Some(PacketKind::ConfigFinish) => self.forward_to_client(&frame).await,
            Some(PacketKind::PluginMessageS2c) => {
                let pkt: PluginMessageS2c = frame.decode(self.version)?;

                if bungee::is_bungee_channel(&pkt.channel)
                    && self.proxy.config().bungee_plugin_message_channel
                {
                    let replies =
                        bungee::handle_message(&self.proxy, &self.player, &pkt.data).await;

                    for data in replies {
                        self.send_backend(&PluginMessageC2s {
                            channel: bungee::reply_channel(self.version).to_owned(),
                            data,
                        })
                        .await?;
                    }

                    return Ok(());
                }

                self.forward_to_client(&frame).await
            }
            _ => self.forward_to_client(&frame).await,
        }
    }

    async fn backend_kicked(&mut self, reason: TextComponent) -> anyhow::Result<()> {
        let server = self.backend.take().map(|b| b.server);

        info!(
            player = %self.player.username,
            server = server.as_deref().unwrap_or("?"),
            "kicked from backend: {reason}"
        );

        {
            let mut state = self.player.state();
            state.current_server = None;
            if let Some(server) = &server {
                if !state.attempted_servers.contains(server) {
                    state.attempted_servers.push(server.clone());
                }
            }
        }

        // The banned-reason guard gates the deferred re-queue.
        let forward_reason = {
            let config = self.proxy.config();

            if let Some(server) = &server {
                if config.queue.enabled
                    && config.queue.queue_on_shutdown
                    && !switch::reason_blocks_requeue(&reason, &config.queue.banned_reasons)
                {
                    self.pending_requeue = Some(server.clone());
                }
            }

            config.queue.forward_kick_reason
        };

        let reason = forward_reason.then_some(reason);

        match switch::decide(&self.proxy, &self.player, true, reason) {
            switch::KickVerb::DisconnectPlayer(reason) => self.kick_client(reason).await,
            switch::KickVerb::Notify(message) => self.send_chat(message, false).await,
            switch::KickVerb::RedirectPlayer { server, message } => {
                self.start_switch(server, message, None).await
            }
        }
    }

    // ---- frame routing: client to backend ------------------------------

    async fn handle_client_frame(&mut self, frame: PacketFrame) -> anyhow::Result<()> {
        match self.phase() {
            ConnectionPhase::Config => self.handle_client_config_frame(frame).await,
            ConnectionPhase::Play => self.handle_client_play_frame(frame).await,
            _ => Ok(()),
        }
    }

    async fn handle_client_config_frame(&mut self, frame: PacketFrame) -> anyhow::Result<()> {
        let kind = catalog::lookup(
            PacketState::Config,
            PacketSide::Serverbound,
            self.version,
            frame.id,
        );

        let reconfiguring = self.handoff.is_some();

        match kind {
            Some(PacketKind::ConfigFinishAck) => {
                if let Some(handoff) = &self.handoff {
                    if handoff.finish_sent {
                        self.handoff = None;
                        self.set_phase(ConnectionPhase::Play);
                        self.complete_switch_success().await?;

                        if let Some(backend) = &mut self.backend {
                            backend.hold_clientbound = false;
                        }
                        return self.flush_held_frames().await;
                    }
                    return Ok(());
                }

                // Initial configuration: the ack goes through, and both
                // sides enter PLAY.
                self.set_phase(ConnectionPhase::Play);
                if let Some(backend) = &mut self.backend {
                    backend.in_config = false;
                }
                self.forward_to_backend(&frame).await
            }
            Some(PacketKind::ConfigClientSettings) => {
                self.client_settings = Some(frame.body.to_vec());

                if reconfiguring {
                    // The new backend is past CONFIG already; hand the
                    // settings over in their play-state form.
                    let body = frame.body.to_vec();
                    self.forward_to_backend_as(PacketKind::ClientSettingsPlay, &body)
                        .await
                } else {
                    self.forward_to_backend(&frame).await
                }
            }
            Some(PacketKind::ConfigPluginMessageC2s) => {
                if let Ok(pkt) = frame.decode::<PluginMessageC2s>(self.version) {
                    self.note_brand(&pkt.channel, &pkt.data);

                    if reconfiguring {
                        let body = frame.body.to_vec();
                        return self
                            .forward_to_backend_as(PacketKind::PluginMessageC2s, &body)
                            .await;
                    }
                }
                self.forward_to_backend(&frame).await
            }
            _ if reconfiguring => Ok(()),
            _ => self.forward_to_backend(&frame).await,
        }
    }

    async fn handle_client_play_frame(&mut self, frame: PacketFrame) -> anyhow::Result<()> {
        let kind = catalog::lookup(
            PacketState::Play,
            PacketSide::Serverbound,
            self.version,
            frame.id,
        );

        match kind {
            Some(PacketKind::KeepAliveC2s) => {
                let pkt: gale_protocol::packets::KeepAliveC2s = frame.decode(self.version)?;

                let known = self
                    .backend
                    .as_mut()
                    .and_then(|backend| backend.pending_pings.remove(&pkt.id));

                match known {
                    Some(sent_at) => {
                        let ping_ms = sent_at.elapsed().as_millis() as u64;
                        self.player.state().ping_ms = Some(ping_ms);
                        self.forward_to_backend(&frame).await
                    }
                    // Unknown ids are a legitimate race during a
                    // switch; swallow them.
                    None => Ok(()),
                }
            }
            Some(PacketKind::ConfigurationAck) => {
                if let Some(handoff) = &mut self.handoff {
                    handoff.config_acked = true;
                    self.set_phase(ConnectionPhase::Config);
                    return self.advance_handoff().await;
                }

                if self.backend_reconfig_pending {
                    self.backend_reconfig_pending = false;
                    self.set_phase(ConnectionPhase::Config);
                    if let Some(backend) = &mut self.backend {
                        backend.in_config = true;
                    }
                }

                self.forward_to_backend(&frame).await
            }
            Some(PacketKind::ChatMessage) => {
                let pkt: gale_protocol::packets::ChatMessageC2s = frame.decode(self.version)?;

                if let Some(line) = pkt.message.strip_prefix('/') {
                    return self.handle_command_line(line.to_owned(), frame).await;
                }

                self.forward_to_backend(&frame).await
            }
            Some(PacketKind::ChatCommand) | Some(PacketKind::SignedChatCommand) => {
                let pkt: gale_protocol::packets::ChatCommandC2s = frame.decode(self.version)?;
                self.handle_command_line(pkt.command, frame).await
            }
            Some(PacketKind::PluginMessageC2s) => {
                let pkt: PluginMessageC2s = frame.decode(self.version)?;

                self.note_brand(&pkt.channel, &pkt.data);

                // Clients do not get to speak on the proxy control
                // channel.
                if bungee::is_bungee_channel(&pkt.channel) {
                    return Ok(());
                }

                self.forward_to_backend(&frame).await
            }
            Some(PacketKind::ClientSettingsPlay) => {
                self.client_settings = Some(frame.body.to_vec());
                self.forward_to_backend(&frame).await
            }
            _ => self.forward_to_backend(&frame).await,
        }
    }

    /// A chat line that might be a proxy command. Unhandled input goes
    /// to the backend untouched.
    async fn handle_command_line(
        &mut self,
        line: String,
        frame: PacketFrame,
    ) -> anyhow::Result<()> {
        if !command::is_proxy_command(&self.proxy, &line) {
            return self.forward_to_backend(&frame).await;
        }

        if !self.cmd_rate.allow() {
            return self
                .kick_client(TextComponent::plain("You are sending commands too fast."))
                .await;
        }

        if self.proxy.config().log_command_executions {
            info!(player = %self.player.username, %line, "command executed");
        }

        command::dispatch(&self.proxy, &self.player, &line).await;
        Ok(())
    }

    fn note_brand(&mut self, channel: &str, data: &[u8]) {
        if channel != "minecraft:brand" && channel != "MC|Brand" {
            return;
        }

        let mut r = data;
        if let Ok(brand) = <&str as gale_protocol::Decode>::decode(&mut r) {
            self.player.state().client_brand = Some(brand.to_owned());
        }
    }

    // ---- keep-alive ----------------------------------------------------

    /// While no backend is pinging the client (queued, or mid-handoff
    /// with the new backend still held back) the proxy itself must keep
    /// it alive.
    async fn handle_keepalive_tick(&mut self) -> anyhow::Result<()> {
        let backend_covers_it = self
            .backend
            .as_ref()
            .is_some_and(|backend| !backend.hold_clientbound);

        if backend_covers_it {
            return Ok(());
        }

        let id = rand::random::<i32>() as i64;

        match self.phase() {
            ConnectionPhase::Config => self.send_client(&ConfigKeepAliveS2c { id }).await,
            ConnectionPhase::Play => self.send_client(&KeepAliveS2c { id }).await,
            _ => Ok(()),
        }
    }
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    dec: &mut PacketDecoder,
    read_timeout: Duration,
) -> anyhow::Result<PacketFrame> {
    use tokio::io::AsyncReadExt;

    loop {
        if let Some(frame) = dec.try_next_packet()? {
            return Ok(frame);
        }

        dec.reserve(READ_BUF_SIZE);
        let mut buf = dec.take_capacity();

        let read = tokio::time::timeout(read_timeout, reader.read_buf(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("read timed out"))??;

        if read == 0 {
            anyhow::bail!("connection closed");
        }

        dec.queue_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_atomic() {
        let handle = ClientHandle::new(ProtocolVersion::V1_21, ConnectionPhase::Login);
        assert_eq!(handle.phase(), ConnectionPhase::Login);

        handle.set_phase(ConnectionPhase::Play);
        assert_eq!(handle.phase(), ConnectionPhase::Play);

        handle.set_phase(ConnectionPhase::Closed);
        assert_eq!(handle.phase(), ConnectionPhase::Closed);
    }

    #[test]
    fn command_rate_window() {
        let mut rate = RateWindow {
            start: Instant::now(),
            used: 0,
        };

        for _ in 0..RateWindow::LIMIT {
            assert!(rate.allow());
        }
        assert!(!rate.allow());

        // A fresh window clears the budget.
        rate.start = Instant::now() - RateWindow::WINDOW;
        assert!(rate.allow());
    }
}
