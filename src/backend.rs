//! Opens and drives proxy-to-backend connections: the dial, the
//! backend-side login with player-info forwarding, and the transition
//! handler that carries a live player onto a new backend.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::BytesMut;
use gale_protocol::catalog::{self, PacketKind, PacketSide, PacketState};
use gale_protocol::packets::{
    FinishConfigAckC2s, HandshakeC2s, KeepAliveC2s, LoginAcknowledgedC2s, LoginPluginRequestS2c,
    LoginPluginResponseC2s, LoginStartC2s, LoginSuccessS2c, NextState, SetCompressionS2c,
};
use gale_protocol::profile::Property;
use gale_protocol::text::TextComponent;
use gale_protocol::version::ProtocolVersion;
use gale_protocol::{
    CompressionThreshold, Encode, PacketDecoder, PacketEncoder, PacketFrame, VarInt,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ForwardingMode;
use crate::packet_io::PacketIo;
use crate::{parse_server_address, Proxy};

const MODERN_FORWARDING_CHANNEL: &str = "velocity:player_info";
const MODERN_FORWARDING_VERSION: i32 = 1;

/// Everything the backend handshake needs to know about the player.
#[derive(Clone, Debug)]
pub struct ForwardInfo {
    pub username: String,
    pub uuid: Uuid,
    pub properties: Vec<Property>,
    pub client_ip: IpAddr,
    pub virtual_host: String,
    pub virtual_port: u16,
    pub version: ProtocolVersion,
}

/// A backend connection that has completed its login. On 1.20.2+ the
/// backend sits at the start of CONFIG; on older versions it is already
/// in PLAY and a JoinGame is on its way.
pub struct BackendIo {
    pub server: String,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub dec: PacketDecoder,
    pub enc: PacketEncoder,
}

/// How a backend connect or switch attempt failed.
#[derive(Debug)]
pub enum SwitchError {
    /// Could not reach or complete a login with the backend. Always a
    /// safe failure: the player (if connected anywhere) is unaffected.
    Unavailable(String),
    /// The backend explicitly kicked the connection. `safe` is false
    /// only when a legacy Forge handshake was cut short, in which case
    /// the client is in a state no other backend can rescue.
    Kicked { reason: TextComponent, safe: bool },
}

impl SwitchError {
    pub fn is_safe(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Kicked { safe, .. } => *safe,
        }
    }
}

/// Dials `server` and drives the backend through its login, applying
/// the configured player-info forwarding mode.
pub async fn dial(proxy: &Proxy, info: &ForwardInfo, server: &str) -> Result<BackendIo, SwitchError> {
    let address = proxy
        .server_address(server)
        .ok_or_else(|| SwitchError::Unavailable(format!("unknown server {server}")))?;

    let version = info.version;
    let connect_timeout = Duration::from_millis(proxy.config().connection_timeout);
    let read_timeout = Duration::from_millis(proxy.config().read_timeout);

    let sock_addr = parse_server_address(&address)
        .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;

    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(sock_addr))
        .await
        .map_err(|_| SwitchError::Unavailable(format!("connect to {server} timed out")))?
        .map_err(|e| SwitchError::Unavailable(format!("connect to {server} failed: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY on backend stream: {e}");
    }

    let mode = proxy.config().forwarding_mode_for(server);
    let level = proxy.config().compression_level;

    let mut io = PacketIo::new(stream, read_timeout);

    if level >= 0 {
        io.set_compression_level(level as u32);
    }

    login_backend(proxy, &mut io, info, server, version, mode)
        .await
        .map_err(|e| match e {
            LoginOutcome::Kicked(reason) => SwitchError::Kicked { reason, safe: true },
            LoginOutcome::Error(e) => SwitchError::Unavailable(format!("{e:#}")),
        })?;

    let (reader, writer, dec, enc) = io.into_parts();

    Ok(BackendIo {
        server: server.to_owned(),
        reader,
        writer,
        dec,
        enc,
    })
}

enum LoginOutcome {
    Kicked(TextComponent),
    Error(anyhow::Error),
}

impl From<anyhow::Error> for LoginOutcome {
    fn from(e: anyhow::Error) -> Self {
        Self::Error(e)
    }
}

async fn login_backend(
    proxy: &Proxy,
    io: &mut PacketIo,
    info: &ForwardInfo,
    server: &str,
    version: ProtocolVersion,
    mode: ForwardingMode,
) -> Result<(), LoginOutcome> {
    let handshake_host = match mode {
        ForwardingMode::None | ForwardingMode::Modern => info.virtual_host.clone(),
        ForwardingMode::Legacy => legacy_forwarding_host(info, None),
        ForwardingMode::Bungeeguard => {
            let secret = proxy
                .config()
                .resolve_forwarding_secret()
                .context("bungeeguard forwarding needs a secret")?;
            legacy_forwarding_host(info, Some(&secret))
        }
    };

    io.send_packet(
        &HandshakeC2s {
            protocol_version: version.number(),
            server_address: handshake_host,
            server_port: info.virtual_port,
            next_state: NextState::Login,
        },
        version,
    )
    .await?;

    io.send_packet(
        &LoginStartC2s {
            username: info.username.clone(),
            uuid: Some(info.uuid),
        },
        version,
    )
    .await?;

    let mut forwarded = false;

    loop {
        let frame = io.recv_frame().await.map_err(LoginOutcome::Error)?;

        let kind = catalog::lookup(PacketState::Login, PacketSide::Clientbound, version, frame.id);

        match kind {
            Some(PacketKind::SetCompression) => {
                let pkt: SetCompressionS2c = frame.decode(version)?;
                if pkt.threshold >= 0 {
                    io.set_compression(CompressionThreshold(pkt.threshold));
                }
            }
            Some(PacketKind::LoginPluginRequest) => {
                let pkt: LoginPluginRequestS2c = frame.decode(version)?;
                let response = answer_plugin_request(proxy, info, version, &pkt)?;
                io.send_packet(&response, version).await?;

                if pkt.channel == MODERN_FORWARDING_CHANNEL {
                    forwarded = true;
                }
            }
            Some(PacketKind::LoginDisconnect) => {
                let pkt: gale_protocol::packets::LoginDisconnectS2c = frame.decode(version)?;
                return Err(LoginOutcome::Kicked(pkt.reason));
            }
            Some(PacketKind::EncryptionRequest) => {
                // A backend asking the proxy to authenticate is
                // misconfigured (it must run in offline mode behind us).
                return Err(LoginOutcome::Error(anyhow::anyhow!(
                    "backend {server} is in online mode"
                )));
            }
            Some(PacketKind::LoginSuccess) => {
                let _: LoginSuccessS2c = frame.decode(version)?;

                if mode == ForwardingMode::Modern && !forwarded {
                    return Err(LoginOutcome::Error(anyhow::anyhow!(
                        "backend {server} never requested modern forwarding info; \
                         is it configured for it?"
                    )));
                }

                if version.has_config_state() {
                    io.send_packet(&LoginAcknowledgedC2s, version).await?;
                }

                return Ok(());
            }
            _ => {
                trace!(id = frame.id, "ignoring unexpected login-state packet from backend");
            }
        }
    }
}

/// `host\0clientIP\0undashed-uuid\0propertiesJson[\0token]`.
fn legacy_forwarding_host(info: &ForwardInfo, bungeeguard_token: Option<&[u8]>) -> String {
    let properties =
        serde_json::to_string(&info.properties).unwrap_or_else(|_| "[]".into());

    let mut host = format!(
        "{}\0{}\0{}\0{}",
        info.virtual_host,
        info.client_ip,
        info.uuid.simple(),
        properties
    );

    if let Some(token) = bungeeguard_token {
        host.push('\0');
        host.push_str(&String::from_utf8_lossy(token));
    }

    host
}

fn answer_plugin_request(
    proxy: &Proxy,
    info: &ForwardInfo,
    _version: ProtocolVersion,
    request: &LoginPluginRequestS2c,
) -> anyhow::Result<LoginPluginResponseC2s> {
    if request.channel != MODERN_FORWARDING_CHANNEL {
        // Unknown login-stage request; there is no client to relay it
        // to at this point, so decline it.
        return Ok(LoginPluginResponseC2s {
            message_id: request.message_id,
            successful: false,
            data: vec![],
        });
    }

    let secret = proxy
        .config()
        .resolve_forwarding_secret()
        .context("modern forwarding needs a secret")?;

    let mut payload = vec![];
    VarInt(MODERN_FORWARDING_VERSION).encode(&mut payload)?;
    info.client_ip.to_string().encode(&mut payload)?;
    info.uuid.encode(&mut payload)?;
    info.username.encode(&mut payload)?;
    info.properties.encode(&mut payload)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(&secret).context("building forwarding MAC")?;
    mac.update(&payload);
    let signature = mac.finalize().into_bytes();

    let mut data = Vec::with_capacity(signature.len() + payload.len());
    data.extend_from_slice(&signature);
    data.extend_from_slice(&payload);

    Ok(LoginPluginResponseC2s {
        message_id: request.message_id,
        successful: true,
        data,
    })
}

/// What the transition task reports back to the session while it owns
/// the in-flight backend.
#[derive(Debug)]
pub enum TransitionEvent {
    /// A plugin message that must reach the client (mod handshakes).
    PluginMessage(PacketFrame),
    /// The backend delivered JoinGame; the session may start moving
    /// the client over.
    JoinGame,
    Failed(SwitchError),
}

/// The in-flight backend, handed to the session once the client is
/// ready to receive it.
pub struct ReadyBackend {
    pub server: String,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub dec: PacketDecoder,
    pub enc: PacketEncoder,
    /// CONFIG-state frames buffered for replay to the client
    /// (1.20.2+ switches only).
    pub config_frames: Vec<PacketFrame>,
    /// PLAY-state frames buffered since the backend went live, JoinGame
    /// first.
    pub play_frames: Vec<PacketFrame>,
}

/// Handle to a running transition.
pub struct InFlight {
    pub server: String,
    pub events: mpsc::UnboundedReceiver<TransitionEvent>,
    handover: Option<oneshot::Sender<()>>,
    pub task: JoinHandle<Option<ReadyBackend>>,
}

impl InFlight {
    /// Asks the task to stop buffering and return the backend.
    pub fn request_handover(&mut self) {
        if let Some(tx) = self.handover.take() {
            let _ = tx.send(());
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawns the transition for a server switch: dial, login, then drive
/// the backend to PLAY while the player keeps playing elsewhere.
///
/// The task answers backend keep-alives itself, forwards plugin
/// messages up to the session, buffers everything else, and reports
/// JoinGame. It keeps buffering until the session requests handover.
pub fn start_transition(proxy: Proxy, info: ForwardInfo, server: String) -> InFlight {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (handover_tx, handover_rx) = oneshot::channel();

    let task_server = server.clone();

    let task = tokio::spawn(async move {
        match run_transition(proxy, info, task_server, &events_tx, handover_rx).await {
            Ok(ready) => Some(ready),
            Err(error) => {
                let _ = events_tx.send(TransitionEvent::Failed(error));
                None
            }
        }
    });

    InFlight {
        server,
        events: events_rx,
        handover: Some(handover_tx),
        task,
    }
}

async fn run_transition(
    proxy: Proxy,
    info: ForwardInfo,
    server: String,
    events: &mpsc::UnboundedSender<TransitionEvent>,
    mut handover: oneshot::Receiver<()>,
) -> Result<ReadyBackend, SwitchError> {
    let version = info.version;
    let (read_timeout, disable_forge) = {
        let config = proxy.config();
        (
            Duration::from_millis(config.read_timeout),
            config.disable_forge,
        )
    };

    let io = dial(&proxy, &info, &server).await?;

    let BackendIo {
        server,
        mut reader,
        mut writer,
        mut dec,
        mut enc,
    } = io;

    let mut in_config = version.has_config_state();
    let mut config_frames = vec![];
    let mut play_frames = vec![];
    let mut saw_join_game = false;
    let mut handover_requested = false;

    let mut forge_started = false;
    let mut forge_complete = false;

    loop {
        if saw_join_game && handover_requested {
            return Ok(ReadyBackend {
                server,
                reader,
                writer,
                dec,
                enc,
                config_frames,
                play_frames,
            });
        }

        let frame = tokio::select! {
            frame = read_backend_frame(&mut reader, &mut dec, read_timeout) => frame,
            _ = &mut handover, if !handover_requested => {
                handover_requested = true;
                continue;
            }
        };

        let frame = frame.map_err(|e| {
            if forge_started && !forge_complete {
                SwitchError::Kicked {
                    reason: TextComponent::plain("Lost connection during mod handshake"),
                    safe: false,
                }
            } else {
                SwitchError::Unavailable(format!("{e:#}"))
            }
        })?;

        let state = if in_config {
            PacketState::Config
        } else {
            PacketState::Play
        };

        match catalog::lookup(state, PacketSide::Clientbound, version, frame.id) {
            Some(PacketKind::ConfigKeepAliveS2c) => {
                let pkt: gale_protocol::packets::ConfigKeepAliveS2c = frame
                    .decode(version)
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
                send_backend_packet(
                    &mut enc,
                    &mut writer,
                    &gale_protocol::packets::ConfigKeepAliveC2s { id: pkt.id },
                    version,
                )
                .await
                .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
            }
            Some(PacketKind::KeepAliveS2c) => {
                let pkt: gale_protocol::packets::KeepAliveS2c = frame
                    .decode(version)
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
                send_backend_packet(&mut enc, &mut writer, &KeepAliveC2s { id: pkt.id }, version)
                    .await
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
            }
            Some(PacketKind::ConfigFinish) => {
                // The proxy completes the backend's configuration pass
                // itself; the frames replay to the client later.
                send_backend_packet(&mut enc, &mut writer, &FinishConfigAckC2s, version)
                    .await
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
                in_config = false;
            }
            Some(PacketKind::ConfigDisconnect) => {
                let pkt: gale_protocol::packets::ConfigDisconnectS2c = frame
                    .decode(version)
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
                return Err(SwitchError::Kicked {
                    reason: pkt.reason,
                    safe: true,
                });
            }
            Some(PacketKind::DisconnectPlay) => {
                let pkt: gale_protocol::packets::DisconnectS2c = frame
                    .decode(version)
                    .map_err(|e| SwitchError::Unavailable(format!("{e:#}")))?;
                return Err(SwitchError::Kicked {
                    reason: pkt.reason,
                    safe: !(forge_started && !forge_complete),
                });
            }
            Some(PacketKind::PluginMessageS2c) | Some(PacketKind::ConfigPluginMessageS2c) => {
                if let Ok(pkt) =
                    frame.decode::<gale_protocol::packets::PluginMessageS2c>(version)
                {
                    if pkt.channel == "FML|HS" {
                        if disable_forge {
                            // Forge support is off; the handshake never
                            // reaches the client.
                            continue;
                        }

                        forge_started = true;
                        if pkt.data.first() == Some(&0xff) {
                            forge_complete = true;
                        }
                    }
                }

                let _ = events.send(TransitionEvent::PluginMessage(frame));
            }
            Some(PacketKind::JoinGame) => {
                play_frames.push(frame);

                if !saw_join_game {
                    saw_join_game = true;
                    let _ = events.send(TransitionEvent::JoinGame);
                }
            }
            _ if in_config => config_frames.push(frame),
            _ => {
                if saw_join_game {
                    play_frames.push(frame);
                }
                // Play frames before JoinGame would confuse the client;
                // servers do not send them, and stragglers are dropped.
            }
        }
    }
}

async fn read_backend_frame(
    reader: &mut OwnedReadHalf,
    dec: &mut PacketDecoder,
    read_timeout: Duration,
) -> anyhow::Result<PacketFrame> {
    use tokio::io::AsyncReadExt;

    loop {
        if let Some(frame) = dec.try_next_packet()? {
            return Ok(frame);
        }

        dec.reserve(crate::packet_io::READ_BUF_SIZE);
        let mut buf = dec.take_capacity();

        let read = tokio::time::timeout(read_timeout, reader.read_buf(&mut buf))
            .await
            .map_err(|_| anyhow::anyhow!("backend read timed out"))??;

        if read == 0 {
            bail!("backend closed the connection");
        }

        dec.queue_bytes(buf);
    }
}

async fn send_backend_packet<P: gale_protocol::Packet>(
    enc: &mut PacketEncoder,
    writer: &mut OwnedWriteHalf,
    pkt: &P,
    version: ProtocolVersion,
) -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    enc.append_packet(pkt, version)?;
    let bytes: BytesMut = enc.take();
    writer.write_all(&bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ForwardInfo {
        ForwardInfo {
            username: "Alice".into(),
            uuid: Uuid::from_u128(0x42),
            properties: vec![],
            client_ip: "203.0.113.7".parse().unwrap(),
            virtual_host: "lobby-host".into(),
            virtual_port: 25565,
            version: ProtocolVersion::V1_21,
        }
    }

    #[test]
    fn legacy_host_layout() {
        let host = legacy_forwarding_host(&sample_info(), None);
        let parts: Vec<&str> = host.split('\0').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "lobby-host");
        assert_eq!(parts[1], "203.0.113.7");
        assert_eq!(parts[2], "00000000000000000000000000000042");
        assert_eq!(parts[3], "[]");
    }

    #[test]
    fn bungeeguard_appends_token() {
        let host = legacy_forwarding_host(&sample_info(), Some(b"token123"));
        let parts: Vec<&str> = host.split('\0').collect();

        assert_eq!(parts.len(), 5);
        assert_eq!(parts[4], "token123");
    }

    #[test]
    fn modern_forwarding_signature_verifies() {
        let proxy = {
            let mut config = crate::config::Config::default();
            config.player_info_forwarding_mode = ForwardingMode::Modern;
            config.forwarding_secret = Some("hunter2".into());
            crate::Proxy::new(config).unwrap()
        };

        let request = LoginPluginRequestS2c {
            message_id: 7,
            channel: MODERN_FORWARDING_CHANNEL.into(),
            data: vec![MODERN_FORWARDING_VERSION as u8],
        };

        let response =
            answer_plugin_request(&proxy, &sample_info(), ProtocolVersion::V1_21, &request)
                .unwrap();

        assert!(response.successful);
        assert_eq!(response.message_id, 7);

        let (signature, payload) = response.data.split_at(32);

        let mut mac = Hmac::<Sha256>::new_from_slice(b"hunter2").unwrap();
        mac.update(payload);
        mac.verify_slice(signature).unwrap();

        // Payload begins with the forwarding version.
        assert_eq!(payload[0], MODERN_FORWARDING_VERSION as u8);
    }

    #[test]
    fn unknown_plugin_channel_is_declined() {
        let proxy = crate::Proxy::new(crate::config::Config::default()).unwrap();

        let request = LoginPluginRequestS2c {
            message_id: 3,
            channel: "somemod:handshake".into(),
            data: vec![],
        };

        let response =
            answer_plugin_request(&proxy, &sample_info(), ProtocolVersion::V1_21, &request)
                .unwrap();

        assert!(!response.successful);
        assert!(response.data.is_empty());
    }
}
