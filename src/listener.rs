//! Accepts new connections and routes them through the handshake.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use gale_protocol::packets::{
    HandshakeC2s, NextState, StatusPingC2s, StatusPongS2c, StatusRequestC2s, StatusResponseS2c,
};
use gale_protocol::version::ProtocolVersion;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::sleep;
use tracing::{debug, error, info, trace};

use crate::packet_io::PacketIo;
use crate::status::{self, LegacyPingFormat};
use crate::{login, Proxy};

/// Accepts new connections to the proxy as they occur.
pub async fn run(proxy: Proxy) -> anyhow::Result<()> {
    let bind = proxy.config().bind;

    let listener = bind_listener(&proxy, bind).context("binding listener")?;

    info!("listening on {bind}");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    let proxy = proxy.clone();

                    tokio::spawn(async move {
                        handle_connection(proxy, stream, remote_addr).await;
                    });
                }
                Err(e) => {
                    error!("failed to accept incoming connection: {e}");
                }
            },
            () = proxy.wait_for_shutdown() => return Ok(()),
        }
    }
}

fn bind_listener(proxy: &Proxy, bind: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = match bind {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    #[cfg(unix)]
    if proxy.config().enable_reuse_port {
        socket.set_reuseport(true)?;
    }

    if proxy.config().tcp_fast_open {
        // TFO enqueueing is an OS knob; nothing to set per-socket here.
        debug!("tcp-fast-open requested; relying on the host's TFO backlog setting");
    }

    socket.set_reuseaddr(true)?;
    socket.bind(bind)?;

    Ok(socket.listen(1024)?)
}

async fn handle_connection(proxy: Proxy, mut stream: TcpStream, mut remote_addr: SocketAddr) {
    trace!(%remote_addr, "handling connection");

    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }

    if proxy.config().proxy_protocol {
        match read_proxy_protocol(&mut stream).await {
            Ok(Some(real_addr)) => remote_addr = real_addr,
            Ok(None) => {}
            Err(e) => {
                debug!(%remote_addr, "rejecting connection with bad PROXY header: {e}");
                return;
            }
        }
    }

    match try_handle_legacy_ping(&proxy, &mut stream).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            debug!(%remote_addr, "legacy ping probe failed: {e}");
            return;
        }
    }

    let read_timeout = Duration::from_millis(proxy.config().read_timeout);
    let io = PacketIo::new(stream, read_timeout);

    if let Err(e) = handle_handshake(proxy, io, remote_addr).await {
        // EOF is routine: clients probe and vanish constantly.
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::UnexpectedEof {
                return;
            }
        }
        debug!(%remote_addr, "connection ended with error: {e:#}");
    }
}

async fn handle_handshake(
    proxy: Proxy,
    mut io: PacketIo,
    remote_addr: SocketAddr,
) -> anyhow::Result<()> {
    // The id table for the handshake state has never changed; any
    // version works for the first read.
    let handshake: HandshakeC2s = io.recv_packet(ProtocolVersion::MINIMUM).await?;

    anyhow::ensure!(
        handshake.server_address.chars().count() <= 255,
        "handshake server address is too long"
    );

    match handshake.next_state {
        NextState::Status => handle_status(proxy, io, handshake)
            .await
            .context("error handling status"),
        NextState::Login | NextState::Transfer => {
            if handshake.next_state == NextState::Transfer && !proxy.config().accepts_transfers {
                debug!(%remote_addr, "rejecting transfer: accepts-transfers is disabled");
                return Ok(());
            }

            login::handle_login(proxy, io, remote_addr, handshake)
                .await
                .context("error handling login")
        }
    }
}

async fn handle_status(proxy: Proxy, mut io: PacketIo, handshake: HandshakeC2s) -> anyhow::Result<()> {
    // Status is answered for any claimed version.
    let version = ProtocolVersion::from_number(handshake.protocol_version)
        .unwrap_or(ProtocolVersion::MAXIMUM);

    io.recv_packet::<StatusRequestC2s>(version).await?;

    let virtual_host = virtual_host_of(&handshake.server_address);
    let json = status::status_json(&proxy, handshake.protocol_version, Some(&virtual_host));

    io.send_packet(
        &StatusResponseS2c {
            json: json.to_string(),
        },
        version,
    )
    .await?;

    let StatusPingC2s { payload } = io.recv_packet(version).await?;
    io.send_packet(&StatusPongS2c { payload }, version).await?;

    Ok(())
}

/// The hostname the client typed, stripped of the trailing data some
/// launchers (and legacy forwarding) append after a NUL, and of the
/// FML marker.
pub fn virtual_host_of(server_address: &str) -> String {
    let host = server_address.split('\0').next().unwrap_or("");
    host.trim_end_matches(".fml2").trim_end_matches(".fml").to_owned()
}

/// Answers the pre-Netty server list pings. Returns true if the
/// connection was a legacy ping and has been handled.
async fn try_handle_legacy_ping(proxy: &Proxy, stream: &mut TcpStream) -> io::Result<bool> {
    let mut probe = [0u8; 3];
    let mut n = stream.peek(&mut probe).await?;

    if let [0xfe] | [0xfe, 0x01] = &probe[..n] {
        // Either a complete pre-1.6 legacy ping, or the prefix of the
        // 1.6 form (or, pathologically, of a modern handshake) still in
        // flight. Give the rest a moment to arrive before deciding.
        sleep(Duration::from_millis(10)).await;
        n = stream.peek(&mut probe).await?;
    }

    let format = match &probe[..n] {
        [0xfe] => LegacyPingFormat::Pre1_4,
        [0xfe, 0x01] => LegacyPingFormat::Pre1_6,
        [0xfe, 0x01, 0xfa] => LegacyPingFormat::Pre1_7,
        _ => return Ok(false),
    };

    if format == LegacyPingFormat::Pre1_7 {
        // Drain the 1.6 payload; the reply does not depend on it.
        let mut scratch = [0u8; 256];
        let _ = stream.read(&mut scratch).await?;
    }

    let response = status::legacy_ping_response(proxy, format);
    stream.write_all(&response).await?;

    Ok(true)
}

/// Consumes a HAProxy PROXY protocol header if one is present,
/// returning the advertised source address.
async fn read_proxy_protocol(stream: &mut TcpStream) -> anyhow::Result<Option<SocketAddr>> {
    const V2_SIGNATURE: [u8; 12] = [
        0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
    ];

    let mut probe = [0u8; 12];
    let n = stream.peek(&mut probe).await?;

    if n >= 6 && &probe[..6] == b"PROXY " {
        return read_proxy_v1(stream).await.map(Some);
    }

    if n >= 12 && probe == V2_SIGNATURE {
        return read_proxy_v2(stream).await;
    }

    bail!("missing PROXY protocol header")
}

async fn read_proxy_v1(stream: &mut TcpStream) -> anyhow::Result<SocketAddr> {
    // "PROXY TCP4 1.2.3.4 5.6.7.8 1234 5678\r\n", at most 107 bytes.
    let mut line = Vec::with_capacity(107);

    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);

        if byte == b'\n' {
            break;
        }
        anyhow::ensure!(line.len() < 107, "PROXY v1 header too long");
    }

    let text = std::str::from_utf8(&line)?.trim_end();
    let mut parts = text.split(' ');

    anyhow::ensure!(parts.next() == Some("PROXY"), "bad PROXY v1 prefix");

    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => bail!("PROXY v1 UNKNOWN family"),
        other => bail!("bad PROXY v1 family {other:?}"),
    }

    let src_ip: std::net::IpAddr = parts.next().context("missing source IP")?.parse()?;
    let _dst_ip = parts.next().context("missing destination IP")?;
    let src_port: u16 = parts.next().context("missing source port")?.parse()?;

    Ok(SocketAddr::new(src_ip, src_port))
}

async fn read_proxy_v2(stream: &mut TcpStream) -> anyhow::Result<Option<SocketAddr>> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await?;

    let version = header[12] >> 4;
    let command = header[12] & 0x0f;
    let family = header[13] >> 4;
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;

    anyhow::ensure!(version == 2, "bad PROXY v2 version {version}");

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    // LOCAL command: health checks; keep the socket's own address.
    if command == 0 {
        return Ok(None);
    }

    match family {
        // AF_INET
        1 => {
            anyhow::ensure!(body.len() >= 12, "short PROXY v2 IPv4 body");
            let src: [u8; 4] = body[0..4].try_into().unwrap();
            let port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(src.into(), port)))
        }
        // AF_INET6
        2 => {
            anyhow::ensure!(body.len() >= 36, "short PROXY v2 IPv6 body");
            let src: [u8; 16] = body[0..16].try_into().unwrap();
            let port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(src.into(), port)))
        }
        _ => bail!("unsupported PROXY v2 family {family}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_host_strips_forwarding_and_fml() {
        assert_eq!(virtual_host_of("play.example.org"), "play.example.org");
        assert_eq!(
            virtual_host_of("play.example.org\0127.0.0.1\0uuid\0[]"),
            "play.example.org"
        );
        assert_eq!(virtual_host_of("play.example.org.fml"), "play.example.org");
        assert_eq!(virtual_host_of("play.example.org.fml2"), "play.example.org");
    }
}
