//! Handles the log-in process for new client connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use gale_protocol::packets::{
    EncryptionRequestS2c, EncryptionResponseC2s, HandshakeC2s, LoginAcknowledgedC2s,
    LoginDisconnectS2c, LoginStartC2s, LoginSuccessS2c, SetCompressionS2c,
};
use gale_protocol::profile::GameProfile;
use gale_protocol::text::TextComponent;
use gale_protocol::version::ProtocolVersion;
use gale_protocol::CompressionThreshold;
use md5::{Digest as _, Md5};
use num_bigint::BigInt;
use rsa::Pkcs1v15Encrypt;
use sha1::Sha1;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::listener::virtual_host_of;
use crate::packet_io::PacketIo;
use crate::player::{no_permissions, DuplicateLogin, Player};
use crate::session::{self, ClientHandle};
use crate::{session::ConnectionPhase, Proxy};

/// Usernames are 1-16 word characters; anything else never came from a
/// real client.
pub fn is_valid_username(name: &str) -> bool {
    (1..=16).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Derives the offline-mode uuid the way the game always has: a v3
/// uuid over `OfflinePlayer:<name>` with no namespace.
pub fn offline_uuid(username: &str) -> Uuid {
    let mut digest: [u8; 16] = Md5::digest(format!("OfflinePlayer:{username}")).into();

    digest[6] = (digest[6] & 0x0f) | 0x30; // version 3
    digest[8] = (digest[8] & 0x3f) | 0x80; // IETF variant

    Uuid::from_bytes(digest)
}

/// The hex digest the session service expects: sha1 interpreted as a
/// signed big-endian integer.
fn auth_digest(hash: &[u8]) -> String {
    BigInt::from_signed_bytes_be(hash).to_str_radix(16)
}

async fn disconnect(
    io: &mut PacketIo,
    version: ProtocolVersion,
    reason: TextComponent,
) -> anyhow::Result<()> {
    io.send_packet(&LoginDisconnectS2c { reason }, version).await
}

/// Runs the login sequence for one client. On success the connection
/// becomes a player session, which this call then drives to its end.
pub async fn handle_login(
    proxy: Proxy,
    mut io: PacketIo,
    remote_addr: SocketAddr,
    handshake: HandshakeC2s,
) -> anyhow::Result<()> {
    let Some(version) = ProtocolVersion::from_number(handshake.protocol_version) else {
        debug!(
            %remote_addr,
            protocol = handshake.protocol_version,
            "unsupported client version"
        );

        // The login disconnect id predates every version split, so the
        // newest catalog entry is safe for the reply.
        return disconnect(
            &mut io,
            ProtocolVersion::MAXIMUM,
            TextComponent::translatable("multiplayer.disconnect.outdated_client"),
        )
        .await;
    };

    let login_start: LoginStartC2s = io.recv_packet(version).await?;
    ensure!(is_valid_username(&login_start.username), "invalid username");

    if !proxy.check_login_rate(remote_addr.ip()) {
        return disconnect(
            &mut io,
            version,
            TextComponent::plain("You are logging in too fast, try again later."),
        )
        .await;
    }

    let username = login_start.username.clone();

    let profile = if proxy.config().online_mode {
        match login_online(&proxy, &mut io, remote_addr, version, username).await? {
            Some(profile) => profile,
            None => return Ok(()), // already disconnected with a reason
        }
    } else {
        GameProfile {
            id: offline_uuid(&username),
            name: username,
            properties: vec![],
        }
    };

    // The duplicate-login policy settles before anything further is
    // promised to the client.
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let client = ClientHandle::new(version, ConnectionPhase::Login);

    let player = Arc::new(Player::new(
        profile,
        remote_addr,
        Some(virtual_host_of(&handshake.server_address)),
        version,
        no_permissions(),
        client,
        command_tx,
    ));

    if !register_with_dup_policy(&proxy, player.clone()).await {
        io.send_packet(
            &LoginDisconnectS2c {
                reason: TextComponent::translatable("velocity.error.already-connected"),
            },
            version,
        )
        .await?;
        return Ok(());
    }

    // The player is registered from here on; every exit path below
    // must run the teardown block.
    let result = finish_login(&proxy, io, player.clone(), command_rx).await;

    proxy.players().unregister(&player);

    if let Some(fleet) = proxy.fleet() {
        fleet.announce_leave(&player).await;
    }

    proxy
        .queues()
        .remove_everywhere(&proxy, player.uuid)
        .await;

    player.complete_teardown();

    info!(username = %player.username, "player disconnected");

    result
}

/// Completes the wire login (compression, success, ack) and hands the
/// connection to its session. The caller owns registration cleanup.
async fn finish_login(
    proxy: &Proxy,
    mut io: PacketIo,
    player: Arc<Player>,
    command_rx: mpsc::UnboundedReceiver<crate::player::PlayerCommand>,
) -> anyhow::Result<()> {
    let version = player.version;
    let (threshold, level) = {
        let config = proxy.config();
        (config.compression_threshold, config.compression_level)
    };

    if threshold >= 0 {
        io.send_packet(&SetCompressionS2c { threshold }, version).await?;
        io.set_compression(CompressionThreshold(threshold));

        if level >= 0 {
            io.set_compression_level(level as u32);
        }
    }

    io.send_packet(
        &LoginSuccessS2c {
            profile: player.profile.clone(),
        },
        version,
    )
    .await?;

    if version.has_config_state() {
        io.recv_packet::<LoginAcknowledgedC2s>(version).await?;
        player.client.set_phase(ConnectionPhase::Config);
    } else {
        player.client.set_phase(ConnectionPhase::Play);
    }

    info!(
        username = %player.username,
        uuid = %player.uuid,
        remote_addr = %player.remote_addr,
        "player logged in"
    );

    if let Some(fleet) = proxy.fleet() {
        fleet.announce_join(proxy, &player).await;
    }

    session::run(proxy.clone(), player, io, command_rx).await
}

/// Registers the player, applying the duplicate-login policy. Returns
/// false when the new connection must be rejected.
async fn register_with_dup_policy(proxy: &Proxy, player: Arc<Player>) -> bool {
    loop {
        match proxy.players().register(player.clone()) {
            Ok(()) => return true,
            Err(duplicate) => {
                if !proxy.config().kick_existing_players {
                    return false;
                }

                let existing = match &duplicate {
                    DuplicateLogin::Uuid(uuid) => proxy.players().by_uuid(*uuid),
                    DuplicateLogin::Username(name) => proxy.players().by_name(name),
                };

                let Some(existing) = existing else {
                    // Lost the race with the old session's teardown.
                    continue;
                };

                existing.kick(TextComponent::translatable(
                    "multiplayer.disconnect.duplicate_login",
                ));

                // Bounded wait: a wedged old session must not hold the
                // identity hostage.
                let _ = tokio::time::timeout(
                    Duration::from_secs(5),
                    existing.wait_for_teardown(),
                )
                .await;

                proxy.players().unregister(&existing);
            }
        }
    }
}

/// Online-mode authentication: the encryption handshake plus the
/// session service query. Returns `None` after sending the client a
/// disconnect reason.
async fn login_online(
    proxy: &Proxy,
    io: &mut PacketIo,
    remote_addr: SocketAddr,
    version: ProtocolVersion,
    username: String,
) -> anyhow::Result<Option<GameProfile>> {
    let verify_token: [u8; 4] = rand::random();

    io.send_packet(
        &EncryptionRequestS2c {
            server_id: String::new(), // always empty since 1.7
            public_key: proxy.inner().public_key_der.to_vec(),
            verify_token: verify_token.to_vec(),
        },
        version,
    )
    .await?;

    let response: EncryptionResponseC2s = io.recv_packet(version).await?;

    let Some(encrypted_token) = response.verify_token else {
        // The salted-signature alternative needs a player key we never
        // issued; a client that sends it is not talking to us.
        bail!("encryption response used a signature without a negotiated key");
    };

    let decrypted_token = proxy
        .inner()
        .rsa_key
        .decrypt(Pkcs1v15Encrypt, &encrypted_token)
        .context("failed to decrypt verify token")?;

    ensure!(
        decrypted_token == verify_token,
        "verify tokens do not match"
    );

    let shared_secret = proxy
        .inner()
        .rsa_key
        .decrypt(Pkcs1v15Encrypt, &response.shared_secret)
        .context("failed to decrypt shared secret")?;

    let key: [u8; 16] = shared_secret
        .as_slice()
        .try_into()
        .context("shared secret has the wrong length")?;

    io.enable_encryption(&key);

    let hash = Sha1::new()
        .chain_update(&shared_secret)
        .chain_update(&proxy.inner().public_key_der)
        .finalize();

    let server_id = auth_digest(&hash);

    let url = if proxy.config().prevent_client_proxy_connections {
        format!(
            "https://sessionserver.mojang.com/session/minecraft/hasJoined?username={username}&serverId={server_id}&ip={}",
            remote_addr.ip()
        )
    } else {
        format!(
            "https://sessionserver.mojang.com/session/minecraft/hasJoined?username={username}&serverId={server_id}"
        )
    };

    let response = proxy
        .inner()
        .http_client
        .get(url)
        .send()
        .await
        .context("session service request failed")?;

    match response.status() {
        reqwest::StatusCode::OK => {}
        reqwest::StatusCode::NO_CONTENT => {
            disconnect(
                io,
                version,
                TextComponent::translatable("multiplayer.disconnect.unverified_username"),
            )
            .await?;
            return Ok(None);
        }
        status => bail!("session service answered with status {status}"),
    }

    let profile: GameProfile = response
        .json()
        .await
        .context("parsing session service profile")?;

    ensure!(
        is_valid_username(&profile.name),
        "session service returned an invalid username"
    );
    ensure!(
        profile.name.eq_ignore_ascii_case(&username),
        "session service returned a different username"
    );

    Ok(Some(profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_validation() {
        assert!(is_valid_username("Alice"));
        assert!(is_valid_username("a_b_c_123"));
        assert!(is_valid_username("A"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("seventeen_chars__"));
        assert!(!is_valid_username("bad name"));
        assert!(!is_valid_username("bad-name"));
    }

    #[test]
    fn offline_uuid_matches_the_game() {
        // Known value: the JDK's nameUUIDFromBytes over
        // "OfflinePlayer:Notch".
        assert_eq!(
            offline_uuid("Notch").to_string(),
            "b50ad385-829d-3141-a216-7e7d7539ba7f"
        );

        let uuid = offline_uuid("Alice");
        assert_eq!(uuid.get_version_num(), 3);
    }

    #[test]
    fn auth_digest_known_values() {
        assert_eq!(
            auth_digest(&Sha1::digest("Notch")),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            auth_digest(&Sha1::digest("jeb_")),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
        assert_eq!(
            auth_digest(&Sha1::digest("simon")),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }
}
