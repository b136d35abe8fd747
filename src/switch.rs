//! Kick and failover policy: which backend a player goes to next, and
//! what happens when a backend turns them away.

use gale_protocol::text::TextComponent;

use crate::config::FallbackFilter;
use crate::player::Player;
use crate::Proxy;

/// What to do about a player a backend kicked (or refused).
#[derive(Debug)]
pub enum KickVerb {
    /// Close the client connection with the reason.
    DisconnectPlayer(TextComponent),
    /// Keep the player where they are and tell them why the attempt
    /// failed. Only meaningful when the failure was an *addition*, not
    /// a kick from the server currently hosting them.
    Notify(TextComponent),
    /// Try another backend; `message` is delivered after it succeeds.
    RedirectPlayer {
        server: String,
        message: Option<TextComponent>,
    },
}

/// Computes the ordered candidate list for a player: their virtual
/// host's forced hosts first, then the global try list, minus servers
/// already attempted and the ones they are on or moving to.
pub fn candidate_servers(
    proxy: &Proxy,
    virtual_host: Option<&str>,
    attempted: &[String],
    current: Option<&str>,
    in_flight: Option<&str>,
) -> Vec<String> {
    let config = proxy.config();

    let forced = virtual_host
        .and_then(|host| config.forced_hosts.get(&host.to_lowercase()))
        .cloned()
        .unwrap_or_default();

    let mut order: Vec<String> = vec![];

    for name in forced.iter().chain(config.servers.try_order.iter()) {
        if order.contains(name) {
            continue;
        }
        if attempted.contains(name) {
            continue;
        }
        if current == Some(name.as_str()) || in_flight == Some(name.as_str()) {
            continue;
        }
        if !config.servers.servers.contains_key(name) {
            continue;
        }

        order.push(name.clone());
    }

    order
}

/// Applies the configured fallback filter to an ordered candidate
/// list. `population` supplies fleet-wide player counts; ties keep
/// list order.
pub fn pick_fallback(
    filter: FallbackFilter,
    candidates: &[String],
    population: impl Fn(&str) -> usize,
) -> Option<String> {
    match filter {
        FallbackFilter::FirstAvailable => candidates.first().cloned(),
        FallbackFilter::MostPopulated => candidates
            .iter()
            .max_by_key(|name| (population(name), std::cmp::Reverse(position(candidates, name))))
            .cloned(),
        FallbackFilter::LeastPopulated => candidates
            .iter()
            .min_by_key(|name| (population(name), position(candidates, name)))
            .cloned(),
    }
}

fn position(candidates: &[String], name: &str) -> usize {
    candidates.iter().position(|c| c == name).unwrap_or(0)
}

/// The full no-plugin decision for a kicked or refused player.
///
/// `from_current` is true when the player was kicked off the server
/// hosting them (so staying put is not an option).
pub fn decide(
    proxy: &Proxy,
    player: &Player,
    from_current: bool,
    reason: Option<TextComponent>,
) -> KickVerb {
    let (attempted, current, in_flight) = {
        let state = player.state();
        (
            state.attempted_servers.clone(),
            state.current_server.clone(),
            state.in_flight_server.clone(),
        )
    };

    let candidates = candidate_servers(
        proxy,
        player.virtual_host.as_deref(),
        &attempted,
        current.as_deref(),
        in_flight.as_deref(),
    );

    let filter = proxy.config().servers.dynamic_fallbacks_filter;
    let next = pick_fallback(filter, &candidates, |name| proxy.total_player_count(name));

    match next {
        Some(server) => KickVerb::RedirectPlayer {
            server,
            message: reason.map(|reason| {
                TextComponent::translatable_with(
                    "velocity.error.moved-to-new-server",
                    vec![reason],
                )
            }),
        },
        // The cascade is exhausted; the player gets the generic reason
        // rather than the last backend's.
        None if from_current => KickVerb::DisconnectPlayer(TextComponent::translatable(
            "velocity.error.no-available-servers",
        )),
        None => KickVerb::Notify(reason.unwrap_or_else(|| {
            TextComponent::translatable("velocity.error.cant-connect")
        })),
    }
}

/// The queue-on-shutdown "ban" guard: a kick reason containing any of
/// the configured substrings blocks the automatic re-queue. Matching is
/// byte-wise over the flattened component tree, children included.
pub fn reason_blocks_requeue(reason: &TextComponent, banned_reasons: &[String]) -> bool {
    banned_reasons
        .iter()
        .any(|pattern| reason.contains(pattern))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::Config;

    fn proxy_with(servers: &[&str], try_order: &[&str]) -> Proxy {
        let toml = format!(
            "[servers]\n{}\ntry = [{}]\n",
            servers
                .iter()
                .map(|s| format!("{s} = \"127.0.0.1:1\""))
                .collect::<Vec<_>>()
                .join("\n"),
            try_order
                .iter()
                .map(|s| format!("\"{s}\""))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let config: Config = toml::from_str(&toml).unwrap();
        Proxy::new(config).unwrap()
    }

    #[test]
    fn candidates_skip_attempted_and_current() {
        let proxy = proxy_with(&["lobby", "fallback", "minigames"], &["lobby", "fallback", "minigames"]);

        let candidates = candidate_servers(
            &proxy,
            None,
            &["lobby".into()],
            Some("minigames"),
            None,
        );

        assert_eq!(candidates, vec!["fallback".to_string()]);
    }

    #[test]
    fn forced_hosts_take_precedence() {
        let config: Config = toml::from_str(
            r#"
            [servers]
            lobby = "127.0.0.1:1"
            event = "127.0.0.1:2"
            try = ["lobby"]

            [forced-hosts]
            "event.example.org" = ["event"]
            "#,
        )
        .unwrap();
        let proxy = Proxy::new(config).unwrap();

        let candidates = candidate_servers(&proxy, Some("event.example.org"), &[], None, None);
        assert_eq!(candidates, vec!["event".to_string(), "lobby".to_string()]);

        // Unforced hosts only see the try list.
        let candidates = candidate_servers(&proxy, Some("other.example.org"), &[], None, None);
        assert_eq!(candidates, vec!["lobby".to_string()]);
    }

    #[test]
    fn fallback_filters() {
        let candidates: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let population = |name: &str| match name {
            "a" => 10,
            "b" => 3,
            "c" => 10,
            _ => 0,
        };

        assert_eq!(
            pick_fallback(FallbackFilter::FirstAvailable, &candidates, population),
            Some("a".into())
        );
        // Ties break toward list order.
        assert_eq!(
            pick_fallback(FallbackFilter::MostPopulated, &candidates, population),
            Some("a".into())
        );
        assert_eq!(
            pick_fallback(FallbackFilter::LeastPopulated, &candidates, population),
            Some("b".into())
        );
        assert_eq!(
            pick_fallback(FallbackFilter::FirstAvailable, &[], population),
            None
        );
    }

    #[test]
    fn exhausted_cascade_disconnects_with_generic_reason() {
        use std::sync::Arc;

        use gale_protocol::profile::GameProfile;
        use gale_protocol::version::ProtocolVersion;

        use crate::player::{no_permissions, Player};
        use crate::session::ClientHandle;

        let proxy = proxy_with(&["lobby", "fallback"], &["lobby", "fallback"]);

        let (commands, _rx) = tokio::sync::mpsc::unbounded_channel();
        let player = Arc::new(Player::new(
            GameProfile {
                id: uuid::Uuid::from_u128(1),
                name: "Alice".into(),
                properties: vec![],
            },
            "127.0.0.1:40000".parse().unwrap(),
            None,
            ProtocolVersion::V1_21,
            no_permissions(),
            ClientHandle::detached(ProtocolVersion::V1_21),
            commands,
        ));

        // First kick: redirect to the remaining candidate, carrying the
        // kick reason along.
        player.state().attempted_servers = vec!["lobby".into()];
        match decide(&proxy, &player, true, Some(TextComponent::plain("Server full"))) {
            KickVerb::RedirectPlayer { server, message } => {
                assert_eq!(server, "fallback");
                assert!(message.unwrap().contains("Server full"));
            }
            other => panic!("expected redirect, got {other:?}"),
        }

        // Both candidates burned: the player is disconnected with the
        // generic reason, not the backend's.
        player.state().attempted_servers = vec!["lobby".into(), "fallback".into()];
        match decide(&proxy, &player, true, Some(TextComponent::plain("Server full"))) {
            KickVerb::DisconnectPlayer(reason) => {
                assert!(reason.contains("no-available-servers"));
            }
            other => panic!("expected disconnect, got {other:?}"),
        }

        // The same exhaustion on a mere addition keeps the player where
        // they are.
        match decide(&proxy, &player, false, None) {
            KickVerb::Notify(_) => {}
            other => panic!("expected notify, got {other:?}"),
        }
    }

    #[test]
    fn banned_reason_guard_is_case_sensitive() {
        let banned = vec!["banned".to_string(), "blacklisted".to_string()];

        let kicked = TextComponent::from_json(json!({
            "text": "You are ",
            "extra": [{"text": "banned"}, {"text": " until tomorrow"}]
        }));
        assert!(reason_blocks_requeue(&kicked, &banned));

        // Byte-wise contains: different case does not match.
        let upper = TextComponent::plain("You are BANNED");
        assert!(!reason_blocks_requeue(&upper, &banned));

        let full = TextComponent::plain("Server is full");
        assert!(!reason_blocks_requeue(&full, &banned));

        assert!(!reason_blocks_requeue(&kicked, &[]));
    }
}
