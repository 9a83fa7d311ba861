//! Request-facing facade over the registry and sessions.
//!
//! Payload shape and credentials are checked here, before anything reaches
//! a session; the session itself only knows about phases and the roster.

use lieability_protocol::{
    CloseReason, CreateLobbyRequest, CreateLobbyResponse, JoinLobbyRequest, JoinLobbyResponse,
    LobbySnapshot,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CoordinatorConfig;
use crate::error::LobbyError;
use crate::hub::{ConnectionId, Outbound, Role};
use crate::launcher::GameLauncher;
use crate::registry::{LobbyRegistry, SharedSession};
use crate::session::LobbyConfig;

pub const MAX_NICKNAME_CHARS: usize = 24;
pub const MAX_AVATAR_CHARS: usize = 64;

/// Display name, trimmed, 1..=24 characters, no control characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nickname(String);

impl Nickname {
    pub fn parse(raw: &str) -> Result<Self, LobbyError> {
        bounded_text(raw, MAX_NICKNAME_CHARS)
            .map(Nickname)
            .ok_or(LobbyError::InvalidNickname {
                max: MAX_NICKNAME_CHARS,
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Nicknames that differ only in case count as the same name.
    pub fn same_as(&self, other: &Nickname) -> bool {
        self.0.to_lowercase() == other.0.to_lowercase()
    }
}

/// Opaque reference to a presentation asset (an emoji, an image key...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar(String);

impl Avatar {
    pub fn parse(raw: &str) -> Result<Self, LobbyError> {
        bounded_text(raw, MAX_AVATAR_CHARS)
            .map(Avatar)
            .ok_or(LobbyError::InvalidAvatar {
                max: MAX_AVATAR_CHARS,
            })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn bounded_text(raw: &str, max: usize) -> Option<String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    let ok = (1..=max).contains(&len) && !trimmed.chars().any(char::is_control);
    ok.then(|| trimmed.to_string())
}

/// Pulls the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer(header: Option<&str>) -> Result<&str, LobbyError> {
    let (scheme, token) = header
        .map(str::trim)
        .and_then(|v| v.split_once(' '))
        .ok_or(LobbyError::Unauthorized)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(LobbyError::Unauthorized);
    }
    Ok(token)
}

/// A connection attached to a lobby. Keeps the session reachable even if
/// the lobby is retired while the socket is still open.
pub struct LobbyConnection {
    pub id: ConnectionId,
    pub role: Role,
    session: SharedSession,
}

impl LobbyConnection {
    /// Transport closed. Safe to call more than once.
    pub fn detach(&self) {
        self.session.lock().detach(self.id);
    }

    /// The player on this connection asked to leave.
    pub fn leave(&self) -> Result<(), LobbyError> {
        match self.role {
            Role::Player(player) => self.session.lock().leave(player),
            Role::Host => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    registry: Arc<LobbyRegistry>,
    config: Arc<CoordinatorConfig>,
    launcher: Arc<dyn GameLauncher>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, launcher: Arc<dyn GameLauncher>) -> Self {
        Self {
            registry: Arc::new(LobbyRegistry::new(&config)),
            config: Arc::new(config),
            launcher,
        }
    }

    /// Starts the idle sweeper and the reconnect-grace reaper.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self
            .registry
            .spawn_sweeper(self.config.sweep_interval, self.config.idle_timeout)];
        tasks.extend(self.registry.spawn_reaper(self.config.reconnect_grace));
        tasks
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<LobbyRegistry> {
        &self.registry
    }

    pub fn create_lobby(&self, req: CreateLobbyRequest) -> Result<CreateLobbyResponse, LobbyError> {
        let config = match req.round_count {
            None => LobbyConfig::default(),
            Some(n) => LobbyConfig {
                round_count: u32::try_from(n)
                    .ok()
                    .and_then(NonZeroU32::new)
                    .ok_or(LobbyError::InvalidRoundCount)?,
            },
        };
        let (code, token) = self.registry.create(config)?;
        Ok(CreateLobbyResponse {
            code: code.to_string(),
            host_token: token.as_str().to_string(),
        })
    }

    pub fn join(&self, code: &str, req: JoinLobbyRequest) -> Result<JoinLobbyResponse, LobbyError> {
        let session = self.registry.lookup(code)?;
        let nickname = Nickname::parse(&req.nickname)?;
        let avatar = Avatar::parse(&req.avatar)?;
        let admission = session.lock().join(nickname, avatar)?;
        Ok(JoinLobbyResponse {
            player_id: admission.player_id,
            player_token: admission.token.as_str().to_string(),
        })
    }

    /// Current lobby state for anyone holding a token of that lobby.
    pub fn snapshot(&self, code: &str, authorization: Option<&str>) -> Result<LobbySnapshot, LobbyError> {
        let token = bearer(authorization)?;
        let session = self.registry.lookup(code)?;
        let session = session.lock();
        session.resolve(token).ok_or(LobbyError::Unauthorized)?;
        Ok(session.snapshot())
    }

    /// Host-only. On success the lobby is `InProgress` and the launcher has
    /// been handed the roster.
    pub fn start(&self, code: &str, authorization: Option<&str>) -> Result<(), LobbyError> {
        let token = bearer(authorization)?;
        let session = self.registry.lookup(code)?;
        let handoff = {
            let mut session = session.lock();
            if !session.is_host(token) {
                tracing::warn!(code = %session.code(), "start refused: not the host credential");
                return Err(LobbyError::Unauthorized);
            }
            session.start()?
        };
        self.launcher.launch(&handoff);
        Ok(())
    }

    /// Player-only voluntary leave.
    pub fn leave(&self, code: &str, authorization: Option<&str>) -> Result<(), LobbyError> {
        let token = bearer(authorization)?;
        let session = self.registry.lookup(code)?;
        let mut session = session.lock();
        match session.resolve(token) {
            Some(Role::Player(player)) => session.leave(player),
            _ => Err(LobbyError::Unauthorized),
        }
    }

    /// Host teardown.
    pub fn close(&self, code: &str, authorization: Option<&str>) -> Result<(), LobbyError> {
        let token = bearer(authorization)?;
        let session = self.registry.lookup(code)?;
        let code = {
            let session = session.lock();
            if !session.is_host(token) {
                return Err(LobbyError::Unauthorized);
            }
            session.code().clone()
        };
        self.registry.retire(&code, CloseReason::HostClosed);
        Ok(())
    }

    /// Checks a socket's `token` query parameter before the upgrade.
    pub fn authorize_connection(&self, code: &str, token: Option<&str>) -> Result<Role, LobbyError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(LobbyError::Unauthorized)?;
        let session = self.registry.lookup(code)?;
        let role = session.lock().resolve(token);
        role.ok_or(LobbyError::Unauthorized)
    }

    /// Registers an upgraded socket with the lobby's hub. Fails if the lobby
    /// or the player disappeared between authorization and upgrade.
    pub fn attach(
        &self,
        code: &str,
        role: Role,
    ) -> Result<(LobbyConnection, mpsc::Receiver<Outbound>), LobbyError> {
        let session = self.registry.lookup(code)?;
        let attached = session.lock().attach(role)?;
        let conn = LobbyConnection {
            id: attached.id,
            role,
            session,
        };
        Ok((conn, attached.rx))
    }

    /// Retires every lobby, telling connected clients the server is going away.
    pub fn shutdown(&self) -> usize {
        let closed = self.registry.drain(CloseReason::Shutdown);
        tracing::info!(closed, "coordinator drained");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::testing::RecordingLauncher;
    use lieability_protocol::{Phase, ServerEvent, ServerFrame};

    struct Harness {
        coordinator: Coordinator,
        launcher: Arc<RecordingLauncher>,
    }

    fn harness() -> Harness {
        let launcher = Arc::new(RecordingLauncher::default());
        let coordinator = Coordinator::new(CoordinatorConfig::default(), launcher.clone());
        Harness {
            coordinator,
            launcher,
        }
    }

    fn create(c: &Coordinator) -> CreateLobbyResponse {
        c.create_lobby(CreateLobbyRequest {
            round_count: Some(3),
        })
        .unwrap()
    }

    fn join(c: &Coordinator, code: &str, nickname: &str) -> JoinLobbyResponse {
        c.join(
            code,
            JoinLobbyRequest {
                nickname: nickname.into(),
                avatar: "🐍".into(),
            },
        )
        .unwrap()
    }

    fn auth(token: &str) -> String {
        format!("Bearer {token}")
    }

    fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Frame(text) = item {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    #[test]
    fn nickname_and_avatar_rules() {
        assert_eq!(Nickname::parse("  Ann ").unwrap().as_str(), "Ann");
        assert!(Nickname::parse("   ").is_err());
        assert!(Nickname::parse(&"x".repeat(25)).is_err());
        assert!(Nickname::parse(&"é".repeat(24)).is_ok());
        assert!(Nickname::parse("bad\nname").is_err());
        assert!(Nickname::parse("Ann").unwrap().same_as(&Nickname::parse("aNN").unwrap()));
        assert!(Avatar::parse("").is_err());
        assert_eq!(Avatar::parse("🐍").unwrap().as_str(), "🐍");
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(bearer(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(bearer(Some("bearer  abc ")).unwrap(), "abc");
        assert_eq!(bearer(None).unwrap_err(), LobbyError::Unauthorized);
        assert_eq!(bearer(Some("Basic abc")).unwrap_err(), LobbyError::Unauthorized);
        assert_eq!(bearer(Some("Bearer")).unwrap_err(), LobbyError::Unauthorized);
        assert_eq!(bearer(Some("Bearer   ")).unwrap_err(), LobbyError::Unauthorized);
    }

    #[test]
    fn round_count_validation() {
        let h = harness();
        let c = &h.coordinator;
        for bad in [0, -1, i64::from(u32::MAX) + 1] {
            assert_eq!(
                c.create_lobby(CreateLobbyRequest {
                    round_count: Some(bad)
                })
                .unwrap_err(),
                LobbyError::InvalidRoundCount
            );
        }
        let lobby = c.create_lobby(CreateLobbyRequest::default()).unwrap();
        let snap = c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert_eq!(snap.round_count, 3);
        assert!(c.registry().len() == 1);
    }

    #[test]
    fn join_validates_after_lookup() {
        let h = harness();
        let c = &h.coordinator;
        let bad = JoinLobbyRequest {
            nickname: "".into(),
            avatar: "".into(),
        };
        assert_eq!(c.join("ZZZZZZ", bad.clone()).unwrap_err(), LobbyError::NotFound);
        let lobby = create(c);
        assert_eq!(
            c.join(&lobby.code, bad).unwrap_err(),
            LobbyError::InvalidNickname {
                max: MAX_NICKNAME_CHARS
            }
        );
    }

    #[test]
    fn happy_path_hands_off_once() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let host = auth(&lobby.host_token);
        let (_watcher, mut rx) = c.attach(&lobby.code, Role::Host).unwrap();

        join(c, &lobby.code, "Ann");
        join(c, &lobby.code, "Bo");
        let seen = frames(&mut rx);
        assert_eq!(seen.len(), 3); // attach snapshot + two joins

        c.start(&lobby.code, Some(&host)).unwrap();
        let launched = h.launcher.launched.lock().clone();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].players.len(), 2);
        assert_eq!(launched[0].round_count, 3);

        let last = frames(&mut rx);
        assert_eq!(last.len(), 1);
        assert!(matches!(last[0].event, ServerEvent::GameStarting { .. }));

        assert_eq!(
            c.start(&lobby.code, Some(&host)).unwrap_err(),
            LobbyError::WrongPhase {
                phase: Phase::InProgress
            }
        );
        assert_eq!(h.launcher.launched.lock().len(), 1);
    }

    #[test]
    fn wrong_credential_changes_nothing() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let ann = join(c, &lobby.code, "Ann");
        join(c, &lobby.code, "Bo");
        let (_watcher, mut rx) = c.attach(&lobby.code, Role::Host).unwrap();
        frames(&mut rx);

        for header in [None, Some("Bearer nope".to_string()), Some(auth(&ann.player_token))] {
            assert_eq!(
                c.start(&lobby.code, header.as_deref()).unwrap_err(),
                LobbyError::Unauthorized
            );
        }
        let snap = c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert_eq!(snap.phase, Phase::Open);
        assert_eq!(snap.players.len(), 2);
        assert!(frames(&mut rx).is_empty());
        assert!(h.launcher.launched.lock().is_empty());
    }

    #[test]
    fn start_with_one_player_is_refused() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        join(c, &lobby.code, "Ann");
        assert_eq!(
            c.start(&lobby.code, Some(&auth(&lobby.host_token))).unwrap_err(),
            LobbyError::NotEnoughPlayers { min: 2, have: 1 }
        );
        let snap = c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert_eq!(snap.phase, Phase::Open);
    }

    #[test]
    fn unknown_lobby_is_not_found_for_a_well_formed_request() {
        let h = harness();
        assert_eq!(
            h.coordinator.start("ZZZZZZ", Some("Bearer x")).unwrap_err(),
            LobbyError::NotFound
        );
        assert_eq!(
            h.coordinator.start("ZZZZZZ", None).unwrap_err(),
            LobbyError::Unauthorized
        );
    }

    #[test]
    fn snapshot_accepts_host_and_player_tokens_only() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let other = create(c);
        let ann = join(c, &lobby.code, "Ann");

        assert!(c.snapshot(&lobby.code, Some(&auth(&ann.player_token))).is_ok());
        assert!(c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).is_ok());
        assert_eq!(
            c.snapshot(&lobby.code, Some(&auth(&other.host_token))).unwrap_err(),
            LobbyError::Unauthorized
        );
    }

    #[test]
    fn authorize_connection_distinguishes_host_and_players() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let ann = join(c, &lobby.code, "Ann");

        assert_eq!(
            c.authorize_connection(&lobby.code, Some(&lobby.host_token)).unwrap(),
            Role::Host
        );
        assert_eq!(
            c.authorize_connection(&lobby.code, Some(&ann.player_token)).unwrap(),
            Role::Player(ann.player_id)
        );
        assert_eq!(
            c.authorize_connection(&lobby.code, None).unwrap_err(),
            LobbyError::Unauthorized
        );
        assert_eq!(
            c.authorize_connection(&lobby.code, Some("")).unwrap_err(),
            LobbyError::Unauthorized
        );
        assert_eq!(
            c.authorize_connection("ZZZZZZ", Some(&ann.player_token)).unwrap_err(),
            LobbyError::NotFound
        );
    }

    #[test]
    fn host_is_an_observer_not_a_roster_entry() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let _host = c.attach(&lobby.code, Role::Host).unwrap();
        let snap = c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert!(snap.players.is_empty());
    }

    #[test]
    fn leave_over_http_and_over_the_socket() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let ann = join(c, &lobby.code, "Ann");
        let bo = join(c, &lobby.code, "Bo");

        assert_eq!(
            c.leave(&lobby.code, Some(&auth(&lobby.host_token))).unwrap_err(),
            LobbyError::Unauthorized
        );
        c.leave(&lobby.code, Some(&auth(&ann.player_token))).unwrap();
        // the token died with the player
        assert_eq!(
            c.leave(&lobby.code, Some(&auth(&ann.player_token))).unwrap_err(),
            LobbyError::Unauthorized
        );

        let (conn, _rx) = c.attach(&lobby.code, Role::Player(bo.player_id)).unwrap();
        conn.leave().unwrap();
        conn.detach();
        let snap = c.snapshot(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert!(snap.players.is_empty());
    }

    #[test]
    fn host_close_retires_and_invalidates() {
        let h = harness();
        let c = &h.coordinator;
        let lobby = create(c);
        let ann = join(c, &lobby.code, "Ann");
        let (watcher, mut rx) = c.attach(&lobby.code, Role::Host).unwrap();
        frames(&mut rx);

        assert_eq!(
            c.close(&lobby.code, Some(&auth(&ann.player_token))).unwrap_err(),
            LobbyError::Unauthorized
        );
        c.close(&lobby.code, Some(&auth(&lobby.host_token))).unwrap();
        assert_eq!(
            c.close(&lobby.code, Some(&auth(&lobby.host_token))).unwrap_err(),
            LobbyError::NotFound
        );
        assert_eq!(
            c.start(&lobby.code, Some(&auth(&lobby.host_token))).unwrap_err(),
            LobbyError::NotFound
        );
        let closing = frames(&mut rx);
        assert_eq!(closing.len(), 1);
        assert!(matches!(closing[0].event, ServerEvent::LobbyClosed { .. }));

        // a socket that outlives its lobby can still detach harmlessly
        watcher.detach();
        watcher.detach();
    }

    #[test]
    fn shutdown_drains_the_registry() {
        let h = harness();
        create(&h.coordinator);
        create(&h.coordinator);
        assert_eq!(h.coordinator.shutdown(), 2);
        assert!(h.coordinator.registry().is_empty());
    }
}
