//! Authoritative state of one lobby.
//!
//! A `LobbySession` lives behind its own mutex (see `registry.rs`). Every
//! method runs start to finish under that lock and does at most one roster
//! broadcast per visible change, so connections observe mutations and their
//! broadcasts as one unit and in the same order.

use lieability_protocol::{CloseReason, LobbySnapshot, Phase, PublicPlayer, ServerEvent};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::coordinator::{Avatar, Nickname};
use crate::credentials::{LobbyCode, Token};
use crate::error::LobbyError;
use crate::hub::{Attached, ConnectionHub, ConnectionId, PlayerId, Role, CLOSE_NORMAL};

pub const MIN_PLAYERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobbyConfig {
    pub round_count: NonZeroU32,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            round_count: NonZeroU32::new(lieability_protocol::DEFAULT_ROUND_COUNT)
                .unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// A player with no live connection carries the epoch of the moment it went
/// away; an expiry only applies if that epoch still matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Connected,
    Away { epoch: u64 },
}

struct Player {
    id: PlayerId,
    nickname: Nickname,
    avatar: Avatar,
    token: Token,
    presence: Presence,
}

impl Player {
    fn public(&self) -> PublicPlayer {
        PublicPlayer {
            id: self.id,
            nickname: self.nickname.as_str().to_string(),
            avatar: self.avatar.as_str().to_string(),
            connected: self.presence == Presence::Connected,
        }
    }
}

/// Request to remove `player` once the reconnect grace period has passed,
/// unless it came back in the meantime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub code: LobbyCode,
    pub player: PlayerId,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub player_id: PlayerId,
    pub token: Token,
}

/// What the gameplay subsystem receives when a lobby starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameHandoff {
    pub code: LobbyCode,
    pub round_count: u32,
    pub players: Vec<PublicPlayer>,
}

pub struct LobbySession {
    code: LobbyCode,
    host_token: Token,
    config: LobbyConfig,
    max_players: usize,
    roster: Vec<Player>,
    phase: Phase,
    closed: Option<CloseReason>,
    hub: ConnectionHub,
    presence_epoch: u64,
    last_activity: Instant,
    reaper: mpsc::UnboundedSender<Expiry>,
}

impl LobbySession {
    pub fn new(
        code: LobbyCode,
        host_token: Token,
        config: LobbyConfig,
        max_players: usize,
        send_queue: usize,
        reaper: mpsc::UnboundedSender<Expiry>,
    ) -> Self {
        Self {
            hub: ConnectionHub::new(code.clone(), send_queue),
            code,
            host_token,
            config,
            max_players,
            roster: Vec::new(),
            phase: Phase::Open,
            closed: None,
            presence_epoch: 0,
            last_activity: Instant::now(),
            reaper,
        }
    }

    pub fn code(&self) -> &LobbyCode {
        &self.code
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn round_count(&self) -> u32 {
        self.config.round_count.get()
    }

    pub fn players(&self) -> Vec<PublicPlayer> {
        self.roster.iter().map(Player::public).collect()
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        LobbySnapshot {
            code: self.code.to_string(),
            round_count: self.round_count(),
            phase: self.phase,
            players: self.players(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.hub.len()
    }

    /// Maps a presented token to the role it grants. The host credential is
    /// checked first; player tokens are a separate namespace.
    pub fn resolve(&self, token: &str) -> Option<Role> {
        if self.host_token.matches(token) {
            return Some(Role::Host);
        }
        self.roster
            .iter()
            .find(|p| p.token.matches(token))
            .map(|p| Role::Player(p.id))
    }

    pub fn is_host(&self, token: &str) -> bool {
        self.host_token.matches(token)
    }

    /// No live connections and nothing happened for `idle_timeout`.
    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.hub.is_empty() && now.saturating_duration_since(self.last_activity) >= idle_timeout
    }

    // ==== roster mutations ====

    pub fn join(&mut self, nickname: Nickname, avatar: Avatar) -> Result<Admission, LobbyError> {
        if self.phase != Phase::Open {
            return Err(LobbyError::WrongPhase { phase: self.phase });
        }
        if self.roster.len() >= self.max_players {
            return Err(LobbyError::LobbyFull {
                max: self.max_players,
            });
        }
        if self.roster.iter().any(|p| p.nickname.same_as(&nickname)) {
            return Err(LobbyError::NicknameTaken);
        }

        let id = Uuid::new_v4();
        let token = Token::generate();
        let epoch = self.next_epoch();
        tracing::info!(code = %self.code, player_id = %id, nickname = nickname.as_str(), "player joined");
        self.roster.push(Player {
            id,
            nickname,
            avatar,
            token: token.clone(),
            presence: Presence::Away { epoch },
        });
        self.touch();
        // A player that never opens its socket is reclaimed like one that dropped.
        self.schedule_expiry(id, epoch);
        self.publish(self.roster_event());

        Ok(Admission {
            player_id: id,
            token,
        })
    }

    /// Voluntary leave. Has no effect once the game owns the roster.
    pub fn leave(&mut self, player: PlayerId) -> Result<(), LobbyError> {
        match self.phase {
            Phase::InProgress => return Ok(()),
            Phase::Closed => return Err(LobbyError::WrongPhase { phase: self.phase }),
            Phase::Open | Phase::Starting => {}
        }
        let Some(pos) = self.roster.iter().position(|p| p.id == player) else {
            return Ok(());
        };
        self.roster.remove(pos);
        self.touch();
        tracing::info!(code = %self.code, player_id = %player, "player left");
        self.publish(self.roster_event());
        self.hub.dismiss(player, CLOSE_NORMAL, "left lobby");
        Ok(())
    }

    /// Removes a player whose grace period ran out, if it is still away
    /// since the same epoch.
    pub fn expire(&mut self, player: PlayerId, epoch: u64) -> bool {
        if !matches!(self.phase, Phase::Open | Phase::Starting) {
            return false;
        }
        let Some(pos) = self
            .roster
            .iter()
            .position(|p| p.id == player && p.presence == Presence::Away { epoch })
        else {
            return false;
        };
        self.roster.remove(pos);
        self.touch();
        tracing::info!(code = %self.code, player_id = %player, "player removed after grace period");
        self.publish(self.roster_event());
        true
    }

    // ==== lifecycle ====

    /// `Open -> Starting -> InProgress`, with one terminal `game_starting`
    /// broadcast. The caller has already checked the host credential.
    pub fn start(&mut self) -> Result<GameHandoff, LobbyError> {
        if self.phase != Phase::Open {
            return Err(LobbyError::WrongPhase { phase: self.phase });
        }
        if self.roster.len() < MIN_PLAYERS {
            return Err(LobbyError::NotEnoughPlayers {
                min: MIN_PLAYERS,
                have: self.roster.len(),
            });
        }

        self.phase = Phase::Starting;
        self.touch();
        let handoff = GameHandoff {
            code: self.code.clone(),
            round_count: self.round_count(),
            players: self.players(),
        };
        self.publish(ServerEvent::GameStarting {
            round_count: handoff.round_count,
            players: handoff.players.clone(),
        });
        self.phase = Phase::InProgress;
        tracing::info!(
            code = %self.code,
            players = handoff.players.len(),
            rounds = handoff.round_count,
            "lobby started"
        );
        Ok(handoff)
    }

    /// Moves to `Closed`, tells every connection and closes them. Returns
    /// `false` if the session was already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.phase == Phase::Closed {
            return false;
        }
        self.phase = Phase::Closed;
        self.closed = Some(reason);
        self.hub.broadcast(&ServerEvent::LobbyClosed { reason });
        self.hub.close_all(CLOSE_NORMAL, "lobby closed");
        tracing::info!(code = %self.code, %reason, "lobby closed");
        true
    }

    // ==== connections ====

    pub fn attach(&mut self, role: Role) -> Result<Attached, LobbyError> {
        if self.phase == Phase::Closed {
            return Err(LobbyError::NotFound);
        }
        if let Role::Player(id) = role {
            if !self.roster.iter().any(|p| p.id == id) {
                return Err(LobbyError::Unauthorized);
            }
        }

        let attached = self.hub.attach(role);
        self.touch();

        let came_back = match role {
            Role::Player(id) if self.phase == Phase::Open => self.mark_connected(id),
            _ => false,
        };
        if came_back {
            self.publish(self.roster_event());
        } else {
            let current = self.current_event();
            self.hub.send_to(attached.id, &current);
        }
        Ok(attached)
    }

    /// Transport closed. Idempotent: an unknown or superseded connection is
    /// ignored. The player is not removed here, only marked away.
    pub fn detach(&mut self, id: ConnectionId) -> bool {
        let Some(role) = self.hub.detach(id) else {
            return false;
        };
        self.touch();
        if let (Role::Player(player), Phase::Open) = (role, self.phase) {
            if self.mark_away(player) {
                self.publish(self.roster_event());
            }
        }
        true
    }

    // ==== internals ====

    fn roster_event(&self) -> ServerEvent {
        ServerEvent::LobbyUpdate {
            players: self.players(),
        }
    }

    /// What a freshly attached connection needs to converge.
    fn current_event(&self) -> ServerEvent {
        match self.phase {
            Phase::Open | Phase::Starting => self.roster_event(),
            Phase::InProgress => ServerEvent::GameStarting {
                round_count: self.round_count(),
                players: self.players(),
            },
            Phase::Closed => ServerEvent::LobbyClosed {
                reason: self.closed.unwrap_or(CloseReason::Shutdown),
            },
        }
    }

    /// Broadcasts `event`. Connections the hub had to drop turn their players
    /// away, which is itself a visible change and gets its own broadcast.
    fn publish(&mut self, event: ServerEvent) {
        let mut event = event;
        loop {
            let dropped = self.hub.broadcast(&event);
            if self.phase != Phase::Open {
                break;
            }
            let mut lapsed = false;
            for player in dropped.iter().filter_map(Role::player) {
                lapsed |= self.mark_away(player);
            }
            if !lapsed {
                break;
            }
            event = self.roster_event();
        }
    }

    fn mark_connected(&mut self, player: PlayerId) -> bool {
        match self.roster.iter_mut().find(|p| p.id == player) {
            Some(p) if p.presence != Presence::Connected => {
                p.presence = Presence::Connected;
                true
            }
            _ => false,
        }
    }

    fn mark_away(&mut self, player: PlayerId) -> bool {
        // The player may have reconnected on a newer connection already.
        if self.hub.connection_of(player).is_some() {
            return false;
        }
        let epoch = self.presence_epoch + 1;
        match self.roster.iter_mut().find(|p| p.id == player) {
            Some(p) if p.presence == Presence::Connected => {
                p.presence = Presence::Away { epoch };
            }
            _ => return false,
        }
        self.presence_epoch = epoch;
        self.schedule_expiry(player, epoch);
        true
    }

    fn next_epoch(&mut self) -> u64 {
        self.presence_epoch += 1;
        self.presence_epoch
    }

    fn schedule_expiry(&self, player: PlayerId, epoch: u64) {
        let expiry = Expiry {
            code: self.code.clone(),
            player,
            epoch,
        };
        if self.reaper.send(expiry).is_err() {
            tracing::debug!(code = %self.code, player_id = %player, "reaper not running, expiry skipped");
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
