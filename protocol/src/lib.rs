use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default number of rounds when the host does not pick one.
pub const DEFAULT_ROUND_COUNT: u32 = 3;

/// ---- Lobby lifecycle ----
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepting joins.
    Open,
    /// Host pressed start; joins are closed while the hand-off runs.
    Starting,
    /// Control belongs to the gameplay subsystem.
    InProgress,
    /// Terminal. The lobby is gone from the registry.
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open => write!(f, "open"),
            Phase::Starting => write!(f, "starting"),
            Phase::InProgress => write!(f, "in_progress"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// Why a lobby stopped existing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    HostClosed,
    Idle,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HostClosed => write!(f, "host closed the lobby"),
            CloseReason::Idle => write!(f, "lobby was idle"),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// ---- Roster ----
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicPlayer {
    pub id: Uuid,
    pub nickname: String,
    pub avatar: String,
    pub connected: bool,
}

/// ---- HTTP bodies ----
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyRequest {
    #[serde(default)]
    pub round_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLobbyResponse {
    pub code: String,
    pub host_token: String,
}

/// Missing fields deserialize as empty strings so that they are reported as
/// validation failures rather than body-shape rejections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinLobbyRequest {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinLobbyResponse {
    pub player_id: Uuid,
    pub player_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LobbySnapshot {
    pub code: String,
    pub round_count: u32,
    pub phase: Phase,
    pub players: Vec<PublicPlayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable code, e.g. `LOBBY_NOT_FOUND`.
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
}

/// ---- WebSocket frames ----

/// Server-to-client events. Serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full roster snapshot, sent on every roster or presence change.
    LobbyUpdate { players: Vec<PublicPlayer> },
    /// Terminal hand-off: the lobby is now owned by the game.
    #[serde(rename_all = "camelCase")]
    GameStarting {
        round_count: u32,
        players: Vec<PublicPlayer>,
    },
    LobbyClosed { reason: CloseReason },
}

impl ServerEvent {
    pub fn players(&self) -> Option<&[PublicPlayer]> {
        match self {
            ServerEvent::LobbyUpdate { players } | ServerEvent::GameStarting { players, .. } => {
                Some(players)
            }
            ServerEvent::LobbyClosed { .. } => None,
        }
    }
}

/// One outbound frame. `seq` is the lobby's broadcast counter: every
/// broadcast bumps it, a snapshot sent to a single fresh connection repeats
/// the current value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub seq: u64,
    /// Unix milliseconds.
    pub ts: i64,
}

/// Client-to-server messages on the lobby socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Leave the lobby voluntarily.
    Leave,
}
