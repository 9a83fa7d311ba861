use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lieability_protocol::{ErrorBody, Phase};

/// Everything a lobby request can be refused with. A refused request never
/// changes lobby state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    #[error("no active lobby with that code")]
    NotFound,
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("not allowed while the lobby is {phase}")]
    WrongPhase { phase: Phase },
    #[error("nickname must be 1 to {max} characters")]
    InvalidNickname { max: usize },
    #[error("avatar must be 1 to {max} characters")]
    InvalidAvatar { max: usize },
    #[error("nickname is already taken in this lobby")]
    NicknameTaken,
    #[error("lobby is full ({max} players)")]
    LobbyFull { max: usize },
    #[error("need at least {min} players to start, have {have}")]
    NotEnoughPlayers { min: usize, have: usize },
    #[error("roundCount must be at least 1")]
    InvalidRoundCount,
    #[error("no free lobby code available")]
    ResourceExhausted,
    #[error("malformed request body: {0}")]
    MalformedBody(String),
}

impl LobbyError {
    pub fn status(&self) -> StatusCode {
        match self {
            LobbyError::NotFound => StatusCode::NOT_FOUND,
            LobbyError::Unauthorized => StatusCode::UNAUTHORIZED,
            LobbyError::InvalidNickname { .. }
            | LobbyError::InvalidAvatar { .. }
            | LobbyError::InvalidRoundCount
            | LobbyError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            LobbyError::WrongPhase { .. }
            | LobbyError::NicknameTaken
            | LobbyError::LobbyFull { .. }
            | LobbyError::NotEnoughPlayers { .. } => StatusCode::CONFLICT,
            LobbyError::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable code for clients to branch on.
    pub fn code(&self) -> &'static str {
        match self {
            LobbyError::NotFound => "LOBBY_NOT_FOUND",
            LobbyError::Unauthorized => "UNAUTHORIZED",
            LobbyError::WrongPhase { .. } => "WRONG_PHASE",
            LobbyError::InvalidNickname { .. } => "INVALID_NICKNAME",
            LobbyError::InvalidAvatar { .. } => "INVALID_AVATAR",
            LobbyError::NicknameTaken => "NAME_TAKEN",
            LobbyError::LobbyFull { .. } => "LOBBY_FULL",
            LobbyError::NotEnoughPlayers { .. } => "NOT_ENOUGH_PLAYERS",
            LobbyError::InvalidRoundCount => "INVALID_ROUND_COUNT",
            LobbyError::ResourceExhausted => "RESOURCE_EXHAUSTED",
            LobbyError::MalformedBody(_) => "INVALID_REQUEST",
        }
    }
}

impl IntoResponse for LobbyError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
