use crate::session::GameHandoff;

/// Receives a lobby once it reaches `InProgress`. What happens in the rounds
/// is the implementor's business.
pub trait GameLauncher: Send + Sync {
    fn launch(&self, handoff: &GameHandoff);
}

/// Default launcher: records the hand-off and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLauncher;

impl GameLauncher for LoggingLauncher {
    fn launch(&self, handoff: &GameHandoff) {
        let names: Vec<&str> = handoff.players.iter().map(|p| p.nickname.as_str()).collect();
        tracing::info!(
            code = %handoff.code,
            rounds = handoff.round_count,
            players = ?names,
            "handing lobby to gameplay"
        );
    }
}
