//! Process-wide table of active lobbies.

use lieability_protocol::CloseReason;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CoordinatorConfig;
use crate::credentials::{LobbyCode, Token};
use crate::error::LobbyError;
use crate::session::{Expiry, LobbyConfig, LobbySession};

pub type SharedSession = Arc<Mutex<LobbySession>>;

/// Fresh codes tried before giving up on a crowded code space.
const MAX_CODE_ATTEMPTS: usize = 64;

pub struct LobbyRegistry {
    lobbies: RwLock<HashMap<LobbyCode, SharedSession>>,
    max_players: usize,
    send_queue: usize,
    reaper_tx: mpsc::UnboundedSender<Expiry>,
    reaper_rx: Mutex<Option<mpsc::UnboundedReceiver<Expiry>>>,
}

impl LobbyRegistry {
    pub fn new(config: &CoordinatorConfig) -> Self {
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        Self {
            lobbies: RwLock::new(HashMap::new()),
            max_players: config.max_players,
            send_queue: config.send_queue,
            reaper_tx,
            reaper_rx: Mutex::new(Some(reaper_rx)),
        }
    }

    pub fn create(&self, config: LobbyConfig) -> Result<(LobbyCode, Token), LobbyError> {
        self.create_with(config, &mut rand::thread_rng())
    }

    pub fn create_with<R: Rng + ?Sized>(
        &self,
        config: LobbyConfig,
        rng: &mut R,
    ) -> Result<(LobbyCode, Token), LobbyError> {
        let mut lobbies = self.lobbies.write();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = LobbyCode::random(rng);
            if lobbies.contains_key(&code) {
                continue;
            }
            let token = Token::generate();
            let session = LobbySession::new(
                code.clone(),
                token.clone(),
                config,
                self.max_players,
                self.send_queue,
                self.reaper_tx.clone(),
            );
            lobbies.insert(code.clone(), Arc::new(Mutex::new(session)));
            tracing::info!(%code, rounds = config.round_count.get(), active = lobbies.len(), "lobby created");
            return Ok((code, token));
        }
        tracing::warn!(active = lobbies.len(), "gave up looking for a free lobby code");
        Err(LobbyError::ResourceExhausted)
    }

    /// Finds a lobby by what the user typed.
    pub fn lookup(&self, code: &str) -> Result<SharedSession, LobbyError> {
        let code = LobbyCode::parse(code).ok_or(LobbyError::NotFound)?;
        self.lobbies
            .read()
            .get(&code)
            .cloned()
            .ok_or(LobbyError::NotFound)
    }

    /// Removes the lobby and closes it. `false` if it was already gone.
    pub fn retire(&self, code: &LobbyCode, reason: CloseReason) -> bool {
        let removed = self.lobbies.write().remove(code);
        match removed {
            Some(session) => session.lock().close(reason),
            None => false,
        }
    }

    /// Retires every lobby that is idle at `now`. The idle check is repeated
    /// under the write lock so a lobby that just got a join survives.
    pub fn sweep_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let candidates: Vec<LobbyCode> = self
            .lobbies
            .read()
            .iter()
            .filter(|(_, s)| s.lock().is_idle(now, idle_timeout))
            .map(|(code, _)| code.clone())
            .collect();

        let mut retired = 0;
        for code in candidates {
            let mut lobbies = self.lobbies.write();
            let still_idle = lobbies
                .get(&code)
                .is_some_and(|s| s.lock().is_idle(now, idle_timeout));
            if !still_idle {
                continue;
            }
            let removed = lobbies.remove(&code);
            drop(lobbies);
            if let Some(session) = removed {
                session.lock().close(CloseReason::Idle);
                retired += 1;
            }
        }
        retired
    }

    /// Applies a grace-period expiry, if the lobby still exists.
    pub fn expire(&self, expiry: &Expiry) -> bool {
        let session = self.lobbies.read().get(&expiry.code).cloned();
        match session {
            Some(session) => session.lock().expire(expiry.player, expiry.epoch),
            None => false,
        }
    }

    /// Retires everything. Used on shutdown.
    pub fn drain(&self, reason: CloseReason) -> usize {
        let all: Vec<SharedSession> = self.lobbies.write().drain().map(|(_, s)| s).collect();
        all.iter().filter(|s| s.lock().close(reason)).count()
    }

    pub fn len(&self) -> usize {
        self.lobbies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lobbies.read().is_empty()
    }

    /// Periodically retires abandoned lobbies. Stops once the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let retired = registry.sweep_idle(Instant::now(), idle_timeout);
                if retired > 0 {
                    tracing::info!(retired, active = registry.len(), "idle lobbies retired");
                }
            }
        })
    }

    /// Turns scheduled expiries into timers of length `grace`. Only the first
    /// call spawns anything.
    pub fn spawn_reaper(self: &Arc<Self>, grace: Duration) -> Option<JoinHandle<()>> {
        let mut rx = self.reaper_rx.lock().take()?;
        let registry = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(expiry) = rx.recv().await {
                let registry = registry.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.expire(&expiry);
                    }
                });
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{Avatar, Nickname};
    use crate::hub::Role;
    use lieability_protocol::Phase;
    use rand::RngCore;

    /// Always yields zero, so every generated code is `AAAAAA`.
    struct StuckRng;

    impl RngCore for StuckRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    fn registry() -> Arc<LobbyRegistry> {
        Arc::new(LobbyRegistry::new(&CoordinatorConfig::default()))
    }

    fn join(session: &SharedSession, name: &str) -> crate::session::Admission {
        session
            .lock()
            .join(Nickname::parse(name).unwrap(), Avatar::parse("x").unwrap())
            .unwrap()
    }

    #[test]
    fn create_then_lookup_is_case_insensitive() {
        let reg = registry();
        let (code, token) = reg.create(LobbyConfig::default()).unwrap();
        let session = reg.lookup(&code.as_str().to_lowercase()).unwrap();
        let session = session.lock();
        assert_eq!(session.code(), &code);
        assert_eq!(session.phase(), Phase::Open);
        assert!(session.players().is_empty());
        assert!(session.is_host(token.as_str()));
    }

    #[test]
    fn unknown_or_malformed_codes_are_not_found() {
        let reg = registry();
        assert!(matches!(reg.lookup("ZZZZZZ"), Err(LobbyError::NotFound)));
        assert!(matches!(reg.lookup("not a code"), Err(LobbyError::NotFound)));
    }

    #[test]
    fn collisions_retry_then_exhaust() {
        let reg = registry();
        let (first, _) = reg.create_with(LobbyConfig::default(), &mut StuckRng).unwrap();
        assert_eq!(first.as_str(), "AAAAAA");
        assert_eq!(
            reg.create_with(LobbyConfig::default(), &mut StuckRng).unwrap_err(),
            LobbyError::ResourceExhausted
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn codes_are_unique_among_active_lobbies() {
        let reg = registry();
        let mut codes: Vec<_> = (0..200)
            .map(|_| reg.create(LobbyConfig::default()).unwrap().0)
            .collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 200);
        assert_eq!(reg.len(), 200);
    }

    #[test]
    fn retire_is_idempotent() {
        let reg = registry();
        let (code, _) = reg.create(LobbyConfig::default()).unwrap();
        let session = reg.lookup(code.as_str()).unwrap();

        assert!(reg.retire(&code, CloseReason::HostClosed));
        assert!(!reg.retire(&code, CloseReason::HostClosed));
        assert!(matches!(reg.lookup(code.as_str()), Err(LobbyError::NotFound)));
        assert_eq!(session.lock().phase(), Phase::Closed);
    }

    #[test]
    fn expire_applies_to_live_lobbies_only() {
        let reg = registry();
        let (code, _) = reg.create(LobbyConfig::default()).unwrap();
        let session = reg.lookup(code.as_str()).unwrap();
        let ann = join(&session, "Ann");
        let expiry = Expiry {
            code: code.clone(),
            player: ann.player_id,
            epoch: 1,
        };
        assert!(reg.expire(&expiry));
        assert!(session.lock().players().is_empty());
        reg.retire(&code, CloseReason::HostClosed);
        assert!(!reg.expire(&expiry));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_retires_only_idle_lobbies() {
        let reg = registry();
        let idle = Duration::from_secs(600);
        let (quiet, _) = reg.create(LobbyConfig::default()).unwrap();
        let (watched, _) = reg.create(LobbyConfig::default()).unwrap();
        let _conn = reg.lookup(watched.as_str()).unwrap().lock().attach(Role::Host).unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(reg.sweep_idle(Instant::now(), idle), 1);
        assert!(reg.lookup(quiet.as_str()).is_err());
        assert!(reg.lookup(watched.as_str()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_on_its_interval() {
        let reg = registry();
        let _task = reg.spawn_sweeper(Duration::from_secs(30), Duration::from_secs(60));
        let (code, _) = reg.create(LobbyConfig::default()).unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(reg.lookup(code.as_str()).is_ok());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(reg.lookup(code.as_str()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_players_who_never_connect() {
        let reg = registry();
        let grace = Duration::from_secs(30);
        assert!(reg.spawn_reaper(grace).is_some());
        assert!(reg.spawn_reaper(grace).is_none());

        let (code, _) = reg.create(LobbyConfig::default()).unwrap();
        let session = reg.lookup(code.as_str()).unwrap();
        join(&session, "Ann");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(session.lock().players().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(session.lock().players().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_spares_players_that_reconnect() {
        let reg = registry();
        reg.spawn_reaper(Duration::from_secs(30));
        let (code, _) = reg.create(LobbyConfig::default()).unwrap();
        let session = reg.lookup(code.as_str()).unwrap();
        let ann = join(&session, "Ann");
        let _conn = session.lock().attach(Role::Player(ann.player_id)).unwrap();

        tokio::time::sleep(Duration::from_secs(40)).await;
        let players = session.lock().players();
        assert_eq!(players.len(), 1);
        assert!(players[0].connected);
    }

    #[test]
    fn drain_closes_everything() {
        let reg = registry();
        for _ in 0..3 {
            reg.create(LobbyConfig::default()).unwrap();
        }
        assert_eq!(reg.drain(CloseReason::Shutdown), 3);
        assert!(reg.is_empty());
    }
}
