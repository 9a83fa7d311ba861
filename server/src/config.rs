use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

// ==== knobs ====
pub const DEFAULT_PORT: u16 = 8000;
pub const MAX_PLAYERS: usize = 8; // roster ceiling per lobby
pub const SEND_QUEUE: usize = 64; // frames buffered per connection before it is dropped
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_GRACE: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

/// Tunables for the lobby coordinator. None of them change semantics, only
/// how quickly abandoned state is reclaimed.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_players: usize,
    pub send_queue: usize,
    /// A lobby with no connections and no roster activity for this long is
    /// retired by the sweeper.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long a player may stay disconnected before being removed.
    pub reconnect_grace: Duration,
    pub heartbeat_interval: Duration,
    /// A socket that sends nothing (not even a pong) for this long is closed.
    pub client_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            send_queue: SEND_QUEUE,
            idle_timeout: IDLE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            reconnect_grace: RECONNECT_GRACE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            client_timeout: CLIENT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    /// Reported by `GET /version`.
    pub version: String,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            version: "dev".to_string(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Defaults overlaid with whatever is set in the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = ServerConfig::default();
        if let Some(v) = parsed(&lookup, "BIND_ADDR")? {
            cfg.bind_addr = v;
        }
        if let Some(v) = parsed(&lookup, "PORT")? {
            cfg.port = v;
        }
        if let Some(v) = lookup("GIT_SHA").filter(|v| !v.trim().is_empty()) {
            cfg.version = v;
        }

        let c = &mut cfg.coordinator;
        if let Some(v) = parsed(&lookup, "LOBBY_MAX_PLAYERS")? {
            c.max_players = v;
        }
        if let Some(v) = parsed(&lookup, "LOBBY_SEND_QUEUE")? {
            c.send_queue = v;
        }
        if let Some(v) = secs(&lookup, "LOBBY_IDLE_TIMEOUT_SECS")? {
            c.idle_timeout = v;
        }
        if let Some(v) = secs(&lookup, "LOBBY_SWEEP_INTERVAL_SECS")? {
            c.sweep_interval = v;
        }
        if let Some(v) = secs(&lookup, "LOBBY_RECONNECT_GRACE_SECS")? {
            c.reconnect_grace = v;
        }
        if let Some(v) = secs(&lookup, "LOBBY_HEARTBEAT_SECS")? {
            c.heartbeat_interval = v;
        }
        if let Some(v) = secs(&lookup, "LOBBY_CLIENT_TIMEOUT_SECS")? {
            c.client_timeout = v;
        }

        // A zero-capacity mpsc channel panics on construction.
        if c.send_queue == 0 {
            return Err(ConfigError {
                var: "LOBBY_SEND_QUEUE",
                value: "0".into(),
            });
        }
        if c.max_players < 2 {
            return Err(ConfigError {
                var: "LOBBY_MAX_PLAYERS",
                value: c.max_players.to_string(),
            });
        }
        Ok(cfg)
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}

fn secs<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parsed::<F, u64>(lookup, var)?.map(Duration::from_secs))
}
