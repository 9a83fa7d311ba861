use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lieability_server::session::MIN_PLAYERS;
use lieability_server::{LoggingLauncher, ServerConfig};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

mod client;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

#[derive(Parser)]
#[command(name = "lieability")]
#[command(about = "Lie-Ability lobby server and terminal client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lobby server in this process
    Serve(ServeArgs),
    /// Create a lobby and watch it fill up; type `start` to begin
    Host {
        /// Base URL of the lobby server
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
        /// Number of rounds for the game
        #[arg(short, long, default_value_t = 3)]
        rounds: i64,
    },
    /// Join a lobby by its code and follow the roster
    Join {
        /// Six-character lobby code
        code: String,
        #[arg(short, long)]
        nickname: String,
        #[arg(short, long, default_value = "🎭")]
        avatar: String,
        /// Base URL of the lobby server
        #[arg(short, long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

/// Flags win over the environment, which wins over defaults.
#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Address to bind
    #[arg(long)]
    bind: Option<IpAddr>,
    /// Roster ceiling per lobby
    #[arg(long, value_parser = roster_ceiling)]
    max_players: Option<usize>,
    /// Seconds a disconnected player keeps their seat
    #[arg(long)]
    grace_secs: Option<u64>,
    /// Seconds before an abandoned lobby is retired
    #[arg(long)]
    idle_secs: Option<u64>,
}

impl ServeArgs {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        let lobby = &mut config.coordinator;
        if let Some(max) = self.max_players {
            lobby.max_players = max;
        }
        if let Some(secs) = self.grace_secs {
            lobby.reconnect_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.idle_secs {
            lobby.idle_timeout = Duration::from_secs(secs);
        }
    }
}

// Same floor as LOBBY_MAX_PLAYERS.
fn roster_ceiling(raw: &str) -> Result<usize, String> {
    let max: usize = raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    if max < MIN_PLAYERS {
        return Err(format!("must be at least {MIN_PLAYERS}"));
    }
    Ok(max)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Host { server, rounds } => client::host(&server, rounds).await,
        Commands::Join {
            code,
            nickname,
            avatar,
            server,
        } => client::join(&server, &code, &nickname, &avatar).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::from_env().context("reading configuration from the environment")?;
    args.apply(&mut config);

    let handle = lieability_server::start(config, Arc::new(LoggingLauncher))
        .await
        .context("starting lobby server")?;
    println!("📡 Lobby server on http://{}", handle.addr);

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
