//! Lobby coordinator for Lie-Ability: lobby codes, rosters, the start
//! hand-off and live roster updates over WebSocket.

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod launcher;
pub mod registry;
pub mod routes;
pub mod session;
pub mod ws;


use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use config::{CoordinatorConfig, ServerConfig};
pub use coordinator::Coordinator;
pub use error::LobbyError;
pub use launcher::{GameLauncher, LoggingLauncher};

/// A running server. Dropping it leaves the server running until the
/// runtime stops; call [`ServerHandle::shutdown`] to stop it cleanly.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub coordinator: Coordinator,
    stop: oneshot::Sender<()>,
    server: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Closes every lobby (clients get `lobby_closed`), then stops accepting
    /// requests and waits for in-flight ones.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        let _ = self.stop.send(());
        if let Err(err) = self.server.await {
            tracing::warn!(error = %err, "server task ended abnormally");
        }
        for task in self.background {
            task.abort();
        }
    }
}

/// Binds the listener and serves the lobby API in a background task.
pub async fn start(
    config: ServerConfig,
    launcher: Arc<dyn GameLauncher>,
) -> std::io::Result<ServerHandle> {
    let coordinator = Coordinator::new(config.coordinator.clone(), launcher);
    let background = coordinator.spawn_background();

    let state = routes::AppState {
        coordinator: coordinator.clone(),
        version: config.version.as_str().into(),
    };
    let router = routes::build_router(state);

    let listener = tokio::net::TcpListener::bind(config.socket_addr()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, version = %config.version, "lobby server listening");

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "server stopped with an error");
        }
    });

    Ok(ServerHandle {
        addr,
        coordinator,
        stop,
        server,
        background,
    })
}
