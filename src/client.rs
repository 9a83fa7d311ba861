//! Terminal client: `host` creates and watches a lobby, `join` takes a seat.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use lieability_protocol::{
    ClientMessage, CreateLobbyRequest, CreateLobbyResponse, ErrorBody, JoinLobbyRequest,
    JoinLobbyResponse, PublicPlayer, ServerEvent, ServerFrame,
};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub async fn host(server: &str, rounds: i64) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{server}/api/v1/lobbies"))
        .json(&CreateLobbyRequest {
            round_count: Some(rounds),
        })
        .send()
        .await
        .context("creating lobby")?;
    let lobby: CreateLobbyResponse = decode(resp).await?;

    println!("🎲 Lobby {} is open ({} rounds)", lobby.code, rounds);
    println!("   players join with: lieability join {} --nickname <name>", lobby.code);

    let (ws_stream, _) = connect_async(ws_url(server, &lobby.code, &lobby.host_token)).await?;
    let (_write, read) = ws_stream.split();
    let mut watcher = tokio::spawn(watch(read));

    println!("\n📋 Commands: start, close, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let lobby_url = format!("{server}/api/v1/lobbies/{}", lobby.code);

    loop {
        tokio::select! {
            _ = &mut watcher => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "start" => {
                        let resp = http
                            .post(format!("{lobby_url}/start"))
                            .bearer_auth(&lobby.host_token)
                            .send()
                            .await?;
                        if let Err(e) = expect_empty(resp).await {
                            println!("❌ {e}");
                        }
                    }
                    "close" => {
                        let resp = http
                            .delete(&lobby_url)
                            .bearer_auth(&lobby.host_token)
                            .send()
                            .await?;
                        if let Err(e) = expect_empty(resp).await {
                            println!("❌ {e}");
                        }
                    }
                    "quit" => break,
                    "" => {}
                    other => println!("❓ Unknown command: {other}"),
                }
            }
        }
    }

    println!("👋 Goodbye!");
    Ok(())
}

pub async fn join(server: &str, code: &str, nickname: &str, avatar: &str) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{server}/api/v1/lobbies/{code}/join"))
        .json(&JoinLobbyRequest {
            nickname: nickname.to_string(),
            avatar: avatar.to_string(),
        })
        .send()
        .await
        .context("joining lobby")?;
    let seat: JoinLobbyResponse = decode(resp).await?;
    println!("✅ Joined lobby {code} as {nickname} ({})", seat.player_id);

    let (ws_stream, _) = connect_async(ws_url(server, code, &seat.player_token)).await?;
    let (mut write, read) = ws_stream.split();
    let mut watcher = tokio::spawn(watch(read));

    println!("\n📋 Commands: leave, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = &mut watcher => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "leave" => {
                        let json = serde_json::to_string(&ClientMessage::Leave)?;
                        write.send(Message::Text(json)).await?;
                    }
                    "quit" => break,
                    "" => {}
                    other => println!("❓ Unknown command: {other}"),
                }
            }
        }
    }

    println!("👋 Goodbye!");
    Ok(())
}

/// Prints frames until the lobby hands off, closes or the socket ends.
async fn watch<S>(mut read: S)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) else {
                    continue;
                };
                if !print_event(&frame.event) {
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                match frame {
                    Some(f) => println!("🔌 Connection closed: {}", f.reason),
                    None => println!("🔌 Connection closed by server"),
                }
                break;
            }
            Err(e) => {
                println!("❌ WebSocket error: {e}");
                break;
            }
            _ => {}
        }
    }
}

/// Returns `false` once nothing more will happen in this lobby.
fn print_event(event: &ServerEvent) -> bool {
    match event {
        ServerEvent::LobbyUpdate { players } => {
            print_roster(players);
            true
        }
        ServerEvent::GameStarting {
            round_count,
            players,
        } => {
            println!("\n🚀 Game starting: {round_count} rounds");
            print_roster(players);
            false
        }
        ServerEvent::LobbyClosed { reason } => {
            println!("\n🚪 Lobby closed ({reason})");
            false
        }
    }
}

fn print_roster(players: &[PublicPlayer]) {
    println!("\n👥 Players ({}):", players.len());
    for (i, player) in players.iter().enumerate() {
        let status = if player.connected { "" } else { " [AWAY]" };
        println!("  {}: {} {}{}", i + 1, player.avatar, player.nickname, status);
    }
}

fn ws_url(server: &str, code: &str, token: &str) -> String {
    let base = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server.to_string()
    };
    format!("{base}/ws/lobbies/{code}?token={token}")
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> anyhow::Result<T> {
    if resp.status().is_success() {
        return Ok(resp.json().await?);
    }
    Err(refusal(resp).await)
}

async fn expect_empty(resp: reqwest::Response) -> anyhow::Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(refusal(resp).await)
}

async fn refusal(resp: reqwest::Response) -> anyhow::Error {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => anyhow::anyhow!("{} ({}): {}", body.error, status, body.message),
        Err(_) => anyhow::anyhow!("server answered {status}"),
    }
}
