//! Live connections of one lobby and ordered fan-out to them.
//!
//! The hub never touches a socket. Each connection is a bounded queue that a
//! dedicated writer task drains (see `ws.rs`), so a broadcast is only a
//! sequence of `try_send`s and cannot stall on a slow client.

use chrono::Utc;
use lieability_protocol::{ServerEvent, ServerFrame};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::credentials::LobbyCode;

pub type PlayerId = Uuid;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_NOT_FOUND: u16 = 4404;
pub const CLOSE_SUPERSEDED: u16 = 4409;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The lobby creator's observer view. Not a roster entry.
    Host,
    Player(PlayerId),
}

impl Role {
    pub fn player(&self) -> Option<PlayerId> {
        match self {
            Role::Player(id) => Some(*id),
            Role::Host => None,
        }
    }
}

/// Items a connection's writer task drains, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-serialized JSON frame, shared by every recipient of a broadcast.
    Frame(Arc<str>),
    /// Send a close frame and stop.
    Close { code: u16, reason: &'static str },
}

struct Connection {
    id: ConnectionId,
    role: Role,
    tx: mpsc::Sender<Outbound>,
}

/// Returned by [`ConnectionHub::attach`]; the receiver belongs to the
/// writer task of the new connection.
pub struct Attached {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<Outbound>,
}

pub struct ConnectionHub {
    code: LobbyCode,
    connections: Vec<Connection>,
    next_id: u64,
    seq: u64,
    queue_capacity: usize,
}

impl ConnectionHub {
    pub fn new(code: LobbyCode, queue_capacity: usize) -> Self {
        Self {
            code,
            connections: Vec::new(),
            next_id: 1,
            seq: 0,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a connection. A player keeps at most one live connection:
    /// an older one is told it was superseded and removed before the new
    /// one is added.
    pub fn attach(&mut self, role: Role) -> Attached {
        let superseded = match role {
            Role::Player(player) => self.dismiss(player, CLOSE_SUPERSEDED, "superseded"),
            Role::Host => None,
        };

        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.connections.push(Connection { id, role, tx });

        tracing::debug!(code = %self.code, conn = %id, ?role, ?superseded, "connection attached");
        Attached { id, rx }
    }

    /// Forgets a connection. Returns its role the first time, `None` after.
    pub fn detach(&mut self, id: ConnectionId) -> Option<Role> {
        let pos = self.connections.iter().position(|c| c.id == id)?;
        let conn = self.connections.remove(pos);
        tracing::debug!(code = %self.code, conn = %id, role = ?conn.role, "connection detached");
        Some(conn.role)
    }

    /// Closes and removes the live connection of `player`, if any.
    pub fn dismiss(&mut self, player: PlayerId, code: u16, reason: &'static str) -> Option<ConnectionId> {
        let pos = self
            .connections
            .iter()
            .position(|c| c.role == Role::Player(player))?;
        let conn = self.connections.remove(pos);
        // If the queue is full the close frame is lost; dropping the sender
        // still ends the writer once it has drained.
        let _ = conn.tx.try_send(Outbound::Close { code, reason });
        Some(conn.id)
    }

    /// Delivers `event` to every attached connection in the order broadcasts
    /// are issued. Connections whose queue is full or gone are removed; their
    /// roles are returned so the caller can account for them.
    pub fn broadcast(&mut self, event: &ServerEvent) -> Vec<Role> {
        self.seq += 1;
        let Some(text) = encode(event, self.seq) else {
            return Vec::new();
        };

        let mut dropped = Vec::new();
        let code = &self.code;
        self.connections.retain(|conn| match conn.tx.try_send(Outbound::Frame(text.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(code = %code, conn = %conn.id, "send queue full, dropping connection");
                dropped.push(conn.role);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(code = %code, conn = %conn.id, "writer gone, dropping connection");
                dropped.push(conn.role);
                false
            }
        });

        tracing::debug!(
            code = %self.code,
            seq = self.seq,
            recipients = self.connections.len(),
            dropped = dropped.len(),
            "broadcast"
        );
        dropped
    }

    /// Sends `event` to one connection without advancing the sequence, so a
    /// fresh connection can catch up on the current state. Returns the role
    /// if the connection had to be dropped.
    pub fn send_to(&mut self, id: ConnectionId, event: &ServerEvent) -> Option<Role> {
        let text = encode(event, self.seq)?;
        let pos = self.connections.iter().position(|c| c.id == id)?;
        if self.connections[pos].tx.try_send(Outbound::Frame(text)).is_ok() {
            return None;
        }
        let conn = self.connections.remove(pos);
        tracing::warn!(code = %self.code, conn = %id, "could not deliver snapshot, dropping connection");
        Some(conn.role)
    }

    /// Closes every connection. Used when the lobby is retired.
    pub fn close_all(&mut self, code: u16, reason: &'static str) {
        for conn in self.connections.drain(..) {
            let _ = conn.tx.try_send(Outbound::Close { code, reason });
        }
    }

    pub fn connection_of(&self, player: PlayerId) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|c| c.role == Role::Player(player))
            .map(|c| c.id)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn encode(event: &ServerEvent, seq: u64) -> Option<Arc<str>> {
    let frame = ServerFrame {
        event: event.clone(),
        seq,
        ts: Utc::now().timestamp_millis(),
    };
    match serde_json::to_string(&frame) {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            tracing::error!(%err, seq, "failed to encode frame");
            None
        }
    }
}
