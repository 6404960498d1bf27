//! Per-connection state machine and connection bookkeeping
//!
//! Every client moves through the same phases, in order:
//!
//! ```text
//! AwaitingReliableHandshake -> AwaitingAuthentication
//!     -> AwaitingRealtimeVerification -> Synchronized -> Disconnected
//! ```
//!
//! Each waiting phase has a timeout. A connection proves it owns its
//! real-time endpoint by echoing, over that channel, the one-time token it
//! was handed on the reliable channel; only then is its real-time address
//! trusted and its input allowed to reach the game.
//!
//! The manager itself never touches sockets. Each connection carries a
//! [`Link`] to its reliable writer task, plus a [`Liveness`] flag that the
//! authority checks before applying anything the connection queued.

use log::{info, warn};
use rand::Rng;
use shared::{ConnectionId, NetworkMessage, VerificationToken, PROTOCOL_VERSION, TOKEN_LEN};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use crate::auth::{self, Authenticator};
use crate::authority::{Liveness, Recipients};
use crate::config::{PhaseTimeouts, ServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    AwaitingReliableHandshake,
    AwaitingAuthentication,
    AwaitingRealtimeVerification,
    Synchronized,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("protocol version {received} not supported (server speaks {expected})")]
    VersionMismatch { expected: u16, received: u16 },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("server full")]
    ServerFull,

    #[error("verification token mismatch")]
    TokenMismatch,

    #[error("event not expected while {0:?}")]
    UnexpectedEvent(ConnectionPhase),

    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("timed out while {phase:?}")]
    Timeout { phase: ConnectionPhase },
}

/// Handle on a connection's reliable writer task.
#[derive(Debug, Clone)]
pub struct Link {
    outbound: mpsc::Sender<NetworkMessage>,
    closed: Arc<Notify>,
}

impl Link {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NetworkMessage>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                outbound,
                closed: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Queues a message for the writer without waiting. A full buffer means
    /// the peer is not keeping up.
    pub fn send(&self, message: NetworkMessage) -> Result<(), TrySendError<NetworkMessage>> {
        self.outbound.try_send(message)
    }

    /// Tells the reader task to stop.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`Link::close`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

/// Server-side view of one client.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub phase: ConnectionPhase,
    pub reliable_peer: SocketAddr,
    /// Set once the real-time endpoint has been verified
    pub realtime_peer: Option<SocketAddr>,
    token: Option<VerificationToken>,
    /// Highest real-time sequence number seen from this connection
    pub last_realtime_sequence: Option<u32>,
    pub phase_entered: Instant,
    /// Last time anything arrived on the reliable channel
    pub last_seen: Instant,
    pub violations: u32,
    pub liveness: Liveness,
    pub link: Link,
}

impl Connection {
    pub fn new(id: ConnectionId, reliable_peer: SocketAddr, link: Link) -> Self {
        let now = Instant::now();
        Self {
            id,
            phase: ConnectionPhase::AwaitingReliableHandshake,
            reliable_peer,
            realtime_peer: None,
            token: None,
            last_realtime_sequence: None,
            phase_entered: now,
            last_seen: now,
            violations: 0,
            liveness: Liveness::new(),
            link,
        }
    }

    fn enter(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
        self.phase_entered = Instant::now();
    }

    /// Whether this connection has outstayed its current phase at `now`.
    pub fn is_timed_out(&self, timeouts: &PhaseTimeouts, now: Instant) -> bool {
        let Some(limit) = timeouts.for_phase(self.phase) else {
            return false;
        };
        // Once synchronized, silence is measured from the last message.
        let since = if self.phase == ConnectionPhase::Synchronized {
            self.last_seen.max(self.phase_entered)
        } else {
            self.phase_entered
        };
        now.saturating_duration_since(since) > limit
    }

    fn expect(&self, phase: ConnectionPhase) -> Result<(), ConnectionError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(ConnectionError::UnexpectedEvent(self.phase))
        }
    }
}

/// Owns every live connection and drives their phase transitions.
pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    by_realtime_addr: HashMap<SocketAddr, ConnectionId>,
    next_id: ConnectionId,
    max_connections: usize,
    timeouts: PhaseTimeouts,
    violation_limit: u32,
    authenticator: Box<dyn Authenticator>,
}

impl ConnectionManager {
    pub fn new(
        max_connections: usize,
        timeouts: PhaseTimeouts,
        violation_limit: u32,
        authenticator: Box<dyn Authenticator>,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            by_realtime_addr: HashMap::new(),
            next_id: 1,
            max_connections,
            timeouts,
            violation_limit,
            authenticator,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.max_connections,
            config.timeouts,
            config.violation_limit,
            auth::from_credentials(&config.credentials),
        )
    }

    /// Registers a freshly accepted reliable connection.
    ///
    /// Capacity is not checked here; it is enforced at authentication so the
    /// client can be told why it was refused.
    pub fn add_connection(&mut self, reliable_peer: SocketAddr, link: Link) -> ConnectionId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        info!("Connection {} opened from {}", id, reliable_peer);
        self.connections
            .insert(id, Connection::new(id, reliable_peer, link));
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn phase(&self, id: ConnectionId) -> Option<ConnectionPhase> {
        self.connections.get(&id).map(|c| c.phase)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, ConnectionError> {
        self.connections
            .get_mut(&id)
            .ok_or(ConnectionError::NotFound(id))
    }

    /// Checks the client's protocol version.
    pub fn handshake(&mut self, id: ConnectionId, protocol_version: u16) -> Result<(), ConnectionError> {
        let connection = self.connection_mut(id)?;
        connection.expect(ConnectionPhase::AwaitingReliableHandshake)?;

        if protocol_version != PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                received: protocol_version,
            });
        }

        connection.enter(ConnectionPhase::AwaitingAuthentication);
        Ok(())
    }

    /// Checks credentials and capacity, then issues a verification token.
    pub fn authenticate(
        &mut self,
        id: ConnectionId,
        credentials: &[u8],
    ) -> Result<VerificationToken, ConnectionError> {
        let admitted = self
            .connections
            .values()
            .filter(|c| {
                matches!(
                    c.phase,
                    ConnectionPhase::AwaitingRealtimeVerification | ConnectionPhase::Synchronized
                )
            })
            .count();
        let full = admitted >= self.max_connections;
        let accepted = self.authenticator.authenticate(credentials);

        let connection = self.connection_mut(id)?;
        connection.expect(ConnectionPhase::AwaitingAuthentication)?;

        if !accepted {
            return Err(ConnectionError::InvalidCredentials);
        }
        if full {
            return Err(ConnectionError::ServerFull);
        }

        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill(&mut bytes);
        let token = VerificationToken(bytes);

        connection.token = Some(token);
        connection.enter(ConnectionPhase::AwaitingRealtimeVerification);
        Ok(token)
    }

    /// Checks a token echoed from `addr` on the real-time channel.
    ///
    /// Returns `Ok(true)` when this echo synchronized the connection and
    /// `Ok(false)` for a repeat echo from the already verified address.
    pub fn verify(
        &mut self,
        id: ConnectionId,
        claimed: ConnectionId,
        token: &VerificationToken,
        addr: SocketAddr,
    ) -> Result<bool, ConnectionError> {
        let connection = self.connection_mut(id)?;

        if connection.phase == ConnectionPhase::Synchronized && connection.realtime_peer == Some(addr) {
            return Ok(false);
        }
        connection.expect(ConnectionPhase::AwaitingRealtimeVerification)?;

        let valid = claimed == id && connection.token.is_some_and(|issued| issued.matches(token));
        if !valid {
            return Err(ConnectionError::TokenMismatch);
        }

        // Single use.
        connection.token = None;
        connection.realtime_peer = Some(addr);
        connection.enter(ConnectionPhase::Synchronized);
        connection.last_seen = Instant::now();

        if let Some(previous) = self.by_realtime_addr.insert(addr, id) {
            warn!(
                "Real-time address {} moved from connection {} to {}",
                addr, previous, id
            );
            if let Some(stale) = self.connections.get_mut(&previous) {
                stale.realtime_peer = None;
            }
        }
        info!("Connection {} synchronized, real-time peer {}", id, addr);
        Ok(true)
    }

    /// Records reliable-channel activity.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Counts a protocol violation. Returns true once the limit is reached.
    pub fn record_violation(&mut self, id: ConnectionId) -> bool {
        let limit = self.violation_limit;
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.violations += 1;
                connection.violations >= limit
            }
            None => false,
        }
    }

    /// Drops real-time sequence numbers that are not newer than the last one
    /// seen. The authority repeats this check against what it applied.
    pub fn accept_realtime_sequence(&mut self, id: ConnectionId, sequence: u32) -> bool {
        let Some(connection) = self.connections.get_mut(&id) else {
            return false;
        };
        match connection.last_realtime_sequence {
            Some(last) if sequence <= last => false,
            _ => {
                connection.last_realtime_sequence = Some(sequence);
                true
            }
        }
    }

    /// Removes a connection, cancels whatever it still has queued and stops
    /// its reader. Returns `None` if it was already gone.
    pub fn disconnect(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut connection = self.connections.remove(&id)?;
        if let Some(addr) = connection.realtime_peer {
            if self.by_realtime_addr.get(&addr) == Some(&id) {
                self.by_realtime_addr.remove(&addr);
            }
        }

        connection.liveness.revoke();
        connection.link.close();
        connection.enter(ConnectionPhase::Disconnected);
        info!("Connection {} disconnected", id);
        Some(connection)
    }

    /// Disconnects every connection that has outstayed its phase.
    pub fn expire(&mut self, now: Instant) -> Vec<(Connection, ConnectionError)> {
        let expired: Vec<(ConnectionId, ConnectionPhase)> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(&self.timeouts, now))
            .map(|c| (c.id, c.phase))
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, phase)| {
                self.disconnect(id)
                    .map(|c| (c, ConnectionError::Timeout { phase }))
            })
            .collect()
    }

    /// Disconnects everything, for shutdown.
    pub fn drain(&mut self) -> Vec<Connection> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.disconnect(id)).collect()
    }

    pub fn find_by_realtime_addr(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.by_realtime_addr.get(&addr).copied()
    }

    fn addressed(&self, to: Recipients) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values().filter(move |c| match to {
            // Direct messages reach a connection in any live phase.
            Recipients::One(id) => c.id == id,
            Recipients::All => c.phase == ConnectionPhase::Synchronized,
            Recipients::AllExcept(id) => c.phase == ConnectionPhase::Synchronized && c.id != id,
        })
    }

    /// Writer links for a reliable delivery.
    pub fn reliable_targets(&self, to: Recipients) -> Vec<(ConnectionId, Link)> {
        self.addressed(to).map(|c| (c.id, c.link.clone())).collect()
    }

    /// Verified real-time addresses for a datagram delivery.
    pub fn realtime_targets(&self, to: Recipients) -> Vec<SocketAddr> {
        self.addressed(to).filter_map(|c| c.realtime_peer).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
