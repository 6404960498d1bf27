//! Deployment parameters for the server.
//!
//! None of these are protocol contracts; the binary fills them from
//! command-line flags and tests shrink the timeouts.

use shared::Position;
use std::time::Duration;

use crate::command::DisconnectPolicy;
use crate::connection_manager::ConnectionPhase;

/// How long a connection may sit in each waiting phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeouts {
    pub handshake: Duration,
    pub authentication: Duration,
    pub verification: Duration,
    /// Silence allowed on the reliable channel once synchronized.
    pub heartbeat: Duration,
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: ConnectionPhase) -> Option<Duration> {
        match phase {
            ConnectionPhase::AwaitingReliableHandshake => Some(self.handshake),
            ConnectionPhase::AwaitingAuthentication => Some(self.authentication),
            ConnectionPhase::AwaitingRealtimeVerification => Some(self.verification),
            ConnectionPhase::Synchronized => Some(self.heartbeat),
            ConnectionPhase::Disconnected => None,
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(5),
            authentication: Duration::from_secs(5),
            verification: Duration::from_secs(5),
            heartbeat: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address of the reliable (TCP) channel
    pub reliable_addr: String,
    /// Bind address of the real-time (UDP) channel
    pub realtime_addr: String,
    /// Authority ticks per second; object updates are flushed once per tick
    pub tick_rate: u32,
    /// Bound of the authority command queue
    pub queue_capacity: usize,
    /// Per-connection outbound message buffer
    pub outbound_capacity: usize,
    pub max_connections: usize,
    /// Interval between server heartbeats and timeout sweeps
    pub heartbeat_interval: Duration,
    pub timeouts: PhaseTimeouts,
    /// Protocol violations tolerated before a connection is dropped
    pub violation_limit: u32,
    /// Accepted credential strings. Empty accepts any credentials.
    pub credentials: Vec<String>,
    pub disconnect_policy: DisconnectPolicy,
    /// Where newly synchronized players appear
    pub spawn_position: Position,
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    /// Period of the timeout sweep and server heartbeat. Never zero.
    pub fn sweep_interval(&self) -> Duration {
        self.heartbeat_interval.max(Duration::from_millis(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            reliable_addr: "127.0.0.1:8080".to_string(),
            realtime_addr: "127.0.0.1:8081".to_string(),
            tick_rate: 30,
            queue_capacity: 1024,
            outbound_capacity: 256,
            max_connections: 32,
            heartbeat_interval: Duration::from_secs(1),
            timeouts: PhaseTimeouts::default(),
            violation_limit: 8,
            credentials: Vec::new(),
            disconnect_policy: DisconnectPolicy::default(),
            spawn_position: Position::new(0, 0),
        }
    }
}
