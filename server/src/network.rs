//! Server transport: the TCP listener, the UDP socket and the tasks around them
//!
//! Task layout:
//! - one reader task and one writer task per reliable connection
//! - one real-time receiver for the shared UDP socket
//! - one outbound dispatcher turning authority output into socket writes
//! - one timeout checker that also emits heartbeats
//! - the authority task, the only owner of the game state

use log::{debug, error, info, warn};
use shared::codec::MAX_PAYLOAD_LEN;
use shared::{
    decode, encode, write_message, AuthResult, ConnectionId, DisconnectReason, FrameReader,
    NetworkMessage, StreamError, HEADER_LEN,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, RwLock};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::authority::{Authority, CommandQueue, Envelope, Outbound, Recipients, SubmitError};
use crate::command::{GameCommand, GridMovement, Movement};
use crate::config::ServerConfig;
use crate::connection_manager::{Connection, ConnectionError, ConnectionManager, Link};
use crate::game::GameState;
use crate::processor::{Channel, ControlEvent, MessageProcessor, Origin, Processed};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("authority task failed: {0}")]
    Authority(#[from] JoinError),
}

/// What a reader should do after handling one message.
enum Flow {
    Continue,
    /// Drop the connection, telling the peer why if there is a reason.
    Close(Option<DisconnectReason>),
}

/// How sure we are that a message came from the connection it is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attribution {
    /// Read off the connection's own stream or its verified real-time address.
    Bound,
    /// An echo from an unverified address, naming the connection it claims.
    Claimed,
}

/// Everything the per-connection and background tasks share.
#[derive(Clone)]
struct Shared {
    config: Arc<ServerConfig>,
    connections: Arc<RwLock<ConnectionManager>>,
    queue: CommandQueue,
    processor: MessageProcessor,
    socket: Arc<UdpSocket>,
}

/// Authoritative server bound to its reliable and real-time endpoints.
pub struct Server {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    state: GameState,
    movement: Box<dyn Movement>,
}

impl Server {
    /// Binds both sockets. Ports of 0 pick free ports; see
    /// [`Server::reliable_addr`] and [`Server::realtime_addr`].
    pub async fn bind(config: ServerConfig, state: GameState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.reliable_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.reliable_addr.clone(),
                source,
            })?;
        let socket = UdpSocket::bind(&config.realtime_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: config.realtime_addr.clone(),
                source,
            })?;

        info!(
            "Server listening on {} (reliable) and {} (real-time)",
            listener.local_addr().map_err(TransportError::from)?,
            socket.local_addr().map_err(TransportError::from)?
        );

        Ok(Self {
            config: Arc::new(config),
            listener,
            socket: Arc::new(socket),
            state,
            movement: Box::new(GridMovement),
        })
    }

    /// Replaces the default grid movement rules.
    pub fn with_movement(mut self, movement: Box<dyn Movement>) -> Self {
        self.movement = movement;
        self
    }

    pub fn reliable_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn realtime_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves clients until `shutdown` resolves, then says goodbye to every
    /// connection and returns the final game state.
    pub async fn run<F>(self, shutdown: F) -> Result<GameState, ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            socket,
            state,
            movement,
        } = self;

        let (queue, commands) = CommandQueue::bounded(config.queue_capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let authority = spawn_authority(
            Authority::new(state, movement, outbound_tx),
            commands,
            config.tick_duration(),
            stop_rx,
        );

        let shared = Shared {
            connections: Arc::new(RwLock::new(ConnectionManager::from_config(&config))),
            config,
            queue,
            processor: MessageProcessor::new(),
            socket,
        };

        let background = [
            spawn_outbound_dispatcher(shared.clone(), outbound_rx),
            spawn_realtime_receiver(shared.clone()),
            spawn_timeout_checker(shared.clone()),
        ];

        info!("Server started successfully");

        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        sessions.spawn(handle_reliable(shared.clone(), stream, peer));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Shutting down");
        for task in &background {
            task.abort();
        }

        // Objects survive a shutdown, so no release commands here.
        let remaining = shared.connections.write().await.drain();
        for connection in remaining {
            let _ = connection.link.send(NetworkMessage::Disconnect {
                reason: DisconnectReason::ServerShutdown,
            });
        }

        let _ = stop_tx.send(());
        let state = authority.await?;

        // Readers have been told to close; give writers a moment to flush.
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        sessions.abort_all();

        Ok(state)
    }
}

fn spawn_authority(
    authority: Authority,
    commands: mpsc::Receiver<Envelope>,
    tick: Duration,
    stop: oneshot::Receiver<()>,
) -> JoinHandle<GameState> {
    tokio::spawn(authority.run(commands, tick, stop))
}

/// Turns authority output into socket writes.
fn spawn_outbound_dispatcher(
    shared: Shared,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Reliable { to, message } => {
                    let targets = shared.connections.read().await.reliable_targets(to);
                    for (id, link) in targets {
                        match link.send(message.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("Connection {} is not keeping up, disconnecting", id);
                                shared.disconnect(id, None).await;
                            }
                            // Writer already gone; the reader will clean up.
                            Err(TrySendError::Closed(_)) => {}
                        }
                    }
                }
                Outbound::Realtime { to, message } => {
                    let bytes = match encode(&message) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            error!("Failed to encode {:?}: {}", message.kind(), e);
                            continue;
                        }
                    };
                    let targets = shared.connections.read().await.realtime_targets(to);
                    for addr in targets {
                        if let Err(e) = shared.socket.send_to(&bytes, addr).await {
                            debug!("Failed to send datagram to {}: {}", addr, e);
                        }
                    }
                }
            }
        }
    })
}

/// Reads datagrams off the shared UDP socket.
///
/// Only verified addresses are mapped to connections. An unknown address may
/// send nothing but a verification echo naming the connection it claims.
fn spawn_realtime_receiver(shared: Shared) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer = vec![0u8; HEADER_LEN + MAX_PAYLOAD_LEN];

        loop {
            let (len, addr) = match shared.socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let message = match decode(&buffer[..len]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropped malformed datagram from {}: {}", addr, e);
                    continue;
                }
            };

            let known = shared.connections.read().await.find_by_realtime_addr(addr);
            let (id, attribution) = match (known, &message) {
                (Some(id), _) => (id, Attribution::Bound),
                (None, NetworkMessage::VerificationEcho { connection, .. }) => {
                    (*connection, Attribution::Claimed)
                }
                (None, _) => {
                    debug!("Ignoring {:?} from unverified address {}", message.kind(), addr);
                    continue;
                }
            };

            let flow = shared
                .handle_message(id, Channel::Realtime, attribution, addr, message)
                .await;
            if let Flow::Close(reason) = flow {
                shared.disconnect(id, reason).await;
            }
        }
    })
}

/// Expires connections that outstayed their phase and heartbeats the rest.
fn spawn_timeout_checker(shared: Shared) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(shared.config.sweep_interval());

        loop {
            interval.tick().await;

            let expired = shared.connections.write().await.expire(Instant::now());
            for (connection, reason) in expired {
                warn!("Connection {} dropped: {}", connection.id, reason);
                shared.retire(connection, Some(DisconnectReason::Timeout));
            }

            let links = shared.connections.read().await.reliable_targets(Recipients::All);
            for (_, link) in links {
                let _ = link.send(NetworkMessage::Heartbeat);
            }
        }
    })
}

fn spawn_reliable_writer(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<NetworkMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                warn!("Failed to write to connection {}: {}", id, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
        debug!("Writer for connection {} finished", id);
    })
}

/// Drives one reliable connection from accept to teardown.
async fn handle_reliable(shared: Shared, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let (reader, writer) = stream.into_split();
    let (link, outbound) = Link::new(shared.config.outbound_capacity);
    let id = shared
        .connections
        .write()
        .await
        .add_connection(peer, link.clone());
    let writer = spawn_reliable_writer(id, writer, outbound);

    let mut frames = FrameReader::new(reader);
    let reason = loop {
        let next = tokio::select! {
            _ = link.closed() => break None,
            next = frames.next_message() => next,
        };

        match next {
            Ok(Some(message)) => {
                if let Flow::Close(reason) = shared
                    .handle_message(id, Channel::Reliable, Attribution::Bound, peer, message)
                    .await
                {
                    break reason;
                }
            }
            Ok(None) => {
                info!("Connection {} closed by peer", id);
                break None;
            }
            Err(StreamError::Decode(e)) => {
                warn!("Malformed frame from connection {}: {}", id, e);
                if let Flow::Close(reason) = shared.violation(id).await {
                    break reason;
                }
            }
            Err(e) => {
                warn!("Connection {} read failed: {}", id, e);
                break None;
            }
        }
    };

    shared.disconnect(id, reason).await;
    drop(link);
    if let Err(e) = writer.await {
        error!("Writer task for connection {} failed: {}", id, e);
    }
}

impl Shared {
    async fn handle_message(
        &self,
        id: ConnectionId,
        channel: Channel,
        attribution: Attribution,
        addr: SocketAddr,
        message: NetworkMessage,
    ) -> Flow {
        let phase = {
            let mut connections = self.connections.write().await;
            if channel == Channel::Reliable {
                connections.touch(id);
            }
            connections.phase(id)
        };
        let Some(phase) = phase else {
            return match attribution {
                Attribution::Bound => Flow::Close(None),
                Attribution::Claimed => Flow::Continue,
            };
        };

        let origin = Origin {
            connection: id,
            phase,
            channel,
        };
        match self.processor.process(message, origin) {
            Ok(Processed::Control(event)) => self.handle_control(id, attribution, addr, event).await,
            Ok(Processed::Command { command, sequence }) => {
                self.enqueue(id, command, sequence).await
            }
            Err(e) if attribution == Attribution::Claimed => {
                debug!("Dropped unverified datagram from {} claiming connection {}: {}", addr, id, e);
                Flow::Continue
            }
            Err(e) => {
                warn!("Protocol violation from connection {}: {}", id, e);
                self.violation(id).await
            }
        }
    }

    async fn handle_control(
        &self,
        id: ConnectionId,
        attribution: Attribution,
        addr: SocketAddr,
        event: ControlEvent,
    ) -> Flow {
        match event {
            ControlEvent::Handshake { protocol_version } => {
                let result = self.connections.write().await.handshake(id, protocol_version);
                match result {
                    Ok(()) => {
                        debug!("Connection {} completed handshake", id);
                        Flow::Continue
                    }
                    Err(e @ ConnectionError::VersionMismatch { .. }) => {
                        warn!("Connection {}: {}", id, e);
                        self.reply(
                            id,
                            NetworkMessage::AuthResponse {
                                result: AuthResult::VersionMismatch,
                            },
                        )
                        .await;
                        Flow::Close(Some(DisconnectReason::VersionMismatch))
                    }
                    Err(e) => {
                        warn!("Connection {}: {}", id, e);
                        self.violation(id).await
                    }
                }
            }
            ControlEvent::Authenticate { credentials } => {
                let result = self.connections.write().await.authenticate(id, &credentials);
                match result {
                    Ok(token) => {
                        info!("Connection {} authenticated", id);
                        self.reply(
                            id,
                            NetworkMessage::AuthResponse {
                                result: AuthResult::Accepted,
                            },
                        )
                        .await;
                        self.reply(id, NetworkMessage::VerificationCode { connection: id, token })
                            .await;
                        Flow::Continue
                    }
                    Err(e @ (ConnectionError::InvalidCredentials | ConnectionError::ServerFull)) => {
                        warn!("Connection {} refused: {}", id, e);
                        let result = match e {
                            ConnectionError::ServerFull => AuthResult::ServerFull,
                            _ => AuthResult::InvalidCredentials,
                        };
                        self.reply(id, NetworkMessage::AuthResponse { result }).await;
                        Flow::Close(Some(DisconnectReason::AuthenticationFailed))
                    }
                    Err(e) => {
                        warn!("Connection {}: {}", id, e);
                        self.violation(id).await
                    }
                }
            }
            ControlEvent::VerificationEcho { connection, token } => {
                let (result, liveness) = {
                    let mut connections = self.connections.write().await;
                    let result = connections.verify(id, connection, &token, addr);
                    (result, connections.get(id).map(|c| c.liveness.clone()))
                };
                match (result, liveness) {
                    (Ok(true), Some(liveness)) => {
                        let spawn = Envelope::reliable(
                            id,
                            liveness,
                            GameCommand::SpawnPlayer {
                                connection: id,
                                position: self.config.spawn_position,
                            },
                        );
                        // Runs on the real-time receiver, which must not wait on the queue.
                        self.queue.submit_detached(spawn);
                        Flow::Continue
                    }
                    (Ok(_), _) => Flow::Continue,
                    // Anyone can send an echo naming any connection; only the
                    // connection's own address answers for a failure.
                    (Err(e), _) if attribution == Attribution::Claimed => {
                        debug!("Verification from {} for connection {} failed: {}", addr, id, e);
                        Flow::Continue
                    }
                    (Err(e), _) => {
                        warn!("Verification from {} for connection {} failed: {}", addr, id, e);
                        self.violation(id).await
                    }
                }
            }
            ControlEvent::Heartbeat => Flow::Continue,
            ControlEvent::Disconnect { reason } => {
                info!("Connection {} left: {:?}", id, reason);
                Flow::Close(None)
            }
        }
    }

    async fn enqueue(&self, id: ConnectionId, command: GameCommand, sequence: Option<u32>) -> Flow {
        let liveness = {
            let mut connections = self.connections.write().await;
            if let Some(sequence) = sequence {
                if !connections.accept_realtime_sequence(id, sequence) {
                    debug!("Dropped stale input {} from connection {}", sequence, id);
                    return Flow::Continue;
                }
            }
            match connections.get(id) {
                Some(connection) => connection.liveness.clone(),
                None => return Flow::Close(None),
            }
        };

        let submitted = match sequence {
            Some(sequence) => self
                .queue
                .submit_realtime(Envelope::realtime(id, liveness, sequence, command)),
            None => {
                self.queue
                    .submit_reliable(Envelope::reliable(id, liveness, command))
                    .await
            }
        };

        match submitted {
            Ok(()) => Flow::Continue,
            Err(SubmitError::Full) => {
                debug!("Authority queue full, dropped real-time command from {}", id);
                Flow::Continue
            }
            Err(SubmitError::Closed) => Flow::Close(None),
        }
    }

    async fn reply(&self, id: ConnectionId, message: NetworkMessage) {
        if let Some(connection) = self.connections.read().await.get(id) {
            if let Err(e) = connection.link.send(message) {
                debug!("Failed to queue reply for connection {}: {}", id, e);
            }
        }
    }

    async fn violation(&self, id: ConnectionId) -> Flow {
        if self.connections.write().await.record_violation(id) {
            warn!("Connection {} reached the violation limit", id);
            Flow::Close(Some(DisconnectReason::ProtocolViolation))
        } else {
            Flow::Continue
        }
    }

    async fn disconnect(&self, id: ConnectionId, reason: Option<DisconnectReason>) {
        let removed = self.connections.write().await.disconnect(id);
        if let Some(connection) = removed {
            self.retire(connection, reason);
        }
    }

    /// Says goodbye to a removed connection and releases its objects.
    fn retire(&self, connection: Connection, reason: Option<DisconnectReason>) {
        if let Some(reason) = reason {
            let _ = connection.link.send(NetworkMessage::Disconnect { reason });
        }

        let release = Envelope::system(GameCommand::ReleaseConnection {
            connection: connection.id,
            policy: self.config.disconnect_policy,
        });
        self.queue.submit_detached(release);
    }
}
