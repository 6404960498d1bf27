//! Headless client: connection sequence, message pump and input sending.

use log::{debug, info, warn};
use shared::codec::MAX_PAYLOAD_LEN;
use shared::{
    decode, encode, write_message, AuthResult, ConnectionId, DecodeError, Direction,
    DisconnectReason, EncodeError, FrameReader, MessageKind, NetworkMessage, ObjectId, Position,
    StreamError, TypeTag, VerificationToken, HEADER_LEN, PROTOCOL_VERSION,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout, Instant};

use crate::world::WorldMirror;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("malformed datagram: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("server refused the connection: {0:?}")]
    Rejected(AuthResult),

    #[error("disconnected by server: {0:?}")]
    Disconnected(DisconnectReason),

    #[error("server closed the connection")]
    ConnectionClosed,

    #[error("reliable writer task failed: {0}")]
    Writer(#[from] JoinError),

    #[error("no player assigned yet")]
    NotSynchronized,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unexpected {0:?} during connection setup")]
    UnexpectedMessage(MessageKind),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server reliable (TCP) address
    pub reliable_addr: String,
    /// Server real-time (UDP) address
    pub realtime_addr: String,
    pub credentials: Vec<u8>,
    pub protocol_version: u16,
    /// Upper bound on the whole connection sequence
    pub connect_timeout: Duration,
    /// How often the verification echo is repeated until the server confirms
    pub echo_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reliable_addr: "127.0.0.1:8080".to_string(),
            realtime_addr: "127.0.0.1:8081".to_string(),
            credentials: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            connect_timeout: Duration::from_secs(5),
            echo_interval: Duration::from_millis(100),
        }
    }
}

enum Incoming {
    Reliable(Result<Option<NetworkMessage>, StreamError>),
    Realtime(std::io::Result<usize>),
}

/// A synchronized connection to the server.
pub struct Client {
    reader: FrameReader<OwnedReadHalf>,
    outbound: mpsc::UnboundedSender<NetworkMessage>,
    writer: JoinHandle<Result<(), StreamError>>,
    socket: UdpSocket,
    connection: ConnectionId,
    sequence: u32,
    next_request: u32,
    world: WorldMirror,
    datagram: Vec<u8>,
}

impl Client {
    /// Runs the full connection sequence: handshake, authentication, then
    /// echoing the verification token over UDP until the server confirms.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let deadline = Instant::now() + config.connect_timeout;

        info!("Connecting to {}", config.reliable_addr);
        let stream = TcpStream::connect(&config.reliable_addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = FrameReader::new(reader);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&config.realtime_addr).await?;

        let (outbound, queued) = mpsc::unbounded_channel();
        let writer = spawn_writer(writer, queued);

        let opening = [
            NetworkMessage::Handshake {
                protocol_version: config.protocol_version,
            },
            NetworkMessage::AuthRequest {
                credentials: config.credentials.clone(),
            },
        ];
        for message in opening {
            outbound
                .send(message)
                .map_err(|_| ClientError::ConnectionClosed)?;
        }

        match read_until(&mut reader, deadline, "authentication").await? {
            NetworkMessage::AuthResponse {
                result: AuthResult::Accepted,
            } => {}
            NetworkMessage::AuthResponse { result } => return Err(ClientError::Rejected(result)),
            other => return Err(ClientError::UnexpectedMessage(other.kind())),
        }

        let (connection, token) = match read_until(&mut reader, deadline, "verification code").await? {
            NetworkMessage::VerificationCode { connection, token } => (connection, token),
            other => return Err(ClientError::UnexpectedMessage(other.kind())),
        };
        debug!("Connection {} received {:?}", connection, token);

        let mut client = Client {
            reader,
            outbound,
            writer,
            socket,
            connection,
            sequence: 0,
            next_request: 0,
            world: WorldMirror::new(),
            datagram: vec![0u8; HEADER_LEN + MAX_PAYLOAD_LEN],
        };
        client.verify(token, config.echo_interval, deadline).await?;

        info!(
            "Synchronized as connection {} with player {:?}",
            client.connection,
            client.world.player_id()
        );
        Ok(client)
    }

    async fn verify(
        &mut self,
        token: VerificationToken,
        echo_interval: Duration,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        let echo = NetworkMessage::VerificationEcho {
            connection: self.connection,
            token,
        };

        loop {
            self.send_realtime(&echo).await?;

            let resend_at = (Instant::now() + echo_interval).min(deadline);
            while Instant::now() < resend_at {
                let remaining = resend_at.saturating_duration_since(Instant::now());
                match timeout(remaining, self.poll()).await {
                    Ok(Ok(NetworkMessage::SyncComplete { .. })) => return Ok(()),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break,
                }
            }

            if Instant::now() >= deadline {
                return Err(ClientError::Timeout("synchronization"));
            }
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn player(&self) -> Option<ObjectId> {
        self.world.player_id()
    }

    pub fn world(&self) -> &WorldMirror {
        &self.world
    }

    /// Sends one step of input for our player. Returns its sequence number.
    pub async fn send_input(&mut self, direction: Direction) -> Result<u32, ClientError> {
        let player = self.world.player_id().ok_or(ClientError::NotSynchronized)?;
        self.sequence = self.sequence.wrapping_add(1);
        self.send_realtime(&NetworkMessage::PlayerInput {
            sequence: self.sequence,
            player,
            direction,
        })
        .await?;
        Ok(self.sequence)
    }

    /// Asks the server to create an object we own. Returns the request number
    /// the acknowledgement will carry.
    pub async fn request_spawn(
        &mut self,
        type_tag: TypeTag,
        position: Position,
    ) -> Result<u32, ClientError> {
        self.next_request = self.next_request.wrapping_add(1);
        let request = self.next_request;
        self.send_reliable(NetworkMessage::SpawnRequest {
            request,
            type_tag,
            position,
        })?;
        Ok(request)
    }

    pub async fn request_destroy(&mut self, object: ObjectId) -> Result<(), ClientError> {
        self.send_reliable(NetworkMessage::DestroyRequest { object })
    }

    pub async fn heartbeat(&mut self) -> Result<(), ClientError> {
        self.send_reliable(NetworkMessage::Heartbeat)
    }

    /// Queues a message for the reliable stream. The writer task does the
    /// actual write, so this never waits and never leaves a partial frame.
    pub fn send_reliable(&self, message: NetworkMessage) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    pub async fn send_realtime(&self, message: &NetworkMessage) -> Result<(), ClientError> {
        let bytes = encode(message)?;
        self.socket.send(&bytes).await?;
        Ok(())
    }

    /// Waits for the next message from either channel and folds it into the
    /// world mirror. Server heartbeats are answered here.
    ///
    /// Cancel safe: nothing is awaited once a message has been taken off a
    /// channel.
    pub async fn poll(&mut self) -> Result<NetworkMessage, ClientError> {
        loop {
            let incoming = tokio::select! {
                frame = self.reader.next_message() => Incoming::Reliable(frame),
                datagram = self.socket.recv(&mut self.datagram) => Incoming::Realtime(datagram),
            };

            let message = match incoming {
                Incoming::Reliable(frame) => match frame {
                    Ok(Some(message)) => message,
                    Ok(None) => return Err(ClientError::ConnectionClosed),
                    Err(StreamError::Decode(e)) => {
                        warn!("Dropped malformed frame: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
                Incoming::Realtime(received) => match decode(&self.datagram[..received?]) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Dropped malformed datagram: {}", e);
                        continue;
                    }
                },
            };

            if message == NetworkMessage::Heartbeat {
                self.send_reliable(NetworkMessage::Heartbeat)?;
            }
            self.world.apply(&message);
            return Ok(message);
        }
    }

    /// Polls until `done` accepts a message or `limit` passes. A server
    /// disconnect ends the wait with an error.
    pub async fn poll_until<F>(&mut self, limit: Duration, mut done: F) -> Result<NetworkMessage, ClientError>
    where
        F: FnMut(&NetworkMessage, &WorldMirror) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = timeout(remaining, self.poll())
                .await
                .map_err(|_| ClientError::Timeout("message"))??;

            if done(&message, &self.world) {
                return Ok(message);
            }
            if let NetworkMessage::Disconnect { reason } = message {
                return Err(ClientError::Disconnected(reason));
            }
        }
    }

    /// Tells the server we are leaving, flushes everything queued and closes
    /// the reliable stream.
    pub async fn disconnect(self) -> Result<(), ClientError> {
        let Client {
            outbound, writer, ..
        } = self;

        let farewell = outbound.send(NetworkMessage::Disconnect {
            reason: DisconnectReason::ClientQuit,
        });
        drop(outbound);
        writer.await??;
        if farewell.is_err() {
            return Err(ClientError::ConnectionClosed);
        }

        info!("Disconnected from server");
        Ok(())
    }
}

/// Owns the reliable write half. Exits once every sender is gone or a write
/// fails.
fn spawn_writer(
    mut writer: OwnedWriteHalf,
    mut queued: mpsc::UnboundedReceiver<NetworkMessage>,
) -> JoinHandle<Result<(), StreamError>> {
    tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                warn!("Failed to write {:?}: {}", message.kind(), e);
                return Err(e);
            }
        }
        writer.shutdown().await?;
        Ok(())
    })
}

/// Reads reliable messages until one arrives that is not a heartbeat.
async fn read_until(
    reader: &mut FrameReader<OwnedReadHalf>,
    deadline: Instant,
    stage: &'static str,
) -> Result<NetworkMessage, ClientError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let next = timeout(remaining, reader.next_message())
            .await
            .map_err(|_| ClientError::Timeout(stage))?;

        match next? {
            Some(NetworkMessage::Heartbeat) => continue,
            Some(NetworkMessage::Disconnect { reason }) => {
                return Err(ClientError::Disconnected(reason))
            }
            Some(message) => return Ok(message),
            None => return Err(ClientError::ConnectionClosed),
        }
    }
}
