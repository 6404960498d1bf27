//! Maps decoded messages to commands or connection-control events.
//!
//! The processor is a plain value with no state of its own. It never sees the
//! game state: every check here depends only on the message, the sender's
//! connection phase and the channel it arrived on, so the same inputs always
//! produce the same result.

use log::error;
use shared::{ConnectionId, DisconnectReason, MessageKind, NetworkMessage, VerificationToken};
use std::fmt;
use thiserror::Error;

use crate::command::GameCommand;
use crate::connection_manager::ConnectionPhase;
use crate::game::Spawn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Realtime,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Reliable => write!(f, "reliable"),
            Channel::Realtime => write!(f, "real-time"),
        }
    }
}

/// Who sent a message, as far as the transport knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub connection: ConnectionId,
    pub phase: ConnectionPhase,
    pub channel: Channel,
}

/// Messages that drive the connection state machine rather than the world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Handshake { protocol_version: u16 },
    Authenticate { credentials: Vec<u8> },
    VerificationEcho {
        connection: ConnectionId,
        token: VerificationToken,
    },
    Heartbeat,
    Disconnect { reason: DisconnectReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Control(ControlEvent),
    Command {
        command: GameCommand,
        /// Real-time sequence number, for stale-command filtering
        sequence: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("{kind:?} not permitted while {phase:?}")]
    UnauthorizedInPhase {
        kind: MessageKind,
        phase: ConnectionPhase,
    },

    #[error("{kind:?} not permitted on the {channel} channel")]
    WrongChannel { kind: MessageKind, channel: Channel },

    #[error("{0:?} is only ever sent by the server")]
    ServerOnly(MessageKind),
}

impl ProcessError {
    pub fn kind(&self) -> MessageKind {
        match self {
            ProcessError::UnauthorizedInPhase { kind, .. } => *kind,
            ProcessError::WrongChannel { kind, .. } => *kind,
            ProcessError::ServerOnly(kind) => *kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageProcessor;

impl MessageProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Turns a client message into a control event or a game command.
    ///
    /// Direction is checked first, then channel, then phase.
    pub fn process(&self, message: NetworkMessage, origin: Origin) -> Result<Processed, ProcessError> {
        let kind = message.kind();
        if !kind.is_server_bound() {
            return Err(ProcessError::ServerOnly(kind));
        }

        let expected = expected_channel(kind);
        if origin.channel != expected {
            return Err(ProcessError::WrongChannel {
                kind,
                channel: origin.channel,
            });
        }

        if !permitted(kind, origin.phase) {
            return Err(ProcessError::UnauthorizedInPhase {
                kind,
                phase: origin.phase,
            });
        }

        let processed = match message {
            NetworkMessage::Handshake { protocol_version } => {
                Processed::Control(ControlEvent::Handshake { protocol_version })
            }
            NetworkMessage::AuthRequest { credentials } => {
                Processed::Control(ControlEvent::Authenticate { credentials })
            }
            NetworkMessage::VerificationEcho { connection, token } => {
                Processed::Control(ControlEvent::VerificationEcho { connection, token })
            }
            NetworkMessage::Heartbeat => Processed::Control(ControlEvent::Heartbeat),
            NetworkMessage::Disconnect { reason } => {
                Processed::Control(ControlEvent::Disconnect { reason })
            }
            NetworkMessage::PlayerInput {
                sequence,
                player,
                direction,
            } => Processed::Command {
                command: GameCommand::ApplyInput {
                    issuer: origin.connection,
                    player,
                    direction,
                },
                sequence: Some(sequence),
            },
            NetworkMessage::SpawnRequest {
                request,
                type_tag,
                position,
            } => Processed::Command {
                command: GameCommand::CreateObject {
                    id: None,
                    type_tag,
                    spawn: Spawn {
                        position,
                        owner: Some(origin.connection),
                        ..Default::default()
                    },
                    request: Some(request),
                },
                sequence: None,
            },
            NetworkMessage::DestroyRequest { object } => Processed::Command {
                command: GameCommand::DestroyObject {
                    id: object,
                    issuer: Some(origin.connection),
                },
                sequence: None,
            },
            NetworkMessage::AuthResponse { .. }
            | NetworkMessage::VerificationCode { .. }
            | NetworkMessage::SyncComplete { .. }
            | NetworkMessage::ObjectCreateAck { .. }
            | NetworkMessage::ObjectCreate { .. }
            | NetworkMessage::ObjectDestroy { .. }
            | NetworkMessage::ObjectUpdate { .. } => {
                error!(
                    "BUG: {:?} passed the direction check but is not a client message",
                    kind
                );
                return Err(ProcessError::ServerOnly(kind));
            }
        };

        Ok(processed)
    }
}

fn expected_channel(kind: MessageKind) -> Channel {
    match kind {
        MessageKind::VerificationEcho | MessageKind::PlayerInput => Channel::Realtime,
        _ => Channel::Reliable,
    }
}

fn permitted(kind: MessageKind, phase: ConnectionPhase) -> bool {
    use ConnectionPhase::*;

    match (kind, phase) {
        (_, Disconnected) => false,
        (MessageKind::Handshake, AwaitingReliableHandshake) => true,
        (MessageKind::AuthRequest, AwaitingAuthentication) => true,
        // A late duplicate echo after synchronizing is harmless.
        (MessageKind::VerificationEcho, AwaitingRealtimeVerification | Synchronized) => true,
        (
            MessageKind::PlayerInput | MessageKind::SpawnRequest | MessageKind::DestroyRequest,
            Synchronized,
        ) => true,
        (MessageKind::Heartbeat | MessageKind::Disconnect, _) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Direction, Position, TypeTag};

    fn origin(phase: ConnectionPhase, channel: Channel) -> Origin {
        Origin {
            connection: 3,
            phase,
            channel,
        }
    }

    fn input() -> NetworkMessage {
        NetworkMessage::PlayerInput {
            sequence: 1,
            player: 7,
            direction: Direction::Up,
        }
    }

    #[test]
    fn test_player_input_before_sync_is_rejected() {
        let processor = MessageProcessor::new();
        let result = processor.process(
            input(),
            origin(ConnectionPhase::AwaitingAuthentication, Channel::Realtime),
        );

        assert_eq!(
            result,
            Err(ProcessError::UnauthorizedInPhase {
                kind: MessageKind::PlayerInput,
                phase: ConnectionPhase::AwaitingAuthentication,
            })
        );
    }

    #[test]
    fn test_player_input_when_synchronized() {
        let processor = MessageProcessor::new();
        let result = processor
            .process(input(), origin(ConnectionPhase::Synchronized, Channel::Realtime))
            .unwrap();

        assert_eq!(
            result,
            Processed::Command {
                command: GameCommand::ApplyInput {
                    issuer: 3,
                    player: 7,
                    direction: Direction::Up,
                },
                sequence: Some(1),
            }
        );
    }

    #[test]
    fn test_processing_is_deterministic() {
        let a = MessageProcessor::new();
        let b = MessageProcessor::new();
        let at = origin(ConnectionPhase::Synchronized, Channel::Realtime);

        assert_eq!(a.process(input(), at), b.process(input(), at));
        assert_eq!(a.process(input(), at), a.process(input(), at));
    }

    #[test]
    fn test_handshake_only_in_first_phase() {
        let processor = MessageProcessor::new();
        let handshake = NetworkMessage::Handshake {
            protocol_version: 1,
        };

        assert!(processor
            .process(
                handshake.clone(),
                origin(ConnectionPhase::AwaitingReliableHandshake, Channel::Reliable)
            )
            .is_ok());
        assert!(matches!(
            processor.process(handshake, origin(ConnectionPhase::Synchronized, Channel::Reliable)),
            Err(ProcessError::UnauthorizedInPhase { .. })
        ));
    }

    #[test]
    fn test_auth_request_becomes_control_event() {
        let processor = MessageProcessor::new();
        let result = processor.process(
            NetworkMessage::AuthRequest {
                credentials: b"secret".to_vec(),
            },
            origin(ConnectionPhase::AwaitingAuthentication, Channel::Reliable),
        );

        assert_eq!(
            result,
            Ok(Processed::Control(ControlEvent::Authenticate {
                credentials: b"secret".to_vec()
            }))
        );
    }

    #[test]
    fn test_wrong_channel() {
        let processor = MessageProcessor::new();

        let result = processor.process(input(), origin(ConnectionPhase::Synchronized, Channel::Reliable));
        assert_eq!(
            result,
            Err(ProcessError::WrongChannel {
                kind: MessageKind::PlayerInput,
                channel: Channel::Reliable,
            })
        );

        let result = processor.process(
            NetworkMessage::Handshake {
                protocol_version: 1,
            },
            origin(ConnectionPhase::AwaitingReliableHandshake, Channel::Realtime),
        );
        assert!(matches!(result, Err(ProcessError::WrongChannel { .. })));
    }

    #[test]
    fn test_server_bound_messages_only() {
        let processor = MessageProcessor::new();
        let result = processor.process(
            NetworkMessage::ObjectDestroy { object: 1 },
            origin(ConnectionPhase::Synchronized, Channel::Reliable),
        );
        assert_eq!(result, Err(ProcessError::ServerOnly(MessageKind::ObjectDestroy)));
    }

    #[test]
    fn test_every_server_message_fails_direction_check() {
        let processor = MessageProcessor::new();
        let server_messages = [
            NetworkMessage::AuthResponse {
                result: shared::AuthResult::Accepted,
            },
            NetworkMessage::VerificationCode {
                connection: 3,
                token: VerificationToken([1; shared::TOKEN_LEN]),
            },
            NetworkMessage::SyncComplete { player: 7 },
            NetworkMessage::ObjectCreateAck {
                request: 1,
                object: 7,
            },
            NetworkMessage::ObjectCreate {
                object: 7,
                type_tag: TypeTag::Item,
                position: Position::new(0, 0),
                facing: Direction::Up,
            },
            NetworkMessage::ObjectDestroy { object: 7 },
            NetworkMessage::ObjectUpdate {
                object: 7,
                position: Position::new(1, 1),
                facing: Direction::Left,
            },
        ];

        for message in server_messages {
            let kind = message.kind();
            assert!(!kind.is_server_bound(), "{:?}", kind);
            for channel in [Channel::Reliable, Channel::Realtime] {
                let result = processor.process(message.clone(), origin(ConnectionPhase::Synchronized, channel));
                assert_eq!(result, Err(ProcessError::ServerOnly(kind)));
            }
        }
    }

    #[test]
    fn test_spawn_request_carries_owner_and_request() {
        let processor = MessageProcessor::new();
        let result = processor
            .process(
                NetworkMessage::SpawnRequest {
                    request: 9,
                    type_tag: TypeTag::Item,
                    position: Position::new(2, -1),
                },
                origin(ConnectionPhase::Synchronized, Channel::Reliable),
            )
            .unwrap();

        match result {
            Processed::Command {
                command:
                    GameCommand::CreateObject {
                        id,
                        type_tag,
                        spawn,
                        request,
                    },
                sequence,
            } => {
                assert_eq!(id, None);
                assert_eq!(type_tag, TypeTag::Item);
                assert_eq!(spawn.owner, Some(3));
                assert_eq!(spawn.position, Position::new(2, -1));
                assert_eq!(request, Some(9));
                assert_eq!(sequence, None);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_destroy_request_carries_issuer() {
        let processor = MessageProcessor::new();
        let result = processor.process(
            NetworkMessage::DestroyRequest { object: 12 },
            origin(ConnectionPhase::Synchronized, Channel::Reliable),
        );
        assert_eq!(
            result,
            Ok(Processed::Command {
                command: GameCommand::DestroyObject {
                    id: 12,
                    issuer: Some(3)
                },
                sequence: None,
            })
        );
    }

    #[test]
    fn test_heartbeat_in_any_live_phase() {
        let processor = MessageProcessor::new();
        for phase in [
            ConnectionPhase::AwaitingReliableHandshake,
            ConnectionPhase::AwaitingAuthentication,
            ConnectionPhase::AwaitingRealtimeVerification,
            ConnectionPhase::Synchronized,
        ] {
            assert_eq!(
                processor.process(NetworkMessage::Heartbeat, origin(phase, Channel::Reliable)),
                Ok(Processed::Control(ControlEvent::Heartbeat))
            );
        }
    }

    #[test]
    fn test_nothing_accepted_when_disconnected() {
        let processor = MessageProcessor::new();
        let result = processor.process(
            NetworkMessage::Heartbeat,
            origin(ConnectionPhase::Disconnected, Channel::Reliable),
        );
        assert!(matches!(result, Err(ProcessError::UnauthorizedInPhase { .. })));
    }
}
