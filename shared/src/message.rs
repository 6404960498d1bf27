//! The closed set of messages exchanged between client and server.

use crate::{ConnectionId, Direction, ObjectId, Position, TypeTag, VerificationToken};

/// Outcome of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthResult {
    Accepted = 0,
    InvalidCredentials = 1,
    ServerFull = 2,
    VersionMismatch = 3,
}

impl AuthResult {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AuthResult::Accepted),
            1 => Some(AuthResult::InvalidCredentials),
            2 => Some(AuthResult::ServerFull),
            3 => Some(AuthResult::VersionMismatch),
            _ => None,
        }
    }
}

/// Why a connection is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    ClientQuit = 0,
    Timeout = 1,
    AuthenticationFailed = 2,
    ProtocolViolation = 3,
    ServerShutdown = 4,
    VersionMismatch = 5,
}

impl DisconnectReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DisconnectReason::ClientQuit),
            1 => Some(DisconnectReason::Timeout),
            2 => Some(DisconnectReason::AuthenticationFailed),
            3 => Some(DisconnectReason::ProtocolViolation),
            4 => Some(DisconnectReason::ServerShutdown),
            5 => Some(DisconnectReason::VersionMismatch),
            _ => None,
        }
    }
}

/// Wire tag of each message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 0x01,
    AuthRequest = 0x02,
    AuthResponse = 0x03,
    VerificationCode = 0x04,
    VerificationEcho = 0x05,
    SyncComplete = 0x06,
    PlayerInput = 0x07,
    SpawnRequest = 0x08,
    ObjectCreateAck = 0x09,
    DestroyRequest = 0x0A,
    ObjectCreate = 0x0B,
    ObjectDestroy = 0x0C,
    ObjectUpdate = 0x0D,
    Heartbeat = 0x0E,
    Disconnect = 0x0F,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            0x01 => MessageKind::Handshake,
            0x02 => MessageKind::AuthRequest,
            0x03 => MessageKind::AuthResponse,
            0x04 => MessageKind::VerificationCode,
            0x05 => MessageKind::VerificationEcho,
            0x06 => MessageKind::SyncComplete,
            0x07 => MessageKind::PlayerInput,
            0x08 => MessageKind::SpawnRequest,
            0x09 => MessageKind::ObjectCreateAck,
            0x0A => MessageKind::DestroyRequest,
            0x0B => MessageKind::ObjectCreate,
            0x0C => MessageKind::ObjectDestroy,
            0x0D => MessageKind::ObjectUpdate,
            0x0E => MessageKind::Heartbeat,
            0x0F => MessageKind::Disconnect,
            _ => return None,
        };
        Some(kind)
    }

    /// Exact payload size for fixed-shape kinds, `None` for variable ones.
    pub fn fixed_payload_len(self) -> Option<usize> {
        match self {
            MessageKind::Handshake => Some(2),
            MessageKind::AuthRequest => None,
            MessageKind::AuthResponse => Some(1),
            MessageKind::VerificationCode | MessageKind::VerificationEcho => {
                Some(4 + crate::TOKEN_LEN)
            }
            MessageKind::SyncComplete => Some(4),
            MessageKind::PlayerInput => Some(9),
            MessageKind::SpawnRequest => Some(13),
            MessageKind::ObjectCreateAck => Some(8),
            MessageKind::DestroyRequest => Some(4),
            MessageKind::ObjectCreate => Some(14),
            MessageKind::ObjectDestroy => Some(4),
            MessageKind::ObjectUpdate => Some(13),
            MessageKind::Heartbeat => Some(0),
            MessageKind::Disconnect => Some(1),
        }
    }

    /// True for kinds a client may send to the server.
    pub fn is_server_bound(self) -> bool {
        matches!(
            self,
            MessageKind::Handshake
                | MessageKind::AuthRequest
                | MessageKind::VerificationEcho
                | MessageKind::PlayerInput
                | MessageKind::SpawnRequest
                | MessageKind::DestroyRequest
                | MessageKind::Heartbeat
                | MessageKind::Disconnect
        )
    }
}

/// A decoded wire message. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Handshake {
        protocol_version: u16,
    },
    AuthRequest {
        credentials: Vec<u8>,
    },
    AuthResponse {
        result: AuthResult,
    },
    VerificationCode {
        connection: ConnectionId,
        token: VerificationToken,
    },
    VerificationEcho {
        connection: ConnectionId,
        token: VerificationToken,
    },
    SyncComplete {
        player: ObjectId,
    },
    PlayerInput {
        sequence: u32,
        player: ObjectId,
        direction: Direction,
    },
    SpawnRequest {
        request: u32,
        type_tag: TypeTag,
        position: Position,
    },
    ObjectCreateAck {
        request: u32,
        object: ObjectId,
    },
    DestroyRequest {
        object: ObjectId,
    },
    ObjectCreate {
        object: ObjectId,
        type_tag: TypeTag,
        position: Position,
        facing: Direction,
    },
    ObjectDestroy {
        object: ObjectId,
    },
    ObjectUpdate {
        object: ObjectId,
        position: Position,
        facing: Direction,
    },
    Heartbeat,
    Disconnect {
        reason: DisconnectReason,
    },
}

impl NetworkMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            NetworkMessage::Handshake { .. } => MessageKind::Handshake,
            NetworkMessage::AuthRequest { .. } => MessageKind::AuthRequest,
            NetworkMessage::AuthResponse { .. } => MessageKind::AuthResponse,
            NetworkMessage::VerificationCode { .. } => MessageKind::VerificationCode,
            NetworkMessage::VerificationEcho { .. } => MessageKind::VerificationEcho,
            NetworkMessage::SyncComplete { .. } => MessageKind::SyncComplete,
            NetworkMessage::PlayerInput { .. } => MessageKind::PlayerInput,
            NetworkMessage::SpawnRequest { .. } => MessageKind::SpawnRequest,
            NetworkMessage::ObjectCreateAck { .. } => MessageKind::ObjectCreateAck,
            NetworkMessage::DestroyRequest { .. } => MessageKind::DestroyRequest,
            NetworkMessage::ObjectCreate { .. } => MessageKind::ObjectCreate,
            NetworkMessage::ObjectDestroy { .. } => MessageKind::ObjectDestroy,
            NetworkMessage::ObjectUpdate { .. } => MessageKind::ObjectUpdate,
            NetworkMessage::Heartbeat => MessageKind::Heartbeat,
            NetworkMessage::Disconnect { .. } => MessageKind::Disconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_from_u8() {
        for tag in 0x01..=0x0F {
            let kind = MessageKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(MessageKind::from_u8(0x00), None);
        assert_eq!(MessageKind::from_u8(0x10), None);
    }

    #[test]
    fn test_server_bound_kinds() {
        assert!(MessageKind::PlayerInput.is_server_bound());
        assert!(MessageKind::Heartbeat.is_server_bound());
        assert!(!MessageKind::ObjectUpdate.is_server_bound());
        assert!(!MessageKind::VerificationCode.is_server_bound());
    }

    #[test]
    fn test_disconnect_reason_from_u8() {
        assert_eq!(DisconnectReason::from_u8(1), Some(DisconnectReason::Timeout));
        assert_eq!(DisconnectReason::from_u8(6), None);
    }
}
