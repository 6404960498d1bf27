//! Wire-level vocabulary shared by the server and the client.
//!
//! Holds the identifiers, type tags, positions and directions that travel
//! between both ends, the closed [`NetworkMessage`] set, the binary [`codec`]
//! that turns those messages into bytes and back, and the [`stream`] framing
//! used on the reliable channel.

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod message;
pub mod stream;

pub use codec::{decode, decode_frame, encode, DecodeError, EncodeError, HEADER_LEN};
pub use message::{AuthResult, DisconnectReason, MessageKind, NetworkMessage};
pub use stream::{write_message, FrameReader, StreamError};

/// Protocol version spoken by this build. A handshake carrying any other
/// version is refused.
pub const PROTOCOL_VERSION: u16 = 1;

/// Length of the verification token issued over the reliable channel.
pub const TOKEN_LEN: usize = 16;

/// World-unique object identifier, assigned by the authority.
pub type ObjectId = u32;

/// Server-assigned connection identifier.
pub type ConnectionId = u32;

/// Closed set of game object variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Player = 0,
    Npc = 1,
    Item = 2,
    Marker = 3,
}

impl TypeTag {
    pub const ALL: [TypeTag; 4] = [TypeTag::Player, TypeTag::Npc, TypeTag::Item, TypeTag::Marker];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TypeTag::Player),
            1 => Some(TypeTag::Npc),
            2 => Some(TypeTag::Item),
            3 => Some(TypeTag::Marker),
            _ => None,
        }
    }
}

/// Movement / facing direction on the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    #[default]
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
}

impl Direction {
    pub const ALL: [Direction; 4] = [Direction::Up, Direction::Down, Direction::Left, Direction::Right];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::Up),
            1 => Some(Direction::Down),
            2 => Some(Direction::Left),
            3 => Some(Direction::Right),
            _ => None,
        }
    }

    /// Unit step for this direction. Positive `y` is up.
    pub fn offset(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, 1),
            Direction::Down => (0, -1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

/// Grid cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Neighbouring cell in `direction`, saturating at the coordinate limits.
    pub fn step(self, direction: Direction) -> Self {
        let (dx, dy) = direction.offset();
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
        }
    }
}

/// One-time token proving a client controls both of its channel endpoints.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerificationToken(pub [u8; TOKEN_LEN]);

impl VerificationToken {
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub fn matches(&self, other: &VerificationToken) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

/// Compares two secrets without short-circuiting on the first differing
/// byte. Only the length comparison can return early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl std::fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only the first bytes, tokens are secrets until consumed.
        write!(f, "VerificationToken({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tag_from_u8() {
        for tag in TypeTag::ALL {
            assert_eq!(TypeTag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(TypeTag::from_u8(4), None);
        assert_eq!(TypeTag::from_u8(255), None);
    }

    #[test]
    fn test_direction_from_u8() {
        for direction in Direction::ALL {
            assert_eq!(Direction::from_u8(direction as u8), Some(direction));
        }
        assert_eq!(Direction::from_u8(9), None);
    }

    #[test]
    fn test_position_step() {
        let origin = Position::new(0, 0);
        assert_eq!(origin.step(Direction::Up), Position::new(0, 1));
        assert_eq!(origin.step(Direction::Down), Position::new(0, -1));
        assert_eq!(origin.step(Direction::Left), Position::new(-1, 0));
        assert_eq!(origin.step(Direction::Right), Position::new(1, 0));
    }

    #[test]
    fn test_position_step_saturates() {
        let edge = Position::new(i32::MAX, i32::MIN);
        assert_eq!(edge.step(Direction::Right), edge);
        assert_eq!(edge.step(Direction::Down), edge);
    }

    #[test]
    fn test_token_matches() {
        let a = VerificationToken([0xAB; TOKEN_LEN]);
        let mut bytes = [0xAB; TOKEN_LEN];
        bytes[TOKEN_LEN - 1] = 0xAC;
        let b = VerificationToken(bytes);

        assert!(a.matches(&a));
        assert!(!a.matches(&b));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_token_debug_is_truncated() {
        let token = VerificationToken([0xCD; TOKEN_LEN]);
        assert_eq!(format!("{:?}", token), "VerificationToken(cdcd..)");
    }
}
