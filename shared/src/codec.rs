//! Binary wire codec.
//!
//! Every frame is `[kind: u8][payload length: u16 BE][payload]`. The payload
//! shape is fixed by the kind tag alone; all integers are big-endian and the
//! only variable-length payload (the credential blob) is bounded by the header
//! length. Decoding is total: any byte input yields a message or a
//! [`DecodeError`], never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{AuthResult, DisconnectReason, MessageKind, NetworkMessage};
use crate::{Direction, Position, TypeTag, VerificationToken, TOKEN_LEN};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 3;

/// Largest payload a header can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    TruncatedBuffer { needed: usize, available: usize },

    #[error("unknown message kind 0x{0:02x}")]
    UnknownMessageKind(u8),

    #[error("{kind:?}.{field} out of range: {value}")]
    FieldOutOfRange {
        kind: MessageKind,
        field: &'static str,
        value: u8,
    },

    #[error("{kind:?} payload is {actual} bytes, expected {expected}")]
    PayloadLength {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },

    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Encodes one message into a complete frame.
pub fn encode(message: &NetworkMessage) -> Result<Bytes, EncodeError> {
    let mut payload = BytesMut::with_capacity(32);
    write_payload(message, &mut payload);

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(EncodeError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(message.kind() as u8);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Decodes exactly one frame. Used for datagrams, where one datagram carries
/// one frame and any extra bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<NetworkMessage, DecodeError> {
    let (kind_byte, payload_len) = read_header(bytes)?;
    let frame_len = HEADER_LEN + payload_len;

    if bytes.len() < frame_len {
        return Err(DecodeError::TruncatedBuffer {
            needed: frame_len,
            available: bytes.len(),
        });
    }
    if bytes.len() > frame_len {
        return Err(DecodeError::TrailingBytes(bytes.len() - frame_len));
    }

    let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownMessageKind(kind_byte))?;
    decode_payload(kind, &bytes[HEADER_LEN..frame_len])
}

/// Splits the next frame off a stream buffer.
///
/// Returns `Ok(None)` while the buffer holds less than one full frame. Once a
/// full frame is present it is always consumed, even when its contents fail
/// to decode, so the stream stays aligned on frame boundaries.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<NetworkMessage>, DecodeError> {
    let (kind_byte, payload_len) = match read_header(&buf[..]) {
        Ok(header) => header,
        Err(DecodeError::TruncatedBuffer { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let frame_len = HEADER_LEN + payload_len;
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    let frame = buf.split_to(frame_len);
    let kind = MessageKind::from_u8(kind_byte).ok_or(DecodeError::UnknownMessageKind(kind_byte))?;
    decode_payload(kind, &frame[HEADER_LEN..]).map(Some)
}

fn read_header(bytes: &[u8]) -> Result<(u8, usize), DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedBuffer {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let payload_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    Ok((bytes[0], payload_len))
}

fn write_payload(message: &NetworkMessage, dst: &mut BytesMut) {
    match message {
        NetworkMessage::Handshake { protocol_version } => dst.put_u16(*protocol_version),
        NetworkMessage::AuthRequest { credentials } => dst.put_slice(credentials),
        NetworkMessage::AuthResponse { result } => dst.put_u8(*result as u8),
        NetworkMessage::VerificationCode { connection, token }
        | NetworkMessage::VerificationEcho { connection, token } => {
            dst.put_u32(*connection);
            dst.put_slice(token.as_bytes());
        }
        NetworkMessage::SyncComplete { player } => dst.put_u32(*player),
        NetworkMessage::PlayerInput {
            sequence,
            player,
            direction,
        } => {
            dst.put_u32(*sequence);
            dst.put_u32(*player);
            dst.put_u8(*direction as u8);
        }
        NetworkMessage::SpawnRequest {
            request,
            type_tag,
            position,
        } => {
            dst.put_u32(*request);
            dst.put_u8(*type_tag as u8);
            put_position(dst, *position);
        }
        NetworkMessage::ObjectCreateAck { request, object } => {
            dst.put_u32(*request);
            dst.put_u32(*object);
        }
        NetworkMessage::DestroyRequest { object } | NetworkMessage::ObjectDestroy { object } => {
            dst.put_u32(*object)
        }
        NetworkMessage::ObjectCreate {
            object,
            type_tag,
            position,
            facing,
        } => {
            dst.put_u32(*object);
            dst.put_u8(*type_tag as u8);
            put_position(dst, *position);
            dst.put_u8(*facing as u8);
        }
        NetworkMessage::ObjectUpdate {
            object,
            position,
            facing,
        } => {
            dst.put_u32(*object);
            put_position(dst, *position);
            dst.put_u8(*facing as u8);
        }
        NetworkMessage::Heartbeat => {}
        NetworkMessage::Disconnect { reason } => dst.put_u8(*reason as u8),
    }
}

fn put_position(dst: &mut BytesMut, position: Position) {
    dst.put_i32(position.x);
    dst.put_i32(position.y);
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<NetworkMessage, DecodeError> {
    if let Some(expected) = kind.fixed_payload_len() {
        if payload.len() != expected {
            return Err(DecodeError::PayloadLength {
                kind,
                expected,
                actual: payload.len(),
            });
        }
    }

    // Fixed-shape payloads have been length-checked, so the reads below stay
    // in bounds.
    let mut cur = payload;
    let message = match kind {
        MessageKind::Handshake => NetworkMessage::Handshake {
            protocol_version: cur.get_u16(),
        },
        MessageKind::AuthRequest => NetworkMessage::AuthRequest {
            credentials: cur.to_vec(),
        },
        MessageKind::AuthResponse => {
            let value = cur.get_u8();
            NetworkMessage::AuthResponse {
                result: AuthResult::from_u8(value).ok_or(DecodeError::FieldOutOfRange {
                    kind,
                    field: "result",
                    value,
                })?,
            }
        }
        MessageKind::VerificationCode => {
            let connection = cur.get_u32();
            NetworkMessage::VerificationCode {
                connection,
                token: get_token(&mut cur),
            }
        }
        MessageKind::VerificationEcho => {
            let connection = cur.get_u32();
            NetworkMessage::VerificationEcho {
                connection,
                token: get_token(&mut cur),
            }
        }
        MessageKind::SyncComplete => NetworkMessage::SyncComplete {
            player: cur.get_u32(),
        },
        MessageKind::PlayerInput => {
            let sequence = cur.get_u32();
            let player = cur.get_u32();
            NetworkMessage::PlayerInput {
                sequence,
                player,
                direction: get_direction(&mut cur, kind, "direction")?,
            }
        }
        MessageKind::SpawnRequest => {
            let request = cur.get_u32();
            let type_tag = get_type_tag(&mut cur, kind)?;
            NetworkMessage::SpawnRequest {
                request,
                type_tag,
                position: get_position(&mut cur),
            }
        }
        MessageKind::ObjectCreateAck => {
            let request = cur.get_u32();
            NetworkMessage::ObjectCreateAck {
                request,
                object: cur.get_u32(),
            }
        }
        MessageKind::DestroyRequest => NetworkMessage::DestroyRequest {
            object: cur.get_u32(),
        },
        MessageKind::ObjectCreate => {
            let object = cur.get_u32();
            let type_tag = get_type_tag(&mut cur, kind)?;
            let position = get_position(&mut cur);
            NetworkMessage::ObjectCreate {
                object,
                type_tag,
                position,
                facing: get_direction(&mut cur, kind, "facing")?,
            }
        }
        MessageKind::ObjectDestroy => NetworkMessage::ObjectDestroy {
            object: cur.get_u32(),
        },
        MessageKind::ObjectUpdate => {
            let object = cur.get_u32();
            let position = get_position(&mut cur);
            NetworkMessage::ObjectUpdate {
                object,
                position,
                facing: get_direction(&mut cur, kind, "facing")?,
            }
        }
        MessageKind::Heartbeat => NetworkMessage::Heartbeat,
        MessageKind::Disconnect => {
            let value = cur.get_u8();
            NetworkMessage::Disconnect {
                reason: DisconnectReason::from_u8(value).ok_or(DecodeError::FieldOutOfRange {
                    kind,
                    field: "reason",
                    value,
                })?,
            }
        }
    };

    Ok(message)
}

fn get_token(cur: &mut &[u8]) -> VerificationToken {
    let mut token = [0u8; TOKEN_LEN];
    cur.copy_to_slice(&mut token);
    VerificationToken(token)
}

fn get_position(cur: &mut &[u8]) -> Position {
    let x = cur.get_i32();
    let y = cur.get_i32();
    Position { x, y }
}

fn get_direction(
    cur: &mut &[u8],
    kind: MessageKind,
    field: &'static str,
) -> Result<Direction, DecodeError> {
    let value = cur.get_u8();
    Direction::from_u8(value).ok_or(DecodeError::FieldOutOfRange { kind, field, value })
}

fn get_type_tag(cur: &mut &[u8], kind: MessageKind) -> Result<TypeTag, DecodeError> {
    let value = cur.get_u8();
    TypeTag::from_u8(value).ok_or(DecodeError::FieldOutOfRange {
        kind,
        field: "type_tag",
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_input_wire_layout() {
        let message = NetworkMessage::PlayerInput {
            sequence: 1,
            player: 7,
            direction: Direction::Up,
        };
        let bytes = encode(&message).unwrap();

        assert_eq!(
            &bytes[..],
            &[0x07, 0x00, 0x09, 0, 0, 0, 1, 0, 0, 0, 7, 0]
        );
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_heartbeat_has_empty_payload() {
        let bytes = encode(&NetworkMessage::Heartbeat).unwrap();
        assert_eq!(&bytes[..], &[0x0E, 0x00, 0x00]);
    }

    #[test]
    fn test_negative_coordinates_survive() {
        let message = NetworkMessage::ObjectUpdate {
            object: 3,
            position: Position::new(-5, i32::MIN),
            facing: Direction::Left,
        };
        let bytes = encode(&message).unwrap();
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(
            decode(&[]),
            Err(DecodeError::TruncatedBuffer {
                needed: HEADER_LEN,
                available: 0
            })
        );
    }

    #[test]
    fn test_decode_truncated_header() {
        assert!(matches!(
            decode(&[0x07, 0x00]),
            Err(DecodeError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_payload() {
        assert_eq!(
            decode(&[0x07, 0x00, 0x09, 0, 0]),
            Err(DecodeError::TruncatedBuffer {
                needed: 12,
                available: 5
            })
        );
    }

    #[test]
    fn test_decode_unknown_kind() {
        assert_eq!(
            decode(&[0x7F, 0x00, 0x00]),
            Err(DecodeError::UnknownMessageKind(0x7F))
        );
    }

    #[test]
    fn test_decode_direction_out_of_range() {
        let bytes = [0x07, 0x00, 0x09, 0, 0, 0, 1, 0, 0, 0, 7, 9];
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::FieldOutOfRange {
                kind: MessageKind::PlayerInput,
                field: "direction",
                value: 9
            })
        );
    }

    #[test]
    fn test_decode_wrong_fixed_length() {
        // Heartbeat declaring a one byte payload.
        assert_eq!(
            decode(&[0x0E, 0x00, 0x01, 0xFF]),
            Err(DecodeError::PayloadLength {
                kind: MessageKind::Heartbeat,
                expected: 0,
                actual: 1
            })
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        assert_eq!(
            decode(&[0x0E, 0x00, 0x00, 0x00, 0x00]),
            Err(DecodeError::TrailingBytes(2))
        );
    }

    #[test]
    fn test_encode_oversized_credentials() {
        let message = NetworkMessage::AuthRequest {
            credentials: vec![0u8; MAX_PAYLOAD_LEN + 1],
        };
        assert!(matches!(
            encode(&message),
            Err(EncodeError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_frame_waits_for_full_frame() {
        let bytes = encode(&NetworkMessage::Handshake {
            protocol_version: 1,
        })
        .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..2]);
        assert_eq!(decode_frame(&mut buf), Ok(None));

        buf.extend_from_slice(&bytes[2..4]);
        assert_eq!(decode_frame(&mut buf), Ok(None));

        buf.extend_from_slice(&bytes[4..]);
        assert_eq!(
            decode_frame(&mut buf),
            Ok(Some(NetworkMessage::Handshake {
                protocol_version: 1
            }))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_frame_splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&NetworkMessage::Heartbeat).unwrap());
        buf.extend_from_slice(
            &encode(&NetworkMessage::AuthRequest {
                credentials: b"secret".to_vec(),
            })
            .unwrap(),
        );

        assert_eq!(decode_frame(&mut buf), Ok(Some(NetworkMessage::Heartbeat)));
        assert_eq!(
            decode_frame(&mut buf),
            Ok(Some(NetworkMessage::AuthRequest {
                credentials: b"secret".to_vec()
            }))
        );
        assert_eq!(decode_frame(&mut buf), Ok(None));
    }

    #[test]
    fn test_decode_frame_skips_bad_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x7F, 0x00, 0x02, 0xAA, 0xBB]);
        buf.extend_from_slice(&encode(&NetworkMessage::Heartbeat).unwrap());

        assert_eq!(
            decode_frame(&mut buf),
            Err(DecodeError::UnknownMessageKind(0x7F))
        );
        assert_eq!(decode_frame(&mut buf), Ok(Some(NetworkMessage::Heartbeat)));
    }
}
