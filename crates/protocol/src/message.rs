//! Datagram layout and frame classification.
//!
//! Every framed datagram opens with a 26-byte header, little-endian:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 2    | protocol flag |
//! | 2      | 8    | sequence number (data frames; zero elsewhere) |
//! | 10     | 8    | sender timestamp |
//! | 18     | 8    | sender timestamp tick rate |
//! | 26     | ...  | payload or control body |
//!
//! Two unframed messages exist besides that: the literal ASCII `START`
//! handshake datagram, and the compact connection-id frame (flag + id, no
//! sequence/timestamps).

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::id::ConnectionId;

/// Data frame carrying a slice of one media frame.
pub const FLAG_DATA: u16 = 0x1000;
/// Compact connection-id exchange frame.
pub const FLAG_ID: u16 = 0x2000;
/// Control frame: connection request.
pub const FLAG_SYN: u16 = 0x3000;
/// Control frame: connection response (bit 0 of the flags byte = Accept).
pub const FLAG_SYN_ACK: u16 = 0x4000;
/// Control frame: connection confirmation.
pub const FLAG_ACK: u16 = 0x5000;

/// The initial handshake datagram: five literal bytes, no header.
pub const START_MESSAGE: &[u8; 5] = b"START";

pub const PROTOCOL_FLAG_LEN: usize = 2;
pub const SEQUENCE_NUMBER_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 8;
pub const TICK_RATE_LEN: usize = 8;

/// Full header carried by data and control frames.
pub const DATA_HEADER_LEN: usize =
    PROTOCOL_FLAG_LEN + SEQUENCE_NUMBER_LEN + TIMESTAMP_LEN + TICK_RATE_LEN;

pub const CONNECTION_ID_LEN: usize = 36;

/// The compact id frame: flag + connection id.
pub const CONNECTION_ID_FRAME_LEN: usize = PROTOCOL_FLAG_LEN + CONNECTION_ID_LEN;

/// Control body: version (1) | flags (1) | reserved (2) | connection id.
pub const CONTROL_FIXED_BODY_LEN: usize = 4 + CONNECTION_ID_LEN;
pub const CONTROL_FRAME_LEN: usize = DATA_HEADER_LEN + CONTROL_FIXED_BODY_LEN;

pub const CONTROL_VERSION: u8 = 1;
const CONTROL_FLAG_ACCEPT: u8 = 0x01;

/// A classified inbound datagram. Borrows from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum MessageKind<'a> {
    /// The literal START handshake.
    Start,
    /// Compact connection-id frame.
    ConnectionId(&'a [u8]),
    /// Data frame: sequence, sender timestamp + tick rate, payload after the header.
    Data {
        sequence: i64,
        sender_qpc: i64,
        sender_qpf: i64,
        payload: &'a [u8],
    },
    Syn {
        connection_id: &'a [u8],
    },
    SynAck {
        accept: bool,
        connection_id: &'a [u8],
    },
    Ack {
        connection_id: &'a [u8],
    },
}

/// Classify an inbound datagram.
pub fn parse(buffer: &[u8]) -> Result<MessageKind<'_>, Error> {
    if buffer.len() == START_MESSAGE.len() && buffer == START_MESSAGE {
        return Ok(MessageKind::Start);
    }

    if buffer.len() < PROTOCOL_FLAG_LEN {
        return Err(Error::BufferTooSmall(PROTOCOL_FLAG_LEN, buffer.len()));
    }

    let flag = u16::from_le_bytes([buffer[0], buffer[1]]);
    if !validate_length(flag, buffer.len()) {
        return Err(Error::TruncatedFrame {
            flag,
            length: buffer.len(),
        });
    }

    match flag {
        FLAG_DATA => Ok(MessageKind::Data {
            sequence: read_i64(buffer, PROTOCOL_FLAG_LEN),
            sender_qpc: read_i64(buffer, PROTOCOL_FLAG_LEN + SEQUENCE_NUMBER_LEN),
            sender_qpf: read_i64(
                buffer,
                PROTOCOL_FLAG_LEN + SEQUENCE_NUMBER_LEN + TIMESTAMP_LEN,
            ),
            payload: &buffer[DATA_HEADER_LEN..],
        }),

        FLAG_ID => Ok(MessageKind::ConnectionId(
            &buffer[PROTOCOL_FLAG_LEN..CONNECTION_ID_FRAME_LEN],
        )),

        FLAG_SYN | FLAG_SYN_ACK | FLAG_ACK => {
            let body = &buffer[DATA_HEADER_LEN..];
            let version = body[0];
            if version != CONTROL_VERSION {
                return Err(Error::UnsupportedControlVersion(version));
            }

            let connection_id = &body[4..4 + CONNECTION_ID_LEN];
            Ok(match flag {
                FLAG_SYN => MessageKind::Syn { connection_id },
                FLAG_SYN_ACK => MessageKind::SynAck {
                    accept: body[1] & CONTROL_FLAG_ACCEPT != 0,
                    connection_id,
                },
                _ => MessageKind::Ack { connection_id },
            })
        }

        other => Err(Error::UnknownFlag(other)),
    }
}

/// Whether a completed receive of `length` bytes carries enough data for its
/// declared protocol flag. A data frame needs the full header plus at least
/// one payload byte; an id frame needs the flag plus the id; control frames
/// need the header plus the fixed body.
pub fn validate_length(flag: u16, length: usize) -> bool {
    match flag {
        FLAG_DATA => length >= DATA_HEADER_LEN + 1,
        FLAG_ID => length >= CONNECTION_ID_FRAME_LEN,
        FLAG_SYN | FLAG_SYN_ACK | FLAG_ACK => length >= CONTROL_FRAME_LEN,
        _ => false,
    }
}

/// Read the sequence-number field of a data frame without a full parse.
/// Returns `None` when the buffer is not a data frame long enough to hold one.
pub fn sequence_number(buffer: &[u8]) -> Option<i64> {
    if buffer.len() < PROTOCOL_FLAG_LEN + SEQUENCE_NUMBER_LEN {
        return None;
    }
    if u16::from_le_bytes([buffer[0], buffer[1]]) != FLAG_DATA {
        return None;
    }
    Some(read_i64(buffer, PROTOCOL_FLAG_LEN))
}

/// Write a compact connection-id frame into `buffer`. Returns the frame length.
pub fn write_connection_id(buffer: &mut [u8], id: &ConnectionId) -> Result<usize, Error> {
    let mut cursor = ParseCursor::new(buffer);
    cursor.try_put_u16_le(FLAG_ID)?;
    cursor.try_put_bytes(id.as_bytes())?;
    Ok(CONNECTION_ID_FRAME_LEN)
}

/// Write a data-frame header (flag, sequence, sender timestamp, tick rate)
/// into the first 26 bytes of `buffer`.
pub fn write_data_header(
    buffer: &mut [u8],
    sequence: i64,
    sender_qpc: i64,
    sender_qpf: i64,
) -> Result<(), Error> {
    let mut cursor = ParseCursor::new(buffer);
    cursor.try_put_u16_le(FLAG_DATA)?;
    cursor.try_put_i64_le(sequence)?;
    cursor.try_put_i64_le(sender_qpc)?;
    cursor.try_put_i64_le(sender_qpf)?;
    Ok(())
}

/// Flavor of control frame to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Syn,
    SynAck { accept: bool },
    Ack,
}

/// Write a control frame (SYN / SYN_ACK / ACK) into `buffer`. The header's
/// sequence and timestamp fields are zero. Returns the frame length.
pub fn write_control(
    buffer: &mut [u8],
    kind: ControlKind,
    id: &ConnectionId,
) -> Result<usize, Error> {
    let (flag, control_flags) = match kind {
        ControlKind::Syn => (FLAG_SYN, 0),
        ControlKind::SynAck { accept } => {
            (FLAG_SYN_ACK, if accept { CONTROL_FLAG_ACCEPT } else { 0 })
        }
        ControlKind::Ack => (FLAG_ACK, 0),
    };

    let mut cursor = ParseCursor::new(buffer);
    cursor.try_put_u16_le(flag)?;
    cursor.try_put_i64_le(0)?; // sequence
    cursor.try_put_i64_le(0)?; // timestamp
    cursor.try_put_i64_le(0)?; // tick rate
    cursor.try_put_u8(CONTROL_VERSION)?;
    cursor.try_put_u8(control_flags)?;
    cursor.try_put_bytes(&[0, 0])?; // reserved
    cursor.try_put_bytes(id.as_bytes())?;
    Ok(CONTROL_FRAME_LEN)
}

#[inline]
fn read_i64(buffer: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buffer[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}
