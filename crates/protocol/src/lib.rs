// The protocol crate uses only safe Rust.
#![forbid(unsafe_code)]

pub mod cursor;
pub mod error;
pub mod id;
pub mod message;
pub mod slices;

// Re-export commonly used types
pub use error::Error;
pub use id::ConnectionId;
pub use message::{
    parse, sequence_number, validate_length, write_connection_id, write_control,
    write_data_header, ControlKind, MessageKind, CONNECTION_ID_FRAME_LEN, CONNECTION_ID_LEN,
    CONTROL_FRAME_LEN, DATA_HEADER_LEN, FLAG_ACK, FLAG_DATA, FLAG_ID, FLAG_SYN, FLAG_SYN_ACK,
    START_MESSAGE,
};
pub use slices::{DatagramChunk, DatagramSlicer};
