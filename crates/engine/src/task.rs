//! The unit of work exchanged between a pattern and its executor.

use std::fmt::{Display, Formatter};

use jitterpump_protocol::{write_connection_id, ConnectionId, CONNECTION_ID_FRAME_LEN};

/// What the executor should do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskAction {
    #[default]
    None,
    Send,
    Recv,
    GracefulShutdown,
    HardShutdown,
    /// Clean terminal: the stream is complete.
    Abort,
    /// Dirty terminal: give up on the connection.
    FatalAbort,
}

impl Display for TaskAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskAction::None => "None",
            TaskAction::Send => "Send",
            TaskAction::Recv => "Recv",
            TaskAction::GracefulShutdown => "GracefulShutdown",
            TaskAction::HardShutdown => "HardShutdown",
            TaskAction::Abort => "Abort",
            TaskAction::FatalAbort => "FatalAbort",
        };
        f.write_str(name)
    }
}

/// What backs a task's bytes. Owning variants make buffer lifetimes explicit:
/// receive buffers live in the shard's records, small control frames travel
/// inside the task itself, and bulk payload is drawn from the shared
/// reference table at send time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskBuffer {
    #[default]
    Null,
    /// A process-lifetime literal, e.g. the START message.
    Static(&'static [u8]),
    /// A connection-id frame built into executor-owned scratch.
    ConnectionIdFrame {
        frame: [u8; CONNECTION_ID_FRAME_LEN],
    },
    /// `length` on-wire bytes of one media frame, filled from the reference
    /// payload table and fragmented by the executor.
    Payload { length: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Task {
    pub action: TaskAction,
    pub buffer: TaskBuffer,
    /// Byte count for receives; sends carry their own length in `buffer`.
    pub length: u32,
    /// Relative delay until the task should be issued.
    pub time_offset_ms: i64,
    /// Where in the reference payload this task's bytes start, for
    /// verification.
    pub expected_pattern_offset: u32,
    /// Whether the completion counts against tracked-IO accounting.
    pub track_io: bool,
}

impl Task {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn recv(length: u32) -> Self {
        Self {
            action: TaskAction::Recv,
            length,
            ..Self::default()
        }
    }

    pub fn send_static(bytes: &'static [u8]) -> Self {
        Self {
            action: TaskAction::Send,
            buffer: TaskBuffer::Static(bytes),
            length: bytes.len() as u32,
            ..Self::default()
        }
    }

    pub fn send_connection_id(id: &ConnectionId) -> Self {
        let mut frame = [0u8; CONNECTION_ID_FRAME_LEN];
        // the scratch is exactly one frame long; the write cannot fail
        let written = write_connection_id(&mut frame, id).unwrap_or(0);
        Self {
            action: TaskAction::Send,
            buffer: TaskBuffer::ConnectionIdFrame { frame },
            length: written as u32,
            ..Self::default()
        }
    }

    pub fn send_payload(length: u32) -> Self {
        Self {
            action: TaskAction::Send,
            buffer: TaskBuffer::Payload { length },
            length,
            track_io: true,
            ..Self::default()
        }
    }

    pub fn abort() -> Self {
        Self {
            action: TaskAction::Abort,
            ..Self::default()
        }
    }

    pub fn fatal_abort() -> Self {
        Self {
            action: TaskAction::FatalAbort,
            ..Self::default()
        }
    }
}

/// Reference payload table. Send paths fill outgoing payload from it
/// cyclically; receive paths verify against it.
pub static PAYLOAD_PATTERN: [u8; 256] = build_payload_pattern();

const fn build_payload_pattern() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = ((i * 37 + 11) % 251) as u8;
        i += 1;
    }
    table
}

/// Fill `buffer` with reference payload starting at `offset`.
pub fn fill_payload(buffer: &mut [u8], offset: u32) {
    for (i, slot) in buffer.iter_mut().enumerate() {
        *slot = PAYLOAD_PATTERN[(offset as usize + i) % PAYLOAD_PATTERN.len()];
    }
}

/// Verify `buffer` against the reference payload starting at `offset`.
pub fn verify_payload(buffer: &[u8], offset: u32) -> bool {
    buffer
        .iter()
        .enumerate()
        .all(|(i, b)| *b == PAYLOAD_PATTERN[(offset as usize + i) % PAYLOAD_PATTERN.len()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jitterpump_protocol::{parse, MessageKind};

    #[test]
    fn fill_then_verify_round_trips() {
        let mut buf = [0u8; 1000];
        fill_payload(&mut buf, 17);
        assert!(verify_payload(&buf, 17));
        assert!(!verify_payload(&buf, 18));
    }

    #[test]
    fn corruption_detected() {
        let mut buf = [0u8; 64];
        fill_payload(&mut buf, 0);
        buf[40] ^= 0xff;
        assert!(!verify_payload(&buf, 0));
    }

    #[test]
    fn connection_id_task_is_parseable() {
        let id = ConnectionId::generate();
        let task = Task::send_connection_id(&id);

        assert_eq!(task.action, TaskAction::Send);
        assert_eq!(task.length as usize, CONNECTION_ID_FRAME_LEN);
        let TaskBuffer::ConnectionIdFrame { frame } = &task.buffer else {
            panic!("wrong buffer kind");
        };
        match parse(frame).unwrap() {
            MessageKind::ConnectionId(bytes) => assert_eq!(bytes, id.as_bytes()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn default_task_does_nothing() {
        let task = Task::none();
        assert_eq!(task.action, TaskAction::None);
        assert_eq!(task.buffer, TaskBuffer::Null);
        assert_eq!(task.time_offset_ms, 0);
        assert!(!task.track_io);
    }
}
