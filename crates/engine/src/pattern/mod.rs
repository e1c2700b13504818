//! Per-connection media-stream state machines.
//!
//! A pattern emits [`Task`]s describing the I/O it wants and consumes the
//! completions; the executor (or the client's receive driver) performs the
//! actual socket work. Out-of-band tasks (START nudges, connection-id
//! replies, terminal aborts) flow through the pattern's task sink.

pub mod receiver;
pub mod sender;

pub use receiver::MediaStreamReceiver;
pub use sender::MediaStreamSender;

use std::sync::Arc;

use jitterpump_protocol::ConnectionId;

use crate::stats::StatsSnapshot;
use crate::task::Task;

/// Verdict returned from `complete_io`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Keep pumping `initiate_io`.
    ContinueIo,
    /// The stream finished cleanly; close the connection.
    CompletedIo,
    /// The stream failed; close the connection with an error.
    FailedIo,
}

/// Receives out-of-band tasks a pattern produces outside the
/// `initiate_io` / `complete_io` cycle (timer-driven work).
pub type TaskSink = Arc<dyn Fn(Task) + Send + Sync>;

pub trait IoPattern: Send + Sync {
    /// The next task the pattern wants issued, or an empty task.
    fn initiate_io(&self) -> Task;

    /// Feed one completion back. `data` holds the received datagram for
    /// receive completions and is empty for sends.
    fn complete_io(&self, task: &Task, completed_bytes: u32, error_code: i32, data: &[u8])
        -> IoStatus;

    /// Register where out-of-band tasks should be delivered.
    fn set_task_sink(&self, sink: TaskSink);

    fn connection_id(&self) -> ConnectionId;

    fn stats(&self) -> StatsSnapshot;
}
