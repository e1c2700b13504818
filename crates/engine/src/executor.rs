//! Per-peer task executor.
//!
//! A `ConnectedSocket` owns the "next task" slot for one peer under a
//! fine-grained lock and a deadline timer. Tasks due within 2 ms run inline;
//! later ones wait on the timer. Execution performs the actual send --
//! fragmenting oversize frames into header-carrying datagrams -- completes
//! the task back to the pattern, and keeps chaining `initiate_io` while the
//! pattern wants more work.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex, Weak};

use jitterpump_protocol::{write_data_header, DatagramSlicer, DATA_HEADER_LEN};
use tracing::{debug, error};

use crate::clock;
use crate::context::Context;
use crate::pattern::{IoPattern, IoStatus};
use crate::state::SocketState;
use crate::task::{fill_payload, Task, TaskAction, TaskBuffer};
use crate::timer::TimerHandle;

/// Result of one synchronous send pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOutcome {
    pub bytes: u32,
    pub code: i32,
}

pub struct ConnectedSocket {
    state: Weak<SocketState>,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    ctx: Arc<Context>,
    sequence_number: AtomicI64,
    connect_time_ms: i64,
    self_weak: Weak<ConnectedSocket>,
    inner: Mutex<ExecutorInner>,
}

struct ExecutorInner {
    next_task: Task,
    timer: Option<TimerHandle>,
}

impl ConnectedSocket {
    pub fn new(
        state: Weak<SocketState>,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        ctx: &Arc<Context>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            state,
            socket,
            remote,
            ctx: Arc::clone(ctx),
            sequence_number: AtomicI64::new(0),
            connect_time_ms: clock::now_ms(),
            self_weak: self_weak.clone(),
            inner: Mutex::new(ExecutorInner {
                next_task: Task::none(),
                timer: None,
            }),
        })
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn connect_time_ms(&self) -> i64 {
        self.connect_time_ms
    }

    fn next_sequence(&self) -> i64 {
        self.sequence_number.fetch_add(1, SeqCst) + 1
    }

    /// Accept a task from the pattern: run it now, or park it on the
    /// deadline timer.
    pub fn queue_task(&self, task: Task) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        state.increment_pended_io();

        let run_inline = {
            let mut inner = self.inner.lock().unwrap();
            if task.time_offset_ms < 2 {
                inner.next_task = task;
                true
            } else {
                let delay = clock::relative_deadline(task.time_offset_ms);
                // assign the task *and* arm the timer while holding the slot
                inner.next_task = task;
                let weak = self.self_weak.clone();
                inner.timer = Some(self.ctx.timers.schedule(delay, move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.run_next_task();
                    }
                }));
                false
            }
        };

        if run_inline {
            self.run_next_task();
        }
    }

    /// A datagram arrived for this peer: hand it to the pattern as a
    /// completed receive.
    pub fn complete_receive(&self, data: &[u8]) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let Some(pattern) = state.pattern() else {
            return;
        };

        let task = Task::recv(data.len() as u32);
        let status = pattern.complete_io(&task, data.len() as u32, 0, data);
        match status {
            IoStatus::ContinueIo => self.pump_pattern(&pattern),
            IoStatus::CompletedIo => state.complete_state(0),
            IoStatus::FailedIo => state.complete_state(libc::ECONNABORTED),
        }
    }

    /// Pull tasks out of the pattern and schedule them until it goes idle.
    /// Recv tasks are absorbed: the receive shard keeps receives posted on
    /// its own records, so they carry no work here.
    pub fn pump_pattern(&self, pattern: &Arc<dyn IoPattern>) {
        loop {
            let task = pattern.initiate_io();
            match task.action {
                TaskAction::None => return,
                TaskAction::Recv => continue,
                _ => self.queue_task(task),
            }
        }
    }

    /// Deadline-timer callback (also run inline for near deadlines): perform
    /// the pending task, complete it back to the pattern, then chain further
    /// tasks while the pattern keeps the connection going.
    fn run_next_task(&self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let Some(pattern) = state.pattern() else {
            state.decrement_pended_io();
            return;
        };

        let mut current = {
            let inner = self.inner.lock().unwrap();
            inner.next_task.clone()
        };

        let mut results = self.perform_io(&current);
        let mut status = pattern.complete_io(&current, results.bytes, results.code, &[]);

        while status == IoStatus::ContinueIo && current.action != TaskAction::None {
            current = pattern.initiate_io();

            match current.action {
                TaskAction::Send => {
                    if current.time_offset_ms < 2 {
                        // behind schedule: catch up inline instead of
                        // bouncing through the timer
                        {
                            let mut inner = self.inner.lock().unwrap();
                            inner.next_task = current.clone();
                        }
                        results = self.perform_io(&current);
                        status =
                            pattern.complete_io(&current, results.bytes, results.code, &[]);
                    } else {
                        state.increment_pended_io();
                        let mut inner = self.inner.lock().unwrap();
                        let delay = clock::relative_deadline(current.time_offset_ms);
                        inner.next_task = current.clone();
                        let weak = self.self_weak.clone();
                        inner.timer = Some(self.ctx.timers.schedule(delay, move || {
                            if let Some(socket) = weak.upgrade() {
                                socket.run_next_task();
                            }
                        }));
                    }
                }

                TaskAction::None => break,

                // receives are pre-posted by the shard
                TaskAction::Recv => continue,

                TaskAction::Abort | TaskAction::FatalAbort => {
                    // terminal tasks complete immediately without touching
                    // the wire
                    results = SendOutcome::default();
                    status = pattern.complete_io(&current, 0, 0, &[]);
                }

                other => {
                    error!("unexpected task action {other} returned from initiate_io");
                    break;
                }
            }
        }

        match status {
            IoStatus::FailedIo => {
                // guarantee a failed error code is reported
                let code = if results.code == 0 {
                    libc::ECONNABORTED
                } else {
                    results.code
                };
                self.ctx.status.error_info(&format!(
                    "media-stream socket ({}) failed IO - aborting this stream",
                    self.remote
                ));
                state.decrement_pended_io();
                state.complete_state(code);
            }
            IoStatus::CompletedIo => {
                debug!(remote = %self.remote, "stream complete - closing this connection");
                state.decrement_pended_io();
                state.complete_state(results.code);
            }
            IoStatus::ContinueIo => {
                state.decrement_pended_io();
            }
        }
    }

    /// Perform the actual socket work for a task. Send failures come back as
    /// OS error codes; the pattern decides whether they are terminal.
    fn perform_io(&self, task: &Task) -> SendOutcome {
        match (&task.action, &task.buffer) {
            (TaskAction::Send, TaskBuffer::Static(bytes)) => self.send_datagram(bytes),

            (TaskAction::Send, TaskBuffer::ConnectionIdFrame { frame }) => {
                let outcome = self.send_datagram(&frame[..task.length as usize]);
                if outcome.code != 0 {
                    self.ctx.status.error_info(&format!(
                        "send of the connection id to {} failed [{}]",
                        self.remote, outcome.code
                    ));
                }
                outcome
            }

            (TaskAction::Send, TaskBuffer::Payload { length }) => self.send_frame(*length),

            _ => SendOutcome::default(),
        }
    }

    /// Send one media frame, fragmented into datagrams no larger than the
    /// configured maximum. Every datagram carries the full header with this
    /// frame's sequence number and a fresh timestamp.
    fn send_frame(&self, frame_size: u32) -> SendOutcome {
        let sequence = self.next_sequence();
        let max_datagram = self.ctx.settings.media.datagram_max_size;

        let slicer = match DatagramSlicer::new(frame_size, max_datagram) {
            Ok(slicer) => slicer,
            Err(e) => {
                self.ctx
                    .status
                    .error_info(&format!("cannot frame {frame_size} bytes: {e}"));
                return SendOutcome {
                    bytes: 0,
                    code: libc::EINVAL,
                };
            }
        };

        let mut scratch = vec![0u8; max_datagram as usize];
        let mut outcome = SendOutcome::default();

        for chunk in slicer {
            let datagram = &mut scratch[..chunk.datagram_len as usize];
            // header write cannot fail: the datagram always fits it
            let _ = write_data_header(
                datagram,
                sequence,
                clock::now_ticks(),
                clock::TICKS_PER_SECOND,
            );
            fill_payload(&mut datagram[DATA_HEADER_LEN..], 0);

            match self.socket.send_to(datagram, self.remote) {
                Ok(sent) => {
                    outcome.bytes += sent as u32;
                    debug!(
                        sequence,
                        sent,
                        frame_bytes = outcome.bytes,
                        "sent media datagram"
                    );
                }
                Err(e) => {
                    let code = e.raw_os_error().unwrap_or(libc::EIO);
                    if code == libc::EMSGSIZE {
                        self.ctx.status.error_info(&format!(
                            "send_to({}, seq {sequence}) failed with EMSGSIZE: attempted \
                             to send a datagram of {} bytes",
                            self.remote, chunk.datagram_len
                        ));
                    } else {
                        self.ctx.status.error_info(&format!(
                            "send_to({}, seq {sequence}) failed [{code}]",
                            self.remote
                        ));
                    }
                    outcome.code = code;
                    return outcome;
                }
            }
        }

        outcome
    }

    fn send_datagram(&self, bytes: &[u8]) -> SendOutcome {
        match self.socket.send_to(bytes, self.remote) {
            Ok(sent) => SendOutcome {
                bytes: sent as u32,
                code: 0,
            },
            Err(e) => SendOutcome {
                bytes: 0,
                code: e.raw_os_error().unwrap_or(libc::EIO),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaStreamSettings, Settings};

    fn test_context(max_datagram: u32) -> Arc<Context> {
        let settings = Settings {
            target_addresses: vec!["127.0.0.1:1".parse().unwrap()],
            media: MediaStreamSettings {
                datagram_max_size: max_datagram,
                ..Default::default()
            },
            ..Default::default()
        };
        Context::new(settings)
    }

    fn socket_pair() -> (Arc<UdpSocket>, UdpSocket, SocketAddr) {
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_millis(500)))
            .unwrap();
        let remote = receiver.local_addr().unwrap();
        (Arc::new(sender), receiver, remote)
    }

    #[test]
    fn frames_are_fragmented_with_shared_sequence() {
        let ctx = test_context(256);
        let (sender, receiver, remote) = socket_pair();

        let executor = ConnectedSocket::new(Weak::new(), sender, remote, &ctx);
        let outcome = executor.send_frame(600);
        assert_eq!(outcome.code, 0);
        assert_eq!(outcome.bytes, 600);

        let mut buf = [0u8; 1500];
        let mut total = 0u32;
        let mut sequences = Vec::new();
        while total < 600 {
            let (n, _) = receiver.recv_from(&mut buf).unwrap();
            total += n as u32;
            sequences.push(jitterpump_protocol::sequence_number(&buf[..n]).unwrap());
            assert!(n <= 256);
        }

        assert_eq!(total, 600);
        assert!(sequences.iter().all(|&s| s == 1));
    }

    #[test]
    fn sequence_numbers_increment_per_frame() {
        let ctx = test_context(1472);
        let (sender, receiver, remote) = socket_pair();

        let executor = ConnectedSocket::new(Weak::new(), sender, remote, &ctx);
        executor.send_frame(100);
        executor.send_frame(100);

        let mut buf = [0u8; 1500];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(jitterpump_protocol::sequence_number(&buf[..n]), Some(1));
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(jitterpump_protocol::sequence_number(&buf[..n]), Some(2));
    }

    #[test]
    fn payload_survives_the_wire_verification() {
        let ctx = test_context(1472);
        let (sender, receiver, remote) = socket_pair();

        let executor = ConnectedSocket::new(Weak::new(), sender, remote, &ctx);
        executor.send_frame(512);

        let mut buf = [0u8; 1500];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 512);
        assert!(crate::task::verify_payload(&buf[DATA_HEADER_LEN..n], 0));
    }
}
