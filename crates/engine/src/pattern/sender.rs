//! The sending role: announce a connection id, then emit one frame's worth
//! of sends per frame interval until the stream length is reached.

use std::sync::{Arc, Mutex, Weak};

use jitterpump_protocol::{parse, ConnectionId, MessageKind, START_MESSAGE};
use tracing::{debug, error};

use crate::clock;
use crate::context::Context;
use crate::pattern::{IoPattern, IoStatus, TaskSink};
use crate::ratelimit::RateLimiter;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::task::{Task, TaskAction, TaskBuffer};
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    NotStarted,
    IdSent,
    IoStarted,
}

pub struct MediaStreamSender {
    ctx: Arc<Context>,
    frame_size_bytes: u32,
    frame_rate_fps: u32,
    final_frame: i64,
    send_start: bool,
    self_weak: Weak<MediaStreamSender>,
    inner: Mutex<SenderInner>,
}

struct SenderInner {
    state: SenderState,
    base_time_ms: i64,
    current_frame: i64,
    current_frame_requested: u32,
    current_frame_completed: u32,
    sent_start_already: bool,
    start_timer: Option<TimerHandle>,
    connection_id: ConnectionId,
    stats: ConnectionStats,
    task_sink: Option<TaskSink>,
    limiter: RateLimiter,
}

impl MediaStreamSender {
    /// `connection_id` is the flow label this side announces: the id the
    /// server assigned on accept, or a fresh one for a pushing client.
    pub fn new(ctx: &Arc<Context>, send_start: bool, connection_id: ConnectionId) -> Arc<Self> {
        let media = &ctx.settings.media;

        let pattern = Arc::new_cyclic(|self_weak| Self {
            ctx: Arc::clone(ctx),
            frame_size_bytes: media.frame_size_bytes(),
            frame_rate_fps: media.frames_per_second,
            final_frame: media.final_frame(),
            send_start,
            self_weak: self_weak.clone(),
            inner: Mutex::new(SenderInner {
                state: SenderState::NotStarted,
                base_time_ms: 0,
                current_frame: 0,
                current_frame_requested: 0,
                current_frame_completed: 0,
                sent_start_already: false,
                start_timer: None,
                connection_id,
                stats: ConnectionStats::new(),
                task_sink: None,
                limiter: RateLimiter::new(
                    ctx.settings.bytes_per_second,
                    ctx.settings.rate_quantum_ms,
                ),
            }),
        });

        if send_start {
            let mut inner = pattern.inner.lock().unwrap();
            inner.start_timer = Some(pattern.arm_start_timer());
        }

        pattern
    }

    /// 500 ms plus one frame interval, giving the receiver time to settle.
    fn start_delay_ms(&self) -> i64 {
        500 + i64::from(1000 / self.frame_rate_fps.max(1))
    }

    fn arm_start_timer(&self) -> TimerHandle {
        let weak = self.self_weak.clone();
        self.ctx.timers.schedule(
            clock::relative_deadline(self.start_delay_ms()),
            move || {
                if let Some(pattern) = weak.upgrade() {
                    pattern.start_tick();
                }
            },
        )
    }

    /// One-shot nudge: post an out-of-band START datagram unless the stream
    /// is already underway.
    fn start_tick(self: &Arc<Self>) {
        let mut emit: Option<(TaskSink, Task)> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.sent_start_already || inner.state != SenderState::NotStarted {
                return;
            }

            debug!("media-stream sender nudging receiver with START");
            inner.sent_start_already = true;
            inner.start_timer = Some(self.arm_start_timer());

            if let Some(sink) = inner.task_sink.clone() {
                let mut task = Task::send_static(START_MESSAGE);
                task.track_io = false;
                emit = Some((sink, task));
            }
        }

        if let Some((sink, task)) = emit {
            sink(task);
        }
    }

    fn cancel_start_timer(inner: &mut SenderInner) {
        if let Some(timer) = inner.start_timer.take() {
            timer.cancel();
        }
    }
}

impl IoPattern for MediaStreamSender {
    fn initiate_io(&self) -> Task {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            SenderState::NotStarted => {
                let mut task = Task::send_connection_id(&inner.connection_id);
                task.track_io = false;
                inner.state = SenderState::IdSent;
                task
            }

            SenderState::IdSent | SenderState::IoStarted => {
                if inner.state == SenderState::IdSent {
                    inner.base_time_ms = clock::now_ms();
                    inner.state = SenderState::IoStarted;
                    // IO is underway; no more START nudges
                    Self::cancel_start_timer(&mut inner);
                }

                if inner.current_frame_requested < self.frame_size_bytes {
                    let mut task = Task::send_payload(self.frame_size_bytes);

                    // pace the frame to its slot in the stream timeline
                    let pacing = inner.base_time_ms
                        + inner.current_frame * 1000 / i64::from(self.frame_rate_fps)
                        - clock::now_ms();
                    inner
                        .limiter
                        .update_time_offset(&mut task, u64::from(self.frame_size_bytes));
                    task.time_offset_ms = task.time_offset_ms.max(pacing);

                    inner.current_frame_requested += task.length;
                    task
                } else {
                    // the current frame is fully requested; nothing more
                    // until a send completes
                    Task::none()
                }
            }
        }
    }

    fn complete_io(
        &self,
        task: &Task,
        completed_bytes: u32,
        error_code: i32,
        data: &[u8],
    ) -> IoStatus {
        let mut emit: Option<(TaskSink, Task)> = None;

        let status = {
            let mut inner = self.inner.lock().unwrap();

            match task.action {
                TaskAction::Abort => {
                    inner.stats.end_statistics();
                    return IoStatus::CompletedIo;
                }
                TaskAction::FatalAbort => {
                    inner.stats.end_statistics();
                    return IoStatus::FailedIo;
                }
                _ => {}
            }

            if error_code != 0 {
                error!(error_code, "media-stream sender saw a failed {}", task.action);
                inner.stats.end_statistics();
                return IoStatus::FailedIo;
            }

            if task.action == TaskAction::Recv {
                // the peer talks back only to handshake
                match parse(&data[..completed_bytes as usize]) {
                    Ok(MessageKind::Start) => {
                        if let Some(sink) = inner.task_sink.clone() {
                            let mut reply = Task::send_connection_id(&inner.connection_id);
                            reply.track_io = false;
                            emit = Some((sink, reply));
                        }
                    }
                    Ok(MessageKind::ConnectionId(bytes)) => {
                        if let Ok(id) = ConnectionId::from_slice(bytes) {
                            inner.connection_id = id;
                        }
                    }
                    Ok(_) | Err(_) => {
                        debug!("media-stream sender ignoring unexpected datagram");
                    }
                }
                IoStatus::ContinueIo
            } else if !matches!(task.buffer, TaskBuffer::ConnectionIdFrame { .. })
                && !matches!(task.buffer, TaskBuffer::Static(_))
            {
                // data sends advance the frame accounting; connection-id and
                // START frames don't count toward the stream
                let bits = i64::from(completed_bytes) * 8;
                self.ctx.totals.add_bits_received(bits);
                inner.stats.bits_received += bits;

                inner.current_frame_completed += completed_bytes;
                if inner.current_frame_completed == self.frame_size_bytes {
                    inner.current_frame += 1;
                    inner.current_frame_requested = 0;
                    inner.current_frame_completed = 0;
                }

                if inner.current_frame >= self.final_frame {
                    inner.stats.end_statistics();
                    IoStatus::CompletedIo
                } else {
                    IoStatus::ContinueIo
                }
            } else {
                IoStatus::ContinueIo
            }
        };

        if let Some((sink, reply)) = emit {
            sink(reply);
        }
        status
    }

    fn set_task_sink(&self, sink: TaskSink) {
        self.inner.lock().unwrap().task_sink = Some(sink);
    }

    fn connection_id(&self) -> ConnectionId {
        self.inner.lock().unwrap().connection_id
    }

    fn stats(&self) -> StatsSnapshot {
        self.inner.lock().unwrap().stats.snapshot()
    }
}

impl Drop for MediaStreamSender {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        Self::cancel_start_timer(&mut inner);
    }
}
