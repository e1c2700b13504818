//! The receiving role: buffer a jitter-tolerant window of frames, render one
//! frame per interval, and classify what each slot held when its time came.
//!
//! The receiver owns a ring of `2 x initial_buffer_frames` entries
//! pre-seeded with sequence numbers 1..=ring_size. Arriving datagrams find
//! their pre-assigned slot (or are counted as error frames); a render timer
//! walks the head forward one slot per frame interval once the initial
//! buffer period has elapsed, rewriting each rendered slot's sequence to
//! `head_seq + ring_size` so assignment stays strictly monotonic.

use std::sync::{Arc, Mutex, Weak};

use jitterpump_protocol::{parse, ConnectionId, MessageKind, START_MESSAGE};
use tracing::{debug, error};

use crate::clock;
use crate::context::Context;
use crate::error::EngineError;
use crate::pattern::{IoPattern, IoStatus, TaskSink};
use crate::stats::{ConnectionStats, JitterFrameEntry, StatsSnapshot};
use crate::task::{verify_payload, Task, TaskAction};
use crate::timer::TimerHandle;

pub struct MediaStreamReceiver {
    ctx: Arc<Context>,
    frame_rate_ms_per_frame: f64,
    max_datagram_size: u32,
    frame_size_bytes: u32,
    final_frame: i64,
    initial_buffer_frames: i64,
    send_start: bool,
    self_weak: Weak<MediaStreamReceiver>,
    inner: Mutex<ReceiverInner>,
}

struct ReceiverInner {
    frame_entries: Vec<JitterFrameEntry>,
    head: usize,
    timer_wheel_offset_frames: i64,
    base_time_ms: i64,
    recv_needed: u32,
    finished_stream: bool,
    sent_start_already: bool,
    first_frame: JitterFrameEntry,
    previous_frame: JitterFrameEntry,
    connection_id: ConnectionId,
    stats: ConnectionStats,
    task_sink: Option<TaskSink>,
    render_timer: Option<TimerHandle>,
    start_timer: Option<TimerHandle>,
}

enum TickOutcome {
    Exit,
    Reloop,
}

impl MediaStreamReceiver {
    pub fn new(ctx: &Arc<Context>, send_start: bool) -> Result<Arc<Self>, EngineError> {
        let media = &ctx.settings.media;
        let final_frame = media.final_frame();

        // if the entire session fits in the initial buffer, shrink accordingly
        let initial_buffer_frames = final_frame
            .min(i64::from(media.buffer_depth_seconds) * i64::from(media.frames_per_second));

        const EXTRA_BUFFER_DEPTH_FACTOR: i64 = 2;
        let ring_size = EXTRA_BUFFER_DEPTH_FACTOR * initial_buffer_frames;
        if ring_size < EXTRA_BUFFER_DEPTH_FACTOR {
            return Err(EngineError::BufferTooShallow);
        }

        debug!(
            ring_size,
            frame_rate_ms = media.frame_rate_ms_per_frame(),
            "media-stream receiver ring sized for this connection"
        );

        // pre-populate the ring with the initial sequence numbers
        let frame_entries = (0..ring_size)
            .map(|i| JitterFrameEntry {
                sequence_number: i + 1,
                ..JitterFrameEntry::default()
            })
            .collect();

        Ok(Arc::new_cyclic(|self_weak| Self {
            ctx: Arc::clone(ctx),
            frame_rate_ms_per_frame: media.frame_rate_ms_per_frame(),
            max_datagram_size: media.datagram_max_size,
            frame_size_bytes: media.frame_size_bytes(),
            final_frame,
            initial_buffer_frames,
            send_start,
            self_weak: self_weak.clone(),
            inner: Mutex::new(ReceiverInner {
                frame_entries,
                head: 0,
                timer_wheel_offset_frames: initial_buffer_frames,
                base_time_ms: 0,
                recv_needed: ctx.settings.prepost_recvs,
                finished_stream: false,
                sent_start_already: false,
                first_frame: JitterFrameEntry::default(),
                previous_frame: JitterFrameEntry::default(),
                connection_id: ConnectionId::zero(),
                stats: ConnectionStats::new(),
                task_sink: None,
                render_timer: None,
                start_timer: None,
            }),
        }))
    }

    /// Slot index holding `sequence_number`, if it is inside the ring's
    /// current window.
    fn find_sequence_number(inner: &ReceiverInner, sequence_number: i64) -> Option<usize> {
        let head_sequence = inner.frame_entries[inner.head].sequence_number;
        let tail_sequence = head_sequence + inner.frame_entries.len() as i64 - 1;
        let vector_end_sequence = inner
            .frame_entries
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(0);

        if sequence_number < head_sequence || sequence_number > tail_sequence {
            return None;
        }

        if sequence_number <= vector_end_sequence {
            // offset from the head; this stretch hasn't wrapped
            Some(inner.head + (sequence_number - head_sequence) as usize)
        } else {
            // wrapped region at the vector's start
            Some((sequence_number - vector_end_sequence - 1) as usize)
        }
    }

    fn received_buffered_frames(inner: &ReceiverInner) -> bool {
        if inner.frame_entries[0].sequence_number > 1 {
            // a full ring's worth has already been rendered through slot 0
            return true;
        }
        if inner.head != 0 {
            return true;
        }
        inner.frame_entries.iter().any(|e| e.bytes_received > 0)
    }

    /// Arm the render timer for the next frame deadline. Returns whether a
    /// timer was scheduled; deadlines within 2 ms are handled inline by the
    /// caller instead.
    fn set_next_render_timer(&self, inner: &mut ReceiverInner, initial_timer: bool) -> bool {
        let mut offset = inner.base_time_ms;
        offset += (inner.timer_wheel_offset_frames as f64 * self.frame_rate_ms_per_frame) as i64;
        offset -= clock::now_ms();

        if initial_timer || offset > 2 {
            let weak = self.self_weak.clone();
            let handle = self
                .ctx
                .timers
                .schedule(clock::relative_deadline(offset), move || {
                    if let Some(pattern) = weak.upgrade() {
                        pattern.render_tick();
                    }
                });
            inner.render_timer = Some(handle);
            true
        } else {
            false
        }
    }

    fn set_next_start_timer(&self, inner: &mut ReceiverInner) {
        let delay = self.frame_rate_ms_per_frame as i64 + 500;
        let weak = self.self_weak.clone();
        let handle = self
            .ctx
            .timers
            .schedule(clock::relative_deadline(delay), move || {
                if let Some(pattern) = weak.upgrade() {
                    pattern.start_tick();
                }
            });
        inner.start_timer = Some(handle);
    }

    /// Render the head slot: classify what arrived for it, then advance the
    /// head and rewrite the slot's sequence to the new end of the window.
    fn render_frame(&self, inner: &mut ReceiverInner) {
        // estimate time in flight: how much longer this frame's arrival
        // lagged the first arrival than its send lagged the first send
        let head = inner.frame_entries[inner.head];
        if head.receiver_qpf != 0 && inner.first_frame.receiver_qpf != 0 {
            let ms_since_first_receive = (head.receiver_qpc as f64 * 1000.0
                / head.receiver_qpf as f64)
                - (inner.first_frame.receiver_qpc as f64 * 1000.0
                    / inner.first_frame.receiver_qpf as f64);
            let ms_since_first_send = (head.sender_qpc as f64 * 1000.0 / head.sender_qpf as f64)
                - (inner.first_frame.sender_qpc as f64 * 1000.0
                    / inner.first_frame.sender_qpf as f64);
            inner.frame_entries[inner.head].estimated_time_in_flight_ms =
                ms_since_first_receive - ms_since_first_send;
        }

        let head_entry = inner.frame_entries[inner.head];
        if head_entry.bytes_received == self.frame_size_bytes {
            self.ctx.totals.increment_successful();
            inner.stats.successful_frames += 1;

            debug!(sequence = head_entry.sequence_number, "rendered frame");
            self.ctx
                .status
                .jitter_update(&head_entry, &inner.previous_frame);

            // capture the first rendered frame as the jitter baseline
            if inner.first_frame.receiver_qpc == 0 {
                inner.first_frame = head_entry;
            }
            inner.previous_frame = head_entry;
        } else if head_entry.bytes_received < self.frame_size_bytes {
            self.ctx.totals.increment_dropped();
            inner.stats.dropped_frames += 1;

            debug!(
                sequence = head_entry.sequence_number,
                bytes = head_entry.bytes_received,
                "dropped frame"
            );

            // report with a zero jitter baseline so no jitter is derived
            // from a frame that never (fully) arrived
            let dropped = JitterFrameEntry {
                sequence_number: head_entry.sequence_number,
                ..JitterFrameEntry::default()
            };
            self.ctx
                .status
                .jitter_update(&dropped, &JitterFrameEntry::default());
        } else {
            self.ctx.totals.increment_duplicate();
            inner.stats.duplicate_frames += 1;

            debug!(
                sequence = head_entry.sequence_number,
                bytes = head_entry.bytes_received,
                "duplicate frame"
            );
        }

        // the slot becomes the new end of the window
        let ring_size = inner.frame_entries.len() as i64;
        let slot = &mut inner.frame_entries[inner.head];
        slot.sequence_number += ring_size;
        slot.bytes_received = 0;

        inner.head += 1;
        if inner.head == inner.frame_entries.len() {
            inner.head = 0;
        }
    }

    /// Render-timer callback: process frames until the next deadline is far
    /// enough away to wait for.
    fn render_tick(self: &Arc<Self>) {
        eprintln!("render_tick called");
        loop {
            let mut emit: Vec<(TaskSink, Task)> = Vec::new();

            let outcome = {
                let mut inner = self.inner.lock().unwrap();
                if inner.finished_stream {
                    TickOutcome::Exit
                } else {
                    inner.timer_wheel_offset_frames += 1;

                    let mut fatal_aborted = false;
                    if inner.timer_wheel_offset_frames >= self.initial_buffer_frames
                        && inner.frame_entries[inner.head].sequence_number <= self.final_frame
                    {
                        if !Self::received_buffered_frames(&inner) {
                            // nothing ever arrived from the sender
                            self.ctx.status.error_info(
                                "media-stream receiver aborting the connection - \
                                 received nothing from the sender",
                            );

                            self.ctx.totals.add_dropped(self.final_frame);
                            inner.stats.dropped_frames += self.final_frame as u64;
                            inner.stats.end_statistics();
                            inner.finished_stream = true;

                            if let Some(sink) = inner.task_sink.clone() {
                                emit.push((sink, Task::fatal_abort()));
                            }
                            fatal_aborted = true;
                        } else {
                            self.render_frame(&mut inner);
                        }
                    }

                    if fatal_aborted {
                        TickOutcome::Exit
                    } else if inner.frame_entries[inner.head].sequence_number <= self.final_frame {
                        if self.set_next_render_timer(&mut inner, false) {
                            TickOutcome::Exit
                        } else {
                            // the next deadline is (nearly) due; keep going
                            TickOutcome::Reloop
                        }
                    } else {
                        debug!("media-stream receiver issuing an abort to close the stream");
                        inner.finished_stream = true;
                        inner.stats.end_statistics();
                        if let Some(sink) = inner.task_sink.clone() {
                            emit.push((sink, Task::abort()));
                        }
                        TickOutcome::Exit
                    }
                }
            };

            eprintln!("render_tick emit.len={} outcome set", emit.len());
            for (sink, task) in emit {
                eprintln!("calling sink");
                sink(task);
                eprintln!("sink returned");
            }

            match outcome {
                TickOutcome::Exit => { eprintln!("render_tick exit"); return; }
                TickOutcome::Reloop => { eprintln!("render_tick reloop"); continue; }
            }
        }
    }

    /// Start-timer callback: resend START while nothing has arrived, and
    /// disarm outright once the stream is underway.
    fn start_tick(self: &Arc<Self>) {
        let mut emit: Option<(TaskSink, Task)> = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.finished_stream {
                return;
            }

            if Self::received_buffered_frames(&inner) {
                // the sender has started; no more wakeups needed
                if let Some(timer) = inner.start_timer.take() {
                    timer.cancel();
                }
                return;
            }

            if self.send_start && !inner.sent_start_already {
                debug!("media-stream receiver sending START");
                inner.sent_start_already = true;
                self.set_next_start_timer(&mut inner);

                if let Some(sink) = inner.task_sink.clone() {
                    let mut task = Task::send_static(START_MESSAGE);
                    task.track_io = false;
                    emit = Some((sink, task));
                }
            } else {
                // keep checking until the sender starts or buffering completes
                self.set_next_start_timer(&mut inner);
            }
        }

        if let Some((sink, task)) = emit {
            sink(task);
        }
    }

    fn complete_receive(
        &self,
        inner: &mut ReceiverInner,
        completed_bytes: u32,
        data: &[u8],
        emit: &mut Vec<(TaskSink, Task)>,
    ) -> IoStatus {
        let receiver_qpc = clock::now_ticks();

        if completed_bytes == 0 {
            if inner.finished_stream {
                // the final recv can complete empty once the sender closes
                return IoStatus::ContinueIo;
            }
            self.ctx
                .status
                .error_info("media-stream receiver received a zero-byte datagram");
            inner.recv_needed += 1;
            return IoStatus::ContinueIo;
        }

        let message = match parse(&data[..completed_bytes as usize]) {
            Ok(message) => message,
            Err(e) => {
                self.ctx.status.error_info(&format!(
                    "media-stream receiver could not parse a datagram: {e}"
                ));
                inner.recv_needed += 1;
                return IoStatus::ContinueIo;
            }
        };

        match message {
            MessageKind::Start => {
                // reply with our connection id
                if let Some(sink) = inner.task_sink.clone() {
                    let mut reply = Task::send_connection_id(&inner.connection_id);
                    reply.track_io = false;
                    emit.push((sink, reply));
                }
                inner.recv_needed += 1;
            }

            MessageKind::ConnectionId(bytes) => {
                if let Ok(id) = ConnectionId::from_slice(bytes) {
                    inner.connection_id = id;
                }
                inner.recv_needed += 1;
            }

            MessageKind::Syn { .. } | MessageKind::SynAck { .. } | MessageKind::Ack { .. } => {
                debug!("media-stream receiver ignoring a control frame");
                inner.recv_needed += 1;
            }

            MessageKind::Data {
                sequence,
                sender_qpc,
                sender_qpf,
                payload,
            } => {
                if !verify_payload(payload, 0) {
                    self.ctx.totals.increment_error();
                    inner.stats.error_frames += 1;
                    self.ctx.status.error_info(
                        "media-stream receiver received a corrupted datagram payload",
                    );
                    inner.recv_needed += 1;
                    return IoStatus::ContinueIo;
                }

                let bits = i64::from(completed_bytes) * 8;
                self.ctx.totals.add_bits_received(bits);
                inner.stats.bits_received += bits;

                if sequence > self.final_frame {
                    self.ctx.totals.increment_error();
                    inner.stats.error_frames += 1;
                    debug!(
                        sequence,
                        final_frame = self.final_frame,
                        "received an unknown sequence number beyond the final frame"
                    );
                } else {
                    match Self::find_sequence_number(inner, sequence) {
                        Some(slot) => {
                            let entry = &mut inner.frame_entries[slot];
                            // always overwrite with the latest datagram's clocks
                            entry.sender_qpc = sender_qpc;
                            entry.sender_qpf = sender_qpf;
                            entry.receiver_qpc = receiver_qpc;
                            entry.receiver_qpf = clock::TICKS_PER_SECOND;
                            entry.bytes_received += completed_bytes;

                            debug!(
                                sequence,
                                bytes = completed_bytes,
                                frame_bytes = entry.bytes_received,
                                "received datagram"
                            );

                            // close the statistics window on the final frame;
                            // not exact under reordering but close
                            if sequence == self.final_frame {
                                inner.stats.end_statistics();
                            }
                        }
                        None => {
                            self.ctx.totals.increment_error();
                            inner.stats.error_frames += 1;

                            let head_sequence =
                                inner.frame_entries[inner.head].sequence_number;
                            if sequence < head_sequence {
                                debug!(sequence, head_sequence, "received a stale sequence number");
                            } else {
                                debug!(
                                    sequence,
                                    head_sequence,
                                    tail_sequence =
                                        head_sequence + inner.frame_entries.len() as i64 - 1,
                                    "received a future sequence number"
                                );
                            }
                        }
                    }
                }

                inner.recv_needed += 1;
            }
        }

        IoStatus::ContinueIo
    }
}

impl IoPattern for MediaStreamReceiver {
    fn initiate_io(&self) -> Task {
        let mut inner = self.inner.lock().unwrap();

        if inner.base_time_ms == 0 {
            // first use: anchor the timeline and arm both timers
            inner.base_time_ms = clock::now_ms();
            self.set_next_start_timer(&mut inner);
            let _ = self.set_next_render_timer(&mut inner, true);
        }

        if inner.recv_needed > 0 {
            inner.recv_needed -= 1;
            Task::recv(self.frame_size_bytes.min(self.max_datagram_size))
        } else {
            Task::none()
        }
    }

    fn complete_io(
        &self,
        task: &Task,
        completed_bytes: u32,
        error_code: i32,
        data: &[u8],
    ) -> IoStatus {
        let mut emit: Vec<(TaskSink, Task)> = Vec::new();

        let status = {
            let mut inner = self.inner.lock().unwrap();

            match task.action {
                TaskAction::Abort => {
                    debug_assert!(inner.finished_stream, "abort before the stream finished");
                    inner.stats.end_statistics();
                    IoStatus::CompletedIo
                }

                TaskAction::FatalAbort => {
                    inner.stats.end_statistics();
                    IoStatus::FailedIo
                }

                TaskAction::Recv => {
                    if error_code != 0 {
                        if inner.finished_stream {
                            IoStatus::CompletedIo
                        } else {
                            error!(error_code, "media-stream receiver recv failed");
                            inner.stats.end_statistics();
                            IoStatus::FailedIo
                        }
                    } else {
                        self.complete_receive(&mut inner, completed_bytes, data, &mut emit)
                    }
                }

                // completion of one of our own sends (START or id reply)
                _ => IoStatus::ContinueIo,
            }
        };

        for (sink, task) in emit {
            sink(task);
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

impl Drop for MediaStreamReceiver {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.start_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = inner.render_timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MediaStreamSettings, Settings};
    use jitterpump_protocol::DATA_HEADER_LEN;

    /// 30 fps, 1-second stream, 1-second buffer: 30 frames, ring size 60.
    fn test_context() -> Arc<Context> {
        let settings = Settings {
            target_addresses: vec!["127.0.0.1:1".parse().unwrap()],
            media: MediaStreamSettings {
                bits_per_second: 983_040, // 4096-byte frames at 30 fps
                frames_per_second: 30,
                buffer_depth_seconds: 1,
                stream_length_seconds: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        Context::new(settings)
    }

    fn test_receiver(ctx: &Arc<Context>) -> Arc<MediaStreamReceiver> {
        MediaStreamReceiver::new(ctx, false).unwrap()
    }

    #[test]
    fn ring_is_seeded_with_initial_sequences() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let inner = receiver.inner.lock().unwrap();

        assert_eq!(inner.frame_entries.len(), 60);
        for (i, entry) in inner.frame_entries.iter().enumerate() {
            assert_eq!(entry.sequence_number, i as i64 + 1);
            assert_eq!(entry.bytes_received, 0);
        }
    }

    #[test]
    fn session_smaller_than_buffer_shrinks_the_ring() {
        let settings = Settings {
            target_addresses: vec!["127.0.0.1:1".parse().unwrap()],
            media: MediaStreamSettings {
                bits_per_second: 983_040,
                frames_per_second: 10,
                buffer_depth_seconds: 30,
                stream_length_seconds: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = Context::new(settings);
        let receiver = test_receiver(&ctx);

        // 10 total frames < 300 buffered frames: ring is 2 x 10
        assert_eq!(receiver.inner.lock().unwrap().frame_entries.len(), 20);
    }

    #[test]
    fn find_sequence_number_covers_the_window() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let inner = receiver.inner.lock().unwrap();

        // head at slot 0, window 1..=60
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 1), Some(0));
        assert_eq!(
            MediaStreamReceiver::find_sequence_number(&inner, 60),
            Some(59)
        );
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 0), None);
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 61), None);
    }

    #[test]
    fn find_sequence_number_handles_the_wrapped_region() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let mut inner = receiver.inner.lock().unwrap();

        // render two frames: head moves to slot 2, slots 0..2 become 61, 62
        receiver.render_frame(&mut inner);
        receiver.render_frame(&mut inner);

        assert_eq!(inner.head, 2);
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 3), Some(2));
        assert_eq!(
            MediaStreamReceiver::find_sequence_number(&inner, 60),
            Some(59)
        );
        // wrapped: 61 and 62 live at the vector's start
        assert_eq!(
            MediaStreamReceiver::find_sequence_number(&inner, 61),
            Some(0)
        );
        assert_eq!(
            MediaStreamReceiver::find_sequence_number(&inner, 62),
            Some(1)
        );
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 63), None);
        // the stale window is closed
        assert_eq!(MediaStreamReceiver::find_sequence_number(&inner, 2), None);
    }

    #[test]
    fn rendering_advances_head_sequence_monotonically() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let mut inner = receiver.inner.lock().unwrap();

        for k in 0..75 {
            let head_sequence = inner.frame_entries[inner.head].sequence_number;
            assert_eq!(head_sequence, k + 1);

            // every slot stays within [head_seq, head_seq + ring - 1]
            let ring = inner.frame_entries.len() as i64;
            for entry in &inner.frame_entries {
                assert!(entry.sequence_number >= head_sequence);
                assert!(entry.sequence_number <= head_sequence + ring - 1);
            }

            receiver.render_frame(&mut inner);
        }
    }

    #[test]
    fn render_classifies_by_received_bytes() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let mut inner = receiver.inner.lock().unwrap();

        // slot 0: exactly one frame's bytes; slot 1: nothing; slot 2: double
        inner.frame_entries[0].bytes_received = 4096;
        inner.frame_entries[2].bytes_received = 8192;

        receiver.render_frame(&mut inner);
        receiver.render_frame(&mut inner);
        receiver.render_frame(&mut inner);

        assert_eq!(inner.stats.successful_frames, 1);
        assert_eq!(inner.stats.dropped_frames, 1);
        assert_eq!(inner.stats.duplicate_frames, 1);
    }

    #[test]
    fn nothing_received_yet_is_detectable() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        let mut inner = receiver.inner.lock().unwrap();

        assert!(!MediaStreamReceiver::received_buffered_frames(&inner));

        inner.frame_entries[5].bytes_received = 100;
        assert!(MediaStreamReceiver::received_buffered_frames(&inner));

        inner.frame_entries[5].bytes_received = 0;
        receiver.render_frame(&mut inner);
        // the head has moved: the stream has clearly been underway
        assert!(MediaStreamReceiver::received_buffered_frames(&inner));
    }

    #[test]
    fn data_datagram_lands_in_its_slot() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        let mut frame = vec![0u8; 1000];
        jitterpump_protocol::write_data_header(&mut frame, 7, 123, clock::TICKS_PER_SECOND)
            .unwrap();
        crate::task::fill_payload(&mut frame[DATA_HEADER_LEN..], 0);

        let task = Task::recv(1472);
        let status = receiver.complete_io(&task, frame.len() as u32, 0, &frame);
        assert_eq!(status, IoStatus::ContinueIo);

        let inner = receiver.inner.lock().unwrap();
        let entry = &inner.frame_entries[6];
        assert_eq!(entry.sequence_number, 7);
        assert_eq!(entry.bytes_received, 1000);
        assert_eq!(entry.sender_qpc, 123);
        assert_eq!(inner.stats.bits_received, 8000);
        assert_eq!(inner.stats.error_frames, 0);
    }

    #[test]
    fn out_of_window_sequence_is_an_error_frame() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        // sequence 31 > final frame 30
        let mut frame = vec![0u8; 100];
        jitterpump_protocol::write_data_header(&mut frame, 31, 1, 1).unwrap();
        crate::task::fill_payload(&mut frame[DATA_HEADER_LEN..], 0);

        let task = Task::recv(1472);
        receiver.complete_io(&task, frame.len() as u32, 0, &frame);

        assert_eq!(receiver.inner.lock().unwrap().stats.error_frames, 1);
    }

    #[test]
    fn corrupted_payload_is_counted_not_fatal() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        let mut frame = vec![0u8; 200];
        jitterpump_protocol::write_data_header(&mut frame, 3, 1, 1).unwrap();
        crate::task::fill_payload(&mut frame[DATA_HEADER_LEN..], 0);
        frame[50] ^= 0xff;

        let task = Task::recv(1472);
        let status = receiver.complete_io(&task, frame.len() as u32, 0, &frame);

        assert_eq!(status, IoStatus::ContinueIo);
        let inner = receiver.inner.lock().unwrap();
        assert_eq!(inner.stats.error_frames, 1);
        assert_eq!(inner.frame_entries[2].bytes_received, 0);
    }

    #[test]
    fn start_literal_triggers_an_id_reply() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        let replies: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_replies = Arc::clone(&replies);
        receiver.set_task_sink(Arc::new(move |task| {
            sink_replies.lock().unwrap().push(task);
        }));

        let task = Task::recv(1472);
        let status = receiver.complete_io(&task, START_MESSAGE.len() as u32, 0, START_MESSAGE);
        assert_eq!(status, IoStatus::ContinueIo);
        assert_eq!(replies.lock().unwrap().len(), 1);
    }

    #[test]
    fn connection_id_frame_is_stored() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        let id = ConnectionId::generate();
        let mut frame = [0u8; jitterpump_protocol::CONNECTION_ID_FRAME_LEN];
        jitterpump_protocol::write_connection_id(&mut frame, &id).unwrap();

        let task = Task::recv(1472);
        receiver.complete_io(&task, frame.len() as u32, 0, &frame);
        assert_eq!(receiver.connection_id(), id);
    }

    #[test]
    fn zero_byte_recv_before_finish_is_logged_not_fatal() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        let task = Task::recv(1472);
        assert_eq!(receiver.complete_io(&task, 0, 0, &[]), IoStatus::ContinueIo);
    }

    #[test]
    fn recv_error_after_finish_completes_cleanly() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);
        receiver.inner.lock().unwrap().finished_stream = true;

        let task = Task::recv(1472);
        assert_eq!(
            receiver.complete_io(&task, 0, libc::ECONNRESET, &[]),
            IoStatus::CompletedIo
        );
    }

    #[test]
    fn recv_tasks_honor_the_prepost_budget() {
        let ctx = test_context();
        let receiver = test_receiver(&ctx);

        // prepost_recvs defaults to 2
        assert_eq!(receiver.initiate_io().action, TaskAction::Recv);
        assert_eq!(receiver.initiate_io().action, TaskAction::Recv);
        assert_eq!(receiver.initiate_io().action, TaskAction::None);

        // a completed receive replenishes the budget
        let mut frame = vec![0u8; 100];
        jitterpump_protocol::write_data_header(&mut frame, 1, 1, 1).unwrap();
        crate::task::fill_payload(&mut frame[DATA_HEADER_LEN..], 0);
        receiver.complete_io(&Task::recv(1472), frame.len() as u32, 0, &frame);

        assert_eq!(receiver.initiate_io().action, TaskAction::Recv);
    }
}
