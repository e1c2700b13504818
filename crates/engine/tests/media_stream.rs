//! Receiver-pattern stream scenarios driven with real timers.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jitterpump_engine::config::{MediaStreamSettings, Settings};
use jitterpump_engine::context::Context;
use jitterpump_engine::pattern::{IoPattern, MediaStreamReceiver};
use jitterpump_engine::task::{fill_payload, Task, TaskAction};
use jitterpump_protocol::{write_data_header, DATA_HEADER_LEN};

const FRAME_SIZE: u32 = 1000;
const TOTAL_FRAMES: i64 = 10;

/// 10 fps, 1-second stream, 1-second buffer: 10 frames of 1000 bytes,
/// ring size 20, rendering starts one second in.
fn test_context() -> Arc<Context> {
    let settings = Settings {
        target_addresses: vec!["127.0.0.1:1".parse().unwrap()],
        media: MediaStreamSettings {
            bits_per_second: u64::from(FRAME_SIZE) * 8 * 10,
            frames_per_second: 10,
            buffer_depth_seconds: 1,
            stream_length_seconds: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    Context::new(settings)
}

fn data_frame(sequence: i64) -> Vec<u8> {
    let mut frame = vec![0u8; FRAME_SIZE as usize];
    write_data_header(
        &mut frame,
        sequence,
        jitterpump_engine::clock::now_ticks(),
        jitterpump_engine::clock::TICKS_PER_SECOND,
    )
    .unwrap();
    fill_payload(&mut frame[DATA_HEADER_LEN..], 0);
    frame
}

/// Collects the pattern's out-of-band tasks (the terminal Abort among them).
fn install_sink(pattern: &Arc<MediaStreamReceiver>) -> Arc<Mutex<Vec<Task>>> {
    let tasks: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_tasks = Arc::clone(&tasks);
    pattern.set_task_sink(Arc::new(move |task| {
        eprintln!("sink closure: locking");
        sink_tasks.lock().unwrap().push(task);
        eprintln!("sink closure: pushed");
    }));
    tasks
}

fn wait_for_terminal(tasks: &Mutex<Vec<Task>>, limit: Duration) -> Option<TaskAction> {
    let deadline = Instant::now() + limit;
    let mut n = 0;
    while Instant::now() < deadline {
        n += 1;
        if n % 20 == 0 { eprintln!("waited {} iters", n); }
        if let Some(action) = tasks
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.action)
            .find(|a| matches!(a, TaskAction::Abort | TaskAction::FatalAbort))
        {
            return Some(action);
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    None
}

#[test]
fn buffered_stream_renders_every_frame() {
    let ctx = test_context();
    let receiver = MediaStreamReceiver::new(&ctx, false).unwrap();
    let tasks = install_sink(&receiver);

    // first use arms the render timer and anchors the timeline
    eprintln!("about to initiate_io");
    assert_eq!(receiver.initiate_io().action, TaskAction::Recv);
    eprintln!("initiated");

    // the whole stream arrives during the buffer window, in order
    for sequence in 1..=TOTAL_FRAMES {
        let frame = data_frame(sequence);
        let task = Task::recv(frame.len() as u32);
        receiver.complete_io(&task, frame.len() as u32, 0, &frame);
    }

    let action = wait_for_terminal(&tasks, Duration::from_secs(10));
    assert_eq!(action, Some(TaskAction::Abort));

    let stats = receiver.stats();
    assert_eq!(stats.successful_frames, TOTAL_FRAMES as u64);
    assert_eq!(stats.dropped_frames, 0);
    assert_eq!(stats.duplicate_frames, 0);
    assert_eq!(stats.error_frames, 0);
    assert_eq!(stats.bits_received, i64::from(FRAME_SIZE) * 8 * TOTAL_FRAMES);

    ctx.shutdown();
}

#[test]
fn losing_every_other_frame_splits_the_classification() {
    let ctx = test_context();
    let receiver = MediaStreamReceiver::new(&ctx, false).unwrap();
    let tasks = install_sink(&receiver);

    assert_eq!(receiver.initiate_io().action, TaskAction::Recv);

    // only even-numbered frames arrive
    for sequence in 1..=TOTAL_FRAMES {
        if sequence % 2 == 0 {
            let frame = data_frame(sequence);
            let task = Task::recv(frame.len() as u32);
            receiver.complete_io(&task, frame.len() as u32, 0, &frame);
        }
    }

    let action = wait_for_terminal(&tasks, Duration::from_secs(10));
    assert_eq!(action, Some(TaskAction::Abort));

    let stats = receiver.stats();
    assert_eq!(stats.successful_frames, TOTAL_FRAMES as u64 / 2);
    assert_eq!(stats.dropped_frames, TOTAL_FRAMES as u64 / 2);
    assert_eq!(stats.duplicate_frames, 0);
    assert_eq!(stats.error_frames, 0);

    ctx.shutdown();
}

#[test]
fn duplicated_frames_are_classified() {
    let ctx = test_context();
    let receiver = MediaStreamReceiver::new(&ctx, false).unwrap();
    let tasks = install_sink(&receiver);

    assert_eq!(receiver.initiate_io().action, TaskAction::Recv);

    for sequence in 1..=TOTAL_FRAMES {
        let frame = data_frame(sequence);
        let task = Task::recv(frame.len() as u32);
        receiver.complete_io(&task, frame.len() as u32, 0, &frame);
        if sequence == 3 {
            // frame 3 arrives twice
            receiver.complete_io(&task, frame.len() as u32, 0, &frame);
        }
    }

    let action = wait_for_terminal(&tasks, Duration::from_secs(10));
    assert_eq!(action, Some(TaskAction::Abort));

    let stats = receiver.stats();
    assert_eq!(stats.successful_frames, TOTAL_FRAMES as u64 - 1);
    assert_eq!(stats.duplicate_frames, 1);
    assert_eq!(stats.dropped_frames, 0);

    ctx.shutdown();
}

#[test]
fn silent_sender_forces_a_fatal_abort() {
    let ctx = test_context();
    let receiver = MediaStreamReceiver::new(&ctx, false).unwrap();
    let tasks = install_sink(&receiver);

    assert_eq!(receiver.initiate_io().action, TaskAction::Recv);

    // nothing ever arrives; the first render tick gives up on the stream
    let action = wait_for_terminal(&tasks, Duration::from_secs(10));
    assert_eq!(action, Some(TaskAction::FatalAbort));

    let stats = receiver.stats();
    assert_eq!(stats.successful_frames, 0);
    assert_eq!(stats.dropped_frames, TOTAL_FRAMES as u64);

    ctx.shutdown();
}
