//! Full loopback run: a server broker streaming to a client broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jitterpump_engine::config::{MediaStreamSettings, PatternKind, Role, Settings};
use jitterpump_engine::context::{
    Context, ContextOptions, LogStatusSink, StatusSink,
};
use jitterpump_engine::stats::{JitterFrameEntry, StatsSnapshot};
use jitterpump_engine::SocketBroker;

const FRAME_SIZE: u32 = 1000;
const TOTAL_FRAMES: u64 = 10;

fn media() -> MediaStreamSettings {
    MediaStreamSettings {
        datagram_max_size: 1472,
        bits_per_second: u64::from(FRAME_SIZE) * 8 * 10,
        frames_per_second: 10,
        buffer_depth_seconds: 1,
        stream_length_seconds: 1,
    }
}

/// Captures per-connection summaries so the test can assert on final stats.
#[derive(Default)]
struct SummarySink {
    summaries: Mutex<Vec<(StatsSnapshot, i32)>>,
}

impl StatusSink for SummarySink {
    fn new_connection(&self, local: std::net::SocketAddr, remote: std::net::SocketAddr) {
        LogStatusSink.new_connection(local, remote);
    }

    fn jitter_update(&self, _frame: &JitterFrameEntry, _previous: &JitterFrameEntry) {}

    fn error_info(&self, message: &str) {
        LogStatusSink.error_info(message);
    }

    fn connection_summary(
        &self,
        _local: Option<std::net::SocketAddr>,
        _remote: Option<std::net::SocketAddr>,
        stats: &StatsSnapshot,
        error_code: i32,
    ) {
        self.summaries.lock().unwrap().push((*stats, error_code));
    }
}

#[test]
fn client_pulls_a_full_stream_from_the_server() {
    // server side: accept exactly one stream on an ephemeral port
    let server_settings = Settings {
        role: Role::Accept,
        listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        accept_limit: 1,
        server_exit_limit: 1,
        pattern: PatternKind::MediaStreamPull,
        media: media(),
        ..Default::default()
    };
    let server_ctx = Context::new(server_settings);

    // bind the listeners up front so the client can learn the port
    let server = server_ctx.server_instance().unwrap();
    let server_addr = server.listener_addresses()[0];

    let server_broker = SocketBroker::new(&server_ctx).unwrap();
    server_broker.start();

    // client side: one connection, collecting its summary
    let summary_sink = Arc::new(SummarySink::default());
    let client_settings = Settings {
        role: Role::Connect,
        target_addresses: vec![server_addr],
        iterations: 1,
        connection_limit: 1,
        connection_throttle_limit: 1,
        pattern: PatternKind::MediaStreamPull,
        media: media(),
        ..Default::default()
    };
    let client_ctx = Context::with_options(
        client_settings,
        ContextOptions {
            status: Some(Arc::clone(&summary_sink) as Arc<dyn StatusSink>),
            ..Default::default()
        },
    );

    let client_broker = SocketBroker::new(&client_ctx).unwrap();
    client_broker.start();

    // ~1s of stream + ~2s of render + margin
    assert!(
        client_broker.wait(Duration::from_secs(15)),
        "client run did not finish"
    );
    assert!(
        server_broker.wait(Duration::from_secs(15)),
        "server run did not finish"
    );

    let summaries = summary_sink.summaries.lock().unwrap();
    assert_eq!(summaries.len(), 1, "expected exactly one summary line");
    let (stats, error_code) = summaries[0];

    assert_eq!(error_code, 0);
    assert_eq!(stats.successful_frames, TOTAL_FRAMES);
    assert_eq!(stats.dropped_frames, 0);
    assert_eq!(stats.error_frames, 0);
    assert_eq!(
        stats.bits_received,
        i64::from(FRAME_SIZE) * 8 * TOTAL_FRAMES as i64
    );
    drop(summaries);

    // process-wide totals mirror the connection stats
    let client_totals = client_ctx.totals.snapshot();
    assert_eq!(client_totals.successful_frames, TOTAL_FRAMES as i64);
    assert_eq!(client_totals.dropped_frames, 0);

    client_broker.shutdown();
    server_broker.shutdown();
    client_ctx.shutdown();
    server_ctx.shutdown();
}

#[test]
fn two_sequential_client_iterations_complete() {
    let server_settings = Settings {
        role: Role::Accept,
        listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
        accept_limit: 2,
        server_exit_limit: 2,
        pattern: PatternKind::MediaStreamPull,
        media: media(),
        ..Default::default()
    };
    let server_ctx = Context::new(server_settings);
    let server = server_ctx.server_instance().unwrap();
    let server_addr = server.listener_addresses()[0];

    let server_broker = SocketBroker::new(&server_ctx).unwrap();
    server_broker.start();

    let client_settings = Settings {
        role: Role::Connect,
        target_addresses: vec![server_addr],
        iterations: 2,
        connection_limit: 1,
        connection_throttle_limit: 1,
        pattern: PatternKind::MediaStreamPull,
        media: media(),
        ..Default::default()
    };
    let client_ctx = Context::new(client_settings);
    let client_broker = SocketBroker::new(&client_ctx).unwrap();
    client_broker.start();

    assert!(
        client_broker.wait(Duration::from_secs(30)),
        "client run did not finish"
    );
    assert!(
        server_broker.wait(Duration::from_secs(30)),
        "server run did not finish"
    );

    let totals = client_ctx.totals.snapshot();
    assert_eq!(totals.successful_frames, 2 * TOTAL_FRAMES as i64);
    assert_eq!(totals.dropped_frames, 0);

    client_broker.shutdown();
    server_broker.shutdown();
    client_ctx.shutdown();
    server_ctx.shutdown();
}
