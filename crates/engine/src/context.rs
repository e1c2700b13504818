//! The run-wide context threaded through the broker, state machines and
//! patterns: settings, status sink, totals, cancellation, timers, the
//! affinity probe result, and the injected role functions.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{error, info};

use crate::affinity::{query_cpu_affinity_support, CpuAffinityInfo};
use crate::client;
use crate::config::{Role, Settings};
use crate::dispatcher::{self, MediaStreamServer};
use crate::error::EngineError;
use crate::state::SocketState;
use crate::stats::{JitterFrameEntry, StatsSnapshot, UdpTotals};
use crate::timer::TimerQueue;

/// Manual-reset notification event. `set` is idempotent; waiters (including
/// `crossbeam_channel::select!` over [`Event::receiver`]) observe a set event
/// as a disconnected channel.
pub struct Event {
    receiver: Receiver<()>,
    sender: Mutex<Option<Sender<()>>>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            receiver: rx,
            sender: Mutex::new(Some(tx)),
        }
    }

    pub fn set(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn is_set(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// For `select!` across several events.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }

    /// Wait until the event is set or `timeout` elapses. Returns whether the
    /// event is set.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.receiver.recv_timeout(timeout) {
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => true,
            _ => false,
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Where user-visible connection events go. Implementations are best-effort
/// and must never panic.
pub trait StatusSink: Send + Sync {
    fn new_connection(&self, local: SocketAddr, remote: SocketAddr);
    fn jitter_update(&self, frame: &JitterFrameEntry, previous: &JitterFrameEntry);
    fn error_info(&self, message: &str);
    fn connection_summary(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        stats: &StatsSnapshot,
        error_code: i32,
    );
}

/// Default sink: structured log lines.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn new_connection(&self, local: SocketAddr, remote: SocketAddr) {
        info!(%local, %remote, "new connection");
    }

    fn jitter_update(&self, frame: &JitterFrameEntry, previous: &JitterFrameEntry) {
        tracing::debug!(
            sequence = frame.sequence_number,
            bytes = frame.bytes_received,
            in_flight_ms = frame.estimated_time_in_flight_ms,
            previous_sequence = previous.sequence_number,
            "rendered frame"
        );
    }

    fn error_info(&self, message: &str) {
        error!("{message}");
    }

    fn connection_summary(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        stats: &StatsSnapshot,
        error_code: i32,
    ) {
        let local = local.map_or_else(|| "-".to_string(), |a| a.to_string());
        let remote = remote.map_or_else(|| "-".to_string(), |a| a.to_string());
        info!(
            %local,
            %remote,
            bits_received = stats.bits_received,
            successful_frames = stats.successful_frames,
            dropped_frames = stats.dropped_frames,
            duplicate_frames = stats.duplicate_frames,
            error_frames = stats.error_frames,
            duration_ms = stats.duration_ms,
            error_code,
            "connection closed"
        );
    }
}

/// Role-specific lifecycle functions invoked by the socket state machine.
/// Swappable so broker behavior is testable without real sockets.
pub type RoleFn = Arc<dyn Fn(&Arc<SocketState>) + Send + Sync>;

#[derive(Clone)]
pub struct RoleFunctions {
    /// Created -> Connecting: client sends START, server registers for accept.
    pub connect: RoleFn,
    /// Connecting -> InitiatingIo: start pumping the pattern.
    pub io: RoleFn,
    /// Terminal cleanup once the socket closes.
    pub close: RoleFn,
}

impl RoleFunctions {
    fn for_role(role: Role) -> Self {
        match role {
            Role::Connect => Self {
                connect: Arc::new(client::connect),
                io: Arc::new(client::start_io),
                close: Arc::new(|_state| {}),
            },
            Role::Accept => Self {
                connect: Arc::new(dispatcher::accept),
                io: Arc::new(dispatcher::server_io),
                close: Arc::new(dispatcher::close),
            },
        }
    }

    /// No-op functions, for tests that only exercise the broker counters.
    pub fn inert() -> Self {
        Self {
            connect: Arc::new(|_state| {}),
            io: Arc::new(|_state| {}),
            close: Arc::new(|_state| {}),
        }
    }
}

/// Optional overrides for [`Context::with_options`].
#[derive(Default)]
pub struct ContextOptions {
    pub status: Option<Arc<dyn StatusSink>>,
    pub roles: Option<RoleFunctions>,
    pub affinity: Option<CpuAffinityInfo>,
}

pub struct Context {
    pub settings: Settings,
    pub status: Arc<dyn StatusSink>,
    pub totals: UdpTotals,
    pub cancel: Event,
    pub timers: TimerQueue,
    pub affinity: CpuAffinityInfo,
    pub roles: RoleFunctions,

    /// The server dispatcher, created on first accept.
    server: Mutex<Option<Arc<MediaStreamServer>>>,
    next_target: AtomicUsize,
}

impl Context {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_options(settings, ContextOptions::default())
    }

    pub fn with_options(settings: Settings, options: ContextOptions) -> Arc<Self> {
        let roles = options
            .roles
            .unwrap_or_else(|| RoleFunctions::for_role(settings.role));

        Arc::new(Self {
            roles,
            status: options.status.unwrap_or_else(|| Arc::new(LogStatusSink)),
            totals: UdpTotals::default(),
            cancel: Event::new(),
            timers: TimerQueue::new(),
            affinity: options.affinity.unwrap_or_else(query_cpu_affinity_support),
            settings,
            server: Mutex::new(None),
            next_target: AtomicUsize::new(0),
        })
    }

    /// The server listener/dispatcher, started on first use.
    pub fn server_instance(self: &Arc<Self>) -> Result<Arc<MediaStreamServer>, EngineError> {
        let mut guard = self.server.lock().unwrap();
        if let Some(server) = guard.as_ref() {
            return Ok(Arc::clone(server));
        }

        let server = MediaStreamServer::start(self)?;
        *guard = Some(Arc::clone(&server));
        Ok(server)
    }

    /// The server dispatcher if it has been started.
    pub fn server_if_started(&self) -> Option<Arc<MediaStreamServer>> {
        self.server.lock().unwrap().clone()
    }

    /// Round-robin over the configured target addresses.
    pub fn next_target_address(&self) -> Option<SocketAddr> {
        let targets = &self.settings.target_addresses;
        if targets.is_empty() {
            return None;
        }
        let index = self.next_target.fetch_add(1, Relaxed);
        Some(targets[index % targets.len()])
    }

    /// External cancellation (e.g. ctrl-c).
    pub fn request_cancel(&self) {
        self.cancel.set();
    }

    /// Stop the server listeners and the timer service. Called at the end of
    /// a run; dropping the context does the same.
    pub fn shutdown(&self) {
        if let Some(server) = self.server.lock().unwrap().take() {
            server.shutdown();
        }
        self.timers.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_set_is_sticky_and_idempotent() {
        let event = Event::new();
        assert!(!event.is_set());
        assert!(!event.wait(Duration::from_millis(10)));

        event.set();
        event.set();
        assert!(event.is_set());
        assert!(event.wait(Duration::from_millis(10)));
    }

    #[test]
    fn select_observes_either_event() {
        let done = Event::new();
        let cancel = Event::new();
        cancel.set();

        let fired = crossbeam_channel::select! {
            recv(done.receiver()) -> _ => "done",
            recv(cancel.receiver()) -> _ => "cancel",
            default(Duration::from_millis(100)) => "timeout",
        };
        assert_eq!(fired, "cancel");
    }

    #[test]
    fn target_addresses_round_robin() {
        let settings = Settings {
            target_addresses: vec![
                "127.0.0.1:1001".parse().unwrap(),
                "127.0.0.1:1002".parse().unwrap(),
            ],
            ..Default::default()
        };
        let ctx = Context::new(settings);

        let first = ctx.next_target_address().unwrap();
        let second = ctx.next_target_address().unwrap();
        let third = ctx.next_target_address().unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
