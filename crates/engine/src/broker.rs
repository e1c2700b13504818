//! Global connection orchestrator.
//!
//! The broker drives `total_remaining` connections through socket states,
//! keeping at most `pending_limit` in flight (clients additionally honor a
//! connect-throttle and the overall connection limit). Closed states are
//! scavenged and replaced on a single-threaded refresh queue; when
//! everything has drained, the done event fires.

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Sender};
use tracing::debug;

use crate::config::Role;
use crate::context::{Context, Event};
use crate::error::EngineError;
use crate::state::{InternalState, SocketState};

pub struct SocketBroker {
    ctx: Arc<Context>,
    inner: Mutex<BrokerInner>,
    done: Event,
    refresh_queue: SerialQueue,
    self_weak: Weak<SocketBroker>,
}

struct BrokerInner {
    total_remaining: u64,
    pending_sockets: u32,
    active_sockets: u32,
    pending_limit: u32,
    socket_pool: Vec<Arc<SocketState>>,
}

impl SocketBroker {
    pub fn new(ctx: &Arc<Context>) -> Result<Arc<Self>, EngineError> {
        let settings = &ctx.settings;

        // receive sharding cannot work without the per-socket affinity option
        if settings.enable_recv_sharding && !ctx.affinity.supports_socket_affinity {
            return Err(EngineError::AffinityUnsupported);
        }

        let (total_remaining, mut pending_limit) = match settings.role {
            Role::Accept => (settings.server_exit_limit, settings.accept_limit),
            Role::Connect => {
                let total = if settings.iterations == crate::config::UNBOUNDED_ITERATIONS {
                    u64::MAX
                } else {
                    settings
                        .iterations
                        .saturating_mul(u64::from(settings.connection_limit))
                };
                (total, settings.connection_limit)
            }
        };

        // pending_limit cannot exceed the total work
        if u64::from(pending_limit) > total_remaining {
            pending_limit = total_remaining as u32;
        }

        Ok(Arc::new_cyclic(|self_weak| Self {
            ctx: Arc::clone(ctx),
            inner: Mutex::new(BrokerInner {
                total_remaining,
                pending_sockets: 0,
                active_sockets: 0,
                pending_limit,
                socket_pool: Vec::new(),
            }),
            done: Event::new(),
            refresh_queue: SerialQueue::new("broker-refresh"),
            self_weak: self_weak.clone(),
        }))
    }

    /// Spin up sockets until the pending limit (or the work) is exhausted.
    pub fn start(self: &Arc<Self>) {
        let to_start = {
            let mut inner = self.inner.lock().unwrap();
            debug!(
                total_remaining = inner.total_remaining,
                pending_limit = inner.pending_limit,
                "starting broker"
            );
            self.fill_pending(&mut inner)
        };

        for state in to_start {
            state.start();
        }
    }

    /// Create socket states up to the pending limit. Returns them for the
    /// caller to start once the broker lock is released.
    fn fill_pending(self: &Arc<Self>, inner: &mut BrokerInner) -> Vec<Arc<SocketState>> {
        let settings = &self.ctx.settings;
        let mut created = Vec::new();

        while inner.total_remaining > 0 && inner.pending_sockets < inner.pending_limit {
            if settings.role == Role::Connect {
                // don't exceed the overall connection limit...
                if inner.pending_sockets + inner.active_sockets >= settings.connection_limit {
                    break;
                }
                // ...and throttle concurrent connection attempts
                if inner.pending_sockets >= settings.connection_throttle_limit {
                    break;
                }
            }

            let state = SocketState::new(&self.ctx, self.self_weak.clone());
            inner.socket_pool.push(Arc::clone(&state));
            created.push(state);
            inner.pending_sockets += 1;
            inner.total_remaining -= 1;
        }

        created
    }

    /// A socket state moved from pending to active.
    pub fn initiating_io(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            assert!(
                inner.pending_sockets > 0,
                "initiating_io: pending_sockets == 0 (active_sockets == {})",
                inner.active_sockets
            );
            inner.pending_sockets -= 1;
            inner.active_sockets += 1;
        }
        self.submit_refresh();
    }

    /// A socket state closed; `was_active` tells which counter it held.
    pub fn closing(&self, was_active: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            if was_active {
                assert!(
                    inner.active_sockets > 0,
                    "closing: active_sockets == 0 (pending_sockets == {})",
                    inner.pending_sockets
                );
                inner.active_sockets -= 1;
            } else {
                assert!(
                    inner.pending_sockets > 0,
                    "closing: pending_sockets == 0 (active_sockets == {})",
                    inner.active_sockets
                );
                inner.pending_sockets -= 1;
            }
        }
        self.submit_refresh();
    }

    fn submit_refresh(&self) {
        let weak = self.self_weak.clone();
        self.refresh_queue.submit(move || {
            if let Some(broker) = weak.upgrade() {
                broker.refresh_sockets();
            }
        });
    }

    /// Scavenge closed states, top back up to the pending limit, and fire
    /// the done event when all work has drained.
    fn refresh_sockets(self: &Arc<Self>) {
        // removed states destruct outside the broker lock
        let mut removed: Vec<Arc<SocketState>> = Vec::new();
        let mut to_start: Vec<Arc<SocketState>> = Vec::new();

        let exiting = {
            let mut inner = self.inner.lock().unwrap();

            let exiting = inner.total_remaining == 0
                && inner.pending_sockets == 0
                && inner.active_sockets == 0;

            if exiting {
                removed = std::mem::take(&mut inner.socket_pool);
            } else {
                inner
                    .socket_pool
                    .retain(|state| match state.current_state() {
                        InternalState::Closed => {
                            removed.push(Arc::clone(state));
                            false
                        }
                        _ => true,
                    });

                // don't spin up more if the user asked to shut down
                if !self.done.is_set() {
                    to_start = self.fill_pending(&mut inner);
                }
            }

            exiting
        };

        drop(removed);
        for state in to_start {
            state.start();
        }

        if exiting {
            debug!("all connections drained");
            self.done.set();
        }
    }

    /// Wait for completion or external cancellation. True when either fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        select! {
            recv(self.done.receiver()) -> _ => true,
            recv(self.ctx.cancel.receiver()) -> _ => true,
            default(timeout) => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub fn pending_sockets(&self) -> u32 {
        self.inner.lock().unwrap().pending_sockets
    }

    pub fn active_sockets(&self) -> u32 {
        self.inner.lock().unwrap().active_sockets
    }

    pub fn total_remaining(&self) -> u64 {
        self.inner.lock().unwrap().total_remaining
    }

    /// Signal done, stop the refresh queue, and drop all socket states.
    pub fn shutdown(&self) {
        self.done.set();
        self.refresh_queue.cancel();

        let pool = std::mem::take(&mut self.inner.lock().unwrap().socket_pool);
        drop(pool);
    }
}

impl Drop for SocketBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One worker thread draining submitted closures in order.
struct SerialQueue {
    sender: Mutex<Option<Sender<Box<dyn FnOnce() + Send>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    fn new(name: &str) -> Self {
        let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send>>();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .expect("failed to spawn serial queue thread");

        Self {
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        }
    }

    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stop accepting work and drain the thread. Idempotent.
    fn cancel(&self) {
        self.sender.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            // the queue thread itself may drop the last broker reference
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
