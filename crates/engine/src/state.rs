//! Per-connection lifecycle.
//!
//! Created -> Connecting -> InitiatingIo -> Closing -> Closed, with the
//! broker notified as the connection becomes active and again when it
//! closes. The role-specific connect / io / close functions are injected
//! through the context so the machine itself is role-agnostic (and broker
//! behavior is testable with stubs).

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::broker::SocketBroker;
use crate::context::Context;
use crate::executor::ConnectedSocket;
use crate::pattern::IoPattern;
use crate::shard::RecvShard;
use crate::stats::StatsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalState {
    Created,
    Connecting,
    InitiatingIo,
    Closing,
    Closed,
}

pub struct SocketState {
    ctx: Arc<Context>,
    broker: Weak<SocketBroker>,
    pended_io: AtomicU32,
    self_weak: Weak<SocketState>,
    inner: Mutex<StateInner>,
}

struct StateInner {
    state: InternalState,
    socket: Option<Arc<UdpSocket>>,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    pattern: Option<Arc<dyn IoPattern>>,
    /// The client's receive shard; the server's live with the dispatcher.
    shard: Option<Arc<RecvShard>>,
    /// The client's executor; the server's live in the dispatcher table.
    executor: Option<Arc<ConnectedSocket>>,
    last_error: i32,
    summary_emitted: bool,
}

impl SocketState {
    pub fn new(ctx: &Arc<Context>, broker: Weak<SocketBroker>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            ctx: Arc::clone(ctx),
            broker,
            pended_io: AtomicU32::new(0),
            self_weak: self_weak.clone(),
            inner: Mutex::new(StateInner {
                state: InternalState::Created,
                socket: None,
                local_address: None,
                remote_address: None,
                pattern: None,
                shard: None,
                executor: None,
                last_error: 0,
                summary_emitted: false,
            }),
        })
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn current_state(&self) -> InternalState {
        self.inner.lock().unwrap().state
    }

    /// Kick off the role-specific connect path.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            debug_assert_eq!(inner.state, InternalState::Created);
            inner.state = InternalState::Connecting;
        }
        (self.ctx.roles.connect.clone())(self);
    }

    /// Advance the state machine with the outcome of the current phase.
    /// Zero means success.
    pub fn complete_state(self: &Arc<Self>, error_code: i32) {
        enum Next {
            StartIo,
            CloseFromPending,
            CloseWhenDrained,
            Nothing,
        }

        let next = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                InternalState::Created | InternalState::Connecting => {
                    if error_code == 0 {
                        inner.state = InternalState::InitiatingIo;
                        Next::StartIo
                    } else {
                        inner.last_error = error_code;
                        Next::CloseFromPending
                    }
                }

                InternalState::InitiatingIo => {
                    inner.last_error = error_code;
                    inner.state = InternalState::Closing;
                    Next::CloseWhenDrained
                }

                InternalState::Closing | InternalState::Closed => {
                    // a later completion lost the race; the first terminal
                    // classification wins
                    Next::Nothing
                }
            }
        };

        match next {
            Next::StartIo => {
                if let Some(broker) = self.broker.upgrade() {
                    broker.initiating_io();
                }
                (self.ctx.roles.io.clone())(self);
            }
            Next::CloseFromPending => self.finalize_close(false),
            Next::CloseWhenDrained => {
                if self.pended_io.load(Acquire) == 0 {
                    self.finalize_close(true);
                }
            }
            Next::Nothing => {}
        }
    }

    pub fn increment_pended_io(&self) {
        self.pended_io.fetch_add(1, AcqRel);
    }

    pub fn decrement_pended_io(self: &Arc<Self>) {
        let previous = self.pended_io.fetch_sub(1, AcqRel);
        debug_assert!(previous > 0, "pended-IO count underflow");

        if previous == 1 && self.current_state() == InternalState::Closing {
            self.finalize_close(true);
        }
    }

    pub fn pended_io(&self) -> u32 {
        self.pended_io.load(Acquire)
    }

    /// Move to Closed: release the socket, shard and pattern outside the
    /// broker lock, emit the one summary line, and notify the broker.
    fn finalize_close(self: &Arc<Self>, was_active: bool) {
        let (resources, summary) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == InternalState::Closed {
                return;
            }
            inner.state = InternalState::Closed;

            let resources = (
                inner.socket.take(),
                inner.shard.take(),
                inner.pattern.take(),
                inner.executor.take(),
            );
            let summary = if inner.summary_emitted {
                None
            } else {
                inner.summary_emitted = true;
                let stats = resources
                    .2
                    .as_ref()
                    .map(|p| p.stats())
                    .unwrap_or_else(StatsSnapshot::default);
                Some((
                    inner.local_address,
                    inner.remote_address,
                    stats,
                    inner.last_error,
                ))
            };
            (resources, summary)
        };

        if let Some(shard) = &resources.1 {
            shard.shutdown();
        }

        if let Some((local, remote, stats, error)) = summary {
            self.ctx
                .status
                .connection_summary(local, remote, &stats, error);
        }

        (self.ctx.roles.close.clone())(self);
        drop(resources);

        debug!(was_active, "socket state closed");
        if let Some(broker) = self.broker.upgrade() {
            broker.closing(was_active);
        }
    }

    pub fn weak(&self) -> Weak<SocketState> {
        self.self_weak.clone()
    }

    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.inner.lock().unwrap().socket.clone()
    }

    pub fn set_socket(&self, socket: Arc<UdpSocket>) {
        self.inner.lock().unwrap().socket = Some(socket);
    }

    pub fn pattern(&self) -> Option<Arc<dyn IoPattern>> {
        self.inner.lock().unwrap().pattern.clone()
    }

    pub fn set_pattern(&self, pattern: Arc<dyn IoPattern>) {
        self.inner.lock().unwrap().pattern = Some(pattern);
    }

    pub fn set_shard(&self, shard: Arc<RecvShard>) {
        self.inner.lock().unwrap().shard = Some(shard);
    }

    /// Keep the client's executor alive for the connection's lifetime; the
    /// task sink and shard callback hold it weakly.
    pub fn set_executor_anchor(&self, executor: Arc<ConnectedSocket>) {
        self.inner.lock().unwrap().executor = Some(executor);
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().local_address
    }

    pub fn set_local_address(&self, address: SocketAddr) {
        self.inner.lock().unwrap().local_address = Some(address);
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().remote_address
    }

    pub fn set_remote_address(&self, address: SocketAddr) {
        self.inner.lock().unwrap().remote_address = Some(address);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::Settings;
    use crate::context::{ContextOptions, RoleFunctions};

    fn counting_roles() -> (RoleFunctions, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let io_calls = Arc::new(AtomicUsize::new(0));
        let close_calls = Arc::new(AtomicUsize::new(0));

        let io_counter = Arc::clone(&io_calls);
        let close_counter = Arc::clone(&close_calls);
        let roles = RoleFunctions {
            connect: Arc::new(|_| {}),
            io: Arc::new(move |_| {
                io_counter.fetch_add(1, Ordering::SeqCst);
            }),
            close: Arc::new(move |_| {
                close_counter.fetch_add(1, Ordering::SeqCst);
            }),
        };
        (roles, io_calls, close_calls)
    }

    fn test_state(roles: RoleFunctions) -> Arc<SocketState> {
        let settings = Settings {
            target_addresses: vec!["127.0.0.1:1".parse().unwrap()],
            ..Default::default()
        };
        let ctx = Context::with_options(
            settings,
            ContextOptions {
                roles: Some(roles),
                ..Default::default()
            },
        );
        SocketState::new(&ctx, Weak::new())
    }

    #[test]
    fn successful_connect_reaches_io() {
        let (roles, io_calls, _) = counting_roles();
        let state = test_state(roles);

        state.start();
        assert_eq!(state.current_state(), InternalState::Connecting);

        state.complete_state(0);
        assert_eq!(state.current_state(), InternalState::InitiatingIo);
        assert_eq!(io_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_connect_goes_straight_to_closed() {
        let (roles, io_calls, close_calls) = counting_roles();
        let state = test_state(roles);

        state.start();
        state.complete_state(libc::ECONNREFUSED);

        assert_eq!(state.current_state(), InternalState::Closed);
        assert_eq!(io_calls.load(Ordering::SeqCst), 0);
        assert_eq!(close_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_waits_for_pended_io() {
        let (roles, _, _) = counting_roles();
        let state = test_state(roles);

        state.start();
        state.complete_state(0);
        state.increment_pended_io();

        state.complete_state(0);
        assert_eq!(state.current_state(), InternalState::Closing);

        state.decrement_pended_io();
        assert_eq!(state.current_state(), InternalState::Closed);
    }

    #[test]
    fn later_completions_do_not_reopen() {
        let (roles, _, close_calls) = counting_roles();
        let state = test_state(roles);

        state.start();
        state.complete_state(0);
        state.complete_state(0);
        assert_eq!(state.current_state(), InternalState::Closed);

        state.complete_state(libc::EIO);
        assert_eq!(state.current_state(), InternalState::Closed);
        assert_eq!(close_calls.load(Ordering::SeqCst), 1);
    }
}
