//! Server listener set and datagram dispatcher.
//!
//! Owns one receive shard per (listen address, shard index), the table of
//! connected peers, and the two pairing queues: sockets waiting to accept
//! and peer endpoints waiting for a socket. Both queues and the table share
//! one lock so START arrivals cannot race broker accepts.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, Weak};

use jitterpump_protocol::{parse, ConnectionId, MessageKind};
use tracing::{debug, warn};

use crate::affinity::{apply_socket_affinity, compute_shard_affinities, GroupAffinity};
use crate::config::PatternKind;
use crate::context::Context;
use crate::error::EngineError;
use crate::executor::ConnectedSocket;
use crate::pattern::{IoPattern, MediaStreamReceiver, MediaStreamSender, TaskSink};
use crate::shard::RecvShard;
use crate::sockets;
use crate::state::SocketState;
use crate::task::Task;

/// Datagrams buffered for a peer whose executor does not exist yet.
const MAX_PENDING_DATAGRAMS: usize = 64;

struct Listener {
    socket: Arc<UdpSocket>,
    local_address: SocketAddr,
    shard: Arc<RecvShard>,
}

struct DispatchState {
    connected: HashMap<SocketAddr, Arc<ConnectedSocket>>,
    accepting_sockets: Vec<Weak<SocketState>>,
    awaiting_endpoints: Vec<(usize, SocketAddr)>,
    pending_datagrams: HashMap<SocketAddr, Vec<Vec<u8>>>,
}

/// Work collected under the dispatcher lock and finished outside it, so
/// completing the socket state never re-enters this module's lock.
struct Established {
    state: Arc<SocketState>,
    executor: Arc<ConnectedSocket>,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    pending: Vec<Vec<u8>>,
}

pub struct MediaStreamServer {
    ctx: Arc<Context>,
    listeners: Mutex<Vec<Listener>>,
    state: Mutex<DispatchState>,
    self_weak: Weak<MediaStreamServer>,
}

impl MediaStreamServer {
    /// Bind the listener set and start the receive shards.
    pub fn start(ctx: &Arc<Context>) -> Result<Arc<Self>, EngineError> {
        let server = Arc::new_cyclic(|self_weak| Self {
            ctx: Arc::clone(ctx),
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(DispatchState {
                connected: HashMap::new(),
                accepting_sockets: Vec::new(),
                awaiting_endpoints: Vec::new(),
                pending_datagrams: HashMap::new(),
            }),
            self_weak: self_weak.clone(),
        });

        if let Err(e) = server.bind_listeners() {
            server.shutdown();
            return Err(e);
        }
        Ok(server)
    }

    fn bind_listeners(&self) -> Result<(), EngineError> {
        let settings = &self.ctx.settings;
        if settings.listen_addresses.is_empty() {
            return Err(EngineError::Config(
                "the media-stream server requires at least one listen address".into(),
            ));
        }

        let mut listeners = Vec::new();

        for &address in &settings.listen_addresses {
            if settings.enable_recv_sharding {
                let shard_count = settings.effective_shard_count();
                let affinities =
                    compute_shard_affinities(shard_count, settings.affinity_policy);

                // every shard binds its own socket to the same endpoint;
                // the kernel balances arrivals across them
                let mut bound_address = address;
                for shard_index in 0..shard_count {
                    let affinity = affinities
                        .as_ref()
                        .and_then(|entries| entries.get(shard_index as usize).copied());
                    let listener = self.bind_one_listener(
                        listeners.len(),
                        bound_address,
                        shard_index,
                        true,
                        affinity,
                        settings.shard_worker_count,
                    )?;
                    // later shards must join the port the first one got
                    bound_address = listener.local_address;
                    listeners.push(listener);
                }
            } else {
                let listener = self.bind_one_listener(
                    listeners.len(),
                    address,
                    0,
                    false,
                    None,
                    settings.shard_worker_count,
                )?;
                listeners.push(listener);
            }
        }

        for listener in &listeners {
            debug!(
                local = %listener.local_address,
                outstanding = listener.shard.outstanding_receives(),
                "receiving datagrams"
            );
        }

        *self.listeners.lock().unwrap() = listeners;
        Ok(())
    }

    fn bind_one_listener(
        &self,
        listener_index: usize,
        address: SocketAddr,
        shard_index: u32,
        shared_endpoint: bool,
        affinity: Option<GroupAffinity>,
        worker_count: u32,
    ) -> Result<Listener, EngineError> {
        let raw = sockets::create_udp_socket(address)?;
        sockets::set_pre_bind_options(&raw, shared_endpoint)?;

        if let Some(entry) = &affinity {
            if !entry.is_empty() {
                // steer the socket's receive processing onto the shard's CPU
                if let Err(e) = apply_socket_affinity(&raw, entry) {
                    warn!(shard_index, "could not apply socket CPU affinity: {e}");
                }
            }
        }

        let socket = sockets::bind_udp_socket(raw, address)?;
        let local_address = socket.local_addr()?;

        let weak = self.self_weak.clone();
        let callback: crate::shard::ShardCallback =
            Arc::new(move |_key, _bytes, data| {
                if let (Some(server), Some((datagram, from))) = (weak.upgrade(), data) {
                    server.on_datagram(listener_index, datagram, from);
                }
            });

        let shard = Arc::new(RecvShard::new(
            shard_index,
            self.ctx.settings.media.datagram_max_size as usize,
            self.ctx.settings.shard_batch_size,
            affinity,
            callback,
        ));
        let shard_socket = socket
            .try_clone()
            .map_err(|e| EngineError::Setup(format!("cloning listener socket: {e}")))?;
        shard.initialize(Some(shard_socket), self.ctx.settings.prepost_recvs)?;
        shard.start_workers(worker_count)?;

        Ok(Listener {
            socket: Arc::new(socket),
            local_address,
            shard,
        })
    }

    /// Every inbound datagram lands here, on a shard worker thread.
    fn on_datagram(self: &Arc<Self>, listener_index: usize, data: &[u8], from: SocketAddr) {
        match parse(data) {
            Ok(MessageKind::Start) => {
                debug!(%from, "parsed START");
                self.handle_start(listener_index, from);
            }
            Ok(_) => self.route_to_connected(listener_index, data, from),
            Err(e) => {
                self.ctx.totals.increment_error();
                debug!(%from, "unparseable datagram: {e}");
            }
        }
    }

    /// An initial START arrived: pair it with an accepting socket, or queue
    /// the endpoint until one shows up.
    fn handle_start(self: &Arc<Self>, listener_index: usize, from: SocketAddr) {
        let established = {
            let mut state = self.state.lock().unwrap();

            if state.connected.contains_key(&from) {
                // duplicate request: latency or drops during negotiation
                self.ctx.totals.increment_duplicate();
                debug!(%from, "START for an already-established peer");
                return;
            }
            if state.awaiting_endpoints.iter().any(|(_, a)| *a == from) {
                self.ctx.totals.increment_duplicate();
                debug!(%from, "START for an already-awaiting peer");
                return;
            }

            let mut found = None;
            while let Some(weak) = state.accepting_sockets.pop() {
                if let Some(socket_state) = weak.upgrade() {
                    found = Some(socket_state);
                    break;
                }
            }

            match found {
                Some(socket_state) => {
                    Some(self.establish(&mut state, socket_state, listener_index, from))
                }
                None => {
                    debug!(%from, "no accepting socket; queueing endpoint");
                    state.awaiting_endpoints.push((listener_index, from));
                    None
                }
            }
        };

        if let Some(established) = established {
            self.finish_establish(established);
        }
    }

    /// A non-START datagram: hand it to the peer's executor, or buffer it
    /// until the peer is established.
    fn route_to_connected(self: &Arc<Self>, listener_index: usize, data: &[u8], from: SocketAddr) {
        let executor = {
            let mut state = self.state.lock().unwrap();
            match state.connected.get(&from) {
                Some(executor) => Some(Arc::clone(executor)),
                None => {
                    if !state.awaiting_endpoints.iter().any(|(_, a)| *a == from) {
                        state.awaiting_endpoints.push((listener_index, from));
                    }
                    let pending = state.pending_datagrams.entry(from).or_default();
                    if pending.len() < MAX_PENDING_DATAGRAMS {
                        pending.push(data.to_vec());
                    }
                    None
                }
            }
        };

        if let Some(executor) = executor {
            executor.complete_receive(data);
        }
    }

    /// The broker has a socket ready to accept: pair it with the newest
    /// waiting endpoint, or queue it.
    pub fn accept_socket(self: &Arc<Self>, socket_state: &Arc<SocketState>) {
        let established = {
            let mut state = self.state.lock().unwrap();

            match state.awaiting_endpoints.last().copied() {
                None => {
                    state.accepting_sockets.push(socket_state.weak());
                    None
                }
                Some((listener_index, from)) => {
                    if state.connected.contains_key(&from) {
                        // duplicate request raced in while this endpoint waited
                        self.ctx.totals.increment_duplicate();
                        debug!(%from, "accept found an already-established peer");
                        return;
                    }

                    let established = self.establish(
                        &mut state,
                        Arc::clone(socket_state),
                        listener_index,
                        from,
                    );
                    state.awaiting_endpoints.pop();
                    Some(established)
                }
            }
        };

        if let Some(established) = established {
            self.finish_establish(established);
        }
    }

    /// Create the executor + pattern pair for a peer. Runs under the
    /// dispatcher lock; everything that can call back out is deferred to
    /// `finish_establish`.
    fn establish(
        &self,
        state: &mut DispatchState,
        socket_state: Arc<SocketState>,
        listener_index: usize,
        from: SocketAddr,
    ) -> Established {
        let listeners = self.listeners.lock().unwrap();
        let listener = &listeners[listener_index];
        let local_address = listener.local_address;
        let socket = Arc::clone(&listener.socket);
        drop(listeners);

        let executor = ConnectedSocket::new(socket_state.weak(), socket, from, &self.ctx);

        debug!(%from, "peer added to connected table");
        state.connected.insert(from, Arc::clone(&executor));
        let pending = state.pending_datagrams.remove(&from).unwrap_or_default();

        Established {
            state: socket_state,
            executor,
            local_address,
            remote_address: from,
            pending,
        }
    }

    /// Outside the dispatcher lock: wire the pattern, complete the socket
    /// state (which starts IO through the broker), and drain any datagrams
    /// that arrived early.
    fn finish_establish(&self, established: Established) {
        let Established {
            state,
            executor,
            local_address,
            remote_address,
            pending,
        } = established;

        // the server sends on pull streams and receives on push streams
        let pattern: Arc<dyn IoPattern> = match self.ctx.settings.pattern {
            PatternKind::MediaStreamPull => MediaStreamSender::new(
                &self.ctx,
                self.ctx.settings.sender_sends_start(),
                ConnectionId::generate(),
            ),
            PatternKind::MediaStreamPush => {
                match MediaStreamReceiver::new(&self.ctx, false) {
                    Ok(receiver) => receiver,
                    Err(e) => {
                        self.ctx
                            .status
                            .error_info(&format!("could not create the receive pattern: {e}"));
                        self.remove_socket(remote_address);
                        state.complete_state(e.os_code());
                        return;
                    }
                }
            }
        };

        let sink: TaskSink = {
            let weak = Arc::downgrade(&executor);
            Arc::new(move |task: Task| {
                if let Some(executor) = weak.upgrade() {
                    executor.queue_task(task);
                }
            })
        };
        pattern.set_task_sink(sink);

        state.set_pattern(pattern);
        state.set_local_address(local_address);
        state.set_remote_address(remote_address);
        if let Some(socket) = state.socket() {
            let _ = sockets::set_post_connect_options(&socket, remote_address);
        }

        state.complete_state(0);
        self.ctx.status.new_connection(local_address, remote_address);

        for datagram in pending {
            executor.complete_receive(&datagram);
        }
    }

    pub fn find_connected(&self, remote: SocketAddr) -> Option<Arc<ConnectedSocket>> {
        self.state.lock().unwrap().connected.get(&remote).cloned()
    }

    /// Remove a closed connection from the table.
    pub fn remove_socket(&self, remote: SocketAddr) {
        let removed = self.state.lock().unwrap().connected.remove(&remote);
        if removed.is_some() {
            debug!(%remote, "peer removed from connected table");
        }
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().unwrap().connected.len()
    }

    /// Bound addresses of every listener, in creation order.
    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .map(|listener| listener.local_address)
            .collect()
    }

    /// Stop every listener shard. Idempotent.
    pub fn shutdown(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap());
        for listener in &listeners {
            listener.shard.shutdown();
        }

        let mut state = self.state.lock().unwrap();
        state.connected.clear();
        state.accepting_sockets.clear();
        state.awaiting_endpoints.clear();
        state.pending_datagrams.clear();
    }
}

// --------------------------------------------------------------------------
// Role functions installed by the context for the accept role.

/// Connecting step: register the socket state for pairing with a START.
pub fn accept(state: &Arc<SocketState>) {
    match state.ctx().server_instance() {
        Ok(server) => server.accept_socket(state),
        Err(e) => {
            state
                .ctx()
                .status
                .error_info(&format!("listener startup failed: {e}"));
            state.complete_state(e.os_code());
        }
    }
}

/// InitiatingIo step: pump the pattern's tasks into the peer's executor.
pub fn server_io(state: &Arc<SocketState>) {
    let Some(pattern) = state.pattern() else {
        return;
    };
    let Some(remote) = state.remote_address() else {
        return;
    };
    let Some(server) = state.ctx().server_if_started() else {
        return;
    };

    match server.find_connected(remote) {
        Some(executor) => executor.pump_pattern(&pattern),
        None => {
            state.ctx().status.error_info(&format!(
                "failed to find {remote} in the connected table to continue sending datagrams"
            ));
            state.complete_state(libc::ENOENT);
        }
    }
}

/// Close step: drop the connected-table entry.
pub fn close(state: &Arc<SocketState>) {
    if let Some(server) = state.ctx().server_if_started() {
        if let Some(remote) = state.remote_address() {
            server.remove_socket(remote);
        }
    }
}
