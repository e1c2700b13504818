//! Client-role connect and IO functions.
//!
//! The client "connects" by sending the literal START datagram from a
//! connected UDP socket, then runs its pattern over a single receive shard:
//! the shard's worker feeds completed receives into the pattern, and pattern
//! tasks flow back out through a per-peer executor on the same socket.

use std::sync::Arc;

use jitterpump_protocol::{ConnectionId, START_MESSAGE};
use tracing::debug;

use crate::config::PatternKind;
use crate::error::EngineError;
use crate::executor::ConnectedSocket;
use crate::pattern::{IoPattern, IoStatus, MediaStreamReceiver, MediaStreamSender, TaskSink};
use crate::shard::{RecvShard, ShardCallback};
use crate::sockets;
use crate::state::SocketState;
use crate::task::Task;

/// Connecting step: create the socket, send START, record the addresses.
pub fn connect(state: &Arc<SocketState>) {
    match connect_impl(state) {
        Ok(()) => state.complete_state(0),
        Err(e) => {
            state
                .ctx()
                .status
                .error_info(&format!("connect failed: {e}"));
            state.complete_state(e.os_code());
        }
    }
}

fn connect_impl(state: &Arc<SocketState>) -> Result<(), EngineError> {
    let ctx = state.ctx();
    let target = ctx
        .next_target_address()
        .ok_or(EngineError::NoTargetAddress)?;

    let raw = sockets::create_udp_socket(sockets::ephemeral_bind_address(target))?;
    sockets::set_pre_bind_options(&raw, false)?;
    let socket = sockets::bind_udp_socket(raw, sockets::ephemeral_bind_address(target))?;
    socket.connect(target)?;
    sockets::set_post_connect_options(&socket, target)?;

    // announce ourselves; the server answers with its connection id
    socket.send(START_MESSAGE)?;
    debug!(%target, "sent START");

    state.set_local_address(socket.local_addr()?);
    state.set_remote_address(target);
    state.set_socket(Arc::new(socket));
    Ok(())
}

/// InitiatingIo step: build the pattern, the executor, and the receive
/// shard, then start pumping.
pub fn start_io(state: &Arc<SocketState>) {
    if let Err(e) = start_io_impl(state) {
        state
            .ctx()
            .status
            .error_info(&format!("starting IO failed: {e}"));
        state.complete_state(e.os_code());
    }
}

fn start_io_impl(state: &Arc<SocketState>) -> Result<(), EngineError> {
    let ctx = state.ctx();
    let socket = state
        .socket()
        .ok_or_else(|| EngineError::Setup("connect did not leave a socket".into()))?;
    let remote = state
        .remote_address()
        .ok_or_else(|| EngineError::Setup("connect did not record the peer".into()))?;

    // the client receives on pull streams and sends on push streams
    let pattern: Arc<dyn IoPattern> = match ctx.settings.pattern {
        PatternKind::MediaStreamPull => MediaStreamReceiver::new(ctx, true)?,
        PatternKind::MediaStreamPush => {
            MediaStreamSender::new(ctx, false, ConnectionId::generate())
        }
    };
    state.set_pattern(Arc::clone(&pattern));

    let executor = ConnectedSocket::new(state.weak(), Arc::clone(&socket), remote, ctx);

    let sink: TaskSink = {
        let weak = Arc::downgrade(&executor);
        Arc::new(move |task: Task| {
            if let Some(executor) = weak.upgrade() {
                executor.queue_task(task);
            }
        })
    };
    pattern.set_task_sink(sink);

    // the shard owns a clone of the connected socket and keeps
    // `prepost_recvs` receives posted on it
    let callback: ShardCallback = {
        let weak_state = state.weak();
        let weak_executor = Arc::downgrade(&executor);
        Arc::new(move |_key, bytes, data| {
            let (Some(state), Some(executor)) = (weak_state.upgrade(), weak_executor.upgrade())
            else {
                return;
            };
            let Some(pattern) = state.pattern() else {
                return;
            };

            let task = Task::recv(bytes);
            let payload = data.map(|(datagram, _from)| datagram).unwrap_or(&[]);
            match pattern.complete_io(&task, bytes, 0, payload) {
                IoStatus::ContinueIo => executor.pump_pattern(&pattern),
                IoStatus::CompletedIo => state.complete_state(0),
                IoStatus::FailedIo => state.complete_state(libc::ECONNABORTED),
            }
        })
    };

    let buffer_size = ctx
        .settings
        .media
        .datagram_max_size
        .max(ctx.settings.media.frame_size_bytes().min(65536)) as usize;
    let shard = Arc::new(RecvShard::new(
        0,
        buffer_size,
        ctx.settings.shard_batch_size,
        None,
        callback,
    ));
    let shard_socket = socket
        .try_clone()
        .map_err(|e| EngineError::Setup(format!("cloning the client socket: {e}")))?;
    shard.initialize(Some(shard_socket), ctx.settings.prepost_recvs)?;
    shard.start_workers(1)?;
    state.set_shard(Arc::clone(&shard));

    // keep the executor alive for the life of the connection: the shard
    // callback and task sink reference it weakly
    state.set_executor_anchor(executor.clone());

    // prime the pattern: arms its timers and pends the initial receives
    executor.pump_pattern(&pattern);
    Ok(())
}
