//! Completion-based receive shard.
//!
//! One shard owns one datagram socket, one completion channel, a fixed set
//! of receive records, and a pool of worker threads. A pump thread waits for
//! socket readiness and receives datagrams into free records, enqueueing one
//! completion per datagram; workers dequeue completions (singly or in
//! batches), invoke the shard's callback, then zero the record and re-post
//! it by returning it to the free-record channel.
//!
//! Receive records are owned values cycling pump -> worker -> pump through
//! channels, so a completed record can never be read and re-posted
//! concurrently.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, warn};

use crate::affinity::{pin_current_thread, GroupAffinity};
use crate::error::EngineError;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One pre-posted receive operation: its buffer, the sender's address, and
/// how many bytes the last completion delivered.
#[derive(Debug)]
pub struct RecvRecord {
    pub buffer: Vec<u8>,
    pub from: Option<SocketAddr>,
    pub bytes: u32,
}

impl RecvRecord {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: vec![0u8; buffer_size],
            from: None,
            bytes: 0,
        }
    }

    fn clear(&mut self) {
        self.bytes = 0;
        self.from = None;
        // re-initialize the sequence-number slot for the next datagram
        let prefix = self.buffer.len().min(8);
        self.buffer[..prefix].fill(0);
    }
}

/// One entry of the shard's completion queue. A `None` record with zero key
/// and zero bytes is the shutdown sentinel.
#[derive(Debug)]
pub struct Completion {
    pub key: u32,
    pub bytes: u32,
    pub record: Option<RecvRecord>,
}

impl Completion {
    fn is_sentinel(&self) -> bool {
        self.key == 0 && self.bytes == 0 && self.record.is_none()
    }
}

/// Invoked on a worker thread for every non-sentinel completion. Receives
/// the shard key, the completed byte count, and (for receive completions)
/// the datagram bytes and sender address.
pub type ShardCallback = Arc<dyn Fn(u32, u32, Option<(&[u8], SocketAddr)>) + Send + Sync>;

pub struct RecvShard {
    id: u32,
    buffer_size: usize,
    batch_size: usize,
    worker_affinity: Option<GroupAffinity>,
    callback: ShardCallback,

    socket: Mutex<Option<Arc<UdpSocket>>>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    free_tx: Sender<RecvRecord>,
    free_rx: Receiver<RecvRecord>,

    shutdown: Arc<AtomicBool>,
    shutdown_done: AtomicBool,
    outstanding: Arc<AtomicU32>,
    worker_count: AtomicU32,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl RecvShard {
    /// `buffer_size` is the receive buffer per record (the datagram maximum);
    /// `batch_size` is how many completions a worker dequeues per wakeup.
    pub fn new(
        id: u32,
        buffer_size: usize,
        batch_size: usize,
        worker_affinity: Option<GroupAffinity>,
        callback: ShardCallback,
    ) -> Self {
        let (completions_tx, completions_rx) = unbounded();
        let (free_tx, free_rx) = unbounded();

        Self {
            id,
            buffer_size,
            batch_size: batch_size.max(1),
            worker_affinity,
            callback,
            socket: Mutex::new(None),
            completions_tx,
            completions_rx,
            free_tx,
            free_rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_done: AtomicBool::new(false),
            outstanding: Arc::new(AtomicU32::new(0)),
            worker_count: AtomicU32::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Adopt `socket_hint` (or create and bind a fresh socket), then
    /// pre-allocate and post `outstanding_receives` receive records. On any
    /// failure the earlier state is torn down.
    pub fn initialize(
        &self,
        socket_hint: Option<UdpSocket>,
        outstanding_receives: u32,
    ) -> Result<(), EngineError> {
        let socket = match socket_hint {
            Some(socket) => socket,
            None => {
                let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
                let raw = crate::sockets::create_udp_socket(addr)?;
                crate::sockets::bind_udp_socket(raw, addr)?
            }
        };

        if let Err(e) = socket.set_nonblocking(true) {
            return Err(EngineError::Setup(format!(
                "shard {}: set_nonblocking failed: {e}",
                self.id
            )));
        }

        *self.socket.lock().unwrap() = Some(Arc::new(socket));

        for _ in 0..outstanding_receives {
            if self.free_tx.send(RecvRecord::new(self.buffer_size)).is_err() {
                *self.socket.lock().unwrap() = None;
                return Err(EngineError::Setup(format!(
                    "shard {}: could not post initial receives",
                    self.id
                )));
            }
        }
        self.outstanding.store(outstanding_receives, Release);

        Ok(())
    }

    /// Spawn the pump thread plus `worker_count` workers. Returns success
    /// only when every thread spawned; on failure the shard is shut down.
    pub fn start_workers(&self, worker_count: u32) -> Result<(), EngineError> {
        let socket = self
            .socket
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Setup(format!("shard {}: not initialized", self.id)))?;

        let mut threads = Vec::with_capacity(worker_count as usize + 1);

        let pump = PumpState {
            id: self.id,
            socket,
            completions: self.completions_tx.clone(),
            free: self.free_rx.clone(),
            free_return: self.free_tx.clone(),
        };
        let shutdown = Arc::clone(&self.shutdown);
        let spawned = std::thread::Builder::new()
            .name(format!("shard-{}-pump", self.id))
            .spawn(move || pump.run(&shutdown));
        match spawned {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                self.shutdown();
                return Err(EngineError::Setup(format!(
                    "shard {}: failed to spawn pump thread: {e}",
                    self.id
                )));
            }
        }

        for worker in 0..worker_count {
            let state = WorkerState {
                id: self.id,
                batch_size: self.batch_size,
                affinity: self.worker_affinity,
                callback: Arc::clone(&self.callback),
                completions: self.completions_rx.clone(),
                free: self.free_tx.clone(),
                outstanding: Arc::clone(&self.outstanding),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("shard-{}-worker-{worker}", self.id))
                .spawn(move || state.run());
            match spawned {
                Ok(handle) => {
                    threads.push(handle);
                    self.worker_count.fetch_add(1, AcqRel);
                }
                Err(e) => {
                    self.threads.lock().unwrap().extend(threads);
                    self.shutdown();
                    return Err(EngineError::Setup(format!(
                        "shard {}: failed to spawn worker {worker}: {e}",
                        self.id
                    )));
                }
            }
        }

        self.threads.lock().unwrap().extend(threads);
        Ok(())
    }

    /// Inject a completion packet, e.g. for testing. Returns false once the
    /// shard is gone.
    pub fn post_completion(&self, key: u32, bytes: u32, record: Option<RecvRecord>) -> bool {
        self.completions_tx
            .send(Completion { key, bytes, record })
            .is_ok()
    }

    /// Stop workers, free receive records, close the socket. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, AcqRel) {
            return;
        }
        self.shutdown.store(true, Release);

        // wake every worker with a sentinel completion
        let workers = self.worker_count.load(Acquire);
        for _ in 0..workers {
            let _ = self.completions_tx.send(Completion {
                key: 0,
                bytes: 0,
                record: None,
            });
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let current = std::thread::current().id();
        for thread in threads {
            // a worker can trigger shutdown from its own callback; it must
            // not join itself, the sentinel already ends its loop
            if thread.thread().id() != current {
                let _ = thread.join();
            }
        }

        // free the outstanding receive records
        while self.free_rx.try_recv().is_ok() {}
        while self.completions_rx.try_recv().is_ok() {}
        self.outstanding.store(0, Release);

        *self.socket.lock().unwrap() = None;
    }

    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    /// Receives still posted. Only decreases when a re-post fails.
    pub fn outstanding_receives(&self) -> u32 {
        self.outstanding.load(Acquire)
    }
}

impl Drop for RecvShard {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------

struct PumpState {
    id: u32,
    socket: Arc<UdpSocket>,
    completions: Sender<Completion>,
    free: Receiver<RecvRecord>,
    free_return: Sender<RecvRecord>,
}

impl PumpState {
    fn run(self, shutdown: &AtomicBool) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                error!(shard = self.id, "failed to create poll: {e}");
                return;
            }
        };

        let std_socket = match self.socket.try_clone() {
            Ok(socket) => socket,
            Err(e) => {
                error!(shard = self.id, "failed to clone shard socket: {e}");
                return;
            }
        };
        let mut mio_socket = MioUdpSocket::from_std(std_socket);
        if let Err(e) =
            poll.registry()
                .register(&mut mio_socket, Token(self.id as usize), Interest::READABLE)
        {
            error!(shard = self.id, "failed to register shard socket: {e}");
            return;
        }

        let mut events = Events::with_capacity(64);
        let mut reset_streak = false;

        while !shutdown.load(Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(shard = self.id, "poll failed: {e}");
                return;
            }

            // drain the socket into free records until it would block
            loop {
                let mut record = match self.free.try_recv() {
                    Ok(record) => record,
                    // no receives posted right now; wait for a re-post
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                };

                match mio_socket.recv_from(&mut record.buffer) {
                    Ok((nbytes, from)) => {
                        reset_streak = false;
                        record.bytes = nbytes as u32;
                        record.from = Some(from);
                        let completion = Completion {
                            key: self.id,
                            bytes: nbytes as u32,
                            record: Some(record),
                        };
                        if self.completions.send(completion).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let _ = self.free_return.send(record);
                        break;
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::ConnectionReset
                            || e.kind() == io::ErrorKind::ConnectionRefused =>
                    {
                        // port-unreachable surfaced on the listening socket;
                        // transient, log once per streak and re-post
                        if !reset_streak {
                            reset_streak = true;
                            warn!(shard = self.id, "recv observed port-unreachable: {e}");
                        }
                        let _ = self.free_return.send(record);
                    }
                    Err(e) => {
                        warn!(shard = self.id, "recv failed: {e}");
                        let _ = self.free_return.send(record);
                        break;
                    }
                }
            }
        }
    }
}

struct WorkerState {
    id: u32,
    batch_size: usize,
    affinity: Option<GroupAffinity>,
    callback: ShardCallback,
    completions: Receiver<Completion>,
    free: Sender<RecvRecord>,
    outstanding: Arc<AtomicU32>,
}

impl WorkerState {
    fn run(self) {
        if let Some(entry) = &self.affinity {
            if let Err(e) = pin_current_thread(entry) {
                warn!(shard = self.id, "failed to pin worker thread: {e}");
            }
        }

        'outer: loop {
            // block for the first completion, then opportunistically drain
            // the rest of the batch
            let first = match self.completions.recv() {
                Ok(completion) => completion,
                Err(_) => break,
            };
            if self.process(first) {
                break;
            }

            for _ in 1..self.batch_size {
                match self.completions.try_recv() {
                    Ok(completion) => {
                        if self.process(completion) {
                            break 'outer;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }

    /// Returns true when the worker should exit.
    fn process(&self, mut completion: Completion) -> bool {
        if completion.is_sentinel() {
            return true;
        }

        match completion.record.take() {
            Some(mut record) => {
                let data = record
                    .from
                    .map(|from| (&record.buffer[..completion.bytes as usize], from));
                (self.callback)(completion.key, completion.bytes, data);

                record.clear();
                if self.free.send(record).is_err() {
                    debug!(shard = self.id, "re-post failed, dropping receive");
                    self.outstanding.fetch_sub(1, AcqRel);
                }
            }
            None => {
                // injected completion without a record
                (self.callback)(completion.key, completion.bytes, None);
            }
        }
        false
    }
}
