//! Deadline-timer service.
//!
//! One thread owns a heap of deadlines and runs callbacks as they come due;
//! patterns and executors arm timers through [`TimerQueue::schedule`] and
//! cancel through the returned [`TimerHandle`]. Callbacks run on the timer
//! thread and must be short: they should snapshot work under their own lock
//! and hand off, never block. Callbacks capture only `Weak` references so a
//! pending timer cannot keep a connection alive.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::trace;

type Callback = Box<dyn FnOnce() + Send + 'static>;

enum TimerCmd {
    Arm {
        id: u64,
        deadline: Instant,
        callback: Callback,
    },
    Cancel {
        id: u64,
    },
}

/// Cancels its timer when asked; dropping the handle does not.
pub struct TimerHandle {
    id: u64,
    commands: Sender<TimerCmd>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        let _ = self.commands.send(TimerCmd::Cancel { id: self.id });
    }
}

pub struct TimerQueue {
    commands: Mutex<Option<Sender<TimerCmd>>>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let thread = std::thread::Builder::new()
            .name("timer-queue".to_string())
            .spawn(move || run(rx))
            .expect("failed to spawn timer-queue thread");

        Self {
            commands: Mutex::new(Some(tx)),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Run `callback` after `delay`.
    pub fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Relaxed);
        let deadline = Instant::now() + delay;

        let guard = self.commands.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(TimerCmd::Arm {
                id,
                deadline,
                callback: Box::new(callback),
            });
            TimerHandle {
                id,
                commands: tx.clone(),
            }
        } else {
            // queue already shut down; hand back an inert handle
            let (orphan, _) = unbounded();
            TimerHandle {
                id,
                commands: orphan,
            }
        }
    }

    /// Stop the timer thread, dropping pending callbacks. Idempotent.
    pub fn shutdown(&self) {
        self.commands.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            // a callback may drop the last owner of this queue
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(commands: Receiver<TimerCmd>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut callbacks: HashMap<u64, Callback> = HashMap::new();

    loop {
        // fire everything due; canceled ids have no callback and are skipped
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = deadlines.peek() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some(callback) = callbacks.remove(&id) {
                trace!(timer = id, "firing timer");
                callback();
            }
        }

        let command = match deadlines.peek() {
            Some(&Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(wait) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match commands.recv() {
                Ok(cmd) => cmd,
                Err(_) => return,
            },
        };

        match command {
            TimerCmd::Arm {
                id,
                deadline,
                callback,
            } => {
                deadlines.push(Reverse((deadline, id)));
                callbacks.insert(id, callback);
            }
            TimerCmd::Cancel { id } => {
                callbacks.remove(&id);
            }
        }
    }
}
