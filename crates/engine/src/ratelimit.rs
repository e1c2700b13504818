//! Token-bucket pacing for send tasks.
//!
//! Budget is measured over a configurable quantum: `bytes_per_quantum =
//! target * quantum_ms / 1000`. A send that would overrun the current
//! quantum's budget gets its `time_offset_ms` pushed out to the next
//! permitted quantum. The quantum start time anchors at the first send and
//! only ever advances.

use crate::clock;
use crate::task::{Task, TaskAction};

#[derive(Debug)]
pub enum RateLimiter {
    DontThrottle,
    Throttle(TokenBucket),
}

#[derive(Debug)]
pub struct TokenBucket {
    bytes_per_quantum: u64,
    quantum_ms: i64,
    sent_this_quantum: u64,
    quantum_start_ms: Option<i64>,
}

impl RateLimiter {
    /// `bytes_per_second == 0` disables throttling.
    pub fn new(bytes_per_second: u64, quantum_ms: i64) -> Self {
        if bytes_per_second == 0 {
            return RateLimiter::DontThrottle;
        }
        RateLimiter::Throttle(TokenBucket {
            bytes_per_quantum: bytes_per_second * quantum_ms as u64 / 1000,
            quantum_ms,
            sent_this_quantum: 0,
            quantum_start_ms: None,
        })
    }

    /// Update `task.time_offset_ms` so the send respects the configured rate.
    /// Only `Send` tasks are adjusted.
    pub fn update_time_offset(&mut self, task: &mut Task, buffer_size: u64) {
        self.update_at(task, buffer_size, clock::now_ms());
    }

    pub(crate) fn update_at(&mut self, task: &mut Task, buffer_size: u64, current_time_ms: i64) {
        if task.action != TaskAction::Send {
            return;
        }

        let bucket = match self {
            RateLimiter::DontThrottle => return,
            RateLimiter::Throttle(bucket) => bucket,
        };

        task.time_offset_ms = 0;
        let start = *bucket.quantum_start_ms.get_or_insert(current_time_ms);

        if bucket.sent_this_quantum < bucket.bytes_per_quantum {
            if current_time_ms < start + bucket.quantum_ms {
                if current_time_ms > start {
                    // time is in the current quantum
                    bucket.sent_this_quantum += buffer_size;
                } else {
                    // time is still in a prior quantum
                    task.time_offset_ms = bucket.next_quantum_start(start) - current_time_ms;
                    bucket.sent_this_quantum += buffer_size;
                }
            } else {
                // time is already in a new quantum - start over
                bucket.sent_this_quantum = buffer_size;
                bucket.quantum_start_ms = Some(current_time_ms);
            }
        } else {
            // have already fulfilled the prior quantum
            let new_start = bucket.next_quantum_start(start);
            if current_time_ms < new_start {
                task.time_offset_ms = new_start - current_time_ms;
                bucket.sent_this_quantum = buffer_size;
                bucket.quantum_start_ms = Some(new_start);
            } else {
                bucket.sent_this_quantum = buffer_size;
                bucket.quantum_start_ms = Some(current_time_ms);
            }
        }
    }
}

impl TokenBucket {
    fn next_quantum_start(&self, start: i64) -> i64 {
        start + (self.sent_this_quantum / self.bytes_per_quantum) as i64 * self.quantum_ms
    }
}
