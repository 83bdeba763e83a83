// SPDX-License-Identifier: Apache-2.0 OR MIT
// Flush barrier: refcounted tokens drained through the queue

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct Barrier {
    pending: Mutex<usize>,
    done: Condvar,
}

impl Barrier {
    fn pend(&self) {
        *lock(&self.pending) += 1;
    }

    fn notify(&self) {
        let mut pending = lock(&self.pending);
        *pending -= 1;
        if *pending == 0 {
            self.done.notify_all();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A drain barrier over the dispatch queue.
///
/// [`Dispatcher::flush`](crate::dispatch::Dispatcher::flush) plants
/// one [`FlushToken`] copy in every ingress slot; each token signals
/// the barrier when the consuming worker drops it. Once `wait`
/// returns, every message that was already buffered when the flush
/// began has been handed to its sink. Messages enqueued afterwards
/// may or may not have been drained first.
#[derive(Clone)]
pub struct Flush {
    barrier: Arc<Barrier>,
}

impl Flush {
    pub fn new() -> Self {
        Flush {
            barrier: Arc::new(Barrier {
                pending: Mutex::new(0),
                done: Condvar::new(),
            }),
        }
    }

    /// Mint a token; the barrier completes when every token (and every
    /// clone) has been dropped.
    pub fn token(&self) -> FlushToken {
        self.barrier.pend();
        FlushToken {
            barrier: Arc::clone(&self.barrier),
        }
    }

    /// Tokens still outstanding.
    pub fn pending(&self) -> usize {
        *lock(&self.barrier.pending)
    }

    /// Block until every token has been consumed.
    pub fn wait(&self) {
        let mut pending = lock(&self.barrier.pending);
        while *pending > 0 {
            pending = self
                .barrier
                .done
                .wait(pending)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block up to `timeout`; true if the barrier completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.barrier.pending);
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .barrier
                .done
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending = guard;
        }
        true
    }
}

impl Default for Flush {
    fn default() -> Self {
        Flush::new()
    }
}

impl fmt::Debug for Flush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flush")
            .field("pending", &self.pending())
            .finish()
    }
}

/// One countable share of a [`Flush`] barrier.
///
/// Tokens ride through the queue inside messages; they render as
/// nothing, so a token slipped into an output stream leaves no trace.
pub struct FlushToken {
    barrier: Arc<Barrier>,
}

impl Clone for FlushToken {
    fn clone(&self) -> Self {
        self.barrier.pend();
        FlushToken {
            barrier: Arc::clone(&self.barrier),
        }
    }
}

impl Drop for FlushToken {
    fn drop(&mut self) {
        self.barrier.notify();
    }
}

impl fmt::Display for FlushToken {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

impl fmt::Debug for FlushToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlushToken")
    }
}
