// SPDX-License-Identifier: Apache-2.0 OR MIT
// Dispatcher: worker threads, the deferred sink and flush plumbing

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use super::flush::Flush;
use super::queue::LatencyQueue;
use crate::erasure::Erasure;
use crate::error::{Error, Result};
use crate::message::{Message, MessageBuilder};
use crate::sink::{sink_ref, NullSink, Sink, SinkRef};
use crate::site::CallSite;

/// Construction parameters for a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    /// Maximum time a message may sit in an idle ingress.
    pub latency: Duration,
    /// How long an insert may block when the queue is saturated.
    pub insert_timeout: Duration,
    /// Elements per ingress ring.
    pub capacity: usize,
    /// Ingress slot count; 0 selects twice the available parallelism.
    pub ingresses: usize,
    /// Independent drain partitions.
    pub depots: usize,
    /// Reader heads (worker threads) per depot.
    pub heads_per_depot: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        DispatchOptions {
            latency: Duration::from_millis(1),
            insert_timeout: Duration::from_millis(5),
            capacity: 128,
            ingresses: 0,
            depots: 1,
            heads_per_depot: 1,
        }
    }
}

/// One queued delivery.
struct Action {
    sink: SinkRef,
    site: &'static CallSite,
    message: Message,
}

/// Site label attached to flush tokens riding through the queue.
static FLUSH_SITE: CallSite = CallSite::new(
    "relog.flush",
    "relog::dispatch::flush",
    "relog::dispatch",
);

/// Latency-bounded handoff between producing threads and sink
/// workers.
///
/// `run` spawns one OS thread per reader head; alternatively callers
/// drive heads themselves with [`work`](Dispatcher::work). Dropping
/// the dispatcher stops and joins its workers; queued messages that
/// were never drained are dropped.
pub struct Dispatcher {
    queue: Arc<LatencyQueue<Action>>,
    insert_timeout: Duration,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    drops: AtomicU64,
}

impl Dispatcher {
    pub fn new(options: DispatchOptions) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let ingresses = match options.ingresses {
            0 => parallelism * 2,
            n => n,
        }
        .max(options.depots);

        Dispatcher {
            queue: Arc::new(LatencyQueue::new(
                options.latency,
                options.capacity,
                ingresses,
                options.depots,
                options.heads_per_depot,
            )),
            insert_timeout: options.insert_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            drops: AtomicU64::new(0),
        }
    }

    pub fn head_count(&self) -> usize {
        self.queue.head_count()
    }

    pub fn ingress_count(&self) -> usize {
        self.queue.ingress_count()
    }

    /// Messages dropped because an insert timed out.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Queue `(sink, site, message)` for delivery by a worker.
    ///
    /// Blocks at most the configured insert timeout; on expiry the
    /// message is dropped and [`Error::InsertTimeout`] returned.
    pub fn insert(&self, sink: SinkRef, site: &'static CallSite, message: Message) -> Result<()> {
        let action = Action {
            sink,
            site,
            message,
        };
        match self.queue.insert(action, self.insert_timeout) {
            Ok(()) => Ok(()),
            Err(action) => {
                drop(action);
                self.drops.fetch_add(1, Ordering::Relaxed);
                Err(Error::InsertTimeout(self.insert_timeout))
            }
        }
    }

    /// Drive reader head `index` on the calling thread until `until`
    /// reports stop; each drained action is delivered to its sink.
    pub fn work<P: FnMut() -> bool>(&self, index: usize, until: P) -> Result<()> {
        self.queue.consume(index, until, |action: Action| {
            action.sink.emit(action.site, action.message);
        })
    }

    /// Spawn one worker thread per reader head. Idempotent.
    ///
    /// Fails with [`Error::WorkerSpawn`] if the OS refuses a thread;
    /// workers spawned before the failure keep running and are joined
    /// on drop as usual.
    pub fn run(&self) -> Result<()> {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return Ok(());
        }
        for index in 0..self.queue.head_count() {
            let queue = Arc::clone(&self.queue);
            let stop = Arc::clone(&self.stop);
            let handle = std::thread::Builder::new()
                .name(format!("relog-head-{index}"))
                .spawn(move || {
                    let _ = queue.consume(
                        index,
                        || stop.load(Ordering::Relaxed),
                        |action: Action| {
                            action.sink.emit(action.site, action.message);
                        },
                    );
                })
                .map_err(|err| Error::WorkerSpawn(err.to_string()))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Plant a flush token in every ingress slot.
    ///
    /// Waiting on the returned barrier blocks until all tokens have
    /// been drained; every message that was buffered anywhere in the
    /// queue when this call began is delivered first. A token whose
    /// insert times out is dropped on the spot and does not stall the
    /// barrier.
    pub fn flush(&self) -> Flush {
        let flush = Flush::new();
        let null: SinkRef = sink_ref(NullSink);
        for slot in 0..self.queue.ingress_count() {
            let mut builder = MessageBuilder::new();
            builder.push(Erasure::new(flush.token()));
            let action = Action {
                sink: null.clone(),
                site: &FLUSH_SITE,
                message: builder.finish(),
            };
            if self.queue.insert_at(slot, action, self.insert_timeout).is_err() {
                self.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
        flush
    }

    /// Stop and join the worker threads. Called from `drop`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.queue.wake_all();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sink that defers formatting and I/O to a [`Dispatcher`].
///
/// Emission inserts `(inner sink, site, message)` into the queue with
/// the configured timeout. On insert failure one diagnostic line goes
/// to standard error and the message is dropped; the producing call
/// never observes an error.
pub struct DeferredSink {
    dispatcher: Arc<Dispatcher>,
    inner: SinkRef,
}

impl DeferredSink {
    pub fn new(dispatcher: Arc<Dispatcher>, inner: SinkRef) -> Self {
        DeferredSink { dispatcher, inner }
    }
}

impl Sink for DeferredSink {
    fn emit(&self, site: &'static CallSite, message: Message) {
        if self
            .dispatcher
            .insert(self.inner.clone(), site, message)
            .is_err()
        {
            eprintln!(
                "relog: dispatch queue full; message from {} dropped",
                site.location()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CaptureSink {
        lines: Arc<StdMutex<Vec<String>>>,
    }

    impl Sink for CaptureSink {
        fn emit(&self, _site: &'static CallSite, message: Message) {
            self.lines.lock().unwrap().push(message.to_string());
        }
    }

    fn capture() -> (SinkRef, Arc<StdMutex<Vec<String>>>) {
        let lines = Arc::new(StdMutex::new(Vec::new()));
        (
            sink_ref(CaptureSink {
                lines: Arc::clone(&lines),
            }),
            lines,
        )
    }

    fn leaked_site() -> &'static CallSite {
        let site = Box::leak(Box::new(CallSite::new(
            "dispatch-test",
            "dispatcher.rs:0",
            "dispatch::tests",
        )));
        site.mark_registered();
        site
    }

    fn small_options() -> DispatchOptions {
        DispatchOptions {
            latency: Duration::from_millis(1),
            insert_timeout: Duration::from_millis(50),
            capacity: 16,
            ingresses: 2,
            depots: 1,
            heads_per_depot: 1,
        }
    }

    #[test]
    fn test_deferred_sink_delivers_through_workers() {
        let dispatcher = Arc::new(Dispatcher::new(small_options()));
        dispatcher.run().unwrap();

        let (sink, lines) = capture();
        let deferred = DeferredSink::new(Arc::clone(&dispatcher), sink);
        let site = leaked_site();

        let count = 100;
        for n in 0..count {
            deferred.emit(site, Message::capture(("n=", n)));
        }
        dispatcher.flush().wait();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), count);
        // Single producer, single head: order survives.
        assert_eq!(lines[0], "n=0");
        assert_eq!(lines[count - 1], format!("n={}", count - 1));
    }

    #[test]
    fn test_flush_without_workers_stays_pending() {
        let dispatcher = Dispatcher::new(small_options());
        let flush = dispatcher.flush();
        assert!(!flush.wait_timeout(Duration::from_millis(20)));
        // Dropping the dispatcher drops the queued tokens and releases
        // the barrier.
        drop(dispatcher);
        assert!(flush.wait_timeout(Duration::from_millis(100)));
    }

    #[test]
    fn test_insert_timeout_counts_drops() {
        let dispatcher = Dispatcher::new(DispatchOptions {
            latency: Duration::from_secs(3600),
            insert_timeout: Duration::from_millis(10),
            capacity: 1,
            ingresses: 1,
            depots: 1,
            heads_per_depot: 1,
        });
        let (sink, _lines) = capture();
        let site = leaked_site();

        let mut failed = 0;
        for n in 0..5 {
            if dispatcher
                .insert(sink.clone(), site, Message::capture(("n=", n)))
                .is_err()
            {
                failed += 1;
            }
        }
        assert!(failed >= 1);
        assert_eq!(dispatcher.drops(), failed);
    }

    #[test]
    fn test_caller_driven_head() {
        let dispatcher = Dispatcher::new(small_options());
        let (sink, lines) = capture();
        let site = leaked_site();

        for n in 0..5 {
            dispatcher
                .insert(sink.clone(), site, Message::capture(("n=", n)))
                .unwrap();
        }

        {
            let lines = Arc::clone(&lines);
            dispatcher
                .work(0, move || lines.lock().unwrap().len() >= 5)
                .unwrap();
        }
        assert_eq!(lines.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_run_is_idempotent() {
        let dispatcher = Dispatcher::new(small_options());
        dispatcher.run().unwrap();
        let before = dispatcher.head_count();
        dispatcher.run().unwrap();
        assert_eq!(dispatcher.head_count(), before);
        dispatcher.stop();
    }

    #[test]
    fn test_default_options_are_sane() {
        let options = DispatchOptions::default();
        assert!(options.capacity > 0);
        assert_eq!(options.ingresses, 0);
        let dispatcher = Dispatcher::new(options);
        assert!(dispatcher.ingress_count() >= 2);
        assert_eq!(dispatcher.head_count(), 1);
    }
}
