// SPDX-License-Identifier: Apache-2.0 OR MIT
// Latency-bounded MPMC queue between producers and sink workers

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::ring::Ring;
use crate::error::Error;

/// Concurrent queue oriented on maintaining a maximum latency.
///
/// Inserted values first land in a thread-associative **ingress**
/// ring, debouncing receiver wakeups. Each ingress belongs to one
/// **depot**; each depot is drained by a fixed set of **reader
/// heads**. A head drains rotated-out rings, and when its deadline
/// expires with nothing ready it sweeps the depot's ingresses,
/// rotating non-empty rings into the ready queue. A producer that
/// fills its ingress rotates the full ring into the depot itself
/// (waking a head); if the depot has neither ready room nor a spare
/// ring, the producer parks on a ticket until a head recycles a ring
/// or the insert timeout expires.
///
/// All rings are allocated up front: at steady state (insert rate at
/// or below drain rate) the queue performs no allocation.
///
/// Ordering: values from one ingress are delivered in insertion
/// order until a rotation; there is no order across ingresses or
/// across heads.
pub struct LatencyQueue<T> {
    ingresses: Vec<Mutex<Ring<T>>>,
    depots: Vec<Depot<T>>,
    heads: Vec<Mutex<Head<T>>>,
    latency: Duration,
    heads_per_depot: usize,
}

struct Depot<T> {
    state: Mutex<DepotState<T>>,
    readers: Condvar,
}

struct DepotState<T> {
    /// Full rings awaiting a head.
    ready: VecDeque<Ring<T>>,
    /// Empty rings handed to ingresses on rotation.
    spare: Vec<Ring<T>>,
    /// Producers blocked because ready was full and spare empty.
    waiters: VecDeque<Arc<Ticket>>,
    ready_limit: usize,
}

struct Head<T> {
    /// Partial drain progress; survives a predicate-driven exit.
    drain: Option<Ring<T>>,
    /// Next sweep time.
    deadline: Instant,
}

struct Ticket {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Ticket {
    fn new() -> Self {
        Ticket {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *lock(&self.signaled) = true;
        self.cond.notify_one();
    }

    /// Wait until signaled or `deadline`; true if signaled.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            signaled = guard;
        }
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> LatencyQueue<T> {
    /// Build a queue.
    ///
    /// * `latency` - maximum time a value may sit in an idle ingress.
    /// * `capacity` - elements per ring.
    /// * `ingresses` - ingress slot count (producers hash onto these).
    /// * `depots` - independent drain partitions.
    /// * `heads_per_depot` - reader heads serving each depot.
    ///
    /// # Panics
    /// Panics if `capacity`, `depots` or `heads_per_depot` is zero, or
    /// if there are fewer ingresses than depots.
    pub fn new(
        latency: Duration,
        capacity: usize,
        ingresses: usize,
        depots: usize,
        heads_per_depot: usize,
    ) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        assert!(depots > 0, "at least one depot required");
        assert!(heads_per_depot > 0, "at least one head per depot required");
        assert!(
            ingresses >= depots,
            "every depot needs at least one ingress"
        );

        let ingress_rings = (0..ingresses)
            .map(|_| Mutex::new(Ring::new(capacity)))
            .collect();

        // Two spares per assigned ingress, so every ingress can rotate
        // while another full ring waits to drain.
        let depot_nodes = (0..depots)
            .map(|depot| {
                let assigned = (depot..ingresses).step_by(depots).count();
                let spares = assigned * 2;
                Depot {
                    state: Mutex::new(DepotState {
                        ready: VecDeque::with_capacity(spares),
                        spare: (0..spares).map(|_| Ring::new(capacity)).collect(),
                        waiters: VecDeque::new(),
                        ready_limit: spares,
                    }),
                    readers: Condvar::new(),
                }
            })
            .collect();

        let now = Instant::now();
        let heads = (0..depots * heads_per_depot)
            .map(|_| {
                Mutex::new(Head {
                    drain: None,
                    deadline: now + latency,
                })
            })
            .collect();

        LatencyQueue {
            ingresses: ingress_rings,
            depots: depot_nodes,
            heads,
            latency,
            heads_per_depot,
        }
    }

    pub fn ingress_count(&self) -> usize {
        self.ingresses.len()
    }

    pub fn depot_count(&self) -> usize {
        self.depots.len()
    }

    /// Total reader-head slots; `consume` indexes below this.
    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    fn thread_slot(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() as usize % self.ingresses.len()
    }

    /// Insert into the calling thread's ingress slot.
    ///
    /// Blocks at most `timeout` when the queue is saturated; on expiry
    /// the value is handed back as `Err`.
    pub fn insert(&self, value: T, timeout: Duration) -> Result<(), T> {
        self.insert_at(self.thread_slot(), value, timeout)
    }

    /// Insert into an explicit ingress slot (used by the flush
    /// barrier to reach every slot).
    pub(crate) fn insert_at(&self, slot: usize, value: T, timeout: Duration) -> Result<(), T> {
        let slot = slot % self.ingresses.len();
        let depot = &self.depots[slot % self.depots.len()];
        let deadline = Instant::now() + timeout;
        let mut value = Some(value);

        loop {
            let mut parked: Option<Arc<Ticket>> = None;
            let mut rotated = false;
            {
                let mut ring = lock(&self.ingresses[slot]);
                match ring.push(value.take().unwrap()) {
                    Ok(()) => return Ok(()),
                    Err(back) => value = Some(back),
                }

                // Ring full: try to rotate it into the depot. Try-lock
                // only, so a sweeping head holding the depot cannot
                // deadlock against us (lock order: ingress, depot).
                if let Ok(mut state) = depot.state.try_lock() {
                    if state.ready.len() < state.ready_limit {
                        if let Some(spare) = state.spare.pop() {
                            let full = std::mem::replace(&mut *ring, spare);
                            state.ready.push_back(full);
                            match ring.push(value.take().unwrap()) {
                                Ok(()) => rotated = true,
                                Err(back) => {
                                    value = Some(back);
                                }
                            }
                        }
                    }
                    if !rotated {
                        let ticket = Arc::new(Ticket::new());
                        state.waiters.push_back(Arc::clone(&ticket));
                        parked = Some(ticket);
                    }
                }
            }

            if rotated {
                depot.readers.notify_one();
                return Ok(());
            }

            match parked {
                Some(ticket) => {
                    if !ticket.wait_until(deadline) {
                        let mut state = lock(&depot.state);
                        state.waiters.retain(|t| !Arc::ptr_eq(t, &ticket));
                        return Err(value.take().unwrap());
                    }
                }
                None => {
                    // Depot briefly busy; retry until the deadline.
                    if Instant::now() >= deadline {
                        return Err(value.take().unwrap());
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Drain values at reader head `index` until `until` says stop.
    ///
    /// `until` is evaluated before each element and between drains;
    /// partial progress is kept in the head slot, so a stopped worker
    /// can resume where it left off. Fails with [`Error::HeadBusy`]
    /// when another worker currently drives the head.
    ///
    /// # Panics
    /// Panics if `index >= head_count()`.
    pub fn consume<P, F>(&self, index: usize, mut until: P, mut receive: F) -> Result<(), Error>
    where
        P: FnMut() -> bool,
        F: FnMut(T),
    {
        assert!(index < self.heads.len(), "reader head out of range");
        let mut head = self.heads[index]
            .try_lock()
            .map_err(|_| Error::HeadBusy(index))?;
        let depot_index = index / self.heads_per_depot;
        let depot = &self.depots[depot_index];

        loop {
            if until() {
                return Ok(());
            }

            // Resume (or finish) draining the current ring.
            if let Some(ring) = head.drain.as_mut() {
                while let Some(item) = ring.pop() {
                    receive(item);
                    if until() {
                        return Ok(());
                    }
                }
                if let Some(empty) = head.drain.take() {
                    let mut state = lock(&depot.state);
                    state.spare.push(empty);
                    if let Some(ticket) = state.waiters.pop_front() {
                        drop(state);
                        ticket.signal();
                    }
                }
            }

            let mut state = lock(&depot.state);
            if let Some(ring) = state.ready.pop_front() {
                head.drain = Some(ring);
                continue;
            }

            // Nothing ready: sleep until the deadline or a producer
            // rotation wakes us.
            let now = Instant::now();
            if now < head.deadline {
                let (guard, result) = depot
                    .readers
                    .wait_timeout(state, head.deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                state = guard;
                if !result.timed_out() {
                    if let Some(ring) = state.ready.pop_front() {
                        head.drain = Some(ring);
                    }
                    continue;
                }
            }

            // Deadline expired and still nothing ready: sweep the
            // ingresses assigned to this depot.
            head.deadline = Instant::now() + self.latency;
            let ready_before = state.ready.len();
            for slot in (depot_index..self.ingresses.len()).step_by(self.depots.len()) {
                if state.ready.len() >= state.ready_limit {
                    break;
                }
                let Some(spare) = state.spare.pop() else {
                    break;
                };
                let mut ring = lock(&self.ingresses[slot]);
                if ring.is_empty() {
                    drop(ring);
                    state.spare.push(spare);
                    continue;
                }
                let full = std::mem::replace(&mut *ring, spare);
                drop(ring);
                state.ready.push_back(full);
            }
            // Sibling heads sleep on the same condvar; anything the
            // sweep surfaced is their work too, same as a producer
            // rotation.
            if state.ready.len() > ready_before {
                depot.readers.notify_all();
            }
            if let Some(ring) = state.ready.pop_front() {
                head.drain = Some(ring);
            }
        }
    }

    /// Wake every sleeping head; used at shutdown so stop predicates
    /// are observed promptly.
    pub(crate) fn wake_all(&self) {
        for depot in &self.depots {
            let _guard = lock(&depot.state);
            depot.readers.notify_all();
        }
    }
}
