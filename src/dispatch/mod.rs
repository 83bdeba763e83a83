// SPDX-License-Identifier: Apache-2.0 OR MIT
// Asynchronous dispatch: bounded-latency handoff to sink workers
//
// Producers append to thread-associative ingress rings; depots pool
// full rings for their reader heads; heads drain on wakeup or
// deadline. The deferred sink routes emissions through the queue so
// formatting and I/O never block the producing thread.

mod dispatcher;
mod flush;
mod queue;
mod ring;

pub use dispatcher::{DeferredSink, DispatchOptions, Dispatcher};
pub use flush::{Flush, FlushToken};
pub use queue::LatencyQueue;
pub use ring::Ring;
