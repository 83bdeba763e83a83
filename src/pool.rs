// SPDX-License-Identifier: Apache-2.0 OR MIT
// Size-classed buffer pool for allocation-free emission

use crossbeam_queue::SegQueue;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

const SMALL_BUFFER_SIZE: usize = 256;
const STANDARD_BUFFER_SIZE: usize = 4096;
const LARGE_BUFFER_SIZE: usize = 16384;

/// Cached buffers retained per class; returns beyond the cap are
/// dropped rather than hoarded.
const CLASS_CACHE_LIMIT: usize = 64;

/// One free-list of equally sized buffers.
struct PoolClass {
    capacity: usize,
    cached: SegQueue<Vec<u8>>,
    count: AtomicUsize,
}

impl PoolClass {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cached: SegQueue::new(),
            count: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        let buffer = self.cached.pop();
        if buffer.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        buffer
    }

    fn give(&self, mut buffer: Vec<u8>) {
        // A buffer grown past its class would carry that capacity in
        // the cache forever, defeating the size classing; drop it and
        // let the class re-allocate at its own size.
        if buffer.capacity() > self.capacity {
            return;
        }
        // Approximate cap: concurrent returns may briefly overshoot.
        if self.count.load(Ordering::Relaxed) < CLASS_CACHE_LIMIT {
            buffer.clear();
            self.count.fetch_add(1, Ordering::Relaxed);
            self.cached.push(buffer);
        }
    }
}

/// Size-classed pool of byte buffers.
///
/// A request at or below a class capacity returns a cached buffer if
/// one is available, otherwise a freshly allocated one that will
/// return itself to the class when dropped. Requests beyond the
/// largest class are served by a plain allocation that is simply
/// dropped on release.
pub struct BufferPool {
    classes: [PoolClass; 3],
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: [
                PoolClass::new(SMALL_BUFFER_SIZE),
                PoolClass::new(STANDARD_BUFFER_SIZE),
                PoolClass::new(LARGE_BUFFER_SIZE),
            ],
        })
    }

    /// Acquire a buffer able to hold at least `size` bytes.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PooledBuf {
        for (index, class) in self.classes.iter().enumerate() {
            if size <= class.capacity {
                let data = class
                    .take()
                    .unwrap_or_else(|| Vec::with_capacity(class.capacity));
                return PooledBuf {
                    data,
                    class: Some(index),
                    pool: Arc::clone(self),
                };
            }
        }
        PooledBuf {
            data: Vec::with_capacity(size),
            class: None,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently cached in the class serving `size`.
    pub fn cached(&self, size: usize) -> usize {
        self.classes
            .iter()
            .find(|class| size <= class.capacity)
            .map(|class| class.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn release(&self, buffer: Vec<u8>, class: Option<usize>) {
        if let Some(index) = class {
            self.classes[index].give(buffer);
        }
    }
}

/// Process-wide pool used by the built-in sinks.
pub fn global() -> &'static Arc<BufferPool> {
    static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

/// A byte buffer that returns itself to its pool class when dropped.
pub struct PooledBuf {
    data: Vec<u8>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(data, self.class);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

// Text rendering lands directly in the pooled bytes.
impl fmt::Write for PooledBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.data.extend_from_slice(s.as_bytes());
        Ok(())
    }
}
