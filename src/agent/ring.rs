//! Fixed-capacity sample history.
//!
//! Samples are stored back to back in one flat allocation, `width` values
//! per slot. Valid slots occupy `[base, base + size)` modulo the capacity.
//! Pushing into a full buffer overwrites the oldest sample.
//!
//! Every operation holds the buffer's lock for its whole duration. The
//! sampler only takes it to copy a finished sample in, so counter reads
//! never contend with readers.

use crate::agent::registry::Schema;
use crate::agent::stats::OVERWRITTEN;

use parking_lot::Mutex;

use std::sync::Arc;

struct Ring {
    data: Box<[u64]>,
    width: usize,
    capacity: usize,
    base: usize,
    size: usize,
    next: usize,
}

impl Ring {
    fn slot(&self, index: usize) -> &[u64] {
        let start = index * self.width;
        &self.data[start..start + self.width]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u64] {
        let start = index * self.width;
        &mut self.data[start..start + self.width]
    }

    fn last(&self) -> Option<usize> {
        if self.size == 0 {
            None
        } else {
            Some((self.base + self.size - 1) % self.capacity)
        }
    }
}

pub struct SampleBuffer {
    schema: Arc<Schema>,
    inner: Mutex<Ring>,
}

impl SampleBuffer {
    /// Creates an empty buffer holding up to `capacity` samples of the
    /// schema's width. A zero capacity is raised to one.
    pub fn new(schema: Arc<Schema>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let width = schema.width();

        Self {
            schema,
            inner: Mutex::new(Ring {
                data: vec![0; capacity * width].into_boxed_slice(),
                width,
                capacity,
                base: 0,
                size: 0,
                next: 0,
            }),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().size
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a sample, overwriting the oldest one when full. Values past
    /// the schema's width are ignored and missing ones are zero.
    pub fn push(&self, sample: &[u64]) {
        let mut ring = self.inner.lock();

        let next = ring.next;
        let slot = ring.slot_mut(next);
        let n = sample.len().min(slot.len());
        slot[..n].copy_from_slice(&sample[..n]);
        slot[n..].fill(0);

        if ring.size < ring.capacity {
            ring.size += 1;
        } else {
            ring.base = (ring.base + 1) % ring.capacity;
            OVERWRITTEN.increment();
        }
        ring.next = (ring.next + 1) % ring.capacity;
    }

    /// Renders and removes the oldest samples, one record per line.
    ///
    /// Draining stops once less than half of `limit` bytes remain, or when
    /// the next record would not fit. Whatever is returned is gone from the
    /// buffer.
    pub fn drain_to_text(&self, limit: usize) -> String {
        let mut ring = self.inner.lock();
        let mut out = String::new();

        while ring.size > 0 {
            let remaining = limit.saturating_sub(out.len());
            if remaining <= limit / 2 {
                break;
            }

            let record = self.schema.render(ring.slot(ring.base));
            if record.len() > remaining {
                break;
            }

            out.push_str(&record);
            ring.base = (ring.base + 1) % ring.capacity;
            ring.size -= 1;
        }

        out
    }

    /// Renders the newest sample, or nothing when the buffer is empty.
    pub fn peek_last(&self) -> String {
        let ring = self.inner.lock();

        match ring.last() {
            Some(index) => self.schema.render(ring.slot(index)),
            None => String::new(),
        }
    }

    /// Empties the buffer without moving the oldest-sample position.
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.size = 0;
        ring.next = ring.base;
    }

    #[cfg(test)]
    fn indices(&self) -> (usize, usize, usize) {
        let ring = self.inner.lock();
        (ring.base, ring.size, ring.next)
    }
}
