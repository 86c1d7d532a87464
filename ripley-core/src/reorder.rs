//! The reorder buffer: a bounded min-heap over timestamps, used by the
//! companion sort mode to re-sort a nearly-ordered input stream.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::record::RequestRecord;

/// One pending request in the heap, ordered by `timestamp` ascending
/// (ties broken by arrival sequence, so the buffer is stable).
struct HeapEntry {
    timestamp: DateTime<Utc>,
    sequence: u64,
    request: RequestRecord,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Bounded-memory k-way merge: buffers up to `buffer_len` requests before
/// it starts emitting, so that inputs disordered by up to `buffer_len`
/// positions come out in strict timestamp order.
pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    buffer_len: usize,
    sequence: u64,
    last_emitted: Option<DateTime<Utc>>,
}

/// The outcome of pushing one record: either nothing is emitted yet (the
/// buffer hasn't filled), or the minimum is popped and returned alongside
/// whether doing so violated monotonicity.
pub struct Emission {
    pub request: RequestRecord,
    pub out_of_order: bool,
}

impl ReorderBuffer {
    pub fn new(buffer_len: usize) -> Self {
        ReorderBuffer {
            heap: BinaryHeap::new(),
            buffer_len,
            sequence: 0,
            last_emitted: None,
        }
    }

    /// Push one record. Returns `Some(Emission)` once the heap exceeds
    /// `buffer_len`, pairing the push with a pop-and-emit of the minimum.
    pub fn push(&mut self, request: RequestRecord) -> Option<Emission> {
        let entry = HeapEntry {
            timestamp: request.timestamp,
            sequence: self.sequence,
            request,
        };
        self.sequence += 1;
        self.heap.push(Reverse(entry));

        if self.heap.len() > self.buffer_len {
            Some(self.pop_and_check())
        } else {
            None
        }
    }

    /// Drain the remainder of the heap in order, for use at EOF.
    pub fn drain(&mut self) -> Vec<Emission> {
        let mut out = Vec::with_capacity(self.heap.len());
        while !self.heap.is_empty() {
            out.push(self.pop_and_check());
        }
        out
    }

    fn pop_and_check(&mut self) -> Emission {
        let Reverse(entry) = self.heap.pop().expect("checked non-empty before popping");
        let out_of_order = match self.last_emitted {
            Some(last) => entry.timestamp < last,
            None => false,
        };
        self.last_emitted = Some(entry.timestamp);
        Emission {
            request: entry.request,
            out_of_order,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
