//! The table correlating in-flight requests with the responses, deadline
//! expiries or stream failures that resolve them.
//!
//! Keyed by sequence number; sequence numbers are never reused, so a resolve
//! against an unknown key is a late response and is dropped. Deadlines ride
//! a min-heap with lazy deletion: entries whose call already resolved are
//! skipped when they surface.

use crate::channel::OutgoingCall;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

pub(crate) struct PendingCall {
    pub seq: i32,
    pub call: OutgoingCall,
    /// The outgoing concurrency credit; dropping it on resolution returns
    /// the credit to the stream.
    pub permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
pub(crate) struct PendingCallTable {
    calls: FxHashMap<i32, PendingCall>,
    deadlines: BinaryHeap<Reverse<(Instant, i32)>>,
}

impl PendingCallTable {
    pub fn insert(&mut self, pending: PendingCall) {
        self.deadlines.push(Reverse((pending.call.deadline, pending.seq)));
        self.calls.insert(pending.seq, pending);
    }

    /// Removes the call for `seq`. `None` means already resolved or never
    /// known, i.e. a late response.
    pub fn resolve(&mut self, seq: i32) -> Option<PendingCall> {
        self.calls.remove(&seq)
    }

    /// Removes and returns every call whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<PendingCall> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if let Some(pending) = self.calls.remove(&seq) {
                due.push(pending);
            }
        }
        due
    }

    /// The earliest live deadline, discarding stale heap entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.deadlines.peek().copied() {
            if self.calls.contains_key(&seq) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Empties the table when the stream dies; the caller classifies each
    /// call as broken, closed or retryable.
    pub fn drain_all(&mut self) -> Vec<PendingCall> {
        self.deadlines.clear();
        self.calls.drain().map(|(_, p)| p).collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
