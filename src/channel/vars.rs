//! Per-call ambient metadata: identity of the method being called plus the
//! trace/span coordinates of the call.
//!
//! A root call mints a fresh trace id and takes span 1; children inherit the
//! trace and draw their span ids from a counter owned by the root, so span
//! ids within one trace are unique and monotonically allocated.

use crate::channel::Channel;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct CallVars {
    /// The channel the call runs on; present for incoming handlers so they
    /// can issue nested calls.
    pub channel: Option<Channel>,
    pub service_name: String,
    pub method_name: String,
    pub method_index: i32,
    pub fifo_key: String,
    pub trace_id: Uuid,
    pub span_parent_id: i32,
    pub span_id: i32,
    next_span_id: Arc<AtomicI32>,
}

impl CallVars {
    /// A root call: new v4 trace id, span 1 under parent 0, child counter
    /// starting at 2.
    pub fn root(
        channel: Option<Channel>,
        service_name: &str,
        method_name: &str,
        method_index: i32,
        fifo_key: &str,
    ) -> Self {
        Self {
            channel,
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            method_index,
            fifo_key: fifo_key.to_string(),
            trace_id: Uuid::new_v4(),
            span_parent_id: 0,
            span_id: 1,
            next_span_id: Arc::new(AtomicI32::new(2)),
        }
    }

    /// A child call: inherits the parent's trace, parents under the
    /// parent's span, and draws its span id from the shared counter.
    pub fn child_of(
        parent: &CallVars,
        channel: Option<Channel>,
        service_name: &str,
        method_name: &str,
        method_index: i32,
        fifo_key: &str,
    ) -> Self {
        let span_id = parent.next_span_id.fetch_add(1, Ordering::SeqCst);
        Self {
            channel,
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            method_index,
            fifo_key: fifo_key.to_string(),
            trace_id: parent.trace_id,
            span_parent_id: parent.span_id,
            span_id,
            next_span_id: parent.next_span_id.clone(),
        }
    }

    /// Vars for a request arriving off the wire: the trace id travels, span
    /// coordinates restart locally.
    pub(crate) fn incoming(
        channel: Option<Channel>,
        service_name: &str,
        method_name: &str,
        trace_id: Uuid,
    ) -> Self {
        Self {
            channel,
            service_name: service_name.to_string(),
            method_name: method_name.to_string(),
            method_index: -1,
            fifo_key: String::new(),
            trace_id,
            span_parent_id: 0,
            span_id: 1,
            next_span_id: Arc::new(AtomicI32::new(2)),
        }
    }
}

impl std::fmt::Debug for CallVars {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[{}.{} trace:{} span:{}<-{}]",
            self.service_name, self.method_name, self.trace_id, self.span_id, self.span_parent_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_root_vars() {
        let vars = CallVars::root(None, "svc", "m", 0, "");
        assert_eq!(vars.span_id, 1);
        assert_eq!(vars.span_parent_id, 0);
        assert!(!vars.trace_id.is_nil());
    }

    #[test]
    fn test_child_inherits_trace_and_counter() {
        let root = CallVars::root(None, "svc", "m", 0, "");
        let c1 = CallVars::child_of(&root, None, "svc", "m2", 1, "");
        let c2 = CallVars::child_of(&root, None, "svc", "m3", 2, "");
        assert_eq!(c1.trace_id, root.trace_id);
        assert_eq!(c1.span_parent_id, 1);
        assert_eq!(c1.span_id, 2);
        assert_eq!(c2.span_id, 3);

        // grandchild draws from the same shared counter
        let g = CallVars::child_of(&c1, None, "svc", "m4", 3, "");
        assert_eq!(g.span_parent_id, c1.span_id);
        assert_eq!(g.span_id, 4);
    }

    #[test]
    fn test_span_ids_unique_under_concurrency() {
        let root = CallVars::root(None, "svc", "m", 0, "");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let parent = root.clone();
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .map(|_| CallVars::child_of(&parent, None, "s", "m", 0, "").span_id)
                    .collect::<Vec<i32>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().expect("join") {
                assert!(seen.insert(id), "span id {} allocated twice", id);
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
