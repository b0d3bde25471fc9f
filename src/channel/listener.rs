//! Lifecycle observers.
//!
//! A listener holds a bounded queue of state-change notifications. When the
//! bound is exceeded the oldest notification is dropped and a loss flag set,
//! so a stalled observer can never extend channel lifetime or memory.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Channel lifecycle notifications, in the order a client sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connecting,
    Established,
    Broken,
    Closed,
}

pub(crate) struct ListenerQueue {
    inner: Mutex<ListenerInner>,
    notify: Notify,
    bound: usize,
}

struct ListenerInner {
    queue: VecDeque<ChannelEvent>,
    lost: bool,
    closed: bool,
}

impl ListenerQueue {
    pub fn new(bound: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ListenerInner {
                queue: VecDeque::with_capacity(bound.max(1)),
                lost: false,
                closed: false,
            }),
            notify: Notify::new(),
            bound: bound.max(1),
        })
    }

    pub fn push(&self, event: ChannelEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        if inner.queue.len() >= self.bound {
            inner.queue.pop_front();
            inner.lost = true;
        }
        inner.queue.push_back(event);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_one();
    }
}

/// The observer handle returned by `Channel::add_listener`.
pub struct ChannelListener {
    pub(crate) queue: Arc<ListenerQueue>,
}

impl ChannelListener {
    /// The next notification, or `None` once the channel is gone and the
    /// queue has drained.
    pub async fn next(&self) -> Option<ChannelEvent> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.queue.inner.lock().unwrap();
                if let Some(event) = inner.queue.pop_front() {
                    // wake any other pending next() for remaining items
                    if !inner.queue.is_empty() || inner.closed {
                        self.queue.notify.notify_one();
                    }
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.as_mut().await;
        }
    }

    /// Whether notifications were dropped because the bound was exceeded.
    pub fn lost_events(&self) -> bool {
        self.queue.inner.lock().unwrap().lost
    }
}
