use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{CoreError, CoreResult};

/// What the writer side of a connection pulls next.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Frame(Arc<str>),
    /// Broadcasts were dropped; send a fresh snapshot in their place.
    Resync,
}

#[derive(Debug)]
enum Slot {
    Broadcast(Arc<str>),
    Reply(Arc<str>),
    Resync,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Slot>,
    broadcasts: usize,
    resync_pending: bool,
    closed: bool,
    dropped: u64,
}

/// Bounded per-connection queue. Broadcasts beyond capacity evict the oldest
/// pending broadcast; replies are never evicted.
pub struct Outbox {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::default(),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a fan-out frame. Never blocks; returns `false` once closed.
    pub fn push_broadcast(&self, frame: Arc<str>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        if inner.broadcasts >= self.capacity {
            if let Some(oldest) = inner
                .queue
                .iter()
                .position(|slot| matches!(slot, Slot::Broadcast(_)))
            {
                inner.broadcasts -= 1;
                inner.dropped += 1;
                if inner.resync_pending {
                    inner.queue.remove(oldest);
                } else {
                    inner.queue[oldest] = Slot::Resync;
                    inner.resync_pending = true;
                }
            }
        }

        inner.queue.push_back(Slot::Broadcast(frame));
        inner.broadcasts += 1;
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Queue a reply to this connection's own request. A client that stops
    /// reading while still sending requests overflows here.
    pub fn push_reply(&self, frame: Arc<str>) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CoreError::Transport("connection closed".into()));
        }
        let replies = inner.queue.len() - inner.broadcasts - usize::from(inner.resync_pending);
        if replies >= self.capacity {
            return Err(CoreError::Transport("reply queue overflow".into()));
        }
        inner.queue.push_back(Slot::Reply(frame));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_recv(&self) -> Option<Outbound> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        let slot = inner.queue.pop_front()?;
        Some(match slot {
            Slot::Broadcast(frame) => {
                inner.broadcasts -= 1;
                Outbound::Frame(frame)
            }
            Slot::Reply(frame) => Outbound::Frame(frame),
            Slot::Resync => {
                inner.resync_pending = false;
                Outbound::Resync
            }
        })
    }

    /// Wait for the next item. `None` once the outbox is closed.
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(next) = self.try_recv() {
                return Some(next);
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.queue.clear();
        inner.broadcasts = 0;
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Broadcasts evicted so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}
