//! Bounded per-socket outbound queue.
//!
//! Producers (the bus dispatcher, timers, message handlers) push frames; the
//! socket task pops them and writes to the wire, so all outbound traffic for
//! one socket is ordered through a single queue. On overflow the oldest
//! non-critical frame is dropped; lifecycle frames displace a non-critical
//! frame rather than be dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 64;

/// One outbound frame: serialized JSON plus its delivery class.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: String,
    pub critical: bool,
}

impl Frame {
    pub fn normal(payload: String) -> Self {
        Self {
            payload,
            critical: false,
        }
    }

    pub fn critical(payload: String) -> Self {
        Self {
            payload,
            critical: true,
        }
    }
}

#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

struct MailboxInner {
    queue: Mutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a frame. Returns false if the frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                match queue.iter().position(|f| !f.critical) {
                    Some(idx) => {
                        queue.remove(idx);
                        tracing::warn!("outbound queue full; dropped oldest non-critical frame");
                    }
                    None if !frame.critical => {
                        tracing::warn!("outbound queue full of lifecycle frames; frame dropped");
                        return false;
                    }
                    // Full of critical frames: a lifecycle frame still goes
                    // in — it must not be lost.
                    None => {}
                }
            }
            queue.push_back(frame);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Wait for the next frame. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.inner.queue.lock().pop_front() {
                return Some(frame);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the next frame if one is queued (used while draining).
    pub fn try_pop(&self) -> Option<Frame> {
        self.inner.queue.lock().pop_front()
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_pop_in_push_order() {
        let mailbox = Mailbox::new(8);
        mailbox.push(Frame::normal("a".into()));
        mailbox.push(Frame::normal("b".into()));
        assert_eq!(mailbox.pop().await.unwrap().payload, "a");
        assert_eq!(mailbox.pop().await.unwrap().payload, "b");
    }

    #[test]
    fn overflow_drops_oldest_non_critical() {
        let mailbox = Mailbox::new(2);
        mailbox.push(Frame::normal("old".into()));
        mailbox.push(Frame::normal("mid".into()));
        assert!(mailbox.push(Frame::normal("new".into())));

        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.try_pop().unwrap().payload, "mid");
        assert_eq!(mailbox.try_pop().unwrap().payload, "new");
    }

    #[test]
    fn critical_displaces_non_critical() {
        let mailbox = Mailbox::new(2);
        mailbox.push(Frame::normal("a".into()));
        mailbox.push(Frame::critical("logout".into()));
        assert!(mailbox.push(Frame::critical("closed".into())));

        // The non-critical frame made room; both lifecycle frames survive.
        let frames: Vec<Frame> = std::iter::from_fn(|| mailbox.try_pop()).collect();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.critical));
    }

    #[test]
    fn non_critical_dropped_when_full_of_critical() {
        let mailbox = Mailbox::new(2);
        mailbox.push(Frame::critical("a".into()));
        mailbox.push(Frame::critical("b".into()));
        assert!(!mailbox.push(Frame::normal("c".into())));
        assert_eq!(mailbox.len(), 2);
    }

    #[tokio::test]
    async fn close_wakes_pending_pop() {
        let mailbox = Mailbox::new(2);
        let waiter = mailbox.clone();
        let handle = tokio::spawn(async move { waiter.pop().await });
        tokio::task::yield_now().await;
        mailbox.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let mailbox = Mailbox::new(2);
        mailbox.close();
        assert!(!mailbox.push(Frame::normal("late".into())));
    }
}
