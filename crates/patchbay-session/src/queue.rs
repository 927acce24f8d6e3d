//! Buffer-then-flush delivery of out-of-band messages for one call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use patchbay_wire::Value;

/// Callback receiving the arguments of one out-of-band message.
pub type MessageListener = Box<dyn Fn(&[Value]) + Send + Sync>;

/// Per-call message queue shared by both call sides.
///
/// Messages are buffered until the first listener attaches, then flushed to
/// it in send order, after which delivery switches to direct live dispatch.
/// A listener attached after the flush sees only live messages; the first
/// listener is guaranteed every message sent since the call was created.
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    /// `Some` until the first listener attaches.
    buffered: Option<VecDeque<Vec<Value>>>,
    listeners: Vec<Arc<MessageListener>>,
    /// Messages waiting for the delivery pump; preserves order when a
    /// listener callback itself sends or attaches.
    pending: VecDeque<Vec<Value>>,
    pumping: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buffered: Some(VecDeque::new()),
                listeners: Vec::new(),
                pending: VecDeque::new(),
                pumping: false,
            }),
        }
    }

    /// Deliver one message: buffer it if no listener has attached yet,
    /// otherwise dispatch it to every current listener, in order relative to
    /// other messages on this queue.
    pub fn deliver(&self, args: Vec<Value>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(buf) = inner.buffered.as_mut() {
            buf.push_back(args);
            return;
        }
        inner.pending.push_back(args);
        self.pump(inner);
    }

    /// Attach a listener. The first listener drains everything buffered so
    /// far, in order, before any later message reaches it.
    pub fn attach(&self, listener: MessageListener) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.push(Arc::new(listener));
        if let Some(buf) = inner.buffered.take() {
            inner.pending.extend(buf);
        }
        self.pump(inner);
    }

    /// Run queued deliveries with the lock released around each callback.
    /// The `pumping` flag keeps exactly one task draining at a time, which
    /// is what preserves per-call ordering.
    fn pump<'a>(&'a self, mut inner: std::sync::MutexGuard<'a, QueueInner>) {
        if inner.pumping {
            return;
        }
        inner.pumping = true;
        while let Some(args) = inner.pending.pop_front() {
            let listeners = inner.listeners.clone();
            drop(inner);
            for listener in &listeners {
                listener(&args);
            }
            inner = self.inner.lock().unwrap();
        }
        inner.pumping = false;
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}
