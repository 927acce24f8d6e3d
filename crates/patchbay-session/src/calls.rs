//! Caller-side handle for one in-flight call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use patchbay_wire::{ErrorRecord, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::queue::MessageQueue;

/// The `(type, method)` a call addresses. A `None` type targets the router
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    pub ty: Option<String>,
    pub method: String,
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.ty {
            Some(ty) => write!(f, "{ty}.{}", self.method),
            None => write!(f, "<router>.{}", self.method),
        }
    }
}

enum CallState {
    Pending,
    Resolved(Value),
    Rejected(ErrorRecord),
}

/// Actions injected into a call so the local and networked paths share one
/// `PendingCall` type: forwarding a message toward the executor, and asking
/// the executor to stop.
pub(crate) struct CallHooks {
    pub send_message: Box<dyn Fn(Vec<Value>) + Send + Sync>,
    pub cancel: Box<dyn Fn() + Send + Sync>,
}

impl CallHooks {
    /// Hooks for a call that can never reach an executor (already failed).
    pub fn inert() -> Self {
        Self {
            send_message: Box::new(|_| {}),
            cancel: Box::new(|| {}),
        }
    }
}

/// State shared between a [`PendingCall`] and whatever resolves it (the
/// connection driver, or the local invocation path).
pub(crate) struct CallShared {
    target: CallTarget,
    state: Mutex<CallState>,
    done: Notify,
    /// Messages flowing from the executor back to the caller.
    queue: MessageQueue,
    cancel_sent: AtomicBool,
    hooks: CallHooks,
}

impl CallShared {
    pub fn new(target: CallTarget, hooks: CallHooks) -> Arc<Self> {
        Arc::new(Self {
            target,
            state: Mutex::new(CallState::Pending),
            done: Notify::new(),
            queue: MessageQueue::new(),
            cancel_sent: AtomicBool::new(false),
            hooks,
        })
    }

    /// Settle the call with a result. No-op if already terminal; returns
    /// whether this invocation was the one that settled it.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(CallState::Resolved(value))
    }

    /// Settle the call with an error. No-op if already terminal.
    pub fn reject(&self, error: ErrorRecord) -> bool {
        self.settle(CallState::Rejected(error))
    }

    fn settle(&self, terminal: CallState) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !matches!(*state, CallState::Pending) {
                return false;
            }
            *state = terminal;
        }
        self.done.notify_waiters();
        true
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(*self.state.lock().unwrap(), CallState::Pending)
    }

    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// Deliver an out-of-band message from the executor. Valid even after
    /// the terminal state: the executor may legitimately have sent messages
    /// that arrive interleaved with (or after) the result.
    pub fn deliver_message(&self, args: Vec<Value>) {
        self.queue.deliver(args);
    }

    async fn wait_terminal(&self) -> Result<Value, ErrorRecord> {
        loop {
            let notified = self.done.notified();
            {
                let state = self.state.lock().unwrap();
                match &*state {
                    CallState::Pending => {}
                    CallState::Resolved(v) => return Ok(v.clone()),
                    CallState::Rejected(e) => return Err(e.clone()),
                }
            }
            notified.await;
        }
    }
}

/// Caller-side handle for one in-flight call.
///
/// Cheap to clone; every clone observes the same outcome. The call settles
/// exactly once - a second resolution attempt (late duplicate, race with a
/// disconnect) is a no-op.
#[derive(Clone)]
pub struct PendingCall {
    shared: Arc<CallShared>,
}

impl PendingCall {
    pub(crate) fn from_shared(shared: Arc<CallShared>) -> Self {
        Self { shared }
    }

    /// A call that failed before it could be issued.
    pub(crate) fn rejected(target: CallTarget, error: ErrorRecord) -> Self {
        let shared = CallShared::new(target, CallHooks::inert());
        shared.reject(error);
        Self { shared }
    }

    /// The `(type, method)` this call addresses.
    pub fn target(&self) -> &CallTarget {
        &self.shared.target
    }

    /// Whether the call has settled.
    pub fn is_terminal(&self) -> bool {
        self.shared.is_terminal()
    }

    /// Await the call's outcome. Any number of awaiters may wait; all
    /// observe the same result.
    pub async fn wait(&self) -> Result<Value, ErrorRecord> {
        self.shared.wait_terminal().await
    }

    /// Send an out-of-band message to whoever is executing the call.
    ///
    /// Silent no-op after the call settles: the executor is gone, and the
    /// race is benign by design.
    pub fn send_message(&self, args: Vec<Value>) {
        if self.shared.is_terminal() {
            return;
        }
        (self.shared.hooks.send_message)(args);
    }

    /// Attach a listener for messages from the executor.
    ///
    /// Messages that arrived before the first listener are buffered and
    /// replayed to it in order, so a streaming callee can start sending
    /// before the caller is ready to listen.
    pub fn on_message(&self, listener: impl Fn(&[Value]) + Send + Sync + 'static) {
        self.shared.queue.attach(Box::new(listener));
    }

    /// Ask the executor to stop. Advisory: the call stays pending until the
    /// executor sends a real terminal packet, and may still resolve
    /// successfully if it finishes before observing the request. Idempotent;
    /// no-op once the call has settled.
    pub fn cancel(&self) {
        if self.shared.is_terminal() {
            return;
        }
        if self.shared.cancel_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.shared.hooks.cancel)();
    }

    /// Wire an external cancellation source to this call. The watcher is
    /// torn down as soon as the call settles, so no registration dangles
    /// past the call's lifetime.
    pub fn with_cancellation(self, token: &CancellationToken) -> Self {
        let watcher = self.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => watcher.cancel(),
                _ = watcher.shared.wait_terminal() => {}
            }
        });
        self
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("target", &self.shared.target)
            .field("terminal", &self.shared.is_terminal())
            .finish()
    }
}
