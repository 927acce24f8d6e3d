//! Callee-side handle for the call being executed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use patchbay_wire::Value;
use tokio_util::sync::CancellationToken;

use crate::calls::CallTarget;
use crate::queue::MessageQueue;

/// Placeholder returned by [`CallContext::caller`] when the originator's
/// identity cannot be resolved.
pub const UNKNOWN_CALLER: &str = "<unknown>";

/// Resolves the human-readable identity of a call's originator.
///
/// Purely diagnostic; a resolver that fails (or is absent) degrades to
/// [`UNKNOWN_CALLER`] rather than erroring.
pub(crate) type CallerResolver =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

struct ContextInner {
    target: CallTarget,
    cancel: CancellationToken,
    /// Messages flowing from the caller to this executor.
    queue: MessageQueue,
    /// Forwards a message back to the caller.
    reply: Box<dyn Fn(Vec<Value>) + Send + Sync>,
    finished: AtomicBool,
    caller: OnceLock<String>,
    caller_resolver: Option<CallerResolver>,
}

tokio::task_local! {
    /// Ambient context for the currently executing call. Task-local rather
    /// than thread-local: the runtime multiplexes many logical calls onto
    /// fewer worker threads, and a thread-local would leak one call's
    /// context into another's continuation.
    static CURRENT_CALL: CallContext;
}

/// Callee-side handle for one executing call.
///
/// One context exists per logical call. Handler code can reach it without
/// parameter threading via [`CallContext::current`], which is scoped to
/// exactly the executing call's task, across its await points.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

impl CallContext {
    pub(crate) fn new(
        target: CallTarget,
        reply: Box<dyn Fn(Vec<Value>) + Send + Sync>,
        caller_resolver: Option<CallerResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                target,
                cancel: CancellationToken::new(),
                queue: MessageQueue::new(),
                reply,
                finished: AtomicBool::new(false),
                caller: OnceLock::new(),
                caller_resolver,
            }),
        }
    }

    /// The ambient context of the call whose handler is currently
    /// executing, if any.
    pub fn current() -> Option<CallContext> {
        CURRENT_CALL.try_with(|cx| cx.clone()).ok()
    }

    /// Run `fut` with this context installed as the ambient one.
    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_CALL.scope(self, fut).await
    }

    /// The `(type, method)` being executed, for diagnostics.
    pub fn target(&self) -> &CallTarget {
        &self.inner.target
    }

    /// Observable cancellation signal. Long-running handlers poll this or
    /// pass it into their own blocking operations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Whether cancellation has been requested for this call.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Set the cancellation signal. Settable once; later invocations are
    /// no-ops.
    pub(crate) fn signal_cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Send an out-of-band message back to the caller. No-op once the
    /// call's result has been finalized.
    pub fn send_message(&self, args: Vec<Value>) {
        if self.inner.finished.load(Ordering::SeqCst) {
            return;
        }
        (self.inner.reply)(args);
    }

    /// Attach a listener for messages from the caller, with the same
    /// buffer-then-flush ordering as the caller side.
    pub fn on_message(&self, listener: impl Fn(&[Value]) + Send + Sync + 'static) {
        self.inner.queue.attach(Box::new(listener));
    }

    /// Deliver a message from the caller into this context's queue.
    pub(crate) fn deliver_message(&self, args: Vec<Value>) {
        self.inner.queue.deliver(args);
    }

    /// Mark the call's result as sent; message sends become no-ops.
    pub(crate) fn finish(&self) {
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    /// Human-readable identity of the call's originator.
    ///
    /// Resolved lazily (on the networked path this is a router meta-call)
    /// and cached; any failure yields [`UNKNOWN_CALLER`]. Diagnostic only.
    pub async fn caller(&self) -> String {
        if let Some(name) = self.inner.caller.get() {
            return name.clone();
        }
        let resolved = match &self.inner.caller_resolver {
            Some(resolver) => resolver().await,
            None => None,
        };
        let name = resolved.unwrap_or_else(|| UNKNOWN_CALLER.to_owned());
        self.inner.caller.get_or_init(|| name).clone()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("target", &self.inner.target)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
