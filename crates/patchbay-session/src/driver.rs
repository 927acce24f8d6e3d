//! The per-connection engine: a single driver task owns the transport,
//! everything else talks to it through a command channel.
//!
//! The [`ClientHandle`] is cheap to clone and fully thread-safe; the
//! [`Driver`] must be spawned (or awaited) to move packets. One driver per
//! transport, always.
//!
//! # Example
//!
//! ```ignore
//! let stream = TcpStream::connect("127.0.0.1:9000").await?;
//! let (handle, driver) = establish_stream(stream, ConnectionConfig::named("worker-1"));
//! tokio::spawn(driver.run());
//!
//! handle.register_type("Clock", Arc::new(clock_methods())).await?;
//! let result = handle.call("Store", "get", vec!["key".into()]).wait().await?;
//! ```

use std::collections::HashMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};

use futures_util::FutureExt;
use patchbay_wire::{
    CallId, CallIdGenerator, ErrorKind, ErrorRecord, LengthPrefixedFramed, Packet,
    PacketTransport, Value, DEFAULT_MAX_FRAME_LEN,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::calls::{CallHooks, CallShared, CallTarget, PendingCall};
use crate::context::{CallContext, CallerResolver};
use crate::errors::{ConnectionError, TypeConflict};
use crate::registry::{Registry, TypeHandler};

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Label for this endpoint, used as the error-record origin and pushed
    /// to the router via `set_name` when one is present.
    pub name: Option<String>,
    /// Per-frame size cap applied by [`establish_stream`] in both
    /// directions. Oversized outgoing packets are refused locally.
    pub max_frame_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ConnectionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

// ============================================================================
// Commands - how handles and handlers talk to the driver
// ============================================================================

/// In-process message posted to the driver task.
///
/// Sends are synchronous and never suspend: the channel is unbounded so a
/// handler can post a message or a cancel from non-async code.
pub(crate) enum Command {
    /// Issue an outgoing call. `shared` is the caller-side state the driver
    /// settles when the terminal packet arrives.
    Call {
        id: CallId,
        args: Vec<Value>,
        shared: Arc<CallShared>,
    },
    /// Out-of-band message toward the executor of one of our calls.
    MessageToCallee { id: CallId, args: Vec<Value> },
    /// Out-of-band message from a local handler back to its caller.
    MessageToCaller { id: CallId, args: Vec<Value> },
    /// Advisory stop request for one of our calls.
    Cancel { id: CallId },
    /// A local handler finished; send the terminal packet.
    Reply {
        id: CallId,
        result: Result<Value, ErrorRecord>,
    },
    /// Stop the driver cleanly.
    Close,
}

// ============================================================================
// ClientHandle
// ============================================================================

pub(crate) struct HandleShared {
    label: Mutex<String>,
    ids: CallIdGenerator,
    cmd_tx: mpsc::UnboundedSender<Command>,
    registry: Registry,
}

impl HandleShared {
    fn label(&self) -> String {
        self.label.lock().unwrap().clone()
    }

    /// Issue a call over the wire. Never fails synchronously: if the driver
    /// is gone the returned call is already rejected with `ConnectionClosed`.
    fn remote_call(
        self: &Arc<Self>,
        ty: Option<String>,
        method: &str,
        args: Vec<Value>,
    ) -> PendingCall {
        let target = CallTarget {
            ty,
            method: method.to_owned(),
        };
        if self.cmd_tx.is_closed() {
            return PendingCall::rejected(target, ErrorRecord::connection_closed(self.label()));
        }
        let id = self.ids.next();

        let hooks = CallHooks {
            send_message: {
                let tx = self.cmd_tx.clone();
                Box::new(move |args| {
                    let _ = tx.send(Command::MessageToCallee { id, args });
                })
            },
            cancel: {
                let tx = self.cmd_tx.clone();
                Box::new(move || {
                    let _ = tx.send(Command::Cancel { id });
                })
            },
        };

        let shared = CallShared::new(target, hooks);
        let send = self.cmd_tx.send(Command::Call {
            id,
            args,
            shared: shared.clone(),
        });
        if send.is_err() {
            shared.reject(ErrorRecord::connection_closed(self.label()));
        }
        PendingCall::from_shared(shared)
    }
}

/// Cloneable handle for issuing calls and managing registrations on one
/// connection.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<HandleShared>,
}

impl ClientHandle {
    /// This endpoint's label.
    pub fn name(&self) -> String {
        self.shared.label()
    }

    /// Call `ty.method(args)`.
    ///
    /// If `ty` is registered on this very endpoint the call never touches
    /// the wire: the handler runs locally, wired to the same `PendingCall`
    /// shape a networked call gets. Otherwise the call goes to the peer.
    pub fn call(&self, ty: &str, method: &str, args: Vec<Value>) -> PendingCall {
        if let Some(handler) = self.shared.registry.get(ty) {
            return self.local_call(handler, ty, method, args);
        }
        self.shared.remote_call(Some(ty.to_owned()), method, args)
    }

    /// Call a method on the router itself (`ty == None`).
    pub fn call_router(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.shared.remote_call(None, method, args)
    }

    /// Register a batch of type handlers atomically, locally and (when a
    /// router is on the other end) globally.
    ///
    /// A router-side name conflict rolls the local registration back. A peer
    /// that serves no router methods (a direct leaf-to-leaf link) leaves the
    /// registration local, which is all such a link needs.
    pub async fn register_types(
        &self,
        entries: Vec<(String, Arc<dyn TypeHandler>)>,
    ) -> Result<(), TypeConflict> {
        let names: Vec<String> = entries.iter().map(|(name, _)| name.clone()).collect();
        self.shared.registry.register(entries)?;

        let announced = Value::List(names.iter().map(|n| Value::Str(n.clone())).collect());
        match self
            .call_router("register_types", vec![announced])
            .wait()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind == ErrorKind::CallAmbiguous => {
                for name in &names {
                    self.shared.registry.unregister(name);
                }
                Err(TypeConflict { names })
            }
            Err(_) => Ok(()),
        }
    }

    /// Register a single type handler. See [`ClientHandle::register_types`].
    pub async fn register_type(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn TypeHandler>,
    ) -> Result<(), TypeConflict> {
        self.register_types(vec![(name.into(), handler)]).await
    }

    /// Remove type registrations, locally and router-side.
    pub async fn unregister_types(&self, names: &[&str]) {
        for name in names {
            self.shared.registry.unregister(name);
        }
        let args = Value::List(names.iter().map(|n| Value::Str((*n).to_owned())).collect());
        let _ = self
            .call_router("unregister_types", vec![args])
            .wait()
            .await;
    }

    /// Whether `name` is reachable, here or through the router.
    pub async fn has_type(&self, name: &str) -> bool {
        if self.shared.registry.contains(name) {
            return true;
        }
        matches!(
            self.call_router("has_type", vec![Value::Str(name.to_owned())])
                .wait()
                .await,
            Ok(Value::Bool(true))
        )
    }

    /// Relabel this endpoint and push the name to the router.
    pub async fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        *self.shared.label.lock().unwrap() = name.clone();
        let _ = self
            .call_router("set_name", vec![Value::Str(name)])
            .wait()
            .await;
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Stop the driver. Every outstanding call is rejected with
    /// `ConnectionClosed`; in-flight handlers get a cancellation signal.
    pub fn close(&self) {
        let _ = self.shared.cmd_tx.send(Command::Close);
    }

    /// Run `ty.method(args)` against a locally registered handler, bypassing
    /// the transport but producing the exact observable shape of a
    /// networked call.
    fn local_call(
        &self,
        handler: Arc<dyn TypeHandler>,
        ty: &str,
        method: &str,
        args: Vec<Value>,
    ) -> PendingCall {
        let target = CallTarget {
            ty: Some(ty.to_owned()),
            method: method.to_owned(),
        };
        let label = self.shared.label();

        // The caller-side hooks need the callee context and vice versa;
        // the OnceLock breaks the construction cycle.
        let cx_slot: Arc<OnceLock<CallContext>> = Arc::new(OnceLock::new());
        let hooks = CallHooks {
            send_message: {
                let slot = cx_slot.clone();
                Box::new(move |args| {
                    if let Some(cx) = slot.get() {
                        cx.deliver_message(args);
                    }
                })
            },
            cancel: {
                let slot = cx_slot.clone();
                Box::new(move || {
                    if let Some(cx) = slot.get() {
                        cx.signal_cancel();
                    }
                })
            },
        };
        let shared = CallShared::new(target.clone(), hooks);

        let reply = {
            // Weak, so a handler that outlives its caller doesn't keep the
            // call state alive.
            let weak = Arc::downgrade(&shared);
            Box::new(move |args: Vec<Value>| {
                if let Some(shared) = weak.upgrade() {
                    shared.deliver_message(args);
                }
            }) as Box<dyn Fn(Vec<Value>) + Send + Sync>
        };
        let resolver: CallerResolver = {
            let label = label.clone();
            Box::new(move || {
                let label = label.clone();
                Box::pin(async move { Some(label) })
            })
        };
        let cx = CallContext::new(target, reply, Some(resolver));
        let _ = cx_slot.set(cx.clone());

        match handler.invoke(method, args) {
            None => {
                shared.reject(ErrorRecord::new(
                    ErrorKind::MethodNotFound,
                    label,
                    format!("{ty} has no method {method}"),
                ));
            }
            Some(fut) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(cx.clone().scope(fut)).catch_unwind().await;
                    cx.finish();
                    match result {
                        Ok(Ok(value)) => {
                            shared.resolve(value);
                        }
                        Ok(Err(error)) => {
                            shared.reject(error);
                        }
                        Err(_) => {
                            shared.reject(ErrorRecord::new(
                                ErrorKind::Wrapped,
                                label,
                                "handler panicked",
                            ));
                        }
                    }
                });
            }
        }
        PendingCall::from_shared(shared)
    }
}

// ============================================================================
// establish() - wire up a handle/driver pair
// ============================================================================

/// Create a handle/driver pair over a packet transport.
///
/// The driver does nothing until [`Driver::run`] is awaited; spawn it.
pub fn establish<T>(transport: T, config: ConnectionConfig) -> (ClientHandle, Driver<T>)
where
    T: PacketTransport,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(HandleShared {
        label: Mutex::new(config.name.unwrap_or_else(|| "local".to_owned())),
        ids: CallIdGenerator::new(),
        cmd_tx: cmd_tx.clone(),
        registry: Registry::new(),
    });
    let handle = ClientHandle {
        shared: shared.clone(),
    };
    let driver = Driver {
        io: transport,
        cmd_tx,
        cmd_rx,
        shared,
        requests: HashMap::new(),
        executing: HashMap::new(),
    };
    (handle, driver)
}

/// [`establish`] over a raw byte stream, wrapped in length-prefixed framing
/// with the config's frame cap.
pub fn establish_stream<S>(
    stream: S,
    config: ConnectionConfig,
) -> (ClientHandle, Driver<LengthPrefixedFramed<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let framed = LengthPrefixedFramed::with_max_frame_len(stream, config.max_frame_len);
    establish(framed, config)
}

// ============================================================================
// Driver - the connection loop
// ============================================================================

/// The connection driver. Owns the transport; must be spawned.
pub struct Driver<T> {
    io: T,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<HandleShared>,
    /// Calls we issued, keyed by the id we allocated.
    requests: HashMap<CallId, Arc<CallShared>>,
    /// Calls we are executing, keyed by the id the peer allocated.
    executing: HashMap<CallId, CallContext>,
}

impl<T> Driver<T>
where
    T: PacketTransport,
{
    /// Run until the transport closes, the handle asks us to stop, or the
    /// transport fails. Outstanding state is cleaned up on every exit path.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.drive().await;
        self.shutdown();
        result
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Close) | None => return Ok(()),
                        Some(cmd) => self.handle_command(cmd).await?,
                    }
                }
                result = self.io.recv() => {
                    match result {
                        Ok(Some(packet)) => self.handle_packet(packet).await?,
                        Ok(None) => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            // Frames are independently delimited; a frame
                            // that fails to decode costs only itself.
                            warn!(error = %e, "dropping undecodable frame");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), ConnectionError> {
        match cmd {
            Command::Call { id, args, shared } => {
                let target = shared.target().clone();
                trace!(%id, %target, "sending call");
                let packet = Packet::Call {
                    id,
                    ty: target.ty,
                    method: target.method,
                    args,
                };
                self.requests.insert(id, shared.clone());
                if let Err(e) = self.io.send(&packet).await {
                    self.requests.remove(&id);
                    if is_local_send_fault(&e) {
                        // Encode or size failure: the call dies, the
                        // connection doesn't.
                        shared.reject(ErrorRecord::new(
                            ErrorKind::Wrapped,
                            self.shared.label(),
                            format!("failed to encode call: {e}"),
                        ));
                    } else {
                        shared.reject(ErrorRecord::connection_closed(self.shared.label()));
                        return Err(e.into());
                    }
                }
            }
            Command::MessageToCallee { id, args } => {
                if !self.requests.contains_key(&id) {
                    return Ok(());
                }
                self.send_lossy(&Packet::MessageToCallee { id, args }).await?;
            }
            Command::MessageToCaller { id, args } => {
                if !self.executing.contains_key(&id) {
                    return Ok(());
                }
                self.send_lossy(&Packet::MessageToCaller { id, args }).await?;
            }
            Command::Cancel { id } => {
                if self.requests.contains_key(&id) {
                    self.io.send(&Packet::Cancel { id }).await?;
                }
            }
            Command::Reply { id, result } => {
                // The entry goes away no matter how the send below fares:
                // exactly one terminal attempt per executed call.
                let Some(cx) = self.executing.remove(&id) else {
                    return Ok(());
                };
                cx.finish();
                let packet = match result {
                    Ok(result) => Packet::Success { id, result },
                    Err(error) => Packet::Error { id, error },
                };
                if let Err(e) = self.io.send(&packet).await {
                    if !is_local_send_fault(&e) {
                        return Err(e.into());
                    }
                    warn!(%id, error = %e, "result did not encode, sending error instead");
                    let fallback = Packet::Error {
                        id,
                        error: ErrorRecord::new(
                            ErrorKind::Wrapped,
                            self.shared.label(),
                            format!("failed to encode result: {e}"),
                        ),
                    };
                    self.io.send(&fallback).await?;
                }
            }
            Command::Close => unreachable!("Close is handled in drive()"),
        }
        Ok(())
    }

    /// Send where an encode failure only loses this packet.
    async fn send_lossy(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        if let Err(e) = self.io.send(packet).await {
            if !is_local_send_fault(&e) {
                return Err(e.into());
            }
            warn!(id = %packet.call_id(), error = %e, "dropping unencodable packet");
        }
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Call {
                id,
                ty,
                method,
                args,
            } => {
                self.handle_incoming_call(id, ty, method, args).await?;
            }
            Packet::Success { id, result } => {
                match self.requests.remove(&id) {
                    Some(call) => {
                        call.resolve(result);
                    }
                    // Late terminal after a disconnect raced us; benign.
                    None => debug!(%id, "success for unknown call id, ignoring"),
                }
            }
            Packet::Error { id, error } => match self.requests.remove(&id) {
                Some(call) => {
                    call.reject(error);
                }
                None => debug!(%id, "error for unknown call id, ignoring"),
            },
            Packet::Cancel { id } => {
                // Advisory: signal the handler and leave the entry alone,
                // it still owes a terminal packet.
                if let Some(cx) = self.executing.get(&id) {
                    cx.signal_cancel();
                } else {
                    trace!(%id, "cancel for unknown call id, ignoring");
                }
            }
            Packet::MessageToCallee { id, args } => {
                if let Some(cx) = self.executing.get(&id) {
                    cx.deliver_message(args);
                } else {
                    trace!(%id, "message for unknown executing call, dropping");
                }
            }
            Packet::MessageToCaller { id, args } => {
                // Delivery is valid right up to (and across) the terminal
                // packet; only a truly unknown id is dropped.
                if let Some(call) = self.requests.get(&id) {
                    call.deliver_message(args);
                } else {
                    trace!(%id, "message for unknown pending call, dropping");
                }
            }
        }
        Ok(())
    }

    async fn handle_incoming_call(
        &mut self,
        id: CallId,
        ty: Option<String>,
        method: String,
        args: Vec<Value>,
    ) -> Result<(), ConnectionError> {
        if self.executing.contains_key(&id) {
            warn!(%id, "duplicate call id from peer, dropping");
            return Ok(());
        }

        let label = self.shared.label();
        let Some(ty) = ty else {
            // Router methods are served by routers; a leaf refuses them.
            let error = ErrorRecord::new(
                ErrorKind::MethodNotFound,
                label,
                format!("no router method {method} here"),
            );
            return Ok(self.io.send(&Packet::Error { id, error }).await?);
        };
        let Some(handler) = self.shared.registry.get(&ty) else {
            let error = ErrorRecord::new(
                ErrorKind::RemoteNotFound,
                label,
                format!("type not registered: {ty}"),
            );
            return Ok(self.io.send(&Packet::Error { id, error }).await?);
        };
        let Some(fut) = handler.invoke(&method, args) else {
            let error = ErrorRecord::new(
                ErrorKind::MethodNotFound,
                label,
                format!("{ty} has no method {method}"),
            );
            return Ok(self.io.send(&Packet::Error { id, error }).await?);
        };

        debug!(%id, %ty, %method, "dispatching incoming call");

        let target = CallTarget {
            ty: Some(ty),
            method,
        };
        let reply = {
            let tx = self.cmd_tx.clone();
            Box::new(move |args: Vec<Value>| {
                let _ = tx.send(Command::MessageToCaller { id, args });
            }) as Box<dyn Fn(Vec<Value>) + Send + Sync>
        };
        // The originator's name lives router-side; ask for it on demand.
        let resolver: CallerResolver = {
            let shared = self.shared.clone();
            Box::new(move || {
                let shared = shared.clone();
                Box::pin(async move {
                    let call = shared.remote_call(
                        None,
                        "caller_name",
                        vec![Value::Int(id.raw() as i64)],
                    );
                    match call.wait().await {
                        Ok(Value::Str(name)) => Some(name),
                        _ => None,
                    }
                })
            })
        };
        let cx = CallContext::new(target, reply, Some(resolver));
        self.executing.insert(id, cx.clone());

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(cx.clone().scope(fut)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(ErrorRecord::new(
                    ErrorKind::Wrapped,
                    label,
                    "handler panicked",
                )),
            };
            let _ = cmd_tx.send(Command::Reply { id, result });
        });
        Ok(())
    }

    /// Tear down all per-call state: reject what we were waiting on, signal
    /// what we were executing, and fail calls still queued in the command
    /// channel that never reached the wire.
    fn shutdown(&mut self) {
        let label = self.shared.label();
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Command::Call { shared, .. } = cmd {
                shared.reject(ErrorRecord::connection_closed(&label));
            }
        }
        for (_, call) in self.requests.drain() {
            call.reject(ErrorRecord::connection_closed(&label));
        }
        for (_, cx) in self.executing.drain() {
            cx.signal_cancel();
            cx.finish();
        }
    }
}

/// Whether a transport send error is a fault of this one packet (it did not
/// encode, or blew the frame cap) rather than of the connection.
fn is_local_send_fault(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
    )
}
