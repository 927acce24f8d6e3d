//! Router state: the connection set, the global type registry, and the
//! call-id translation tables.
//!
//! The hub never interprets call payloads. It owns exactly two concerns:
//! deciding which link a packet continues on, and translating the call id
//! into that link's id space. Everything else ships through opaquely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use patchbay_wire::{
    CallId, CallIdGenerator, ErrorKind, ErrorRecord, LengthPrefixedFramed, Packet,
    PacketTransport, Value, DEFAULT_MAX_FRAME_LEN,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::HubConnection;

/// Router parameters.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Label used as the origin of router-generated error records.
    pub name: String,
    /// Per-frame size cap applied by [`Hub::attach_stream`].
    pub max_frame_len: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "hub".to_owned(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

pub(crate) type PeerId = u64;

/// The other half of a forwarded call: which link, and which id in that
/// link's space.
#[derive(Debug, Clone, Copy)]
struct CallRef {
    peer: PeerId,
    id: CallId,
}

struct PeerInfo {
    name: String,
    /// Outbound queue drained by this link's [`HubConnection`]. Unbounded:
    /// enqueueing never suspends, so routing and dispose can run under the
    /// state lock.
    tx: mpsc::UnboundedSender<Packet>,
    /// Allocates call ids in this link's space for calls forwarded to it.
    ids: CallIdGenerator,
    /// Calls this link's peer is executing for someone else:
    /// forwarded id -> originator.
    executions: HashMap<CallId, CallRef>,
    /// Calls this link's peer originated that went to someone else:
    /// the peer's own id -> executor.
    requests: HashMap<CallId, CallRef>,
}

struct HubState {
    next_peer: PeerId,
    peers: HashMap<PeerId, PeerInfo>,
    /// Global type registry. Exclusive: one owning connection per name.
    types: HashMap<String, PeerId>,
}

pub(crate) struct HubShared {
    pub(crate) config: HubConfig,
    state: Mutex<HubState>,
}

/// The central router. Cheap to clone; all clones share one state.
///
/// A hub is plain owned state, not a process-wide singleton: tests build as
/// many independent hubs as they like.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                config,
                state: Mutex::new(HubState {
                    next_peer: 1,
                    peers: HashMap::new(),
                    types: HashMap::new(),
                }),
            }),
        }
    }

    /// Attach one peer transport. The returned connection must be spawned;
    /// it owns the transport until the peer goes away.
    pub fn attach<T>(&self, transport: T) -> HubConnection<T>
    where
        T: PacketTransport,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = {
            let mut state = self.shared.state.lock().unwrap();
            let peer = state.next_peer;
            state.next_peer += 1;
            state.peers.insert(
                peer,
                PeerInfo {
                    name: format!("conn-{peer}"),
                    tx,
                    ids: CallIdGenerator::new(),
                    executions: HashMap::new(),
                    requests: HashMap::new(),
                },
            );
            peer
        };
        debug!(peer, "connection attached");
        HubConnection::new(self.shared.clone(), peer, transport, rx)
    }

    /// [`Hub::attach`] over a raw byte stream, wrapped in length-prefixed
    /// framing with the hub's frame cap.
    pub fn attach_stream<S>(&self, stream: S) -> HubConnection<LengthPrefixedFramed<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.attach(LengthPrefixedFramed::with_max_frame_len(
            stream,
            self.shared.config.max_frame_len,
        ))
    }

    /// Whether any connection currently serves `name`.
    pub fn has_type(&self, name: &str) -> bool {
        self.shared.state.lock().unwrap().types.contains_key(name)
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().unwrap().peers.len()
    }
}

/// Rebuild a packet with a different call id, leaving the rest untouched.
fn with_call_id(packet: Packet, id: CallId) -> Packet {
    match packet {
        Packet::Call {
            ty, method, args, ..
        } => Packet::Call {
            id,
            ty,
            method,
            args,
        },
        Packet::Success { result, .. } => Packet::Success { id, result },
        Packet::Error { error, .. } => Packet::Error { id, error },
        Packet::Cancel { .. } => Packet::Cancel { id },
        Packet::MessageToCallee { args, .. } => Packet::MessageToCallee { id, args },
        Packet::MessageToCaller { args, .. } => Packet::MessageToCaller { id, args },
    }
}

impl HubShared {
    /// Route one inbound packet from `from`. Synchronous on purpose: every
    /// path is lock, table work, enqueue.
    pub(crate) fn route(&self, from: PeerId, packet: Packet) {
        match packet {
            Packet::Call {
                id,
                ty: Some(ty),
                method,
                args,
            } => self.forward_call(from, id, ty, method, args),
            Packet::Call {
                id,
                ty: None,
                method,
                args,
            } => self.meta_call(from, id, &method, args),
            terminal @ (Packet::Success { .. } | Packet::Error { .. }) => {
                self.forward_terminal(from, terminal)
            }
            Packet::Cancel { id } => self.forward_to_callee(from, id, Packet::Cancel { id }),
            Packet::MessageToCallee { id, args } => {
                self.forward_to_callee(from, id, Packet::MessageToCallee { id, args })
            }
            Packet::MessageToCaller { id, args } => self.forward_to_caller(from, id, args),
        }
    }

    fn forward_call(&self, from: PeerId, id: CallId, ty: String, method: String, args: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        if !state.peers.contains_key(&from) {
            return;
        }
        if state
            .peers
            .get(&from)
            .is_some_and(|p| p.requests.contains_key(&id))
        {
            warn!(from, %id, "duplicate call id from peer, dropping");
            return;
        }

        let owner = match state.types.get(&ty) {
            Some(owner) => *owner,
            None => {
                let error = ErrorRecord::new(
                    ErrorKind::RemoteNotFound,
                    &self.config.name,
                    format!("no connection serves type {ty}"),
                );
                Self::enqueue(&state, from, Packet::Error { id, error });
                return;
            }
        };

        // Allocate an id in the owner's space and record the mapping both
        // ways before the packet leaves.
        let forwarded_id = match state.peers.get(&owner) {
            Some(info) => info.ids.next(),
            None => {
                let error = ErrorRecord::new(
                    ErrorKind::RemoteNotFound,
                    &self.config.name,
                    format!("owner of type {ty} is gone"),
                );
                Self::enqueue(&state, from, Packet::Error { id, error });
                return;
            }
        };
        if let Some(info) = state.peers.get_mut(&owner) {
            info.executions.insert(forwarded_id, CallRef { peer: from, id });
        }
        if let Some(info) = state.peers.get_mut(&from) {
            info.requests.insert(
                id,
                CallRef {
                    peer: owner,
                    id: forwarded_id,
                },
            );
        }
        debug!(from, to = owner, %id, %forwarded_id, %ty, %method, "forwarding call");
        Self::enqueue(
            &state,
            owner,
            Packet::Call {
                id: forwarded_id,
                ty: Some(ty),
                method,
                args,
            },
        );
    }

    fn forward_terminal(&self, from: PeerId, packet: Packet) {
        let id = packet.call_id();
        let mut state = self.state.lock().unwrap();
        let origin = match state.peers.get_mut(&from) {
            Some(info) => info.executions.remove(&id),
            None => return,
        };
        let Some(origin) = origin else {
            warn!(from, %id, "terminal packet for unknown execution, dropping");
            return;
        };
        match state.peers.get_mut(&origin.peer) {
            Some(caller) => {
                caller.requests.remove(&origin.id);
                let _ = caller.tx.send(with_call_id(packet, origin.id));
            }
            // The caller disconnected while the call was running; this is
            // where its execution entry finally goes away.
            None => debug!(from, %id, "originator gone, dropping terminal packet"),
        }
    }

    /// Relay a caller-side packet (cancel, message) toward the executor.
    fn forward_to_callee(&self, from: PeerId, id: CallId, packet: Packet) {
        let state = self.state.lock().unwrap();
        let target = match state.peers.get(&from) {
            Some(info) => info.requests.get(&id).copied(),
            None => return,
        };
        let Some(target) = target else {
            // Settled or never forwarded; either way there is nobody to tell.
            return;
        };
        Self::enqueue(&state, target.peer, with_call_id(packet, target.id));
    }

    /// Relay an executor-side message back to the originator.
    fn forward_to_caller(&self, from: PeerId, id: CallId, args: Vec<Value>) {
        let state = self.state.lock().unwrap();
        let origin = match state.peers.get(&from) {
            Some(info) => info.executions.get(&id).copied(),
            None => return,
        };
        let Some(origin) = origin else {
            return;
        };
        Self::enqueue(
            &state,
            origin.peer,
            Packet::MessageToCaller {
                id: origin.id,
                args,
            },
        );
    }

    // ------------------------------------------------------------------
    // Meta-calls: Call packets with no type address the router itself.
    // ------------------------------------------------------------------

    fn meta_call(&self, from: PeerId, id: CallId, method: &str, args: Vec<Value>) {
        let reply = match method {
            "set_name" => self.meta_set_name(from, &args),
            "register_types" => self.meta_register_types(from, &args),
            "unregister_types" => self.meta_unregister_types(from, &args),
            "has_type" => self.meta_has_type(&args),
            "caller_name" => self.meta_caller_name(from, &args),
            other => Err(ErrorRecord::new(
                ErrorKind::MethodNotFound,
                &self.config.name,
                format!("router has no method {other}"),
            )),
        };
        let packet = match reply {
            Ok(result) => Packet::Success { id, result },
            Err(error) => Packet::Error { id, error },
        };
        let state = self.state.lock().unwrap();
        Self::enqueue(&state, from, packet);
    }

    fn meta_set_name(&self, from: PeerId, args: &[Value]) -> Result<Value, ErrorRecord> {
        let name = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| self.bad_args("set_name expects a string"))?;
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.peers.get_mut(&from) {
            debug!(peer = from, name, "connection named");
            info.name = name.to_owned();
        }
        Ok(Value::Null)
    }

    fn meta_register_types(&self, from: PeerId, args: &[Value]) -> Result<Value, ErrorRecord> {
        let names = self.name_list(args)?;
        let mut state = self.state.lock().unwrap();
        // All or nothing across the whole list.
        let conflicts: Vec<&String> = names
            .iter()
            .filter(|n| state.types.contains_key(n.as_str()))
            .collect();
        if !conflicts.is_empty() {
            let listed = conflicts
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ErrorRecord::new(
                ErrorKind::CallAmbiguous,
                &self.config.name,
                format!("types already registered: {listed}"),
            ));
        }
        for name in &names {
            state.types.insert(name.clone(), from);
        }
        debug!(peer = from, types = ?names, "types registered");
        Ok(Value::Null)
    }

    fn meta_unregister_types(&self, from: PeerId, args: &[Value]) -> Result<Value, ErrorRecord> {
        let names = self.name_list(args)?;
        let mut state = self.state.lock().unwrap();
        // Only entries still owned by the caller; a name re-registered by
        // someone else after a disconnect stays theirs.
        state
            .types
            .retain(|name, owner| *owner != from || !names.iter().any(|n| n == name));
        Ok(Value::Null)
    }

    fn meta_has_type(&self, args: &[Value]) -> Result<Value, ErrorRecord> {
        let name = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| self.bad_args("has_type expects a string"))?;
        let state = self.state.lock().unwrap();
        Ok(Value::Bool(state.types.contains_key(name)))
    }

    /// Who originated the call the asking peer is executing as `id`.
    fn meta_caller_name(&self, from: PeerId, args: &[Value]) -> Result<Value, ErrorRecord> {
        let raw = args
            .first()
            .and_then(Value::as_int)
            .ok_or_else(|| self.bad_args("caller_name expects a call id"))?;
        let id = CallId(raw as u64);
        let state = self.state.lock().unwrap();
        let origin = state
            .peers
            .get(&from)
            .and_then(|info| info.executions.get(&id))
            .copied();
        match origin.and_then(|o| state.peers.get(&o.peer)) {
            Some(caller) => Ok(Value::Str(caller.name.clone())),
            None => Err(ErrorRecord::new(
                ErrorKind::Wrapped,
                &self.config.name,
                format!("no active execution {id} on this connection"),
            )),
        }
    }

    fn name_list(&self, args: &[Value]) -> Result<Vec<String>, ErrorRecord> {
        let Some(Value::List(items)) = args.first() else {
            return Err(self.bad_args("expected a list of type names"));
        };
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| self.bad_args("type names must be strings"))
            })
            .collect()
    }

    fn bad_args(&self, message: &str) -> ErrorRecord {
        ErrorRecord::new(ErrorKind::Wrapped, &self.config.name, message)
    }

    // ------------------------------------------------------------------
    // Disconnect fan-out
    // ------------------------------------------------------------------

    /// Remove one connection and notify everything entangled with it: its
    /// type registrations vanish, its unfinished executions reject their
    /// callers, and the executors of its outstanding calls get a cancel.
    ///
    /// Every notification is enqueued before this returns; no surviving
    /// peer learns late or never.
    pub(crate) fn dispose(&self, peer: PeerId) {
        let mut state = self.state.lock().unwrap();
        let Some(info) = state.peers.remove(&peer) else {
            return;
        };
        state.types.retain(|_, owner| *owner != peer);

        let mut rejected = 0usize;
        for (_, origin) in info.executions {
            if let Some(caller) = state.peers.get_mut(&origin.peer) {
                caller.requests.remove(&origin.id);
                let _ = caller.tx.send(Packet::Error {
                    id: origin.id,
                    error: ErrorRecord::connection_closed(&info.name),
                });
                rejected += 1;
            }
        }

        let mut cancelled = 0usize;
        for (_, target) in info.requests {
            // The execution entry on the callee stays; it is cleaned up when
            // the terminal packet arrives and finds its originator gone.
            if let Some(callee) = state.peers.get(&target.peer) {
                let _ = callee.tx.send(Packet::Cancel { id: target.id });
                cancelled += 1;
            }
        }
        drop(state);
        debug!(peer, name = %info.name, rejected, cancelled, "connection disposed");
    }

    fn enqueue(state: &HubState, peer: PeerId, packet: Packet) {
        if let Some(info) = state.peers.get(&peer) {
            // A closed receiver means the link is mid-teardown; dispose
            // handles its state.
            let _ = info.tx.send(packet);
        }
    }
}
