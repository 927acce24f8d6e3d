#![deny(unsafe_code)]

//! Per-peer connection engine for the patchbay RPC substrate.
//!
//! This crate turns one [`patchbay_wire::PacketTransport`] into a live,
//! bidirectional RPC endpoint:
//!
//! - [`establish`] / [`establish_stream`] wire up a [`ClientHandle`] and a
//!   [`Driver`]; the driver is a future that owns the transport and must be
//!   spawned.
//! - [`PendingCall`] is the caller-side handle: await the outcome, exchange
//!   out-of-band messages, request advisory cancellation.
//! - [`CallContext`] is the callee-side mirror, reachable ambiently from
//!   handler code via [`CallContext::current`].
//! - [`MethodTable`] / [`TypeHandler`] / [`Registry`] hold the types this
//!   endpoint executes locally.
//!
//! Calls addressing a locally registered type never touch the wire; they are
//! observably identical to networked calls.

mod calls;
mod context;
mod driver;
mod errors;
mod queue;
mod registry;

pub use calls::{CallTarget, PendingCall};
pub use context::{CallContext, UNKNOWN_CALLER};
pub use driver::{establish, establish_stream, ClientHandle, ConnectionConfig, Driver};
pub use errors::{ConnectionError, TypeConflict};
pub use registry::{MethodFuture, MethodTable, Registry, TypeHandler};

#[cfg(test)]
mod tests;
