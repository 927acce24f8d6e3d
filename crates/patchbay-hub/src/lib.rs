#![deny(unsafe_code)]

//! Central router for the patchbay RPC substrate.
//!
//! A [`Hub`] sits in the middle of a star of connections. Leaves register
//! type names with it; calls addressing a type are forwarded to the owning
//! connection, with call ids translated between the two links' id spaces.
//! The hub never looks inside arguments or results.
//!
//! ```ignore
//! let hub = Hub::new(HubConfig::default());
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     tokio::spawn(hub.attach_stream(socket).run());
//! }
//! ```
//!
//! Leaves talk to the hub with `patchbay_session::establish_stream`; the
//! routing surface (`register_types`, `set_name`, `has_type`, ...) is a set
//! of calls addressed to the router itself, which `ClientHandle` wraps.

mod connection;
mod hub;

pub use connection::HubConnection;
pub use hub::{Hub, HubConfig};
