//! Transport layer for the threshold signing coordinator.
//!
//! Line-delimited JSON envelopes over TCP, one duplex [`Endpoint`] per
//! remote, a [`PeerRegistry`] indexing endpoints by participant id and by
//! symbolic client id, and an accept loop that identifies connections via
//! the `ack` hello frame.
//!
//! Guarantees relied on by the coordinator:
//! - envelopes from any one sender arrive in send order;
//! - writes through an endpoint never interleave partial frames;
//! - a closed endpoint is terminal and its close hook fires exactly once;
//! - heartbeats and idle timeouts live entirely inside this crate.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod registry;

pub use endpoint::{split, CloseHandler, Endpoint, EndpointConfig, EnvelopeHandler};
pub use error::{NetworkError, NetworkResult};
pub use listener::{bind, connect_peer, spawn_acceptor, Identity};
pub use registry::PeerRegistry;
