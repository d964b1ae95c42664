//! Protocol engine for the threshold signing coordinator.
//!
//! [`RoundBuffer`] accumulates inbound sub-messages per (session, round)
//! until the fan-in is complete; [`ProtocolMachine`] wraps the crypto
//! provider's setup objects in per-kind state machines that enforce strict
//! round ordering and translate provider outputs into routed, round-tagged
//! sub-messages.

pub mod engine;
pub mod error;
pub mod round_buffer;

pub use engine::{Artifact, Outbound, ProtocolMachine, RoundOutput};
pub use error::{EngineError, EngineResult};
pub use round_buffer::{Deposit, RoundBuffer};
