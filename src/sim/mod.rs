//! The discrete-event simulation substrate: a deterministic random source, a
//! programmable message bus, and the tick-driven cluster driver. This module
//! is payload-agnostic; the Raft protocol plugs in through the [`Payload`]
//! and [`Node`] traits.

mod bus;
mod cluster;
mod message;
pub mod random;
mod rule;

pub use bus::MessageBus;
pub use cluster::{Cluster, Control, Node};
pub use message::{Message, NodeId, Payload, Tick};
pub use random::{Random, SharedRandom};
pub use rule::{Action, Rule};
