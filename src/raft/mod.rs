//! The Raft consensus state machine and its simulation facade. Nodes plug
//! into the simulation substrate in [`crate::sim`] through the `Node` and
//! `Payload` traits; scenarios and the REPL drive the [`RaftModel`] facade.

mod log;
mod message;
mod model;
mod node;

pub use log::{Entry, Index, RaftLog, Term};
pub use message::{
    Rpc, KINDS, KIND_APPEND_ENTRIES, KIND_APPEND_ENTRIES_RESP, KIND_REQUEST_VOTE,
    KIND_REQUEST_VOTE_RESP,
};
pub use model::{RaftModel, WriteOutcome};
pub use node::{Options, Progress, RaftNode, Role};
