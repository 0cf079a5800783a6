#![warn(clippy::all)]

pub mod controller;
pub mod error;
pub mod raft;
pub mod scenario;
pub mod sim;

pub use controller::{Controller, Outcome};
pub use error::{Error, Result};
pub use raft::{RaftModel, WriteOutcome};
pub use scenario::Scenario;
