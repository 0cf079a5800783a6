use super::log::{Entry, Index, Term};
use crate::sim::{NodeId, Payload};

use serde::{Deserialize, Serialize};

/// Message kind tags, as matched by network rules and scenario files.
pub const KIND_REQUEST_VOTE: &str = "RequestVote";
pub const KIND_REQUEST_VOTE_RESP: &str = "RequestVoteResp";
pub const KIND_APPEND_ENTRIES: &str = "AppendEntries";
pub const KIND_APPEND_ENTRIES_RESP: &str = "AppendEntriesResp";

/// All known message kinds.
pub const KINDS: [&str; 4] =
    [KIND_REQUEST_VOTE, KIND_REQUEST_VOTE_RESP, KIND_APPEND_ENTRIES, KIND_APPEND_ENTRIES_RESP];

/// A Raft RPC payload. The set is closed: the role state machine dispatches
/// exhaustively over these four variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Rpc {
    /// Candidates solicit votes from all peers when campaigning.
    RequestVote {
        /// The candidate's term.
        term: Term,
        /// The campaigning candidate.
        candidate: NodeId,
        /// The index of the candidate's last log entry.
        last_index: Index,
        /// The term of the candidate's last log entry.
        last_term: Term,
    },
    /// A voter's response to a RequestVote.
    RequestVoteResp {
        /// The voter's current term.
        term: Term,
        /// Whether the vote was granted.
        granted: bool,
    },
    /// Leaders replicate entries and assert leadership. An empty entries
    /// vector is a heartbeat.
    AppendEntries {
        /// The leader's term.
        term: Term,
        /// The leader.
        leader: NodeId,
        /// The index of the entry immediately preceding the entries.
        prev_index: Index,
        /// The term of the entry immediately preceding the entries.
        prev_term: Term,
        /// Entries to replicate.
        entries: Vec<Entry>,
        /// The leader's commit index.
        leader_commit: Index,
    },
    /// A follower's response to an AppendEntries.
    AppendEntriesResp {
        /// The follower's current term.
        term: Term,
        /// Whether the entries were appended.
        success: bool,
        /// On success, the index of the last entry matching the leader's
        /// log. 0 on failure.
        match_index: Index,
    },
}

impl Payload for Rpc {
    fn kind(&self) -> &'static str {
        match self {
            Rpc::RequestVote { .. } => KIND_REQUEST_VOTE,
            Rpc::RequestVoteResp { .. } => KIND_REQUEST_VOTE_RESP,
            Rpc::AppendEntries { .. } => KIND_APPEND_ENTRIES,
            Rpc::AppendEntriesResp { .. } => KIND_APPEND_ENTRIES_RESP,
        }
    }
}
