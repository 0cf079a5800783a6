use super::log::{Index, RaftLog, Term};
use super::message::Rpc;
use crate::errdata;
use crate::error::Result;
use crate::sim::{self, Message, NodeId, SharedRandom, Tick};

use itertools::Itertools as _;
use log::{debug, info};
use std::collections::{BTreeMap, HashSet};

/// Raft node timing options, in ticks.
#[derive(Clone, Debug)]
pub struct Options {
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Tick,
    /// The range of randomized election timeouts, drawn on entry into the
    /// follower and candidate roles. Wider than the heartbeat interval so
    /// that split votes are unlikely but possible.
    pub election_timeout: std::ops::RangeInclusive<Tick>,
}

impl Default for Options {
    fn default() -> Self {
        Self { heartbeat_interval: 2, election_timeout: 9..=15 }
    }
}

/// Follower replication progress, tracked by leaders.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// The next log index to replicate to the follower.
    pub next_index: Index,
    /// The last log index known to match the follower's log.
    pub match_index: Index,
}

impl Progress {
    /// Attempts to advance the follower's match index, returning true if it
    /// did. next_index is pulled along but never regressed here.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }

    /// Regresses next_index by one after a rejected AppendEntries, bounded
    /// below by match_index + 1. The next heartbeat retries from there.
    fn regress(&mut self) {
        self.next_index = std::cmp::max(self.next_index.saturating_sub(1), self.match_index + 1);
    }
}

/// A Raft role. Role-specific state lives in the variant, so a role change
/// drops the old role's volatile state wholesale.
#[derive(Clone, Debug, PartialEq)]
pub enum Role {
    /// Replicates entries from a leader, campaigns on election timeout.
    Follower,
    /// Campaigns for leadership, tracking received votes (including its own).
    Candidate { votes: HashSet<NodeId> },
    /// Replicates entries to followers, tracking per-peer progress.
    Leader { progress: BTreeMap<NodeId, Progress> },
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate { .. } => write!(f, "Candidate"),
            Role::Leader { .. } => write!(f, "Leader"),
        }
    }
}

/// A Raft node. Driven synchronously by the cluster driver via on_tick() and
/// on_message(); outbound messages go through the cluster outbox channel.
///
/// Internal invariants are asserted on the hot paths: a violated assertion
/// means a simulator bug, not bad input, and aborts the run.
pub struct RaftNode {
    /// The node ID.
    id: NodeId,
    /// Peer IDs, sorted for deterministic broadcast order. Excludes self.
    peers: Vec<NodeId>,
    /// The current term. Never decreases.
    term: Term,
    /// The node voted for in the current term, if any. Reset when the term
    /// increases.
    voted_for: Option<NodeId>,
    /// The replicated log.
    log: RaftLog,
    /// The index of the last entry applied to the (virtual) state machine.
    last_applied: Index,
    /// The current role.
    role: Role,
    /// Whether the node is up. Crashed nodes keep term, vote, and log.
    up: bool,
    /// The tick of the last leader contact, granted vote, or leadership
    /// assumption. Drives the election and heartbeat timers.
    last_activity: Tick,
    /// The current randomized election timeout, in ticks.
    election_timeout: Tick,
    /// Timing options.
    opts: Options,
    /// The cluster random source, for election timeout jitter.
    random: SharedRandom,
    /// Outbound message channel, drained into the bus by the driver.
    tx: crossbeam::channel::Sender<Message<Rpc>>,
}

impl RaftNode {
    /// Creates a new node as a follower at term 0.
    pub fn new(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        opts: Options,
        random: SharedRandom,
        tx: crossbeam::channel::Sender<Message<Rpc>>,
    ) -> Result<Self> {
        let id = id.into();
        assert!(!peers.contains(&id), "node {id} can't be its own peer");
        let peers = peers.into_iter().sorted().dedup().collect();
        let mut node = Self {
            id,
            peers,
            term: 0,
            voted_for: None,
            log: RaftLog::new(),
            last_applied: 0,
            role: Role::Follower,
            up: true,
            last_activity: 0,
            election_timeout: 0,
            opts,
            random,
            tx,
        };
        node.election_timeout = node.gen_election_timeout()?;
        Ok(node)
    }

    /// Returns the current term.
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the node voted for in the current term, if any.
    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// Returns the current role.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Returns true if the node is currently a leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Returns the log.
    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the last applied index.
    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    /// Accepts a client command if leader, appending it to the log and
    /// pushing replication immediately. Returns false otherwise; the caller
    /// may queue and retry.
    pub fn propose(&mut self, command: String) -> Result<bool> {
        if !self.is_leader() {
            return Ok(false);
        }
        let index = self.log.append(self.term, command);
        info!("{} appended entry {index} in term {}", self.id, self.term);
        if let Role::Leader { progress } = &self.role {
            for (peer, pr) in progress {
                self.send_entries(peer, pr.next_index)?;
            }
        }
        // A single-node cluster commits on its own.
        self.maybe_commit();
        Ok(true)
    }

    /// Seeds the log with (term, command) pairs, e.g. from a scenario's
    /// initial state, and raises the node's term to cover them.
    pub fn seed_log(&mut self, entries: Vec<(Term, String)>) -> Result<()> {
        for (term, command) in entries {
            let (_, last_term) = self.log.last();
            if term < last_term {
                return errdata!("seeded log terms must be non-decreasing");
            }
            self.log.append(term, command);
        }
        self.term = std::cmp::max(self.term, self.log.last().1);
        Ok(())
    }

    /// Returns the cluster size, including self.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Returns the quorum size (strict majority of the configured cluster,
    /// regardless of how many nodes are live).
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Returns the quorum value of the given unsorted vector: the largest
    /// value that a strict majority is at or above. The vector must have one
    /// element per cluster member.
    fn quorum_value(mut values: Vec<Index>, quorum: usize) -> Index {
        *values.select_nth_unstable_by(quorum - 1, |a, b| a.cmp(b).reverse()).1
    }

    /// Generates a randomized election timeout.
    fn gen_election_timeout(&self) -> Result<Tick> {
        let range = &self.opts.election_timeout;
        self.random.borrow_mut().jitter(*range.start(), *range.end())
    }

    /// Sends a message to a peer.
    fn send(&self, to: &NodeId, rpc: Rpc) -> Result<()> {
        let msg = Message::new(self.id.clone(), to.clone(), rpc);
        debug!("Sending {msg:?}");
        Ok(self.tx.send(msg)?)
    }

    /// Broadcasts a message to all peers, in sorted order for determinism.
    fn broadcast(&self, rpc: Rpc) -> Result<()> {
        for peer in &self.peers {
            self.send(peer, rpc.clone())?;
        }
        Ok(())
    }

    /// Steps into a higher term as a leaderless follower, resetting the vote.
    fn bump_term(&mut self, term: Term) {
        assert!(term > self.term, "term regression {} → {term}", self.term);
        debug!("{} discovered new term {term}", self.id);
        self.term = term;
        self.voted_for = None;
        self.role = Role::Follower;
    }

    /// Campaigns for leadership: enters a new term as candidate, votes for
    /// itself, resets the election timer, and solicits votes from all peers.
    fn campaign(&mut self, now: Tick) -> Result<()> {
        self.term += 1;
        info!("{} starting election for term {}", self.id, self.term);
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate { votes: HashSet::from([self.id.clone()]) };
        self.election_timeout = self.gen_election_timeout()?;
        self.last_activity = now;

        let (last_index, last_term) = self.log.last();
        self.broadcast(Rpc::RequestVote {
            term: self.term,
            candidate: self.id.clone(),
            last_index,
            last_term,
        })?;

        // A single-node cluster has quorum by its own vote.
        let votes = match &self.role {
            Role::Candidate { votes } => votes.len(),
            _ => 0,
        };
        if votes >= self.quorum_size() {
            self.become_leader(now)?;
        }
        Ok(())
    }

    /// Assumes leadership after winning an election: initializes follower
    /// progress and immediately asserts leadership with an empty
    /// AppendEntries round.
    fn become_leader(&mut self, now: Tick) -> Result<()> {
        info!("{} won election for term {}, becoming leader", self.id, self.term);
        let (last_index, _) = self.log.last();
        let progress = self
            .peers
            .iter()
            .map(|peer| {
                (peer.clone(), Progress { next_index: last_index + 1, match_index: 0 })
            })
            .collect();
        self.role = Role::Leader { progress };
        self.heartbeat(now)
    }

    /// Sends an AppendEntries round to all peers, carrying any entries they
    /// are missing, and resets the heartbeat timer.
    fn heartbeat(&mut self, now: Tick) -> Result<()> {
        if let Role::Leader { progress } = &self.role {
            for (peer, pr) in progress {
                self.send_entries(peer, pr.next_index)?;
            }
        }
        self.last_activity = now;
        Ok(())
    }

    /// Sends the log tail from next_index to a single peer.
    fn send_entries(&self, peer: &NodeId, next_index: Index) -> Result<()> {
        let prev_index = next_index - 1;
        let prev_term = self.log.get(prev_index).map(|e| e.term).unwrap_or(0);
        self.send(
            peer,
            Rpc::AppendEntries {
                term: self.term,
                leader: self.id.clone(),
                prev_index,
                prev_term,
                entries: self.log.entries_from(next_index),
                leader_commit: self.log.commit_index(),
            },
        )
    }

    /// Grants or denies a vote (§5.4.1 of the Raft paper): one vote per
    /// term, and only to candidates whose log is at least as up-to-date.
    fn handle_request_vote(
        &mut self,
        candidate: NodeId,
        term: Term,
        last_index: Index,
        last_term: Term,
        now: Tick,
    ) -> Result<()> {
        if term > self.term {
            self.bump_term(term);
        }

        let (my_index, my_term) = self.log.last();
        let up_to_date = last_term > my_term || (last_term == my_term && last_index >= my_index);
        let can_vote =
            self.voted_for.is_none() || self.voted_for.as_ref() == Some(&candidate);
        let granted = term == self.term && can_vote && up_to_date;

        if granted {
            info!("{} voting for {candidate} in term {term}", self.id);
            self.voted_for = Some(candidate.clone());
            self.last_activity = now;
        }
        self.send(&candidate, Rpc::RequestVoteResp { term: self.term, granted })
    }

    /// Tallies a vote response while campaigning. Reaching quorum assumes
    /// leadership; responses in other roles or terms are stale and ignored.
    fn handle_request_vote_resp(
        &mut self,
        from: NodeId,
        term: Term,
        granted: bool,
        now: Tick,
    ) -> Result<()> {
        if term > self.term {
            self.bump_term(term);
            return Ok(());
        }
        let quorum = self.quorum_size();
        let won = match &mut self.role {
            Role::Candidate { votes } if term == self.term && granted => {
                votes.insert(from);
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader(now)?;
        }
        Ok(())
    }

    /// Appends replicated entries from a leader. Any AppendEntries at or
    /// above our term makes us its follower and resets the election timer,
    /// even if the consistency check then fails.
    fn handle_append_entries(
        &mut self,
        leader: NodeId,
        term: Term,
        prev_index: Index,
        prev_term: Term,
        entries: Vec<super::log::Entry>,
        leader_commit: Index,
        now: Tick,
    ) -> Result<()> {
        if term < self.term {
            debug!("{} rejecting stale AppendEntries from {leader} in term {term}", self.id);
            return self.send(
                &leader,
                Rpc::AppendEntriesResp { term: self.term, success: false, match_index: 0 },
            );
        }
        if term > self.term {
            self.bump_term(term);
        }
        assert!(!self.is_leader(), "two leaders in term {}", self.term);
        self.role = Role::Follower;
        self.last_activity = now;

        if prev_index > 0 && !self.log.has(prev_index, prev_term) {
            debug!("{} missing base entry {prev_index}/{prev_term}, rejecting", self.id);
            return self.send(
                &leader,
                Rpc::AppendEntriesResp { term: self.term, success: false, match_index: 0 },
            );
        }

        let match_index = self.log.splice(prev_index, entries);
        if leader_commit > self.log.commit_index() {
            self.log.commit(std::cmp::min(leader_commit, self.log.last().0));
        }
        self.send(
            &leader,
            Rpc::AppendEntriesResp { term: self.term, success: true, match_index },
        )
    }

    /// Updates follower progress from an AppendEntries response and advances
    /// the commit index where a quorum allows.
    fn handle_append_entries_resp(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: Index,
    ) -> Result<()> {
        if term > self.term {
            self.bump_term(term);
            return Ok(());
        }
        if term < self.term {
            return Ok(()); // stale response
        }
        let last_index = self.log.last().0;
        let advanced = match &mut self.role {
            Role::Leader { progress } => {
                let pr = progress.get_mut(&from).expect("response from unknown peer");
                if success {
                    assert!(match_index <= last_index, "match index {match_index} beyond log");
                    pr.advance(match_index)
                } else {
                    pr.regress();
                    false
                }
            }
            _ => false, // stale response from a past leadership
        };
        if advanced {
            self.maybe_commit();
        }
        Ok(())
    }

    /// Commits the largest index replicated to a quorum, if it is from the
    /// current term. Entries from prior terms are never committed directly;
    /// they commit transitively when a current-term entry commits above them.
    fn maybe_commit(&mut self) {
        let Role::Leader { progress } = &self.role else {
            return;
        };
        let mut indexes: Vec<Index> = progress.values().map(|pr| pr.match_index).collect();
        indexes.push(self.log.last().0);
        let quorum_index = Self::quorum_value(indexes, self.quorum_size());
        if quorum_index > self.log.commit_index()
            && self.log.get(quorum_index).map(|e| e.term) == Some(self.term)
        {
            debug!("{} committing index {quorum_index} in term {}", self.id, self.term);
            self.log.commit(quorum_index);
        }
    }

    /// Applies committed entries. Commands are opaque here, so applying just
    /// advances the applied index.
    fn maybe_apply(&mut self) {
        self.last_applied = self.log.commit_index();
    }
}

impl sim::Node<Rpc> for RaftNode {
    fn id(&self) -> &NodeId {
        &self.id
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn set_up(&mut self, up: bool, now: Tick) -> Result<()> {
        if up == self.up {
            return Ok(()); // redundant crash/recover is a no-op
        }
        self.up = up;
        self.role = Role::Follower;
        if up {
            // Restart the election timer from the recovery tick, not from
            // crash time, with a fresh jitter draw.
            self.last_activity = now;
            self.election_timeout = self.gen_election_timeout()?;
            info!("{} recovered as follower in term {}", self.id, self.term);
        } else {
            info!("{} crashed", self.id);
        }
        Ok(())
    }

    fn on_tick(&mut self, now: Tick) -> Result<()> {
        assert!(self.up, "crashed node ticked");
        assert!(now >= self.last_activity, "tick time regression");

        match self.role {
            Role::Follower | Role::Candidate { .. } => {
                if now - self.last_activity > self.election_timeout {
                    self.campaign(now)?;
                }
            }
            Role::Leader { .. } => {
                if now - self.last_activity >= self.opts.heartbeat_interval {
                    self.heartbeat(now)?;
                }
            }
        }
        self.maybe_apply();
        Ok(())
    }

    fn on_message(&mut self, msg: Message<Rpc>, now: Tick) -> Result<()> {
        assert!(self.up, "message delivered to crashed node");
        assert_eq!(msg.to, self.id, "message to other node");
        assert!(self.peers.contains(&msg.from), "message from unknown sender {}", msg.from);

        match msg.payload {
            Rpc::RequestVote { term, candidate, last_index, last_term } => {
                assert_eq!(candidate, msg.from, "candidate differs from sender");
                self.handle_request_vote(candidate, term, last_index, last_term, now)?;
            }
            Rpc::RequestVoteResp { term, granted } => {
                self.handle_request_vote_resp(msg.from, term, granted, now)?;
            }
            Rpc::AppendEntries { term, leader, prev_index, prev_term, entries, leader_commit } => {
                assert_eq!(leader, msg.from, "leader differs from sender");
                self.handle_append_entries(
                    leader,
                    term,
                    prev_index,
                    prev_term,
                    entries,
                    leader_commit,
                    now,
                )?;
            }
            Rpc::AppendEntriesResp { term, success, match_index } => {
                self.handle_append_entries_resp(msg.from, term, success, match_index)?;
            }
        }
        self.maybe_apply();
        Ok(())
    }

    fn dump(&self) -> String {
        let vote = self.voted_for.as_deref().unwrap_or("none");
        let mut out = format!(
            "role={} term={} vote={vote} commit={} applied={} log={}",
            self.role,
            self.term,
            self.log.commit_index(),
            self.last_applied,
            self.log.len(),
        );
        if let Role::Leader { progress } = &self.role {
            let progress = progress
                .iter()
                .map(|(peer, pr)| format!("{peer}:{}/{}", pr.next_index, pr.match_index))
                .join(" ");
            out.push_str(&format!(" progress=[{progress}]"));
        }
        out
    }
}
