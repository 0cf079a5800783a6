use super::log::Term;
use super::message::Rpc;
use super::node::{Options, RaftNode};
use crate::errinput;
use crate::error::Result;
use crate::sim::{random, Cluster, MessageBus, Node as _, NodeId, Rule, Tick};

use itertools::Itertools as _;
use log::info;
use std::collections::VecDeque;

/// The outcome of a client write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WriteOutcome {
    /// A live leader accepted the command into its log.
    Accepted,
    /// No live leader; the command was queued and will be flushed to the
    /// next leader, in submission order.
    Queued,
}

/// The Raft simulation facade: wires a cluster of Raft nodes to a bus and a
/// seeded random source, and exposes the operations scenarios and the REPL
/// drive. Callers never reach into node internals; this surface plus the
/// rule API is the whole interface.
pub struct RaftModel {
    cluster: Cluster<Rpc, RaftNode>,
    /// Client writes awaiting a leader, flushed FIFO after every step.
    pending: VecDeque<String>,
}

impl RaftModel {
    /// Creates a model with the given nodes and seed, using default timing.
    pub fn new(node_ids: &[NodeId], seed: u64) -> Result<Self> {
        Self::with_options(node_ids, seed, Options::default())
    }

    /// Creates a model with the given nodes, seed, and timing options. Every
    /// node gets every other node as a peer.
    pub fn with_options(node_ids: &[NodeId], seed: u64, opts: Options) -> Result<Self> {
        if node_ids.is_empty() {
            return errinput!("cluster requires at least one node");
        }
        if let Some(dup) = node_ids.iter().duplicates().next() {
            return errinput!("duplicate node ID {dup}");
        }

        let random = random::shared(seed);
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut cluster = Cluster::new(MessageBus::new(random.clone()), rx);
        for id in node_ids {
            let peers = node_ids.iter().filter(|peer| *peer != id).cloned().collect();
            cluster.add(RaftNode::new(id.clone(), peers, opts.clone(), random.clone(), tx.clone())?);
        }
        info!("Initialized Raft cluster of {} with seed {seed}", node_ids.len());
        Ok(Self { cluster, pending: VecDeque::new() })
    }

    /// Advances the cluster one tick, then flushes pending client writes to
    /// the leader if one emerged, then checks cluster-wide invariants.
    pub fn step(&mut self) -> Result<()> {
        self.cluster.step()?;
        self.flush_pending()?;
        self.check_invariants();
        Ok(())
    }

    /// Returns the current tick.
    pub fn now(&self) -> Tick {
        self.cluster.now()
    }

    /// Returns the node IDs, in registry order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.cluster.nodes().iter().map(|n| n.id().clone()).collect()
    }

    /// Returns a node for read-only inspection.
    pub fn node(&self, id: &NodeId) -> Option<&RaftNode> {
        self.cluster.get(id)
    }

    /// Crashes a node. Unknown IDs are logged and ignored.
    pub fn crash(&mut self, id: &NodeId) -> Result<()> {
        let now = self.cluster.now();
        match self.cluster.get_mut(id) {
            Some(node) => node.set_up(false, now),
            None => {
                info!("Ignoring crash of unknown node {id}");
                Ok(())
            }
        }
    }

    /// Recovers a node. Unknown IDs are logged and ignored.
    pub fn recover(&mut self, id: &NodeId) -> Result<()> {
        let now = self.cluster.now();
        match self.cluster.get_mut(id) {
            Some(node) => node.set_up(true, now),
            None => {
                info!("Ignoring recovery of unknown node {id}");
                Ok(())
            }
        }
    }

    /// Partitions two groups of nodes from each other by installing drop
    /// rules for every directed pair across the groups.
    pub fn partition(&mut self, group_a: &[NodeId], group_b: &[NodeId]) {
        for a in group_a {
            for b in group_b {
                self.cluster.bus_mut().add_rule(Rule::drop(a.clone(), b.clone()));
                self.cluster.bus_mut().add_rule(Rule::drop(b.clone(), a.clone()));
            }
        }
        info!("Partitioned {group_a:?} from {group_b:?}");
    }

    /// Clears all network rules. Deliberately coarse: this removes delay and
    /// loss rules too, not just partitions. Callers needing finer control
    /// manage rules individually via remove_rule().
    pub fn clear_partitions(&mut self) {
        self.cluster.bus_mut().clear_rules();
        info!("Cleared all network rules");
    }

    /// Appends a network rule.
    pub fn add_rule(&mut self, rule: Rule) {
        self.cluster.bus_mut().add_rule(rule);
    }

    /// Removes the network rule at the given index, if any.
    pub fn remove_rule(&mut self, index: usize) -> Option<Rule> {
        self.cluster.bus_mut().remove_rule(index)
    }

    /// Returns the network rules.
    pub fn rules(&self) -> &[Rule] {
        self.cluster.bus().rules()
    }

    /// Submits a client write. Accepted by a live leader, queued otherwise.
    pub fn client_write(&mut self, command: impl Into<String>) -> Result<WriteOutcome> {
        let command = command.into();
        if let Some(leader) = self.current_leader_id() {
            let node = self.cluster.get_mut(&leader).expect("leader must be registered");
            if node.propose(command.clone())? {
                info!("Client write accepted by {leader}: {command}");
                return Ok(WriteOutcome::Accepted);
            }
        }
        info!("No live leader, queueing client write: {command}");
        self.pending.push_back(command);
        Ok(WriteOutcome::Queued)
    }

    /// Returns the first live leader in registry order, if any. There is at
    /// most one per term by invariant.
    pub fn current_leader_id(&self) -> Option<NodeId> {
        self.cluster
            .nodes()
            .iter()
            .find(|node| node.is_up() && node.is_leader())
            .map(|node| node.id().clone())
    }

    /// Returns true if every pair of live nodes has prefix-consistent logs:
    /// the shorter log equals the prefix of the longer one. Trivially true
    /// with at most one live node.
    pub fn logs_are_prefix_consistent(&self) -> bool {
        self.cluster
            .nodes()
            .iter()
            .filter(|node| node.is_up())
            .tuple_combinations()
            .all(|(a, b)| {
                let (a, b) = (a.log().entries(), b.log().entries());
                let len = std::cmp::min(a.len(), b.len());
                a[..len] == b[..len]
            })
    }

    /// Seeds a node's log with (term, command) pairs before the simulation
    /// runs. Unknown IDs are logged and ignored.
    pub fn seed_log(&mut self, id: &NodeId, entries: Vec<(Term, String)>) -> Result<()> {
        match self.cluster.get_mut(id) {
            Some(node) => node.seed_log(entries),
            None => {
                info!("Ignoring seeded log for unknown node {id}");
                Ok(())
            }
        }
    }

    /// Returns a deterministic dump of the full model state: a pure function
    /// of (scenario, seed, tick).
    pub fn dump(&self) -> String {
        let leader = self.current_leader_id().unwrap_or_else(|| "none".into());
        let mut out = format!(
            "tick={} leader={leader} pending={} delayed={}\n",
            self.cluster.now(),
            self.pending.len(),
            self.cluster.bus().delayed_count(),
        );
        out.push_str(&self.dump_nodes());
        out
    }

    /// Returns one summary line per node, in registry order.
    pub fn dump_nodes(&self) -> String {
        let mut out = String::new();
        for node in self.cluster.nodes() {
            let status = if node.is_up() { "up" } else { "down" };
            out.push_str(&format!("{}: {status} {}\n", node.id(), node.dump()));
        }
        out
    }

    /// Returns every node's full log, in registry order.
    pub fn dump_logs(&self) -> String {
        let mut out = String::new();
        for node in self.cluster.nodes() {
            let entries = node
                .log()
                .entries()
                .iter()
                .map(|e| format!("{}/{} {:?}", e.index, e.term, e.command))
                .join(", ");
            out.push_str(&format!("{}: [{entries}]\n", node.id()));
        }
        out
    }

    /// Returns the network rules by index, plus the delayed message count.
    pub fn dump_net(&self) -> String {
        let mut out = String::new();
        if self.rules().is_empty() {
            out.push_str("no rules\n");
        }
        for (index, rule) in self.rules().iter().enumerate() {
            out.push_str(&format!("[{index}] {rule}\n"));
        }
        out.push_str(&format!("delayed messages: {}\n", self.cluster.bus().delayed_count()));
        out
    }

    /// Flushes queued client writes to the leader, in FIFO order.
    fn flush_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(leader) = self.current_leader_id() else {
            return Ok(());
        };
        while let Some(command) = self.pending.pop_front() {
            info!("Flushing queued write to {leader}: {command}");
            let node = self.cluster.get_mut(&leader).expect("leader must be registered");
            if !node.propose(command.clone())? {
                self.pending.push_front(command);
                break;
            }
        }
        Ok(())
    }

    /// Asserts that at most one live leader exists per term. A violation is
    /// a simulator bug and aborts the run.
    fn check_invariants(&self) {
        let leaders: Vec<&RaftNode> = self
            .cluster
            .nodes()
            .iter()
            .filter(|node| node.is_up() && node.is_leader())
            .collect();
        for (a, b) in leaders.iter().tuple_combinations() {
            assert_ne!(
                a.term(),
                b.term(),
                "two leaders ({} and {}) in term {}",
                a.id(),
                b.id(),
                a.term()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    /// Steps until a live leader exists, up to a bound.
    fn step_to_leader(model: &mut RaftModel) -> NodeId {
        for _ in 0..50 {
            model.step().unwrap();
            if let Some(leader) = model.current_leader_id() {
                return leader;
            }
        }
        panic!("no leader after 50 ticks");
    }

    #[test]
    fn construction_validates_nodes() {
        assert!(RaftModel::new(&[], 1).is_err());
        assert!(RaftModel::new(&ids(&["n1", "n1"]), 1).is_err());
        assert!(RaftModel::new(&ids(&["n1"]), 1).is_ok());
    }

    #[test]
    fn elects_a_leader() {
        let mut model = RaftModel::new(&ids(&["n1", "n2", "n3"]), 12345).unwrap();
        let leader = step_to_leader(&mut model);
        assert!(model.node_ids().contains(&leader));
        assert!(model.now() <= 30);
    }

    #[test]
    fn client_writes_queue_until_leader() {
        let mut model = RaftModel::new(&ids(&["n1", "n2", "n3"]), 7).unwrap();
        assert_eq!(model.client_write("a").unwrap(), WriteOutcome::Queued);
        assert_eq!(model.client_write("b").unwrap(), WriteOutcome::Queued);

        let leader = step_to_leader(&mut model);
        model.step().unwrap();

        // The queue flushed in order into the leader's log.
        let log = model.node(&leader).unwrap().log();
        assert_eq!(log.get(1).unwrap().command, "a");
        assert_eq!(log.get(2).unwrap().command, "b");

        // With a live leader, writes are accepted directly.
        assert_eq!(model.client_write("c").unwrap(), WriteOutcome::Accepted);
        assert_eq!(model.node(&leader).unwrap().log().get(3).unwrap().command, "c");
    }

    #[test]
    fn crash_and_unknown_ids_are_forgiving() {
        let mut model = RaftModel::new(&ids(&["n1", "n2", "n3"]), 1).unwrap();
        model.crash(&"ghost".to_string()).unwrap();
        model.recover(&"ghost".to_string()).unwrap();

        let leader = step_to_leader(&mut model);
        model.crash(&leader).unwrap();
        assert_eq!(model.current_leader_id(), None);

        // A new leader emerges among the survivors.
        for _ in 0..50 {
            model.step().unwrap();
            if let Some(new_leader) = model.current_leader_id() {
                assert_ne!(new_leader, leader);
                return;
            }
        }
        panic!("no new leader after crash");
    }

    #[test]
    fn partition_installs_and_clears_drop_rules() {
        let mut model = RaftModel::new(&ids(&["n1", "n2", "n3", "n4", "n5"]), 42).unwrap();
        model.partition(&ids(&["n1", "n2"]), &ids(&["n3", "n4", "n5"]));
        assert_eq!(model.rules().len(), 12); // 2 * 3 pairs, both directions
        model.clear_partitions();
        assert!(model.rules().is_empty());
    }

    #[test]
    fn replication_keeps_logs_prefix_consistent() {
        let mut model = RaftModel::new(&ids(&["n1", "n2", "n3"]), 12345).unwrap();
        assert!(model.logs_are_prefix_consistent());

        step_to_leader(&mut model);
        model.client_write("x=1").unwrap();
        model.client_write("y=2").unwrap();
        for _ in 0..10 {
            model.step().unwrap();
            assert!(model.logs_are_prefix_consistent());
        }

        // All nodes converged on the two entries.
        for id in model.node_ids() {
            assert_eq!(model.node(&id).unwrap().log().len(), 2);
        }
    }

    #[test]
    fn identical_seeds_yield_identical_dumps() {
        let mut a = RaftModel::new(&ids(&["n1", "n2", "n3"]), 99).unwrap();
        let mut b = RaftModel::new(&ids(&["n1", "n2", "n3"]), 99).unwrap();
        for _ in 0..40 {
            a.step().unwrap();
            b.step().unwrap();
            assert_eq!(a.dump(), b.dump());
        }
    }
}
