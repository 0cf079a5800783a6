//! Scenario documents: a YAML description of a cluster, its initial state,
//! network rules, a timeline of fault-injection actions, and assertions.
//! Parsing goes through the `config` crate into typed serde structs, and
//! validation happens at load so that execution only ever sees well-formed
//! scenarios. Unknown node IDs are deliberately not validated here: the
//! model tolerates them at execution time.

use crate::errinput;
use crate::error::Result;
use crate::raft::{RaftModel, Term};
use crate::sim::{Action, NodeId, Rule, Tick};

use itertools::Itertools as _;
use serde::Deserialize;
use std::collections::HashMap;

/// The action kinds a timeline may reference.
const ACTION_KINDS: [&str; 8] =
    ["crash", "recover", "clientwrite", "partition", "partition_clear", "delay", "drop", "run"];

/// The assertion types a scenario may reference.
const ASSERTION_KINDS: [&str; 2] = ["leader_exists", "log_consistency"];

/// A simulation scenario.
#[derive(Clone, Debug, Deserialize)]
pub struct Scenario {
    /// The consensus model. Only "raft" is recognized.
    pub model: String,
    /// The random seed. Defaults to wall-clock time, which makes the run
    /// non-reproducible; scenarios that care set an explicit seed.
    #[serde(default)]
    pub seed: Option<u64>,
    /// The cluster description.
    pub cluster: ClusterSpec,
    /// Initial node state and logs.
    #[serde(default)]
    pub initial: InitialSpec,
    /// Initial network rules.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Scheduled actions, fired when the controller reaches their tick.
    #[serde(default)]
    pub timeline: Vec<TimedAction>,
    /// Assertions evaluated after the timeline has played out.
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
}

/// The cluster description.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterSpec {
    /// The node IDs. Non-empty and unique.
    pub nodes: Vec<NodeId>,
}

/// Initial state applied before the first tick.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InitialSpec {
    /// Per-node initial state.
    #[serde(default)]
    pub node_state: HashMap<NodeId, NodeStateSpec>,
    /// Per-node seeded logs, appended in order.
    #[serde(default)]
    pub logs: HashMap<NodeId, Vec<LogEntrySpec>>,
}

/// Initial per-node state.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeStateSpec {
    /// Whether the node starts crashed.
    #[serde(default)]
    pub crashed: bool,
}

/// A seeded log entry.
#[derive(Clone, Debug, Deserialize)]
pub struct LogEntrySpec {
    /// The entry's term.
    pub term: Term,
    /// The entry's command.
    pub cmd: String,
}

/// Initial network rules.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NetworkSpec {
    /// The rules, installed in order.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// A network rule specification.
#[derive(Clone, Debug, Deserialize)]
pub struct RuleSpec {
    /// The message pattern.
    #[serde(default, rename = "match")]
    pub matches: MatchSpec,
    /// The action: pass, drop, delay, or drop_pct.
    pub action: String,
    /// The delay in ticks, for delay rules.
    #[serde(default)]
    pub delay_steps: Option<Tick>,
    /// The drop probability in [0,1], for drop_pct rules. Defaults to 1.
    #[serde(default)]
    pub pct: Option<f64>,
}

/// A rule's message pattern. Absent fields and "*" are wildcards.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MatchSpec {
    /// The sender to match.
    #[serde(default)]
    pub from: Option<String>,
    /// The recipient to match.
    #[serde(default)]
    pub to: Option<String>,
    /// The message kind to match.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// An unordered node pair; shorthand for from/to with bidirectional.
    #[serde(default)]
    pub between: Option<Vec<NodeId>>,
    /// Whether from/to match in both directions.
    #[serde(default)]
    pub bidirectional: bool,
}

/// Actions scheduled at a tick.
#[derive(Clone, Debug, Deserialize)]
pub struct TimedAction {
    /// The tick at which to fire.
    pub at: Tick,
    /// The actions, fired in order.
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// A single timeline action.
#[derive(Clone, Debug, Deserialize)]
pub struct ActionSpec {
    /// The action kind.
    pub kind: String,
    /// The action arguments. Which apply depends on the kind.
    #[serde(default)]
    pub args: ActionArgs,
}

/// Timeline action arguments.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActionArgs {
    /// The target node, for crash/recover.
    #[serde(default)]
    pub node: Option<NodeId>,
    /// The command, for clientwrite.
    #[serde(default)]
    pub command: Option<String>,
    /// The two groups, for partition.
    #[serde(default)]
    pub groups: Option<Vec<Vec<NodeId>>>,
    /// The sender, for delay/drop rules.
    #[serde(default)]
    pub from: Option<String>,
    /// The recipient, for delay/drop rules.
    #[serde(default)]
    pub to: Option<String>,
    /// The message kind, for delay/drop rules.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// The delay in ticks, for delay rules.
    #[serde(default)]
    pub steps: Option<Tick>,
    /// The drop probability, for drop rules.
    #[serde(default)]
    pub pct: Option<f64>,
    /// The tick count, for run.
    #[serde(default)]
    pub ticks: Option<Tick>,
}

/// An assertion specification.
#[derive(Clone, Debug, Deserialize)]
pub struct AssertionSpec {
    /// The assertion type.
    #[serde(rename = "type")]
    pub kind: String,
    /// The assertion arguments.
    pub args: AssertionArgs,
}

/// Assertion arguments.
#[derive(Clone, Debug, Deserialize)]
pub struct AssertionArgs {
    /// The tick at or after which the assertion is checked.
    pub after: Tick,
}

impl Scenario {
    /// Loads and validates a scenario from a YAML file.
    pub fn load(path: &str) -> Result<Self> {
        let scenario: Scenario = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parses and validates a scenario from a YAML string.
    pub fn parse(text: &str) -> Result<Self> {
        let scenario: Scenario = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Builds a model from the scenario: seeds the PRNG, constructs the
    /// cluster, and applies initial state and network rules. The timeline
    /// and assertions are the controller's business.
    pub fn build(&self) -> Result<RaftModel> {
        let seed = self.seed.unwrap_or_else(default_seed);
        let mut model = RaftModel::new(&self.cluster.nodes, seed)?;

        for rule in &self.network.rules {
            model.add_rule(rule.to_rule()?);
        }
        // Sorted application keeps runs reproducible despite map iteration.
        for (id, entries) in self.initial.logs.iter().sorted_by_key(|(id, _)| id.clone()) {
            model.seed_log(id, entries.iter().map(|e| (e.term, e.cmd.clone())).collect())?;
        }
        for (id, state) in self.initial.node_state.iter().sorted_by_key(|(id, _)| id.clone()) {
            if state.crashed {
                model.crash(id)?;
            }
        }
        Ok(model)
    }

    /// Validates the scenario's own consistency. Unknown node IDs are left
    /// to execution, which tolerates them.
    fn validate(&self) -> Result<()> {
        if self.model != "raft" {
            return errinput!("unknown consensus model {}", self.model);
        }
        if self.cluster.nodes.is_empty() {
            return errinput!("scenario cluster requires at least one node");
        }
        if let Some(dup) = self.cluster.nodes.iter().duplicates().next() {
            return errinput!("duplicate cluster node {dup}");
        }
        for rule in &self.network.rules {
            rule.to_rule()?;
        }
        for timed in &self.timeline {
            for action in &timed.actions {
                if !ACTION_KINDS.contains(&action.kind.to_lowercase().as_str()) {
                    return errinput!("unknown action kind {}", action.kind);
                }
            }
        }
        for assertion in &self.assertions {
            if !ASSERTION_KINDS.contains(&assertion.kind.to_lowercase().as_str()) {
                return errinput!("unknown assertion type {}", assertion.kind);
            }
        }
        Ok(())
    }

    /// Returns the largest timeline tick, or 0 with an empty timeline.
    pub fn last_action_at(&self) -> Tick {
        self.timeline.iter().map(|t| t.at).max().unwrap_or(0)
    }

    /// Returns the largest assertion `after` tick, or 0 without assertions.
    pub fn max_assertion_after(&self) -> Tick {
        self.assertions.iter().map(|a| a.args.after).max().unwrap_or(0)
    }
}

impl RuleSpec {
    /// Converts the specification into a bus rule, validating its fields.
    pub fn to_rule(&self) -> Result<Rule> {
        let action = match self.action.to_lowercase().as_str() {
            "pass" => Action::Pass,
            "drop" => Action::Drop,
            "delay" => match self.delay_steps {
                Some(steps) => Action::Delay(steps),
                None => return errinput!("delay rule requires delay_steps"),
            },
            "drop_pct" => {
                let pct = self.pct.unwrap_or(1.0);
                if !(0.0..=1.0).contains(&pct) {
                    return errinput!("drop probability {pct} must be in [0,1]");
                }
                Action::DropProb(pct)
            }
            other => return errinput!("unknown rule action {other}"),
        };

        let (from, to, bidirectional) = match &self.matches.between {
            Some(pair) => {
                let [a, b] = pair.as_slice() else {
                    return errinput!("between requires exactly two nodes");
                };
                (Some(a.clone()), Some(b.clone()), true)
            }
            None => (
                pattern(&self.matches.from),
                pattern(&self.matches.to),
                self.matches.bidirectional,
            ),
        };
        Ok(Rule { from, to, kind: pattern(&self.matches.kind), bidirectional, action })
    }
}

/// Normalizes a pattern field: absent or "*" is a wildcard.
pub(crate) fn pattern(field: &Option<String>) -> Option<String> {
    field.as_ref().filter(|value| *value != "*").cloned()
}

/// A wall-clock seed for scenarios and clusters that don't pin one. Such
/// runs are not reproducible.
pub fn default_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::KIND_APPEND_ENTRIES;
    use crate::sim::Node as _;

    #[test]
    fn parses_minimal_scenario() {
        let scenario = Scenario::parse(
            r#"
model: raft
cluster:
  nodes: [n1, n2, n3]
"#,
        )
        .unwrap();
        assert_eq!(scenario.model, "raft");
        assert_eq!(scenario.seed, None);
        assert_eq!(scenario.cluster.nodes, vec!["n1", "n2", "n3"]);
        assert!(scenario.timeline.is_empty());
        assert!(scenario.assertions.is_empty());
        assert_eq!(scenario.last_action_at(), 0);
        assert_eq!(scenario.max_assertion_after(), 0);
    }

    #[test]
    fn parses_full_scenario() {
        let scenario = Scenario::parse(
            r#"
model: raft
seed: 12345
cluster:
  nodes: [n1, n2, n3, n4, n5]
initial:
  node_state:
    n5: {crashed: true}
  logs:
    n1:
      - {term: 1, cmd: "x=1"}
      - {term: 1, cmd: "y=2"}
network:
  rules:
    - match: {from: n1, to: n2, type: AppendEntries}
      action: delay
      delay_steps: 3
    - match: {between: [n1, n3]}
      action: drop_pct
      pct: 0.5
timeline:
  - at: 5
    actions:
      - kind: partition
        args: {groups: [[n1, n2], [n3, n4, n5]]}
  - at: 80
    actions:
      - kind: partition_clear
assertions:
  - type: leader_exists
    args: {after: 100}
  - type: log_consistency
    args: {after: 110}
"#,
        )
        .unwrap();
        assert_eq!(scenario.seed, Some(12345));
        assert!(scenario.initial.node_state["n5"].crashed);
        assert_eq!(scenario.initial.logs["n1"].len(), 2);
        assert_eq!(scenario.network.rules.len(), 2);
        assert_eq!(scenario.last_action_at(), 80);
        assert_eq!(scenario.max_assertion_after(), 110);

        let delay = scenario.network.rules[0].to_rule().unwrap();
        assert_eq!(delay.action, Action::Delay(3));
        assert_eq!(delay.kind.as_deref(), Some(KIND_APPEND_ENTRIES));
        assert!(!delay.bidirectional);

        let loss = scenario.network.rules[1].to_rule().unwrap();
        assert_eq!(loss.action, Action::DropProb(0.5));
        assert!(loss.bidirectional);
        assert_eq!(loss.from.as_deref(), Some("n1"));
        assert_eq!(loss.to.as_deref(), Some("n3"));
    }

    #[test]
    fn rejects_unknown_model() {
        let err = Scenario::parse(
            r#"
model: paxos
cluster:
  nodes: [n1]
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_invalid_cluster_rules_and_kinds() {
        assert!(Scenario::parse("model: raft\ncluster:\n  nodes: []\n").is_err());
        assert!(Scenario::parse("model: raft\ncluster:\n  nodes: [n1, n1]\n").is_err());

        let bad_pct = r#"
model: raft
cluster:
  nodes: [n1, n2]
network:
  rules:
    - match: {from: n1, to: n2}
      action: drop_pct
      pct: 1.5
"#;
        assert!(Scenario::parse(bad_pct).is_err());

        let bad_action = r#"
model: raft
cluster:
  nodes: [n1, n2]
timeline:
  - at: 1
    actions:
      - kind: explode
"#;
        assert!(Scenario::parse(bad_action).is_err());

        let bad_assertion = r#"
model: raft
cluster:
  nodes: [n1, n2]
assertions:
  - type: quorum_intact
    args: {after: 5}
"#;
        assert!(Scenario::parse(bad_assertion).is_err());
    }

    #[test]
    fn wildcards_normalize_to_none() {
        let rule = RuleSpec {
            matches: MatchSpec {
                from: Some("*".into()),
                to: Some("n2".into()),
                kind: None,
                between: None,
                bidirectional: false,
            },
            action: "drop".into(),
            delay_steps: None,
            pct: None,
        }
        .to_rule()
        .unwrap();
        assert_eq!(rule.from, None);
        assert_eq!(rule.to.as_deref(), Some("n2"));
        assert_eq!(rule.kind, None);
    }

    #[test]
    fn build_applies_initial_state() {
        let scenario = Scenario::parse(
            r#"
model: raft
seed: 7
cluster:
  nodes: [n1, n2, n3]
initial:
  node_state:
    n3: {crashed: true}
  logs:
    n1:
      - {term: 1, cmd: "x=1"}
network:
  rules:
    - match: {from: n1, to: n2}
      action: drop
"#,
        )
        .unwrap();
        let model = scenario.build().unwrap();
        assert_eq!(model.rules().len(), 1);
        assert!(!model.node(&"n3".to_string()).unwrap().is_up());
        let log = model.node(&"n1".to_string()).unwrap().log();
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(1).unwrap().command, "x=1");
    }
}
