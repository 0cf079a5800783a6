//! The simulation controller: fires a scenario's timeline actions at their
//! scheduled ticks, runs the cluster to quiescence, and evaluates
//! assertions. Assertion failures are outcome values in the run report, not
//! errors; only malformed input and internal failures surface as errors.

use crate::error::Result;
use crate::raft::RaftModel;
use crate::scenario::{self, ActionSpec, AssertionSpec, Scenario};
use crate::sim::{Action, Rule, Tick};

use log::info;

/// Empty ticks appended after the timeline and assertion horizon, giving
/// heartbeats and commits time to propagate before assertions fire.
const SETTLE_TICKS: Tick = 5;

/// The outcome of a single assertion.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// The assertion's 1-based position in the scenario.
    pub index: usize,
    /// The assertion type.
    pub kind: String,
    /// The tick the assertion was scheduled for.
    pub after: Tick,
    /// The tick the assertion was actually checked at.
    pub checked_at: Tick,
    /// Whether the assertion passed.
    pub passed: bool,
    /// A human-readable explanation.
    pub detail: String,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "[{}] {status} {} after={} ({} at t={})",
            self.index, self.kind, self.after, self.detail, self.checked_at
        )
    }
}

/// Drives a model through a scenario. The controller's tick mirrors the
/// cluster's: both advance together in step().
pub struct Controller {
    /// The model under simulation.
    model: RaftModel,
    /// The timeline, flattened to (tick, action) and stably sorted by tick,
    /// preserving intra-tick order.
    timeline: Vec<(Tick, ActionSpec)>,
    /// The scenario's assertions.
    assertions: Vec<AssertionSpec>,
    /// The largest timeline tick.
    last_action_at: Tick,
    /// The largest assertion `after` tick.
    max_assertion_after: Tick,
    /// The current tick.
    tick: Tick,
    /// The next unfired timeline index.
    next_action: usize,
}

impl Controller {
    /// Creates a controller around a model, with no timeline or assertions.
    /// Used by the REPL's `init` command.
    pub fn new(model: RaftModel) -> Self {
        Self {
            model,
            timeline: Vec::new(),
            assertions: Vec::new(),
            last_action_at: 0,
            max_assertion_after: 0,
            tick: 0,
            next_action: 0,
        }
    }

    /// Builds a model from a scenario and wires its timeline and assertions.
    pub fn from_scenario(scenario: &Scenario) -> Result<Self> {
        let model = scenario.build()?;
        let mut timeline: Vec<(Tick, ActionSpec)> = scenario
            .timeline
            .iter()
            .flat_map(|timed| timed.actions.iter().map(move |action| (timed.at, action.clone())))
            .collect();
        timeline.sort_by_key(|(at, _)| *at);
        Ok(Self {
            model,
            timeline,
            assertions: scenario.assertions.clone(),
            last_action_at: scenario.last_action_at(),
            max_assertion_after: scenario.max_assertion_after(),
            tick: 0,
            next_action: 0,
        })
    }

    /// Returns the model.
    pub fn model(&self) -> &RaftModel {
        &self.model
    }

    /// Returns the model mutably, for direct REPL operations.
    pub fn model_mut(&mut self) -> &mut RaftModel {
        &mut self.model
    }

    /// Returns the current tick.
    pub fn now(&self) -> Tick {
        self.tick
    }

    /// Executes one simulation step: fires all timeline actions due at the
    /// current tick, advances the cluster one tick, then advances the
    /// controller tick.
    pub fn step(&mut self) -> Result<()> {
        self.fire_actions()?;
        self.model.step()?;
        self.tick += 1;
        Ok(())
    }

    /// Executes n simulation steps.
    pub fn step_n(&mut self, n: Tick) -> Result<()> {
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    /// Steps until the tick passes both the timeline and the assertion
    /// horizon, plus a settle buffer for quiescence.
    pub fn play_to_end(&mut self) -> Result<()> {
        let horizon = std::cmp::max(self.last_action_at + 1, self.max_assertion_after);
        let target = horizon + SETTLE_TICKS;
        info!("Playing to t={target}");
        while self.tick < target {
            self.step()?;
        }
        Ok(())
    }

    /// Evaluates all assertions in scenario order, stepping the simulation
    /// forward to each assertion's `after` tick where necessary. Failures
    /// are reported, not raised.
    pub fn evaluate_assertions(&mut self) -> Result<Vec<Outcome>> {
        let assertions = self.assertions.clone();
        let mut outcomes = Vec::with_capacity(assertions.len());
        for (i, assertion) in assertions.iter().enumerate() {
            while self.tick < assertion.args.after {
                self.step()?;
            }
            let (passed, detail) = match assertion.kind.to_lowercase().as_str() {
                "leader_exists" => match self.model.current_leader_id() {
                    Some(leader) => (true, format!("leader {leader}")),
                    None => (false, "no leader".to_string()),
                },
                "log_consistency" => match self.model.logs_are_prefix_consistent() {
                    true => (true, "logs prefix-consistent".to_string()),
                    false => (false, "logs diverge".to_string()),
                },
                // Unreachable after scenario validation.
                other => (false, format!("unknown assertion type {other}")),
            };
            outcomes.push(Outcome {
                index: i + 1,
                kind: assertion.kind.clone(),
                after: assertion.args.after,
                checked_at: self.tick,
                passed,
                detail,
            });
        }
        Ok(outcomes)
    }

    /// Plays the scenario to its end and evaluates assertions.
    pub fn play(&mut self) -> Result<Vec<Outcome>> {
        self.play_to_end()?;
        self.evaluate_assertions()
    }

    /// Fires all unfired timeline actions due at or before the current tick.
    fn fire_actions(&mut self) -> Result<()> {
        while self.next_action < self.timeline.len()
            && self.timeline[self.next_action].0 <= self.tick
        {
            let (at, action) = self.timeline[self.next_action].clone();
            self.next_action += 1;
            info!("t={at}: firing action {}", action.kind);
            self.execute(&action)?;
        }
        Ok(())
    }

    /// Executes a single timeline action. Actions with missing arguments are
    /// logged and ignored, keeping scenarios forgiving.
    fn execute(&mut self, action: &ActionSpec) -> Result<()> {
        let args = &action.args;
        match action.kind.to_lowercase().as_str() {
            "crash" => match &args.node {
                Some(node) => self.model.crash(node)?,
                None => info!("crash action missing node, ignoring"),
            },
            "recover" => match &args.node {
                Some(node) => self.model.recover(node)?,
                None => info!("recover action missing node, ignoring"),
            },
            "clientwrite" => match &args.command {
                Some(command) => {
                    self.model.client_write(command.clone())?;
                }
                None => info!("clientwrite action missing command, ignoring"),
            },
            "partition" => match args.groups.as_deref() {
                Some([group_a, group_b, ..]) => self.model.partition(group_a, group_b),
                _ => info!("partition action requires two groups, ignoring"),
            },
            "partition_clear" => self.model.clear_partitions(),
            "delay" => match (&args.from, &args.to, args.steps) {
                (Some(from), Some(to), Some(steps)) => self.model.add_rule(Rule {
                    from: scenario::pattern(&Some(from.clone())),
                    to: scenario::pattern(&Some(to.clone())),
                    kind: scenario::pattern(&args.kind),
                    bidirectional: false,
                    action: Action::Delay(steps),
                }),
                _ => info!("delay action requires from, to, and steps, ignoring"),
            },
            "drop" => match (&args.from, &args.to) {
                (Some(from), Some(to)) => {
                    let pct = args.pct.unwrap_or(1.0);
                    // A certain drop short-circuits; a partial one must be
                    // able to fall through to later rules.
                    let rule_action =
                        if pct < 1.0 { Action::DropProb(pct) } else { Action::Drop };
                    self.model.add_rule(Rule {
                        from: scenario::pattern(&Some(from.clone())),
                        to: scenario::pattern(&Some(to.clone())),
                        kind: scenario::pattern(&args.kind),
                        bidirectional: false,
                        action: rule_action,
                    })
                }
                _ => info!("drop action requires from and to, ignoring"),
            },
            "run" => match args.ticks {
                Some(ticks) => self.step_n(ticks)?,
                None => info!("run action missing ticks, ignoring"),
            },
            // Unreachable after scenario validation.
            other => info!("unknown action kind {other}, ignoring"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Node as _;

    fn controller(yaml: &str) -> Controller {
        Controller::from_scenario(&Scenario::parse(yaml).unwrap()).unwrap()
    }

    #[test]
    fn timeline_actions_fire_at_their_tick() {
        let mut c = controller(
            r#"
model: raft
seed: 1
cluster:
  nodes: [n1, n2, n3]
timeline:
  - at: 0
    actions:
      - kind: crash
        args: {node: n2}
  - at: 3
    actions:
      - kind: crash
        args: {node: n3}
      - kind: recover
        args: {node: n2}
"#,
        );
        // The at=0 action fires before the first cluster tick.
        c.step().unwrap();
        assert!(!c.model().node(&"n2".to_string()).unwrap().is_up());
        assert!(c.model().node(&"n3".to_string()).unwrap().is_up());

        c.step_n(2).unwrap(); // t=3 actions not yet fired
        assert!(c.model().node(&"n3".to_string()).unwrap().is_up());
        c.step().unwrap(); // fires the t=3 batch, in order
        assert!(!c.model().node(&"n3".to_string()).unwrap().is_up());
        assert!(c.model().node(&"n2".to_string()).unwrap().is_up());
    }

    #[test]
    fn run_action_steps_recursively() {
        let mut c = controller(
            r#"
model: raft
seed: 1
cluster:
  nodes: [n1, n2, n3]
timeline:
  - at: 2
    actions:
      - kind: run
        args: {ticks: 10}
"#,
        );
        c.step_n(2).unwrap();
        assert_eq!(c.now(), 2);
        // The outer step at t=2 nests 10 inner steps before its own.
        c.step().unwrap();
        assert_eq!(c.now(), 13);
        assert_eq!(c.model().now(), 13);
    }

    #[test]
    fn play_to_end_covers_horizon_and_settle() {
        let mut c = controller(
            r#"
model: raft
seed: 1
cluster:
  nodes: [n1, n2, n3]
timeline:
  - at: 4
    actions:
      - kind: clientwrite
        args: {command: "x=1"}
assertions:
  - type: leader_exists
    args: {after: 20}
"#,
        );
        c.play_to_end().unwrap();
        assert_eq!(c.now(), 25);
    }

    #[test]
    fn evaluate_assertions_steps_to_after_and_reports() {
        let mut c = controller(
            r#"
model: raft
seed: 12345
cluster:
  nodes: [n1, n2, n3]
assertions:
  - type: leader_exists
    args: {after: 30}
  - type: log_consistency
    args: {after: 35}
"#,
        );
        let outcomes = c.evaluate_assertions().unwrap();
        assert_eq!(c.now(), 35);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.passed), "outcomes: {outcomes:?}");
        assert_eq!(outcomes[0].checked_at, 30);
        assert_eq!(outcomes[1].checked_at, 35);
        assert!(outcomes[0].to_string().starts_with("[1] PASS leader_exists after=30"));
    }

    /// Assertion failures are data: a scenario whose cluster can't elect
    /// anyone reports FAIL without erroring.
    #[test]
    fn failed_assertions_are_reported_not_raised() {
        let mut c = controller(
            r#"
model: raft
seed: 1
cluster:
  nodes: [n1, n2]
initial:
  node_state:
    n2: {crashed: true}
assertions:
  - type: leader_exists
    args: {after: 40}
"#,
        );
        let outcomes = c.play().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].passed);
        assert_eq!(outcomes[0].detail, "no leader");
    }
}
