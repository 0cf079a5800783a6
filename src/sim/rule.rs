use super::message::{Message, NodeId, Payload, Tick};
use crate::errinput;
use crate::error::Result;

use std::fmt::{self, Display};

/// The action a rule takes on a matched message.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Deliver immediately, short-circuiting later rules.
    Pass,
    /// Discard silently.
    Drop,
    /// Hold for the given number of ticks before delivery.
    Delay(Tick),
    /// Discard with the given probability. On a miss, evaluation continues
    /// with later rules as if this rule had not matched; this is the only
    /// fall-through in the rule model.
    DropProb(f64),
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Pass => write!(f, "pass"),
            Action::Drop => write!(f, "drop"),
            Action::Delay(ticks) => write!(f, "delay {ticks}"),
            Action::DropProb(p) => write!(f, "drop pct={p}"),
        }
    }
}

/// A network rule: a message pattern and the action to take on a match. A
/// None pattern field is a wildcard. Rules are evaluated in insertion order
/// and the first match decides the outcome, except for DropProb misses.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    /// The sender to match, or None for any.
    pub from: Option<NodeId>,
    /// The recipient to match, or None for any.
    pub to: Option<NodeId>,
    /// The message kind to match, or None for any.
    pub kind: Option<String>,
    /// If true, from/to are an unordered pair: the rule matches traffic in
    /// both directions between them.
    pub bidirectional: bool,
    /// The action to take on a match.
    pub action: Action,
}

impl Rule {
    /// Creates a rule matching all messages from one node to another.
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, action: Action) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            kind: None,
            bidirectional: false,
            action,
        }
    }

    /// Creates a rule matching every message.
    pub fn all(action: Action) -> Self {
        Self { from: None, to: None, kind: None, bidirectional: false, action }
    }

    /// Creates a drop rule for a directed node pair.
    pub fn drop(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self::new(from, to, Action::Drop)
    }

    /// Creates a delay rule for a directed node pair.
    pub fn delay(from: impl Into<NodeId>, to: impl Into<NodeId>, ticks: Tick) -> Self {
        Self::new(from, to, Action::Delay(ticks))
    }

    /// Creates a probabilistic drop rule for a directed node pair. Errors if
    /// the probability is outside [0, 1].
    pub fn drop_prob(from: impl Into<NodeId>, to: impl Into<NodeId>, pct: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&pct) {
            return errinput!("drop probability {pct} must be in [0,1]");
        }
        Ok(Self::new(from, to, Action::DropProb(pct)))
    }

    /// Restricts the rule to a message kind.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Makes the rule match the node pair in both directions.
    pub fn between(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    /// Returns true if the rule matches the message.
    pub fn matches<P: Payload>(&self, msg: &Message<P>) -> bool {
        if let Some(kind) = &self.kind {
            if kind != msg.kind() {
                return false;
            }
        }
        if self.bidirectional {
            // Match the unordered pair {from, to}, treating a wildcard side
            // as matching either endpoint.
            let forward = self.endpoint_matches(&self.from, &msg.from)
                && self.endpoint_matches(&self.to, &msg.to);
            let reverse = self.endpoint_matches(&self.from, &msg.to)
                && self.endpoint_matches(&self.to, &msg.from);
            forward || reverse
        } else {
            self.endpoint_matches(&self.from, &msg.from) && self.endpoint_matches(&self.to, &msg.to)
        }
    }

    fn endpoint_matches(&self, pattern: &Option<NodeId>, id: &NodeId) -> bool {
        pattern.as_ref().map_or(true, |p| p == id)
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let wildcard = "*".to_string();
        let from = self.from.as_ref().unwrap_or(&wildcard);
        let to = self.to.as_ref().unwrap_or(&wildcard);
        let kind = self.kind.as_deref().unwrap_or("*");
        let arrow = if self.bidirectional { "<->" } else { "->" };
        write!(f, "{from} {arrow} {to} ({kind}): {}", self.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Probe(&'static str);

    impl Payload for Probe {
        fn kind(&self) -> &'static str {
            self.0
        }
    }

    fn msg(from: &str, to: &str, kind: &'static str) -> Message<Probe> {
        Message::new(from, to, Probe(kind))
    }

    #[test]
    fn exact_match() {
        let rule = Rule::drop("n1", "n2");
        assert!(rule.matches(&msg("n1", "n2", "AppendEntries")));
        assert!(!rule.matches(&msg("n2", "n1", "AppendEntries")));
        assert!(!rule.matches(&msg("n1", "n3", "AppendEntries")));
    }

    #[test]
    fn wildcards() {
        let any = Rule::all(Action::Drop);
        assert!(any.matches(&msg("n1", "n2", "RequestVote")));

        let from_any = Rule { from: None, ..Rule::drop("x", "n2") };
        assert!(from_any.matches(&msg("n9", "n2", "RequestVote")));
        assert!(!from_any.matches(&msg("n9", "n3", "RequestVote")));
    }

    #[test]
    fn kind_match() {
        let rule = Rule::drop("n1", "n2").with_kind("RequestVote");
        assert!(rule.matches(&msg("n1", "n2", "RequestVote")));
        assert!(!rule.matches(&msg("n1", "n2", "AppendEntries")));
    }

    #[test]
    fn bidirectional_matches_both_directions() {
        let rule = Rule::drop("n1", "n2").between();
        assert!(rule.matches(&msg("n1", "n2", "AppendEntries")));
        assert!(rule.matches(&msg("n2", "n1", "AppendEntries")));
        assert!(!rule.matches(&msg("n1", "n3", "AppendEntries")));
        assert!(!rule.matches(&msg("n3", "n2", "AppendEntries")));
    }

    #[test]
    fn drop_prob_validates_pct() {
        assert!(Rule::drop_prob("n1", "n2", 0.0).is_ok());
        assert!(Rule::drop_prob("n1", "n2", 1.0).is_ok());
        assert!(Rule::drop_prob("n1", "n2", 1.5).is_err());
        assert!(Rule::drop_prob("n1", "n2", -0.1).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(Rule::drop("n1", "n2").to_string(), "n1 -> n2 (*): drop");
        assert_eq!(
            Rule::delay("n1", "n2", 3).with_kind("AppendEntries").to_string(),
            "n1 -> n2 (AppendEntries): delay 3"
        );
        assert_eq!(Rule::drop("n1", "n2").between().to_string(), "n1 <-> n2 (*): drop");
    }
}
