use super::message::{Message, NodeId, Payload, Tick};
use super::random::SharedRandom;
use super::rule::{Action, Rule};

use log::debug;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

/// A message held back by a delay rule. Ordered by delivery tick, with a
/// send sequence number breaking ties so that equally-delayed messages
/// deliver in send order.
#[derive(Debug)]
struct Delayed<P: Payload> {
    delivery_tick: Tick,
    seq: u64,
    message: Message<P>,
}

impl<P: Payload> PartialEq for Delayed<P> {
    fn eq(&self, other: &Self) -> bool {
        self.delivery_tick == other.delivery_tick && self.seq == other.seq
    }
}

impl<P: Payload> Eq for Delayed<P> {}

impl<P: Payload> PartialOrd for Delayed<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Payload> Ord for Delayed<P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.delivery_tick, self.seq).cmp(&(other.delivery_tick, other.seq))
    }
}

/// The verdict of rule evaluation for a sent message.
enum Verdict {
    Deliver,
    Drop,
    Delay(Tick),
}

/// A discrete-time message bus. Messages sent through the bus are routed by
/// an ordered rule list into either the recipient's FIFO inbox or a delay
/// queue drained as the bus clock advances. Single-threaded and cooperative:
/// no rule or message is ever observed partially.
pub struct MessageBus<P: Payload> {
    /// The rule list, evaluated in insertion order.
    rules: Vec<Rule>,
    /// Messages held back by delay rules, keyed by delivery tick.
    delayed: BinaryHeap<Reverse<Delayed<P>>>,
    /// Per-recipient FIFO inboxes.
    inboxes: HashMap<NodeId, VecDeque<Message<P>>>,
    /// The bus clock, advanced by tick().
    now: Tick,
    /// Send sequence counter, for deterministic delay-queue ordering.
    seq: u64,
    /// The cluster random source, used for probabilistic drops.
    random: SharedRandom,
}

impl<P: Payload> MessageBus<P> {
    /// Creates an empty bus at tick 0 with no rules.
    pub fn new(random: SharedRandom) -> Self {
        Self {
            rules: Vec::new(),
            delayed: BinaryHeap::new(),
            inboxes: HashMap::new(),
            now: 0,
            seq: 0,
            random,
        }
    }

    /// Sends a message, applying the rule list. The first matching rule
    /// decides the outcome, except that a DropProb that does not fire falls
    /// through to subsequent rules. With no matching rule the message is
    /// delivered immediately.
    pub fn send(&mut self, message: Message<P>) {
        let mut verdict = Verdict::Deliver;
        for rule in &self.rules {
            if !rule.matches(&message) {
                continue;
            }
            match rule.action {
                Action::Pass => break,
                Action::Drop => {
                    verdict = Verdict::Drop;
                    break;
                }
                Action::Delay(ticks) => {
                    verdict = Verdict::Delay(ticks);
                    break;
                }
                Action::DropProb(p) => {
                    if self.random.borrow_mut().chance(p) {
                        verdict = Verdict::Drop;
                        break;
                    }
                    // Fell through: keep evaluating as if unmatched.
                }
            }
        }
        match verdict {
            Verdict::Deliver => self.deliver(message),
            Verdict::Drop => debug!("Dropping {message:?}"),
            Verdict::Delay(ticks) => {
                debug!("Delaying {message:?} by {ticks} ticks");
                self.seq += 1;
                self.delayed.push(Reverse(Delayed {
                    delivery_tick: self.now + ticks,
                    seq: self.seq,
                    message,
                }));
            }
        }
    }

    /// Places a message in its recipient's inbox.
    fn deliver(&mut self, message: Message<P>) {
        self.inboxes.entry(message.to.clone()).or_default().push_back(message);
    }

    /// Advances the bus clock by one tick and moves all matured delayed
    /// messages into recipient inboxes, in (delivery tick, send order).
    pub fn tick(&mut self) {
        self.now += 1;
        while let Some(Reverse(head)) = self.delayed.peek() {
            if head.delivery_tick > self.now {
                break;
            }
            let Reverse(delayed) = self.delayed.pop().expect("peeked entry must pop");
            self.deliver(delayed.message);
        }
    }

    /// Removes and returns all queued messages for a node, in arrival order.
    /// Returns an empty vector for an empty or unknown inbox.
    pub fn drain(&mut self, id: &NodeId) -> Vec<Message<P>> {
        self.inboxes.get_mut(id).map(|inbox| inbox.drain(..).collect()).unwrap_or_default()
    }

    /// Returns the bus clock.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Appends a rule to the rule list.
    pub fn add_rule(&mut self, rule: Rule) {
        debug!("Adding rule {rule}");
        self.rules.push(rule);
    }

    /// Removes and returns the rule at the given index, if any.
    pub fn remove_rule(&mut self, index: usize) -> Option<Rule> {
        if index < self.rules.len() {
            Some(self.rules.remove(index))
        } else {
            None
        }
    }

    /// Removes all rules.
    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    /// Returns the rule list.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Returns the number of delayed messages not yet matured.
    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    /// Returns the number of messages queued in a node's inbox.
    pub fn inbox_len(&self, id: &NodeId) -> usize {
        self.inboxes.get(id).map(|inbox| inbox.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::random;

    #[derive(Clone, Debug, PartialEq)]
    struct Probe(u64);

    impl Payload for Probe {
        fn kind(&self) -> &'static str {
            "Probe"
        }
    }

    fn bus() -> MessageBus<Probe> {
        MessageBus::new(random::shared(12345))
    }

    fn msg(from: &str, to: &str, n: u64) -> Message<Probe> {
        Message::new(from, to, Probe(n))
    }

    #[test]
    fn no_rules_delivers_immediately() {
        let mut bus = bus();
        bus.send(msg("n1", "n2", 1));
        assert_eq!(bus.drain(&"n2".to_string()), vec![msg("n1", "n2", 1)]);
        // Drain is idempotent on an empty inbox.
        assert_eq!(bus.drain(&"n2".to_string()), vec![]);
    }

    #[test]
    fn drop_discards() {
        let mut bus = bus();
        bus.add_rule(Rule::drop("n1", "n2"));
        bus.send(msg("n1", "n2", 1));
        bus.send(msg("n2", "n1", 2));
        assert_eq!(bus.drain(&"n2".to_string()), vec![]);
        assert_eq!(bus.drain(&"n1".to_string()), vec![msg("n2", "n1", 2)]);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut bus = bus();
        bus.add_rule(Rule::new("n1", "n2", Action::Pass));
        bus.add_rule(Rule::drop("n1", "n2"));
        bus.send(msg("n1", "n2", 1));
        assert_eq!(bus.drain(&"n2".to_string()).len(), 1);
    }

    #[test]
    fn delay_matures_after_exactly_k_ticks() {
        let mut bus = bus();
        bus.add_rule(Rule::delay("n1", "n2", 3));
        bus.send(msg("n1", "n2", 1));
        assert_eq!(bus.delayed_count(), 1);

        bus.tick(); // now=1
        bus.tick(); // now=2
        assert_eq!(bus.drain(&"n2".to_string()), vec![]);
        bus.tick(); // now=3, matured
        assert_eq!(bus.drain(&"n2".to_string()), vec![msg("n1", "n2", 1)]);
        assert_eq!(bus.delayed_count(), 0);
    }

    #[test]
    fn delay_zero_delivers_on_next_tick() {
        let mut bus = bus();
        bus.add_rule(Rule::delay("n1", "n2", 0));
        bus.send(msg("n1", "n2", 1));
        bus.tick();
        assert_eq!(bus.drain(&"n2".to_string()), vec![msg("n1", "n2", 1)]);
    }

    #[test]
    fn equal_delays_preserve_send_order() {
        let mut bus = bus();
        bus.add_rule(Rule::delay("n1", "n2", 2));
        for n in 0..5 {
            bus.send(msg("n1", "n2", n));
        }
        bus.tick();
        bus.tick();
        let delivered: Vec<u64> =
            bus.drain(&"n2".to_string()).into_iter().map(|m| m.payload.0).collect();
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn differing_delays_can_reorder() {
        let mut bus = bus();
        bus.add_rule(Rule::delay("n1", "n2", 5).with_kind("Probe"));
        bus.send(msg("n1", "n2", 1)); // delayed 5
        bus.clear_rules();
        bus.send(msg("n1", "n2", 2)); // immediate
        bus.tick();
        let delivered: Vec<u64> =
            bus.drain(&"n2".to_string()).into_iter().map(|m| m.payload.0).collect();
        assert_eq!(delivered, vec![2]);
        for _ in 0..4 {
            bus.tick();
        }
        let delivered: Vec<u64> =
            bus.drain(&"n2".to_string()).into_iter().map(|m| m.payload.0).collect();
        assert_eq!(delivered, vec![1]);
    }

    #[test]
    fn drop_prob_zero_never_drops_and_one_always_drops() {
        let mut bus = bus();
        bus.add_rule(Rule::drop_prob("n1", "n2", 0.0).unwrap());
        for n in 0..100 {
            bus.send(msg("n1", "n2", n));
        }
        assert_eq!(bus.drain(&"n2".to_string()).len(), 100);

        bus.clear_rules();
        bus.add_rule(Rule::drop_prob("n1", "n2", 1.0).unwrap());
        for n in 0..100 {
            bus.send(msg("n1", "n2", n));
        }
        assert_eq!(bus.drain(&"n2".to_string()).len(), 0);
    }

    /// A DropProb miss must continue evaluation at the next rule rather than
    /// deliver immediately.
    #[test]
    fn drop_prob_miss_falls_through_to_next_rule() {
        let mut bus = bus();
        bus.add_rule(Rule::drop_prob("n1", "n2", 0.5).unwrap());
        bus.add_rule(Rule::delay("n1", "n2", 3));
        let total = 1000;
        for n in 0..total {
            bus.send(msg("n1", "n2", n));
        }
        // Nothing is delivered immediately: survivors sit in the delay queue.
        assert_eq!(bus.drain(&"n2".to_string()).len(), 0);
        let survivors = bus.delayed_count();
        assert!((400..600).contains(&survivors), "unexpected survivor count {survivors}");

        bus.tick();
        bus.tick();
        assert_eq!(bus.drain(&"n2".to_string()).len(), 0);
        bus.tick();
        assert_eq!(bus.drain(&"n2".to_string()).len(), survivors);
    }

    #[test]
    fn rule_management() {
        let mut bus = bus();
        bus.add_rule(Rule::drop("n1", "n2"));
        bus.add_rule(Rule::delay("n2", "n3", 1));
        assert_eq!(bus.rules().len(), 2);

        let removed = bus.remove_rule(0).unwrap();
        assert_eq!(removed, Rule::drop("n1", "n2"));
        assert_eq!(bus.rules(), &[Rule::delay("n2", "n3", 1)]);
        assert_eq!(bus.remove_rule(7), None);

        bus.clear_rules();
        assert!(bus.rules().is_empty());
        bus.send(msg("n1", "n2", 1));
        assert_eq!(bus.drain(&"n2".to_string()).len(), 1);
    }
}
