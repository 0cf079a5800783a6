use super::bus::MessageBus;
use super::message::{Message, NodeId, Payload, Tick};
use crate::error::Result;

use log::{debug, info};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A node in the cluster. Nodes are driven synchronously by the cluster
/// driver: on_tick() advances time, on_message() processes an inbound
/// message. Nodes never observe each other's state directly; they reference
/// peers by ID only and communicate through the bus via their outbox channel.
pub trait Node<P: Payload> {
    /// Returns the node ID.
    fn id(&self) -> &NodeId;
    /// Returns whether the node is up. Crashed nodes are not scheduled.
    fn is_up(&self) -> bool;
    /// Crashes or recovers the node at the given tick.
    fn set_up(&mut self, up: bool, now: Tick) -> Result<()>;
    /// Processes a logical clock tick.
    fn on_tick(&mut self, now: Tick) -> Result<()>;
    /// Processes an inbound message.
    fn on_message(&mut self, msg: Message<P>, now: Tick) -> Result<()>;
    /// Returns a one-line state summary for dumps.
    fn dump(&self) -> String;
}

/// A scheduled control event, applied by the driver at the start of its tick.
#[derive(Clone, Debug, PartialEq)]
pub enum Control {
    Crash(NodeId),
    Recover(NodeId),
}

/// A control event with its scheduled tick and insertion sequence, ordered
/// by (tick, insertion).
#[derive(Clone, Debug, PartialEq, Eq)]
struct Scheduled {
    at: Tick,
    seq: u64,
    node: NodeId,
    up: bool,
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// The discrete-event cluster driver. Owns the nodes and the bus for its
/// lifetime, and advances virtual time in indivisible ticks. The node
/// registry preserves insertion order, which fixes dispatch order and thus
/// determinism.
///
/// Nodes send outbound messages into a shared outbox channel rather than
/// calling the bus directly; the driver drains the outbox into the bus after
/// every dispatch, keeping send order deterministic without handing node
/// handlers a bus borrow.
pub struct Cluster<P: Payload, N: Node<P>> {
    /// The registered nodes, in insertion order.
    nodes: Vec<N>,
    /// The message bus.
    bus: MessageBus<P>,
    /// The receiving end of the shared node outbox channel.
    outbox: crossbeam::channel::Receiver<Message<P>>,
    /// Scheduled control events.
    events: BinaryHeap<Reverse<Scheduled>>,
    /// Control event insertion counter.
    events_seq: u64,
    /// The current tick.
    tick: Tick,
}

impl<P: Payload, N: Node<P>> Cluster<P, N> {
    /// Creates an empty cluster at tick 0. The outbox receiver must be the
    /// counterpart of the sender handed to every node.
    pub fn new(bus: MessageBus<P>, outbox: crossbeam::channel::Receiver<Message<P>>) -> Self {
        Self { nodes: Vec::new(), bus, outbox, events: BinaryHeap::new(), events_seq: 0, tick: 0 }
    }

    /// Registers a node. Registration order is dispatch order.
    pub fn add(&mut self, node: N) {
        assert!(
            self.get(node.id()).is_none(),
            "duplicate node ID {}",
            node.id()
        );
        self.nodes.push(node);
    }

    /// Returns a node by ID.
    pub fn get(&self, id: &NodeId) -> Option<&N> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Returns a mutable node by ID.
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut N> {
        self.nodes.iter_mut().find(|n| n.id() == id)
    }

    /// Returns the registered nodes in insertion order.
    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    /// Returns the bus.
    pub fn bus(&self) -> &MessageBus<P> {
        &self.bus
    }

    /// Returns the bus mutably, e.g. for rule management.
    pub fn bus_mut(&mut self) -> &mut MessageBus<P> {
        &mut self.bus
    }

    /// Returns the current tick.
    pub fn now(&self) -> Tick {
        self.tick
    }

    /// Schedules a crash or recovery at the given tick.
    pub fn schedule(&mut self, at: Tick, control: Control) {
        self.events_seq += 1;
        let (node, up) = match control {
            Control::Crash(node) => (node, false),
            Control::Recover(node) => (node, true),
        };
        self.events.push(Reverse(Scheduled { at, seq: self.events_seq, node, up }));
    }

    /// Advances the cluster by one tick:
    ///
    /// 1. Increment the tick.
    /// 2. Apply control events scheduled at or before it.
    /// 3. Tick every live node, in registry order.
    /// 4. Tick the bus, maturing delayed messages.
    /// 5. Deliver every live node's inbox, in registry order.
    ///
    /// Crashed nodes are neither ticked nor delivered to; their inboxes
    /// retain messages until recovery.
    pub fn step(&mut self) -> Result<()> {
        self.tick += 1;

        while let Some(Reverse(event)) = self.events.peek() {
            if event.at > self.tick {
                break;
            }
            let Reverse(event) = self.events.pop().expect("peeked event must pop");
            let tick = self.tick;
            match self.get_mut(&event.node) {
                Some(node) => node.set_up(event.up, tick)?,
                None => info!("Ignoring control event for unknown node {}", event.node),
            }
        }

        for i in 0..self.nodes.len() {
            if self.nodes[i].is_up() {
                self.nodes[i].on_tick(self.tick)?;
                self.drain_outbox();
            }
        }

        self.bus.tick();

        for i in 0..self.nodes.len() {
            if !self.nodes[i].is_up() {
                continue;
            }
            let id = self.nodes[i].id().clone();
            for msg in self.bus.drain(&id) {
                debug!("Delivering {msg:?}");
                self.nodes[i].on_message(msg, self.tick)?;
                self.drain_outbox();
            }
        }

        Ok(())
    }

    /// Moves all outbox messages into the bus, in send order.
    fn drain_outbox(&mut self) {
        while let Ok(msg) = self.outbox.try_recv() {
            self.bus.send(msg);
        }
    }
}
