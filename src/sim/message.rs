/// A node ID. Opaque, globally unique within a cluster, fixed at construction.
pub type NodeId = String;

/// A logical clock time as a number of ticks since cluster construction.
pub type Tick = u64;

/// A message payload. The payload set is closed per protocol (tagged enum
/// variants with exhaustive dispatch), but the bus and cluster are generic
/// over it: they only need the kind tag for network rule matching.
pub trait Payload: Clone + PartialEq + std::fmt::Debug {
    /// Returns the kind tag that network rules match against.
    fn kind(&self) -> &'static str;
}

/// A message in flight between two nodes. Immutable once sent: the bus takes
/// ownership on send and the recipient's handler takes ownership on delivery.
/// Equality is structural.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<P: Payload> {
    /// The sending node.
    pub from: NodeId,
    /// The receiving node.
    pub to: NodeId,
    /// The payload.
    pub payload: P,
}

impl<P: Payload> Message<P> {
    /// Creates a new message.
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, payload: P) -> Self {
        Self { from: from.into(), to: to.into(), payload }
    }

    /// Returns the payload's kind tag.
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}
