//! Links: directed delivery channels between two endpoints.
//!
//! A link stamps every send with a minimum propagation latency and routes
//! the resulting event to the correct queue: the local vortex for handled
//! endpoints, the link's own polling queue for polled endpoints, or the
//! peer's sync queue when the far endpoint lives on another partition.
//!
//! Links hold no back-references; the [`LinkTable`] is owned by the
//! scheduler and looked up by id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::activity::Event;
use crate::queue::PollingLinkQueue;
use crate::types::{LinkId, Rank, SimTime};

/// Static description of a link, as written by configuration.
///
/// # Example
///
/// ```
/// use lockstep::link::LinkSpec;
///
/// // Link 7, minimum latency 3 cycles, far endpoint on rank 1.
/// let spec = LinkSpec::new(7, 3).with_peer(1);
/// assert_eq!(spec.peer, Some(1));
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Link id, shared by both endpoints.
    pub id: LinkId,
    /// Minimum propagation latency in cycles. Must be non-zero when the
    /// peer endpoint lives on another partition.
    pub latency: SimTime,
    /// Rank of the far endpoint, `None` when both endpoints are local.
    #[serde(default)]
    pub peer: Option<Rank>,
}

impl LinkSpec {
    /// Creates a local link description.
    pub fn new(id: LinkId, latency: SimTime) -> Self {
        Self {
            id,
            latency,
            peer: None,
        }
    }

    /// Places the far endpoint on another partition.
    pub fn with_peer(mut self, peer: Rank) -> Self {
        self.peer = Some(peer);
        self
    }
}

/// How delivered events reach the local endpoint.
#[derive(Debug)]
pub enum Delivery {
    /// Events dispatch through the handler registered under this name.
    Handled { handler: String },
    /// Events buffer in the link's own queue until the endpoint polls.
    Polled(PollingLinkQueue),
}

/// One partition's view of a link.
///
/// Latencies are frozen once configuration is finalised; the globally
/// minimum cross-partition latency bounds the barrier period from below.
#[derive(Debug)]
pub struct Link {
    spec: LinkSpec,
    delivery: Delivery,
    /// Init data awaiting the init exchange (remote peers only).
    init_outbox: Vec<Event>,
    /// Init data received and not yet collected by the endpoint.
    init_inbox: Vec<Event>,
}

impl Link {
    /// Creates a link from its description. Links start polled; binding a
    /// handler switches the delivery mode.
    pub fn new(spec: LinkSpec) -> Self {
        Self {
            spec,
            delivery: Delivery::Polled(PollingLinkQueue::new()),
            init_outbox: Vec::new(),
            init_inbox: Vec::new(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.spec.id
    }

    pub fn latency(&self) -> SimTime {
        self.spec.latency
    }

    /// Rank of the far endpoint, if remote.
    pub fn peer(&self) -> Option<Rank> {
        self.spec.peer
    }

    pub fn is_remote(&self) -> bool {
        self.spec.peer.is_some()
    }

    pub fn spec(&self) -> &LinkSpec {
        &self.spec
    }

    /// Computes the delivery time for a send issued now with the requested
    /// delay. Delays below the link latency clamp silently to the latency.
    pub fn delivery_time(&self, now: SimTime, delay: SimTime) -> SimTime {
        now + delay.max(self.spec.latency)
    }

    /// Binds the local endpoint to a named handler.
    pub fn bind_handler(&mut self, handler: impl Into<String>) {
        self.delivery = Delivery::Handled {
            handler: handler.into(),
        };
    }

    /// Binds the local endpoint to polling delivery.
    pub fn bind_polling(&mut self) {
        self.delivery = Delivery::Polled(PollingLinkQueue::new());
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn delivery_mut(&mut self) -> &mut Delivery {
        &mut self.delivery
    }

    /// The handler name, for handled links.
    pub fn handler_name(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Handled { handler } => Some(handler),
            Delivery::Polled(_) => None,
        }
    }

    pub fn is_polled(&self) -> bool {
        matches!(self.delivery, Delivery::Polled(_))
    }

    /// The polling queue, for polled links.
    pub fn polled_queue_mut(&mut self) -> Option<&mut PollingLinkQueue> {
        match &mut self.delivery {
            Delivery::Polled(queue) => Some(queue),
            Delivery::Handled { .. } => None,
        }
    }

    pub fn polled_queue(&self) -> Option<&PollingLinkQueue> {
        match &self.delivery {
            Delivery::Polled(queue) => Some(queue),
            Delivery::Handled { .. } => None,
        }
    }

    pub(crate) fn init_outbox(&self) -> &[Event] {
        &self.init_outbox
    }

    pub(crate) fn init_inbox(&self) -> &[Event] {
        &self.init_inbox
    }

    pub(crate) fn push_init_outbox(&mut self, event: Event) {
        self.init_outbox.push(event);
    }

    pub(crate) fn push_init_inbox(&mut self, event: Event) {
        self.init_inbox.push(event);
    }

    pub(crate) fn drain_init_outbox(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.init_outbox)
    }

    pub(crate) fn pop_init_inbox(&mut self) -> Option<Event> {
        if self.init_inbox.is_empty() {
            None
        } else {
            Some(self.init_inbox.remove(0))
        }
    }

    pub(crate) fn restore_init_buffers(&mut self, outbox: Vec<Event>, inbox: Vec<Event>) {
        self.init_outbox = outbox;
        self.init_inbox = inbox;
    }
}

/// The per-partition link table, looked up by id.
///
/// Keyed by a `BTreeMap` so iteration order (init-data drains, checkpoint
/// capture, latency scans) is deterministic.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: BTreeMap<LinkId, Link>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a link. Returns false if the id is already registered.
    pub fn insert(&mut self, link: Link) -> bool {
        let id = link.id();
        if self.links.contains_key(&id) {
            return false;
        }
        self.links.insert(id, link);
        true
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Link> {
        self.links.values_mut()
    }

    /// The minimum latency over links whose peer is remote. This is the
    /// conservative lookahead bounding the barrier period.
    pub fn min_remote_latency(&self) -> Option<SimTime> {
        self.links
            .values()
            .filter(|l| l.is_remote())
            .map(|l| l.latency())
            .min()
    }

    /// The set of peer ranks this partition sends to, ascending.
    pub fn remote_ranks(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = self.links.values().filter_map(|l| l.peer()).collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_time_clamps_to_latency() {
        let link = Link::new(LinkSpec::new(1, 3));
        assert_eq!(link.delivery_time(10, 5), 15);
        // delay below latency clamps
        assert_eq!(link.delivery_time(10, 1), 13);
        assert_eq!(link.delivery_time(10, 0), 13);
    }

    #[test]
    fn test_binding_switches_mode() {
        let mut link = Link::new(LinkSpec::new(1, 1));
        assert!(link.is_polled());

        link.bind_handler("receiver");
        assert!(!link.is_polled());
        assert_eq!(link.handler_name(), Some("receiver"));

        link.bind_polling();
        assert!(link.is_polled());
    }

    #[test]
    fn test_table_rejects_duplicate_id() {
        let mut table = LinkTable::new();
        assert!(table.insert(Link::new(LinkSpec::new(1, 1))));
        assert!(!table.insert(Link::new(LinkSpec::new(1, 9))));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_min_remote_latency() {
        let mut table = LinkTable::new();
        table.insert(Link::new(LinkSpec::new(1, 1))); // local, ignored
        table.insert(Link::new(LinkSpec::new(2, 7).with_peer(1)));
        table.insert(Link::new(LinkSpec::new(3, 4).with_peer(2)));

        assert_eq!(table.min_remote_latency(), Some(4));
    }

    #[test]
    fn test_remote_ranks_sorted_and_deduped() {
        let mut table = LinkTable::new();
        table.insert(Link::new(LinkSpec::new(1, 2).with_peer(2)));
        table.insert(Link::new(LinkSpec::new(2, 2).with_peer(1)));
        table.insert(Link::new(LinkSpec::new(3, 2).with_peer(2)));

        assert_eq!(table.remote_ranks(), vec![1, 2]);
    }

    #[test]
    fn test_init_buffers() {
        let mut link = Link::new(LinkSpec::new(5, 2).with_peer(1));
        link.push_init_outbox(Event::new(5, serde_json::json!("hello")));
        assert_eq!(link.init_outbox().len(), 1);

        let drained = link.drain_init_outbox();
        assert_eq!(drained.len(), 1);
        assert!(link.init_outbox().is_empty());

        link.push_init_inbox(Event::new(5, serde_json::json!("reply")));
        assert!(link.pop_init_inbox().is_some());
        assert!(link.pop_init_inbox().is_none());
    }
}
