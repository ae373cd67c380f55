//! Adaption events.
//!
//! Every change a sync applies to the patch is described by an
//! [`AdaptionEvent`]: which entities changed, how, and in which order.
//! The event stream is precise enough for applications to transfer field
//! data across an adaption without extra metadata: paired send/receive
//! and refine/coarsen events list their ids in matching order on both
//! sides.

use std::collections::HashMap;

/// The kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdaptionType {
    /// Entities created from scratch, e.g. the initial import.
    Creation,
    /// One entity replaced by its children.
    Refinement,
    /// A sibling group merged into its parent.
    Coarsening,
    /// An entity kept its id but moved to a different tree index.
    Renumbering,
    /// Entities shipped to another rank during a load balance.
    PartitionSend,
    /// Entities received from another rank during a load balance.
    PartitionRecv,
    /// Entities removed without a successor.
    Deletion,
}

impl AdaptionType {
    // Event kinds that aggregate: repeated contributions for the same
    // (type, entity, rank) triple extend one event instead of creating a
    // new one.
    fn is_aggregated(&self) -> bool {
        matches!(
            self,
            AdaptionType::Renumbering
                | AdaptionType::Deletion
                | AdaptionType::PartitionSend
                | AdaptionType::PartitionRecv
        )
    }
}

/// The kind of entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdaptionEntity {
    /// A volumetric cell.
    Cell,
    /// A mesh vertex.
    Vertex,
    /// A codimension-one interface.
    Interface,
}

/// One topological change applied by a sync.
#[derive(Debug, Clone)]
pub struct AdaptionEvent {
    /// What happened.
    pub kind: AdaptionType,
    /// What kind of entity changed.
    pub entity: AdaptionEntity,
    /// The rank the event refers to: the peer rank for partition events,
    /// the local rank otherwise.
    pub rank: usize,
    /// Ids of the entities as they were before the change.
    pub previous: Vec<i64>,
    /// Ids of the entities after the change.
    pub current: Vec<i64>,
}

impl AdaptionEvent {
    fn new(kind: AdaptionType, entity: AdaptionEntity, rank: usize) -> Self {
        Self {
            kind,
            entity,
            rank,
            previous: Vec::new(),
            current: Vec::new(),
        }
    }
}

/// Collects adaption events during a sync.
///
/// Aggregating kinds (renumbering, deletion, partition transfers) are
/// deduplicated by `(type, entity, rank)`; the other kinds get one event
/// per contribution, e.g. one refinement event per split octant.
#[derive(Debug, Default)]
pub(crate) struct AdaptionTracker {
    events: Vec<AdaptionEvent>,
    aggregated: HashMap<(AdaptionType, AdaptionEntity, usize), usize>,
}

impl AdaptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The event for the given triple, creating it on first use.
    pub fn entry(
        &mut self,
        kind: AdaptionType,
        entity: AdaptionEntity,
        rank: usize,
    ) -> &mut AdaptionEvent {
        if kind.is_aggregated() {
            let key = (kind, entity, rank);
            if let Some(&index) = self.aggregated.get(&key) {
                return &mut self.events[index];
            }
            self.aggregated.insert(key, self.events.len());
        }

        self.events.push(AdaptionEvent::new(kind, entity, rank));
        self.events.last_mut().expect("just pushed")
    }

    /// Mutable access to all collected events.
    pub fn events_mut(&mut self) -> &mut [AdaptionEvent] {
        &mut self.events
    }

    /// Consume the tracker, dropping empty events.
    pub fn into_events(self) -> Vec<AdaptionEvent> {
        self.events
            .into_iter()
            .filter(|event| !event.previous.is_empty() || !event.current.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_refinements_stay_separate() {
        let mut tracker = AdaptionTracker::new();
        tracker
            .entry(AdaptionType::Refinement, AdaptionEntity::Cell, 0)
            .previous
            .push(1);
        tracker
            .entry(AdaptionType::Refinement, AdaptionEntity::Cell, 0)
            .previous
            .push(2);

        let events = tracker.into_events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_deletions_aggregate() {
        let mut tracker = AdaptionTracker::new();
        tracker
            .entry(AdaptionType::Deletion, AdaptionEntity::Cell, 0)
            .previous
            .push(1);
        tracker
            .entry(AdaptionType::Deletion, AdaptionEntity::Cell, 0)
            .previous
            .push(2);
        // A different entity kind aggregates separately.
        tracker
            .entry(AdaptionType::Deletion, AdaptionEntity::Interface, 0)
            .previous
            .push(9);

        let events = tracker.into_events();
        assert_eq!(events.len(), 2);
        let cells = events
            .iter()
            .find(|e| e.entity == AdaptionEntity::Cell)
            .unwrap();
        assert_eq!(cells.previous, vec![1, 2]);
    }

    #[test]
    fn test_empty_events_are_dropped() {
        let mut tracker = AdaptionTracker::new();
        tracker.entry(AdaptionType::Creation, AdaptionEntity::Cell, 0);
        assert!(tracker.into_events().is_empty());
    }

    #[test]
    fn test_partition_events_key_on_peer_rank() {
        let mut tracker = AdaptionTracker::new();
        tracker
            .entry(AdaptionType::PartitionSend, AdaptionEntity::Cell, 1)
            .previous
            .push(4);
        tracker
            .entry(AdaptionType::PartitionSend, AdaptionEntity::Cell, 2)
            .previous
            .push(5);
        tracker
            .entry(AdaptionType::PartitionSend, AdaptionEntity::Cell, 1)
            .previous
            .push(6);

        let events = tracker.into_events();
        assert_eq!(events.len(), 2);
        let to_rank1 = events.iter().find(|e| e.rank == 1).unwrap();
        assert_eq!(to_rank1.previous, vec![4, 6]);
    }
}
