//! The routing table
//!
//! Contacts are keyed by XOR distance from the local identity and kept
//! in a splitting prefix tree: diverged buckets hold peers whose
//! distance diverges at a fixed depth, the final unsplit leaf absorbs
//! everything sharing the prefix so far and splits when full. Alongside
//! the tree, three bounded near-sets track the peers closest to the
//! local identity and define the cache area this peer replicates.

use tokio::sync::mpsc;
use tracing::{debug, trace};
use weftnet_crypto::PeerId;

use crate::bucket::Bucket;
use crate::contact::Contact;
use crate::error::{RoutingError, RoutingResult};
use crate::nearset::{Admission, NearOrder, NearSet};
use crate::{K, MAX_SPLIT_DEPTH, NEAR_NUMERIC_MAX, NEAR_XOR_MAX};

/// Side effects the table reports to its owner
#[derive(Debug, Clone)]
pub enum RoutingEvent {
    /// A peer entered a near-set; the store should push it a replication
    /// patch for the cache area. Best-effort, may fire more than once
    /// for the same peer.
    ReplicationPush { target: Contact },
}

/// Outcome of offering a contact to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New contact inserted
    Added,
    /// Already tracked; liveness and endpoint refreshed
    Refreshed,
    /// The responsible diverged bucket is at capacity
    BucketFull,
    /// The leaf cannot split past the hard depth limit
    DepthLimit,
}

/// XOR-distance routing table with cache-area near-sets
pub struct RoutingTable {
    local_id: PeerId,

    /// buckets[i] for i < len-1 hold contacts diverging at depth i;
    /// the last entry is the unsplit leaf.
    buckets: Vec<Bucket>,

    near_xor: NearSet,
    near_above: NearSet,
    near_below: NearSet,

    events: Option<mpsc::UnboundedSender<RoutingEvent>>,

    /// Round-robin cursor for maintenance bucket refresh
    pub(crate) refresh_cursor: usize,
}

impl RoutingTable {
    /// Create an empty table for the local identity
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(0)],
            near_xor: NearSet::new(NearOrder::Xor, NEAR_XOR_MAX, local_id),
            near_above: NearSet::new(NearOrder::NumericAbove, NEAR_NUMERIC_MAX, local_id),
            near_below: NearSet::new(NearOrder::NumericBelow, NEAR_NUMERIC_MAX, local_id),
            events: None,
            refresh_cursor: 0,
        }
    }

    /// Register the replication event channel
    pub fn set_event_sink(&mut self, tx: mpsc::UnboundedSender<RoutingEvent>) {
        self.events = Some(tx);
    }

    /// The local identity this table is centered on
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Total tracked contacts
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Whether no contacts are tracked
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Iterator over all tracked contacts
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.contacts())
    }

    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub(crate) fn buckets_mut(&mut self) -> &mut [Bucket] {
        &mut self.buckets
    }

    /// Look up a tracked contact
    pub fn get(&self, id: PeerId) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    /// Look up a tracked contact mutably
    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Contact> {
        let idx = self.bucket_index(id);
        self.buckets[idx].get_mut(id)
    }

    /// Whether the peer is tracked
    pub fn contains(&self, id: PeerId) -> bool {
        self.get(id).is_some()
    }

    /// Index of the bucket responsible for an identifier
    fn bucket_index(&self, id: PeerId) -> usize {
        let divergence = self.local_id.distance(&id).leading_zeros() as usize;
        divergence.min(self.buckets.len() - 1)
    }

    /// Offer a contact to the table.
    ///
    /// Rejects the local identity and zero identifiers outright. A
    /// tracked peer is refreshed in place; a new peer is inserted into
    /// the prefix tree, splitting the leaf as needed up to the hard
    /// depth limit, then offered to each near-set.
    pub fn add(&mut self, contact: Contact) -> RoutingResult<AddOutcome> {
        if contact.peer_id.is_zero() || contact.client_id.is_zero() {
            return Err(RoutingError::InvalidIdentifier);
        }
        if contact.peer_id == self.local_id {
            return Err(RoutingError::SelfContact);
        }

        if let Some(existing) = self.get_mut(contact.peer_id) {
            existing.touch(&contact);
            return Ok(AddOutcome::Refreshed);
        }

        loop {
            let idx = self.bucket_index(contact.peer_id);
            if !self.buckets[idx].is_full() {
                self.buckets[idx].push(contact.clone());
                trace!(peer = %contact.peer_id, bucket = idx, "contact added");
                break;
            }

            let leaf = self.buckets.len() - 1;
            if idx != leaf {
                return Ok(AddOutcome::BucketFull);
            }
            if self.buckets[leaf].depth() >= MAX_SPLIT_DEPTH {
                debug!(peer = %contact.peer_id, "dropped at split depth limit");
                return Ok(AddOutcome::DepthLimit);
            }
            self.split_leaf();
        }

        self.offer_to_near_sets(&contact);
        Ok(AddOutcome::Added)
    }

    /// Split the leaf: members diverging exactly at the leaf's depth
    /// stay behind as a diverged bucket, the rest move into a new leaf
    /// one level deeper.
    fn split_leaf(&mut self) {
        let leaf_index = self.buckets.len() - 1;
        let depth = self.buckets[leaf_index].depth();
        debug_assert!(depth < MAX_SPLIT_DEPTH);

        let members = self.buckets[leaf_index].drain();
        let mut new_leaf = Bucket::new(depth + 1);

        for member in members {
            let divergence = self.local_id.distance(&member.peer_id).leading_zeros();
            if divergence == depth {
                self.buckets[leaf_index].push(member);
            } else {
                new_leaf.push(member);
            }
        }

        trace!(
            depth,
            diverged = self.buckets[leaf_index].len(),
            carried = new_leaf.len(),
            "leaf split"
        );
        self.buckets.push(new_leaf);
    }

    /// Remove a tracked peer, merging near-empty sibling buckets and
    /// refilling any near-set that lost the member.
    pub fn remove(&mut self, id: PeerId) -> Option<Contact> {
        let idx = self.bucket_index(id);
        let removed = self.buckets[idx].remove(id)?;
        debug!(peer = %id, "contact removed");

        // Merge the leaf back into its sibling while their combined
        // population has fallen below a single bucket's capacity.
        while self.buckets.len() > 1 {
            let leaf_len = self.buckets[self.buckets.len() - 1].len();
            let sibling_len = self.buckets[self.buckets.len() - 2].len();
            if leaf_len + sibling_len >= K {
                break;
            }
            let leaf = self.buckets.pop().expect("leaf exists");
            let sibling = self.buckets.pop().expect("sibling exists");

            let mut merged = Bucket::new(sibling.depth());
            let mut drained_sibling = sibling;
            for member in drained_sibling.drain() {
                merged.push(member);
            }
            let mut drained_leaf = leaf;
            for member in drained_leaf.drain() {
                merged.push(member);
            }
            trace!(depth = merged.depth(), "buckets merged");
            self.buckets.push(merged);
        }

        // A near-set that lost a member rescans the buckets (not the
        // other near-sets) for the next-best qualifying candidate.
        let candidate_ids: Vec<PeerId> = self.contacts().map(|c| c.peer_id).collect();
        for which in [NearOrder::Xor, NearOrder::NumericAbove, NearOrder::NumericBelow] {
            if !self.near_set_mut(which).remove(id) {
                continue;
            }
            let best = self
                .near_set(which)
                .best_candidate(candidate_ids.iter().copied());
            if let Some(best) = best {
                let admitted =
                    matches!(self.near_set_mut(which).offer(best), Admission::Admitted);
                if admitted {
                    if let Some(contact) = self.get(best).cloned() {
                        self.emit(RoutingEvent::ReplicationPush { target: contact });
                    }
                }
            }
        }

        Some(removed)
    }

    /// The `max_results` tracked contacts minimizing XOR distance to
    /// the target. Exact nearest-neighbor over the flat contact set.
    pub fn find(&self, target: PeerId, max_results: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts().cloned().collect();
        all.sort_by_key(|c| target.distance(&c.peer_id));
        all.truncate(max_results);
        all
    }

    /// Whether an identifier falls inside the local cache area: the
    /// range covered by any of the three near-sets.
    pub fn in_cache_area(&self, id: PeerId) -> bool {
        self.near_xor.covers(id) || self.near_above.covers(id) || self.near_below.covers(id)
    }

    /// Members of the three near-sets, deduplicated
    pub fn near_members(&self) -> Vec<PeerId> {
        let mut members: Vec<PeerId> = self
            .near_xor
            .members()
            .chain(self.near_above.members())
            .chain(self.near_below.members())
            .collect();
        members.sort_unstable();
        members.dedup();
        members
    }

    pub(crate) fn near_set(&self, which: NearOrder) -> &NearSet {
        match which {
            NearOrder::Xor => &self.near_xor,
            NearOrder::NumericAbove => &self.near_above,
            NearOrder::NumericBelow => &self.near_below,
        }
    }

    fn near_set_mut(&mut self, which: NearOrder) -> &mut NearSet {
        match which {
            NearOrder::Xor => &mut self.near_xor,
            NearOrder::NumericAbove => &mut self.near_above,
            NearOrder::NumericBelow => &mut self.near_below,
        }
    }

    fn offer_to_near_sets(&mut self, contact: &Contact) {
        let mut admitted = false;
        for which in [NearOrder::Xor, NearOrder::NumericAbove, NearOrder::NumericBelow] {
            match self.near_set_mut(which).offer(contact.peer_id) {
                Admission::Admitted | Admission::AdmittedEvicting(_) => admitted = true,
                Admission::Rejected => {}
            }
        }
        if admitted {
            self.emit(RoutingEvent::ReplicationPush {
                target: contact.clone(),
            });
        }
    }

    fn emit(&self, event: RoutingEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// A random identifier falling inside the given bucket's range:
    /// shares the local prefix up to the bucket's depth and, for a
    /// diverged bucket, flips the bit at that depth.
    pub(crate) fn random_id_in_bucket(&self, index: usize) -> PeerId {
        let is_leaf = index == self.buckets.len() - 1;
        let depth = self.buckets[index].depth();
        let local = self.local_id.as_u64();

        let prefix_mask = if depth == 0 {
            0
        } else {
            !0u64 << (64 - depth)
        };
        let mut id = (local & prefix_mask) | (rand::random::<u64>() & !prefix_mask);

        if !is_leaf {
            let bit = 1u64 << (63 - depth);
            id = (id & !bit) | ((local ^ bit) & bit);
        }
        if id == local || id == 0 {
            id ^= 1;
        }
        PeerId::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::FirewallState;
    use std::net::Ipv4Addr;
    use weftnet_crypto::ClientId;

    fn contact(id: u64) -> Contact {
        Contact::new(
            PeerId::new(id),
            ClientId::new(1),
            Ipv4Addr::new(10, 0, 0, 1),
            1000,
            1001,
            FirewallState::Open,
        )
    }

    fn table(local: u64) -> RoutingTable {
        RoutingTable::new(PeerId::new(local))
    }

    #[test]
    fn test_rejects_invalid_contacts() {
        let mut t = table(0x8000_0000_0000_0000);

        assert!(matches!(
            t.add(contact(0)),
            Err(RoutingError::InvalidIdentifier)
        ));
        assert!(matches!(
            t.add(contact(0x8000_0000_0000_0000)),
            Err(RoutingError::SelfContact)
        ));

        let mut zero_client = contact(5);
        zero_client.client_id = ClientId::new(0);
        assert!(matches!(
            t.add(zero_client),
            Err(RoutingError::InvalidIdentifier)
        ));
    }

    #[test]
    fn test_add_then_refresh() {
        let mut t = table(1);
        assert_eq!(t.add(contact(2)).unwrap(), AddOutcome::Added);
        assert_eq!(t.add(contact(2)).unwrap(), AddOutcome::Refreshed);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_contact_lives_in_exactly_one_bucket() {
        let mut t = table(0);
        for i in 1..=40u64 {
            let _ = t.add(contact(i * 0x0101_0101)).unwrap();
        }
        for c in t.contacts() {
            let holders = t
                .buckets()
                .iter()
                .filter(|b| b.get(c.peer_id).is_some())
                .count();
            assert_eq!(holders, 1);
        }
    }

    #[test]
    fn test_leaf_splits_once_on_divergence() {
        // Local 0: ids with the top bit set diverge at depth 0, the
        // rest share the prefix. Fill the leaf with K divergent ids,
        // then one more forces exactly one split.
        let mut t = table(0);
        for i in 0..K as u64 {
            assert_eq!(
                t.add(contact(0x8000_0000_0000_0000 | (i + 1))).unwrap(),
                AddOutcome::Added
            );
        }
        assert_eq!(t.buckets().len(), 1);

        // The K+1-th divergent id splits the leaf; all members stay in
        // the diverged bucket, which is then full.
        assert_eq!(
            t.add(contact(0x8000_0000_0000_0000 | 0x7000)).unwrap(),
            AddOutcome::BucketFull
        );
        assert_eq!(t.buckets().len(), 2);

        // A non-divergent id still finds room in the fresh leaf.
        assert_eq!(t.add(contact(0x0000_0000_0000_0001)).unwrap(), AddOutcome::Added);
    }

    #[test]
    fn test_sibling_merge_below_capacity() {
        let mut t = table(0);
        for i in 0..K as u64 {
            t.add(contact(0x8000_0000_0000_0000 | (i + 1))).unwrap();
        }
        t.add(contact(1)).unwrap();
        // Leaf split happened during the fill above.
        assert_eq!(t.buckets().len(), 2);

        // Removing divergent members drops the combined population
        // below K and merges the siblings back into one leaf.
        for i in 0..K as u64 {
            t.remove(PeerId::new(0x8000_0000_0000_0000 | (i + 1)));
        }
        assert_eq!(t.buckets().len(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_find_matches_brute_force() {
        let mut t = table(0x5555_0000_0000_0000);
        let ids: Vec<u64> = (1..60u64).map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15)).collect();
        for &id in &ids {
            let _ = t.add(contact(id));
        }

        let target = PeerId::new(0x1234_5678_9ABC_DEF0);
        let found = t.find(target, 10);

        let mut tracked: Vec<u64> = t.contacts().map(|c| c.peer_id.as_u64()).collect();
        tracked.sort_by_key(|&id| target.distance(&PeerId::new(id)));

        let found_ids: Vec<u64> = found.iter().map(|c| c.peer_id.as_u64()).collect();
        assert_eq!(found_ids, tracked[..10].to_vec());
    }

    #[test]
    fn test_near_members_returned_by_find() {
        let mut t = table(1000);
        for i in 0..50u64 {
            let _ = t.add(contact(2000 + i * 37));
        }

        let near = t.near_members();
        assert!(!near.is_empty());

        let all = t.find(t.local_id(), t.len());
        for id in near {
            assert!(all.iter().any(|c| c.peer_id == id));
        }
    }

    #[test]
    fn test_replication_event_on_admission() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = table(100);
        t.set_event_sink(tx);

        t.add(contact(101)).unwrap();

        match rx.try_recv() {
            Ok(RoutingEvent::ReplicationPush { target }) => {
                assert_eq!(target.peer_id, PeerId::new(101));
            }
            other => panic!("expected replication push, got {:?}", other),
        }
    }

    #[test]
    fn test_near_set_refill_after_removal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = table(0);

        // Fill the numeric-above set past capacity so one candidate
        // stays outside it.
        for i in 1..=(NEAR_NUMERIC_MAX as u64 + 1) {
            t.add(contact(i * 16)).unwrap();
        }
        t.set_event_sink(tx);

        // Removing the best member must pull the spare candidate in
        // and announce it.
        t.remove(PeerId::new(16));

        let mut saw_refill = false;
        while let Ok(RoutingEvent::ReplicationPush { target }) = rx.try_recv() {
            if target.peer_id == PeerId::new((NEAR_NUMERIC_MAX as u64 + 1) * 16) {
                saw_refill = true;
            }
        }
        assert!(saw_refill);
    }

    #[test]
    fn test_cache_area_unbounded_when_sparse() {
        let mut t = table(500);
        t.add(contact(600)).unwrap();

        // Sets are under capacity, so every id is in the cache area.
        assert!(t.in_cache_area(PeerId::new(1)));
        assert!(t.in_cache_area(PeerId::new(u64::MAX)));
    }

    #[test]
    fn test_cache_area_bounded_when_full() {
        let mut t = table(0x8000);
        for i in 1..=200u64 {
            let _ = t.add(contact(0x8000 ^ (i * 3)));
        }

        // With all sets full, something maximally far is outside.
        assert!(!t.in_cache_area(PeerId::new(0x8000 ^ u64::MAX)));
        // The nearest tracked peer is inside.
        let nearest = t.find(t.local_id(), 1)[0].peer_id;
        assert!(t.in_cache_area(nearest));
    }

    #[test]
    fn test_random_id_lands_in_bucket_range() {
        let mut t = table(0);
        for i in 0..K as u64 {
            t.add(contact(0x8000_0000_0000_0000 | (i + 1))).unwrap();
        }
        t.add(contact(1)).unwrap();
        assert!(t.buckets().len() >= 2);

        // Diverged bucket at depth 0: ids must have the top bit set.
        for _ in 0..16 {
            let id = t.random_id_in_bucket(0);
            assert_eq!(id.as_u64() >> 63, 1);
        }
        // Leaf: ids must share the (empty-so-far) prefix, i.e. top bit
        // clear at depth >= 1.
        let leaf = t.buckets().len() - 1;
        for _ in 0..16 {
            let id = t.random_id_in_bucket(leaf);
            assert_eq!(id.as_u64() >> 63, 0);
        }
    }
}
