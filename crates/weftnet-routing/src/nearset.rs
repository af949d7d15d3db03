//! Bounded near-sets defining the local cache area
//!
//! Three orderings are tracked: XOR-nearest plus numerically higher and
//! lower neighbors. The XOR set alone is vulnerable to topological
//! clustering leaving a numerically adjacent peer's data
//! under-replicated; the high/low sets give an independent contiguous
//! coverage guarantee.

use weftnet_crypto::PeerId;

/// Ordering a near-set ranks candidates by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearOrder {
    /// XOR distance to the local identity
    Xor,
    /// Numeric offset above the local identity
    NumericAbove,
    /// Numeric offset below the local identity
    NumericBelow,
}

/// Outcome of offering a candidate to a near-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Candidate admitted into free capacity
    Admitted,
    /// Candidate admitted, displacing the given worst member
    AdmittedEvicting(PeerId),
    /// Candidate does not qualify or does not improve on the worst member
    Rejected,
}

/// A bounded sorted list of the contacts nearest the local identity
/// under one ordering.
#[derive(Debug)]
pub struct NearSet {
    order: NearOrder,
    max: usize,
    local: PeerId,
    /// Members sorted ascending by rank key
    members: Vec<(u64, PeerId)>,
}

impl NearSet {
    pub fn new(order: NearOrder, max: usize, local: PeerId) -> Self {
        Self {
            order,
            max,
            local,
            members: Vec::with_capacity(max),
        }
    }

    /// Rank key of a candidate under this ordering, or None when the
    /// candidate does not qualify (wrong side of the local id).
    fn key(&self, id: PeerId) -> Option<u64> {
        let local = self.local.as_u64();
        let raw = id.as_u64();
        match self.order {
            NearOrder::Xor => Some(local ^ raw),
            NearOrder::NumericAbove => (raw > local).then(|| raw - local),
            NearOrder::NumericBelow => (raw < local).then(|| local - raw),
        }
    }

    /// The set's current bound: the key of its worst member when full,
    /// otherwise the maximal sentinel (unbounded).
    pub fn bound(&self) -> u64 {
        if self.members.len() >= self.max {
            self.members.last().map(|(k, _)| *k).unwrap_or(u64::MAX)
        } else {
            u64::MAX
        }
    }

    /// Whether an identifier falls inside this set's responsibility range
    pub fn covers(&self, id: PeerId) -> bool {
        match self.key(id) {
            Some(k) => k <= self.bound(),
            None => false,
        }
    }

    /// Whether the peer is currently a member
    pub fn contains(&self, id: PeerId) -> bool {
        self.members.iter().any(|(_, m)| *m == id)
    }

    /// Offer a candidate for admission
    pub fn offer(&mut self, id: PeerId) -> Admission {
        let key = match self.key(id) {
            Some(k) => k,
            None => return Admission::Rejected,
        };
        if self.contains(id) {
            return Admission::Rejected;
        }

        if self.members.len() < self.max {
            let pos = self.members.partition_point(|(k, _)| *k <= key);
            self.members.insert(pos, (key, id));
            return Admission::Admitted;
        }

        // Full: admit only an improvement over the worst member.
        let (worst_key, worst_id) = *self.members.last().expect("full set has members");
        if key < worst_key {
            self.members.pop();
            let pos = self.members.partition_point(|(k, _)| *k <= key);
            self.members.insert(pos, (key, id));
            Admission::AdmittedEvicting(worst_id)
        } else {
            Admission::Rejected
        }
    }

    /// Remove a member; returns whether it was present
    pub fn remove(&mut self, id: PeerId) -> bool {
        let before = self.members.len();
        self.members.retain(|(_, m)| *m != id);
        self.members.len() != before
    }

    /// Current members, best first
    pub fn members(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.members.iter().map(|(_, m)| *m)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.max
    }

    pub fn order(&self) -> NearOrder {
        self.order
    }

    /// Best qualifying non-member among the candidates, if any
    pub fn best_candidate<I: IntoIterator<Item = PeerId>>(&self, candidates: I) -> Option<PeerId> {
        candidates
            .into_iter()
            .filter(|id| !self.contains(*id))
            .filter_map(|id| self.key(id).map(|k| (k, id)))
            .min()
            .map(|(_, id)| id)
    }
}
