//! Periodic table maintenance
//!
//! Driven once per second by the dispatcher. Each tick touches one
//! bucket (round-robin), selects at most one contact for a liveness
//! probe, evicts peers that stayed silent through their probe budget,
//! and reports whether the table still looks connected. The table never
//! performs I/O itself; probes and discovery searches are returned as
//! actions for the dispatcher to execute.

use std::time::Instant;

use tracing::debug;
use weftnet_crypto::PeerId;

use crate::contact::Contact;
use crate::table::RoutingTable;
use crate::{
    BUCKET_REFRESH_INTERVAL, K, MAX_PROBE_ATTEMPTS, TABLE_UNRESPONSIVE_TIMEOUT,
};

/// I/O the dispatcher should perform on the table's behalf
#[derive(Debug, Clone)]
pub enum MaintenanceAction {
    /// Send a liveness probe to the contact
    Probe(Contact),
    /// Issue a discovery search for the given identifier
    Discover(PeerId),
}

/// Result of one maintenance tick
#[derive(Debug)]
pub struct TickReport {
    /// Probes and discovery searches to execute
    pub actions: Vec<MaintenanceAction>,

    /// False once the freshest known contact is older than the
    /// disconnect-detection bound; independent of table size.
    pub responsive: bool,
}

impl RoutingTable {
    /// Run one maintenance tick.
    ///
    /// `reachable` reflects the local connectivity classification;
    /// probes and discovery searches are pointless while the local
    /// node cannot receive replies.
    pub fn tick(&mut self, reachable: bool) -> TickReport {
        let now = Instant::now();
        let mut actions = Vec::new();

        // One bucket per tick: refresh sparsely populated ranges with a
        // discovery search, at most once per interval per bucket.
        let bucket_count = self.buckets().len();
        self.refresh_cursor = (self.refresh_cursor + 1) % bucket_count;
        let cursor = self.refresh_cursor;
        {
            let bucket = &self.buckets()[cursor];
            if reachable
                && bucket.len() * 2 < K
                && bucket.refresh_due(now, BUCKET_REFRESH_INTERVAL)
            {
                let target = self.random_id_in_bucket(cursor);
                self.buckets_mut()[cursor].mark_refreshed(now);
                actions.push(MaintenanceAction::Discover(target));
            }
        }

        // Evict contacts that exhausted their probe budget and stayed
        // silent past the latest retry deadline.
        let dead: Vec<PeerId> = self
            .contacts()
            .filter(|c| c.attempts >= MAX_PROBE_ATTEMPTS && c.retriable(now))
            .map(|c| c.peer_id)
            .collect();
        for id in dead {
            debug!(peer = %id, "evicting unresponsive contact");
            self.remove(id);
        }

        // Probe the single stalest contact whose retry deadline passed.
        if reachable {
            let candidate = self
                .contacts()
                .filter(|c| c.retriable(now))
                .min_by_key(|c| c.last_seen)
                .map(|c| c.peer_id);
            if let Some(id) = candidate {
                if let Some(contact) = self.get_mut(id) {
                    contact.record_probe();
                    actions.push(MaintenanceAction::Probe(contact.clone()));
                }
            }
        }

        let responsive = self
            .contacts()
            .map(|c| c.age())
            .min()
            .map(|freshest| freshest < TABLE_UNRESPONSIVE_TIMEOUT)
            .unwrap_or(false);

        TickReport {
            actions,
            responsive,
        }
    }
}
