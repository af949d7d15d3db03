//! Weftnet Routing Table
//!
//! Tracks overlay topology by XOR distance from the local identity:
//! a splitting prefix tree of contact buckets plus three bounded
//! near-sets (XOR-nearest and the numerically adjacent neighbors on
//! either side) that together define the local cache-responsibility
//! area. Periodic maintenance keeps contacts alive, refreshes sparse
//! ID ranges, and bounds disconnect detection.

use std::time::Duration;

pub mod bucket;
pub mod contact;
pub mod error;
pub mod maintenance;
pub mod nearset;
pub mod table;

pub use bucket::Bucket;
pub use contact::{Contact, FirewallState, PatchEntry, CONTACT_WIRE_SIZE, PATCH_ENTRY_WIRE_SIZE};
pub use error::{RoutingError, RoutingResult};
pub use maintenance::{MaintenanceAction, TickReport};
pub use nearset::{Admission, NearOrder, NearSet};
pub use table::{AddOutcome, RoutingEvent, RoutingTable};

/// Bucket capacity. Kept small under test so split and merge paths are
/// exercised with a handful of contacts.
pub const K: usize = if cfg!(test) { 8 } else { 16 };

/// Hard limit on leaf splitting depth; a contact that would require a
/// deeper split is dropped. Also the bound that guarantees the split
/// retry loop terminates.
pub const MAX_SPLIT_DEPTH: u32 = 63;

/// Capacity of the XOR-nearest set
pub const NEAR_XOR_MAX: usize = 8;

/// Capacity of each numeric-neighbor set
pub const NEAR_NUMERIC_MAX: usize = 4;

/// Minimum interval between discovery searches for one bucket
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Delay before a contact becomes eligible for its next liveness probe;
/// doubles as the responsiveness window a probed peer has to reply in.
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Failed probes before a contact is evicted
pub const MAX_PROBE_ATTEMPTS: u8 = 2;

/// The table is declared unresponsive when its freshest contact is
/// older than this, regardless of size.
pub const TABLE_UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(15);
