//! `firewatch-sync`: keeps the downstream incident store in step with the
//! upstream dispatch API.
//!
//! * [`IncrementalSync`] polls for records newer than the cached
//!   [`WatermarkCache`] value.
//! * [`FullResync`] clears the store and re-walks every upstream page while
//!   the polling routine is suspended.
//! * [`DiffReconciler`] patches the newest record from the cross-reference
//!   feed; its failures never fail the poll.
//! * [`DispatchRoutine`] ties the three together as a scheduler task.

pub mod diff;
pub mod dispatch;
pub mod error;
pub mod incremental;
pub mod model;
pub mod pages;
pub mod resync;
pub mod store;
pub mod upstream;
pub mod watermark;

#[cfg(test)]
pub(crate) mod testing;

pub use diff::{compute_diff, DiffReconciler, DiffResult, ReconcileOutcome};
pub use dispatch::{DispatchReport, DispatchRoutine, DispatchStats, ROUTINE_NAME};
pub use error::{Result, SyncError};
pub use incremental::{CheckOutcome, IncrementalSync};
pub use model::{Incident, StoredIncident, TypeCache, TypeTable, UpstreamIncident};
pub use pages::{Page, PageWalker};
pub use resync::{FullResync, ResyncReport};
pub use store::{RecordStore, SqliteStore};
pub use upstream::Upstream;
pub use watermark::{SyncWatermark, WatermarkCache};
