use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::store::RecordStore;

/// Cached creation time of the newest downstream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWatermark {
    pub last_seen_created_at: Option<DateTime<Utc>>,
    /// When set, the cached value must not be trusted.
    pub invalid: bool,
}

impl Default for SyncWatermark {
    fn default() -> Self {
        Self {
            last_seen_created_at: None,
            invalid: true,
        }
    }
}

/// Single-writer cache in front of the store's latest record.
#[derive(Debug, Default)]
pub struct WatermarkCache {
    state: Mutex<SyncWatermark>,
}

impl WatermarkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the watermark, refreshing from `store` when the cache is
    /// invalid or empty.
    pub async fn read(&self, store: &dyn RecordStore) -> Result<Option<DateTime<Utc>>> {
        let cached = *self.state.lock();
        if !cached.invalid {
            if let Some(at) = cached.last_seen_created_at {
                return Ok(Some(at));
            }
        }

        let latest = store.latest().await?.map(|s| s.record.created_at);
        *self.state.lock() = SyncWatermark {
            last_seen_created_at: latest,
            invalid: false,
        };
        debug!(watermark = ?latest, "watermark refreshed from store");
        Ok(latest)
    }

    /// Mark the cache stale; the next [`read`](Self::read) hits the store.
    pub fn invalidate(&self) {
        self.state.lock().invalid = true;
    }

    pub fn snapshot(&self) -> SyncWatermark {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Incident, Location};
    use crate::store::SqliteStore;
    use chrono::TimeZone;

    fn incident(id: &str, hour: u32) -> Incident {
        Incident {
            upstream_id: id.into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            narrative: None,
            incident_type: "Medical".into(),
            type_code: None,
            type_id: None,
            address: None,
            city: None,
            state: None,
            location: Location::default(),
            cross_reference_id: None,
        }
    }

    #[tokio::test]
    async fn valid_cache_is_not_refreshed_until_invalidated() {
        let store = SqliteStore::in_memory().unwrap();
        let cache = WatermarkCache::new();
        assert!(cache.snapshot().invalid);
        assert_eq!(cache.read(&store).await.unwrap(), None);

        store.insert_many(&[incident("a", 8)]).await.unwrap();
        let first = cache.read(&store).await.unwrap();
        assert_eq!(first, Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()));

        store.insert_many(&[incident("b", 9)]).await.unwrap();
        assert_eq!(cache.read(&store).await.unwrap(), first);

        cache.invalidate();
        assert_eq!(
            cache.read(&store).await.unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap())
        );
        assert!(!cache.snapshot().invalid);
    }
}
