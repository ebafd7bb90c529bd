//! Upstream dispatch payloads and the downstream incident document.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::store::RecordStore;

/// Stored when the upstream record carries no type.
pub const UNKNOWN_TYPE: &str = "Unknown";

/// One record as returned by `GET {base}/records`.
///
/// Only the fields the sync needs are modelled; the rest are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamIncident {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default, rename = "type")]
    pub incident_type: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub incident_type_code: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    /// Numbers or numeric strings, depending on the upstream feed version.
    #[serde(default)]
    pub latitude: Option<Value>,
    #[serde(default)]
    pub longitude: Option<Value>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub cross_reference_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Downstream incident document. Serialized as-is into the store's JSON
/// column, so field names here are the patch paths used by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub upstream_id: String,
    pub created_at: DateTime<Utc>,
    pub narrative: Option<String>,
    pub incident_type: String,
    pub type_code: Option<String>,
    pub type_id: Option<i64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub location: Location,
    pub cross_reference_id: Option<String>,
}

/// An incident together with its downstream row id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIncident {
    pub id: i64,
    pub record: Incident,
}

/// Case-insensitive lookup from incident type name to type id.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    by_name: HashMap<String, i64>,
}

impl TypeTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        let by_name = entries
            .into_iter()
            .map(|(name, id)| (normalize_type(name.as_ref()), id))
            .collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.by_name.get(&normalize_type(name)).copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// The type table shared by the incremental and full sync paths.
#[derive(Debug, Default)]
pub struct TypeCache {
    table: RwLock<TypeTable>,
}

impl TypeCache {
    /// Replace the table with the store's current incident types.
    pub async fn reload(&self, store: &dyn RecordStore) -> Result<usize> {
        let table = TypeTable::new(store.incident_types().await?);
        let n = table.len();
        *self.table.write() = table;
        debug!(types = n, "incident type table loaded");
        Ok(n)
    }

    pub fn snapshot(&self) -> TypeTable {
        self.table.read().clone()
    }
}

fn normalize_type(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Map an upstream record onto the downstream schema.
///
/// Unknown types are kept with `type_id = None`.
pub fn map_incident(upstream: &UpstreamIncident, types: &TypeTable) -> Incident {
    let incident_type = non_empty(upstream.incident_type.as_deref())
        .unwrap_or(UNKNOWN_TYPE)
        .to_string();
    let type_id = types.lookup(&incident_type);

    Incident {
        upstream_id: upstream.id.clone(),
        created_at: upstream.created_at,
        narrative: non_empty(upstream.narrative.as_deref()).map(str::to_string),
        type_id,
        incident_type,
        type_code: non_empty(upstream.incident_type_code.as_deref()).map(str::to_string),
        address: non_empty(upstream.address.as_deref()).map(str::to_string),
        city: non_empty(upstream.city.as_deref()).map(str::to_string),
        state: non_empty(upstream.state.as_deref()).map(str::to_string),
        location: Location {
            latitude: upstream.latitude.as_ref().and_then(coerce_coordinate),
            longitude: upstream.longitude.as_ref().and_then(coerce_coordinate),
        },
        cross_reference_id: upstream.cross_reference_id.clone(),
    }
}

/// Parse a coordinate that may arrive as a JSON number or a numeric string.
pub fn coerce_coordinate(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
