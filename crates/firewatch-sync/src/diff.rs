//! Best-effort enrichment of the newest incident from the cross-reference
//! feed.
//!
//! Only tracked fields are compared, `null` and absent are treated as equal,
//! and changes are addressed by field path (`location.latitude`,
//! `units[0].name`) so nested values are merged rather than replaced.

use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{coerce_coordinate, Incident, StoredIncident, TypeCache, TypeTable, UNKNOWN_TYPE};
use crate::store::RecordStore;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Coordinate,
}

/// Source key in the cross-reference record, target path in the incident.
/// `fallback` mirrors the default applied when the incident was first mapped.
struct TrackedField {
    source: &'static str,
    target: &'static str,
    kind: FieldKind,
    fallback: Option<&'static str>,
}

const fn tracked(source: &'static str, target: &'static str, kind: FieldKind) -> TrackedField {
    TrackedField {
        source,
        target,
        kind,
        fallback: None,
    }
}

const TYPE_NAME_PATH: &str = "incident_type";
const TYPE_ID_PATH: &str = "type_id";

const TRACKED_FIELDS: &[TrackedField] = &[
    tracked("narrative", "narrative", FieldKind::Text),
    TrackedField {
        source: "type",
        target: TYPE_NAME_PATH,
        kind: FieldKind::Text,
        fallback: Some(UNKNOWN_TYPE),
    },
    tracked("address", "address", FieldKind::Text),
    tracked("city", "city", FieldKind::Text),
    tracked("state", "state", FieldKind::Text),
    tracked("latitude", "location.latitude", FieldKind::Coordinate),
    tracked("longitude", "location.longitude", FieldKind::Coordinate),
    tracked("incident_type_code", "type_code", FieldKind::Text),
];

/// Changed fields in tracked-field order, keyed by target path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub has_diff: bool,
    pub changes: Vec<(String, Value)>,
}

/// Compare an incoming cross-reference record against the current document.
pub fn compute_diff(current: &Value, incoming: &Value) -> DiffResult {
    let mut changes = Vec::new();
    for field in TRACKED_FIELDS {
        let new_value = normalize(incoming.get(field.source), field);
        let old_value = normalize(get_path(current, field.target), field);
        if !values_equal(&old_value, &new_value) {
            changes.push((field.target.to_string(), new_value));
        }
    }
    DiffResult {
        has_diff: !changes.is_empty(),
        changes,
    }
}

fn normalize(value: Option<&Value>, field: &TrackedField) -> Value {
    let normalized = match (value, field.kind) {
        (None | Some(Value::Null), _) => Value::Null,
        (Some(v), FieldKind::Coordinate) => coerce_coordinate(v)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        (Some(Value::String(s)), FieldKind::Text) if s.trim().is_empty() => Value::Null,
        (Some(Value::String(s)), FieldKind::Text) => Value::String(s.trim().to_string()),
        // Text targets are `Option<String>`; scalars are kept as their text.
        (Some(Value::Number(n)), FieldKind::Text) => Value::String(n.to_string()),
        (Some(Value::Bool(b)), FieldKind::Text) => Value::String(b.to_string()),
        (Some(_), FieldKind::Text) => Value::Null,
    };
    match (normalized, field.fallback) {
        (Value::Null, Some(fallback)) => Value::String(fallback.to_string()),
        (v, _) => v,
    }
}

/// Keep `type_id` consistent with a changed type name. Unmatched names get
/// `null`, as on first insert.
fn resolve_type_id(diff: &mut DiffResult, current: &Value, types: &TypeTable) {
    let Some(name) = diff
        .changes
        .iter()
        .find(|(path, _)| path == TYPE_NAME_PATH)
        .and_then(|(_, value)| value.as_str())
    else {
        return;
    };
    let type_id = types.lookup(name).map(Value::from).unwrap_or(Value::Null);
    let old = get_path(current, TYPE_ID_PATH).unwrap_or(&Value::Null);
    if !values_equal(old, &type_id) {
        diff.changes.push((TYPE_ID_PATH.to_string(), type_id));
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Split `a.b[2].c` into segments. Empty keys and malformed brackets are
/// treated as literal key text.
fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        if let Some(open) = rest.find('[') {
            let key = &rest[..open];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[open..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    segments.push(Segment::Key(rest.to_string()));
                    rest = "";
                    break;
                };
                match stripped[..close].parse::<usize>() {
                    Ok(i) => segments.push(Segment::Index(i)),
                    Err(_) => segments.push(Segment::Key(stripped[..close].to_string())),
                }
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                segments.push(Segment::Key(rest.to_string()));
            }
        } else if !part.is_empty() {
            segments.push(Segment::Key(part.to_string()));
        }
    }
    segments
}

/// Read the value at `path`, if every segment exists.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    parse_path(path)
        .iter()
        .try_fold(root, |node, segment| match segment {
            Segment::Key(k) => node.get(k.as_str()),
            Segment::Index(i) => node.get(*i),
        })
}

/// Write `value` at `path`, creating intermediate objects and arrays as
/// needed. Siblings along the path are preserved.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments = parse_path(path);
    let Some((last, parents)) = segments.split_last() else {
        *root = value;
        return;
    };

    let mut node = root;
    for (i, segment) in parents.iter().enumerate() {
        let next_is_index = matches!(segments.get(i + 1), Some(Segment::Index(_)));
        node = child_mut(node, segment, next_is_index);
    }

    match last {
        Segment::Key(k) => {
            ensure_object(node).insert(k.clone(), value);
        }
        Segment::Index(i) => {
            let items = ensure_array(node, *i);
            items[*i] = value;
        }
    }
}

fn child_mut<'a>(node: &'a mut Value, segment: &Segment, next_is_index: bool) -> &'a mut Value {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };
    match segment {
        Segment::Key(k) => {
            let child = ensure_object(node).entry(k.clone()).or_insert_with(empty);
            if child.is_null() {
                *child = empty();
            }
            child
        }
        Segment::Index(i) => {
            let items = ensure_array(node, *i);
            if items[*i].is_null() {
                items[*i] = empty();
            }
            &mut items[*i]
        }
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn ensure_array(node: &mut Value, index: usize) -> &mut Vec<Value> {
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    match node {
        Value::Array(items) => {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            items
        }
        _ => unreachable!("node was just replaced with an array"),
    }
}

/// Apply every change to `doc` by structural merge.
pub fn apply_changes(doc: &mut Value, changes: &[(String, Value)]) {
    for (path, value) in changes {
        set_path(doc, path, value.clone());
    }
}

/// What one reconciliation pass did. Never an error: failures are reported
/// here and logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Skipped { reason: String },
    Unchanged,
    Patched { fields: usize },
    Failed { reason: String },
}

/// Diffs the newest incident against its cross-reference record and patches
/// only the fields that changed.
pub struct DiffReconciler {
    upstream: Arc<Upstream>,
    store: Arc<dyn RecordStore>,
    types: Arc<TypeCache>,
    window: Duration,
    /// Last known state of the newest incident, updated after each patch.
    cached: Mutex<Option<StoredIncident>>,
}

impl DiffReconciler {
    pub fn new(
        upstream: Arc<Upstream>,
        store: Arc<dyn RecordStore>,
        types: Arc<TypeCache>,
        window: Duration,
    ) -> Self {
        Self {
            upstream,
            store,
            types,
            window,
            cached: Mutex::new(None),
        }
    }

    pub async fn reconcile(&self) -> ReconcileOutcome {
        match self.try_reconcile().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "diff reconciliation failed");
                ReconcileOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn try_reconcile(&self) -> Result<ReconcileOutcome> {
        let Some(latest) = self.store.latest().await? else {
            return Ok(skipped("no synced incidents yet"));
        };

        // Keep our patched copy while it is still the newest incident.
        let current = {
            let mut cached = self.cached.lock();
            match cached.as_ref() {
                Some(c) if c.id == latest.id => c.clone(),
                _ => {
                    *cached = Some(latest.clone());
                    latest
                }
            }
        };

        let Some(xref) = current.record.cross_reference_id.clone() else {
            return Ok(skipped("newest incident has no cross-reference id"));
        };
        if current.record.created_at < Utc::now() - self.window {
            return Ok(skipped("newest incident is outside the diff window"));
        }

        let incoming: Value = match self.upstream.cross_reference(&xref).await {
            Ok(v) => v,
            Err(e) => {
                warn!(cross_reference_id = %xref, error = %e, "cross-reference fetch failed");
                return Ok(ReconcileOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };

        let mut doc = serde_json::to_value(&current.record)?;
        let mut diff = compute_diff(&doc, &incoming);
        if !diff.has_diff {
            debug!(incident = current.id, "cross-reference unchanged");
            return Ok(ReconcileOutcome::Unchanged);
        }

        resolve_type_id(&mut diff, &doc, &self.types.snapshot());
        apply_changes(&mut doc, &diff.changes);
        let record: Incident = serde_json::from_value(doc)?;
        self.store.patch(current.id, &diff.changes).await?;
        *self.cached.lock() = Some(StoredIncident {
            id: current.id,
            record,
        });

        let fields = diff.changes.len();
        info!(
            incident = current.id,
            fields,
            paths = ?diff.changes.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            "applied cross-reference diff"
        );
        Ok(ReconcileOutcome::Patched { fields })
    }
}

fn skipped(reason: &str) -> ReconcileOutcome {
    ReconcileOutcome::Skipped {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use crate::store::SqliteStore;
    use crate::testing::{config, FakeUpstream};
    use firewatch_fetch::FetchResponse;
    use serde_json::json;

    #[test]
    fn null_and_missing_are_equal() {
        let current = json!({ "narrative": null, "location": { "latitude": null } });
        let incoming = json!({ "narrative": null });
        let diff = compute_diff(&current, &incoming);
        assert!(!diff.has_diff);
        assert!(diff.changes.is_empty());
    }

    #[test]
    fn changes_keep_tracked_order_and_nested_paths() {
        let current = json!({
            "narrative": "smoke",
            "city": "Springfield",
            "location": { "latitude": 1.0, "longitude": 2.0 }
        });
        let incoming = json!({
            "narrative": "flames",
            "city": "Springfield",
            "latitude": "1.5",
            "longitude": 2,
            "untracked": "ignored"
        });
        let diff = compute_diff(&current, &incoming);
        assert!(diff.has_diff);
        assert_eq!(
            diff.changes,
            vec![
                ("narrative".to_string(), json!("flames")),
                ("location.latitude".to_string(), json!(1.5)),
            ]
        );
    }

    #[test]
    fn set_path_merges_instead_of_replacing() {
        let mut doc = json!({ "location": { "latitude": 1.0, "longitude": 2.0 } });
        set_path(&mut doc, "location.latitude", json!(3.0));
        assert_eq!(doc, json!({ "location": { "latitude": 3.0, "longitude": 2.0 } }));
    }

    #[test]
    fn set_path_builds_missing_structure() {
        let mut doc = json!({});
        set_path(&mut doc, "units[1].name", json!("E12"));
        assert_eq!(doc, json!({ "units": [null, { "name": "E12" }] }));
        assert_eq!(get_path(&doc, "units[1].name"), Some(&json!("E12")));
        assert_eq!(get_path(&doc, "units[5].name"), None);
    }

    #[test]
    fn parse_path_handles_brackets() {
        assert_eq!(
            parse_path("a.b[2][0].c"),
            vec![
                Segment::Key("a".into()),
                Segment::Key("b".into()),
                Segment::Index(2),
                Segment::Index(0),
                Segment::Key("c".into()),
            ]
        );
        assert_eq!(parse_path("x[key]"), vec![Segment::Key("x".into()), Segment::Key("key".into())]);
    }

    fn fresh_incident(xref: Option<&str>) -> Incident {
        Incident {
            upstream_id: "1".into(),
            created_at: Utc::now(),
            narrative: Some("smoke showing".into()),
            incident_type: "Structure Fire".into(),
            type_code: None,
            type_id: None,
            address: Some("1 Main St".into()),
            city: None,
            state: None,
            location: Location {
                latitude: Some(41.0),
                longitude: Some(-87.0),
            },
            cross_reference_id: xref.map(str::to_string),
        }
    }

    async fn setup(
        incident: Incident,
        upstream: &FakeUpstream,
    ) -> (DiffReconciler, Arc<SqliteStore>) {
        setup_with(incident, upstream.client(&config()), &[]).await
    }

    /// Registers `type_names` (ids 1, 2, ... in order) before inserting.
    async fn setup_with(
        incident: Incident,
        upstream: Arc<Upstream>,
        type_names: &[&str],
    ) -> (DiffReconciler, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        for name in type_names {
            store.upsert_incident_type(name).unwrap();
        }
        let types = Arc::new(TypeCache::default());
        types.reload(store.as_ref()).await.unwrap();
        store.insert_many(&[incident]).await.unwrap();
        let reconciler = DiffReconciler::new(upstream, store.clone(), types, Duration::minutes(5));
        (reconciler, store)
    }

    fn cross_ref(body: Value) -> FetchResponse {
        FetchResponse::new(200, body.to_string())
    }

    #[tokio::test]
    async fn second_pass_with_same_data_has_no_diff() {
        let upstream = FakeUpstream::new();
        upstream.route(
            "https://api.test/cross-ref/77",
            FetchResponse::new(
                200,
                json!({
                    "narrative": "fully involved",
                    "type": "Structure Fire",
                    "address": "1 Main St",
                    "city": "Joliet",
                    "latitude": "41.5",
                    "longitude": -87.0
                })
                .to_string(),
            ),
        );
        let (reconciler, store) = setup(fresh_incident(Some("77")), &upstream).await;

        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Patched { fields: 3 });
        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Unchanged);

        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.record.narrative.as_deref(), Some("fully involved"));
        assert_eq!(stored.record.city.as_deref(), Some("Joliet"));
        assert_eq!(stored.record.location.latitude, Some(41.5));
        assert_eq!(stored.record.location.longitude, Some(-87.0));
        assert_eq!(stored.record.incident_type, "Structure Fire");
    }

    #[test]
    fn scalar_text_values_compare_as_strings() {
        let current = json!({ "type_code": "321", "narrative": "true" });
        let incoming = json!({ "incident_type_code": 321, "narrative": true, "city": ["x"] });
        assert!(!compute_diff(&current, &incoming).has_diff);
    }

    #[tokio::test]
    async fn numeric_type_code_does_not_block_other_changes() {
        let upstream = FakeUpstream::new();
        upstream.route(
            "https://api.test/cross-ref/77",
            cross_ref(json!({
                "narrative": "smoke",
                "type": "Structure Fire",
                "address": "1 Main St",
                "latitude": 41.0,
                "longitude": -87.0,
                "incident_type_code": 321
            })),
        );
        let (reconciler, store) = setup(fresh_incident(Some("77")), &upstream).await;

        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Patched { fields: 2 });
        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.record.narrative.as_deref(), Some("smoke"));
        assert_eq!(stored.record.type_code.as_deref(), Some("321"));

        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Unchanged);
    }

    #[tokio::test]
    async fn type_change_resolves_type_id() {
        let upstream = FakeUpstream::new();
        let base = json!({
            "narrative": "smoke showing",
            "address": "1 Main St",
            "latitude": 41.0,
            "longitude": -87.0
        });
        let with_type = |name: &str| {
            let mut body = base.clone();
            body["type"] = json!(name);
            cross_ref(body)
        };
        upstream.route("https://api.test/cross-ref/77", with_type("hazmat"));
        upstream.route("https://api.test/cross-ref/77", with_type("Brush Fire"));

        let mut incident = fresh_incident(Some("77"));
        incident.type_id = Some(1);
        let (reconciler, store) = setup_with(
            incident,
            upstream.client(&config()),
            &["Structure Fire", "Hazmat"],
        )
        .await;

        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Patched { fields: 2 });
        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.record.incident_type, "hazmat");
        assert_eq!(stored.record.type_id, Some(2));

        // unknown names clear the id rather than keep the previous one
        assert_eq!(reconciler.reconcile().await, ReconcileOutcome::Patched { fields: 2 });
        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.record.incident_type, "Brush Fire");
        assert_eq!(stored.record.type_id, None);
    }

    #[tokio::test]
    async fn cross_reference_is_fetched_once_without_backoff() {
        let upstream = FakeUpstream::new();
        upstream.route(
            "https://api.test/cross-ref/77",
            FetchResponse::new(503, "busy"),
        );
        let policy = firewatch_fetch::RetryPolicy {
            max_retries: 3,
            ..firewatch_fetch::RetryPolicy::default()
        };
        let (reconciler, _) = setup_with(
            fresh_incident(Some("77")),
            upstream.client_with_policy(&config(), policy),
            &[],
        )
        .await;

        let outcome = reconciler.reconcile().await;
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_swallowed() {
        let upstream = FakeUpstream::new();
        upstream.route(
            "https://api.test/cross-ref/77",
            FetchResponse::new(404, "missing"),
        );
        let (reconciler, store) = setup(fresh_incident(Some("77")), &upstream).await;

        let outcome = reconciler.reconcile().await;
        assert!(matches!(outcome, ReconcileOutcome::Failed { .. }));
        let stored = store.latest().await.unwrap().unwrap();
        assert_eq!(stored.record.narrative.as_deref(), Some("smoke showing"));
    }

    #[tokio::test]
    async fn stale_or_unlinked_incidents_are_skipped() {
        let upstream = FakeUpstream::new();
        let (reconciler, _) = setup(fresh_incident(None), &upstream).await;
        assert!(matches!(reconciler.reconcile().await, ReconcileOutcome::Skipped { .. }));

        let mut old = fresh_incident(Some("77"));
        old.created_at = Utc::now() - Duration::hours(2);
        let (reconciler, _) = setup(old, &upstream).await;
        assert!(matches!(reconciler.reconcile().await, ReconcileOutcome::Skipped { .. }));
        assert!(upstream.calls().is_empty());
    }
}
