//! Turns claimed log entries into processed analytics events.

use std::collections::BTreeMap;
use std::sync::Arc;

use rowcast_postgres::types::{EventKind, LogEntry};
use tracing::debug;

use crate::error::{ErrorKind, RowcastResult};
use crate::expr::{Scope, Value, decode_row, decode_row_lax};
use crate::rules::{CompiledRule, RuleSet};
use crate::types::ProcessedEvent;
use crate::{bail, rowcast_error};

/// Property keys accepted as a user identifier on any table.
const USER_ID_KEYS: &[&str] = &["userid", "user_id", "_user_id"];

/// Tables whose own primary key doubles as the user identifier.
const USER_TABLE_NAMES: &[&str] = &["users", "user", "_users"];

/// Maps one log entry to zero or one processed event using the compiled
/// rules. Stateless; all configuration is borrowed for the process lifetime.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    rules: Arc<RuleSet>,
    default_schema: String,
}

impl EventTransformer {
    pub fn new(rules: Arc<RuleSet>, default_schema: impl Into<String>) -> EventTransformer {
        EventTransformer {
            rules,
            default_schema: default_schema.into(),
        }
    }

    /// Transforms a single entry.
    ///
    /// `Ok(None)` means the entry is untracked or its condition selected no
    /// event; both count as successful handling and the entry is deleted.
    /// Errors are per-entry and schedule a retry.
    pub fn transform(&self, entry: &LogEntry) -> RowcastResult<Option<ProcessedEvent>> {
        let table = self.local_table_name(&entry.table);

        let Some(rule) = self.rules.get(table, entry.kind) else {
            debug!(
                event_id = entry.id,
                table = entry.table,
                kind = %entry.kind,
                "no tracking rule for entry, skipping"
            );
            return Ok(None);
        };

        let scope = self.build_scope(entry, table)?;

        let (name, properties) = match rule {
            CompiledRule::Simple { event, properties } => {
                (event.clone(), evaluate_properties(properties, &scope)?)
            }
            CompiledRule::Conditional { cond, branches } => {
                match cond.eval(&scope)? {
                    Value::EventRef(selected) => {
                        let branch = branches.get(&selected).ok_or_else(|| {
                            rowcast_error!(
                                ErrorKind::EvaluationError,
                                "condition selected an undeclared event",
                                selected.clone()
                            )
                        })?;
                        (selected, evaluate_properties(branch, &scope)?)
                    }
                    value if value.is_null() => return Ok(None),
                    other => {
                        bail!(
                            ErrorKind::EvaluationError,
                            "condition must return an event reference or null",
                            format!("got {}", other.type_name())
                        );
                    }
                }
            }
        };

        let distinct_id = pluck_distinct_id(table, &properties);

        Ok(Some(ProcessedEvent {
            source_id: entry.id,
            name,
            properties,
            timestamp: entry.logged_at,
            distinct_id,
        }))
    }

    /// Binds the table alias plus `new`/`old` per the entry kind, enforcing
    /// the old/new presence rule along the way.
    fn build_scope(&self, entry: &LogEntry, table: &str) -> RowcastResult<Scope> {
        let decode = |row: &serde_json::Value| -> RowcastResult<Value> {
            let decoded = match self.rules.descriptor().and_then(|d| d.table(table)) {
                Some(descriptor) => decode_row(descriptor, row),
                None => decode_row_lax(row),
            };
            decoded.map_err(|reason| {
                rowcast_error!(
                    ErrorKind::MalformedLogEntry,
                    "failed to decode row payload",
                    reason
                )
            })
        };

        let missing = |which: &str| {
            rowcast_error!(
                ErrorKind::MalformedLogEntry,
                "log entry violates the row presence rule",
                format!("{} entry {} has no {which} row", entry.kind, entry.id)
            )
        };

        let mut scope = Scope::new();
        match entry.kind {
            EventKind::Insert => {
                let new_row = entry.new_row.as_ref().ok_or_else(|| missing("new"))?;
                let new_value = decode(new_row)?;
                scope.bind(table, new_value.clone());
                scope.bind("new", new_value);
            }
            EventKind::Update => {
                let new_row = entry.new_row.as_ref().ok_or_else(|| missing("new"))?;
                let old_row = entry.old_row.as_ref().ok_or_else(|| missing("old"))?;
                let new_value = decode(new_row)?;
                scope.bind(table, new_value.clone());
                scope.bind("new", new_value);
                scope.bind("old", decode(old_row)?);
            }
            EventKind::Delete => {
                let old_row = entry.old_row.as_ref().ok_or_else(|| missing("old"))?;
                let old_value = decode(old_row)?;
                scope.bind(table, old_value.clone());
                scope.bind("old", old_value);
            }
        }

        scope.bind("events", events_binding(&self.rules, table, entry.kind));

        Ok(scope)
    }

    /// Strips the default-schema qualifier so `public.users` and `users`
    /// resolve to the same tracking rules and descriptor entry.
    fn local_table_name<'a>(&self, table: &'a str) -> &'a str {
        match table.split_once('.') {
            Some((schema, rest)) if schema == self.default_schema => rest,
            _ => table,
        }
    }
}

/// Builds the runtime `events` record for a conditional rule: one member per
/// declared branch, each holding its own name as an event reference.
fn events_binding(rules: &RuleSet, table: &str, kind: EventKind) -> Value {
    let mut members = BTreeMap::new();
    if let Some(CompiledRule::Conditional { branches, .. }) = rules.get(table, kind) {
        for name in branches.keys() {
            members.insert(name.clone(), Value::EventRef(name.clone()));
        }
    }
    Value::Map(members)
}

fn evaluate_properties(
    properties: &[(String, crate::expr::Program)],
    scope: &Scope,
) -> RowcastResult<BTreeMap<String, serde_json::Value>> {
    let mut evaluated = BTreeMap::new();
    for (name, program) in properties {
        let value = program.eval(scope)?;
        evaluated.insert(name.clone(), value.into_json());
    }
    Ok(evaluated)
}

/// Derives the analytics distinct id from the properties map.
///
/// Precedence: an explicit `distinct_id` property, then any user-id-shaped
/// key, then (on user tables only) the row's own `id`. Candidates are
/// scanned in sorted key order so the derivation is deterministic; the
/// first matching key decides, and a value that cannot be coerced leaves
/// the id unset rather than falling through to later candidates.
fn pluck_distinct_id(
    table: &str,
    properties: &BTreeMap<String, serde_json::Value>,
) -> Option<String> {
    if properties.is_empty() {
        return None;
    }

    if let Some(value) = properties.get("distinct_id") {
        return coerce_to_string(value);
    }

    let table = table.to_ascii_lowercase();
    let accept_row_id = USER_TABLE_NAMES.contains(&table.as_str());

    for (key, value) in properties {
        let key = key.to_ascii_lowercase();
        let matches = USER_ID_KEYS.contains(&key.as_str()) || (accept_row_id && key == "id");
        if matches {
            return coerce_to_string(value);
        }
    }

    None
}

/// Coerces a property value to a distinct-id string: strings pass through,
/// integers use plain decimal, floats their shortest round-tripping form.
/// Anything else yields no id.
fn coerce_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(value) => Some(value.clone()),
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(int.to_string())
            } else {
                number.as_f64().map(|float| float.to_string())
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{LogEntryExt, log_entry, tracking_document, users_orders_descriptor};
    use crate::rules::RuleSet;
    use serde_json::json;

    fn transformer(yaml: &str) -> EventTransformer {
        let document = tracking_document(yaml);
        let rules =
            RuleSet::compile(&document, Some(Arc::new(users_orders_descriptor()))).unwrap();
        EventTransformer::new(Arc::new(rules), "public")
    }

    #[test]
    fn simple_insert_produces_the_expected_event() {
        let transformer = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
    properties:
      email: new.email
"#,
        );
        let entry = log_entry(1, EventKind::Insert, "users")
            .with_new_row(json!({"id": 1, "email": "a@b"}));

        let event = transformer.transform(&entry).unwrap().unwrap();
        assert_eq!(event.name, "user_signed_up");
        assert_eq!(event.source_id, 1);
        assert_eq!(event.properties["email"], json!("a@b"));
        assert_eq!(event.distinct_id.as_deref(), None);
        assert_eq!(event.timestamp, entry.logged_at);
    }

    #[test]
    fn untracked_entries_are_skipped() {
        let transformer = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
"#,
        );
        let entry = log_entry(2, EventKind::Delete, "users")
            .with_old_row(json!({"id": 1, "email": "a@b"}));

        assert!(transformer.transform(&entry).unwrap().is_none());
    }

    #[test]
    fn schema_qualified_table_names_resolve() {
        let transformer = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
"#,
        );
        let entry = log_entry(3, EventKind::Insert, "public.users")
            .with_new_row(json!({"id": 1, "email": "a@b"}));

        assert!(transformer.transform(&entry).unwrap().is_some());
    }

    #[test]
    fn conditional_null_means_skip_not_failure() {
        let transformer = transformer(
            r#"
track:
  orders.update:
    cond: "old.status != 'completed' && new.status == 'completed' ? events.order_completed : null"
    order_completed:
      properties:
        total: new.total
"#,
        );

        let skipped = log_entry(4, EventKind::Update, "orders")
            .with_old_row(json!({"id": 9, "status": "completed", "total": 10.0, "user_id": 7}))
            .with_new_row(json!({"id": 9, "status": "completed", "total": 10.0, "user_id": 7}));
        assert!(transformer.transform(&skipped).unwrap().is_none());

        let fired = log_entry(5, EventKind::Update, "orders")
            .with_old_row(json!({"id": 9, "status": "pending", "total": 10.0, "user_id": 7}))
            .with_new_row(json!({"id": 9, "status": "completed", "total": 10.5, "user_id": 7}));
        let event = transformer.transform(&fired).unwrap().unwrap();
        assert_eq!(event.name, "order_completed");
        assert_eq!(event.properties["total"], json!(10.5));
    }

    #[test]
    fn presence_violations_are_malformed_entries() {
        let transformer = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
"#,
        );
        let entry = log_entry(6, EventKind::Insert, "users");

        let err = transformer.transform(&entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedLogEntry);
    }

    #[test]
    fn evaluation_failures_surface_per_entry() {
        let transformer = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
    properties:
      plan: new.metadata.plan.tier
"#,
        );
        // metadata is null, so the nested access fails at evaluation time.
        let entry = log_entry(7, EventKind::Insert, "users")
            .with_new_row(json!({"id": 1, "email": "a@b", "metadata": null}));

        let err = transformer.transform(&entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvaluationError);
    }

    #[test]
    fn distinct_id_prefers_the_explicit_property() {
        let transformer = transformer(
            r#"
track:
  orders.insert:
    event: order_created
    properties:
      distinct_id: new.user_id
      user_id: new.id
"#,
        );
        let entry = log_entry(8, EventKind::Insert, "orders")
            .with_new_row(json!({"id": 3, "status": "pending", "total": 1.0, "user_id": 7}));

        let event = transformer.transform(&entry).unwrap().unwrap();
        assert_eq!(event.distinct_id.as_deref(), Some("7"));
    }

    #[test]
    fn distinct_id_heuristics_match_the_boundary_table() {
        // users table with only `id` derives from the row id.
        let transformer_a = transformer(
            r#"
track:
  users.insert:
    event: user_signed_up
    properties:
      id: new.id
"#,
        );
        let entry = log_entry(9, EventKind::Insert, "users")
            .with_new_row(json!({"id": 42, "email": "a@b"}));
        let event = transformer_a.transform(&entry).unwrap().unwrap();
        assert_eq!(event.distinct_id.as_deref(), Some("42"));

        // orders table with user_id picks it up.
        let transformer_b = transformer(
            r#"
track:
  orders.insert:
    event: order_created
    properties:
      user_id: new.user_id
"#,
        );
        let entry = log_entry(10, EventKind::Insert, "orders")
            .with_new_row(json!({"id": 3, "status": "pending", "total": 1.0, "user_id": 7}));
        let event = transformer_b.transform(&entry).unwrap().unwrap();
        assert_eq!(event.distinct_id.as_deref(), Some("7"));

        // orders table with only its own id stays unset.
        let transformer_c = transformer(
            r#"
track:
  orders.insert:
    event: order_created
    properties:
      id: new.id
"#,
        );
        let entry = log_entry(11, EventKind::Insert, "orders")
            .with_new_row(json!({"id": 3, "status": "pending", "total": 1.0, "user_id": 7}));
        let event = transformer_c.transform(&entry).unwrap().unwrap();
        assert_eq!(event.distinct_id, None);
    }

    #[test]
    fn uncoercible_first_candidate_leaves_the_id_unset() {
        // `_user_id` sorts before `user_id`, matches first, and holds a
        // bool; the lookup must not fall through to the next candidate.
        let transformer = transformer(
            r#"
track:
  orders.insert:
    event: order_created
    properties:
      _user_id: "true"
      user_id: new.user_id
"#,
        );
        let entry = log_entry(13, EventKind::Insert, "orders")
            .with_new_row(json!({"id": 3, "status": "pending", "total": 1.0, "user_id": 7}));

        let event = transformer.transform(&entry).unwrap().unwrap();
        assert_eq!(event.properties["_user_id"], json!(true));
        assert_eq!(event.properties["user_id"], json!(7));
        assert_eq!(event.distinct_id, None);
    }

    #[test]
    fn float_distinct_ids_use_shortest_form() {
        assert_eq!(coerce_to_string(&json!(2.5)).as_deref(), Some("2.5"));
        assert_eq!(coerce_to_string(&json!(7)).as_deref(), Some("7"));
        assert_eq!(coerce_to_string(&json!("abc")).as_deref(), Some("abc"));
        assert_eq!(coerce_to_string(&json!(true)), None);
        assert_eq!(coerce_to_string(&json!({"a": 1})), None);
    }

    #[test]
    fn transformation_is_deterministic() {
        let transformer = transformer(
            r#"
track:
  orders.insert:
    event: order_created
    properties:
      total: new.total
      status: new.status
      user_id: new.user_id
"#,
        );
        let entry = log_entry(12, EventKind::Insert, "orders")
            .with_new_row(json!({"id": 3, "status": "pending", "total": 12.75, "user_id": 7}));

        let first = serde_json::to_vec(&transformer.transform(&entry).unwrap().unwrap()).unwrap();
        let second = serde_json::to_vec(&transformer.transform(&entry).unwrap().unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
