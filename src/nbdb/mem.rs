//! In-memory stand-in for the northbound OVSDB server, implementing the
//! operation subset the client emits (`insert`, `update`, `delete`,
//! `mutate`, `wait`, `select`). Tests drive the real managers against it and
//! assert on the resulting rows.

use serde_json::{Value, json};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use super::cache::{self, Row, ovsdb_uuid_set, set_members, uuid_of};

#[derive(Clone, Default)]
pub struct MemDb {
    tables: Arc<Mutex<Map<String, Map<String, Row>>>>,
    counter: Arc<AtomicU64>,
}

type Tables = Map<String, Map<String, Row>>;

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row directly, bypassing the transaction path. Used to
    /// pre-populate tables the core only reads (logical switch ports) or to
    /// simulate state left behind by an earlier run.
    pub fn seed(&self, table: &str, columns: impl IntoIterator<Item = (&'static str, Value)>) -> String {
        let uuid = self.next_uuid();
        let mut row = Row::new();
        for (column, value) in columns {
            row.insert(column.to_string(), value);
        }
        self.lock().entry(table.to_string()).or_default().insert(uuid.clone(), row);
        uuid
    }

    /// Overwrites one column behind the client's back, to provoke a `wait`
    /// guard conflict.
    pub fn set_column(&self, table: &str, uuid: &str, column: &str, value: Value) {
        if let Some(row) = self.lock().get_mut(table).and_then(|rows| rows.get_mut(uuid)) {
            row.insert(column.to_string(), value);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<(String, Row)> {
        self.lock()
            .get(table)
            .map(|rows| rows.iter().map(|(u, r)| (u.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn find_by_name(&self, table: &str, name: &str) -> Option<(String, Row)> {
        self.rows(table)
            .into_iter()
            .find(|(_, row)| row.get("name").and_then(Value::as_str) == Some(name))
    }

    pub fn find_by_external_ids(
        &self,
        table: &str,
        wanted: &Map<String, String>,
    ) -> Option<(String, Row)> {
        self.rows(table)
            .into_iter()
            .find(|(_, row)| &cache::external_ids(row) == wanted)
    }

    pub(crate) fn transact(&self, ops: &[Value]) -> Vec<Value> {
        // Work on a copy; only a fully successful transaction is kept.
        let mut tables = self.lock().clone();
        let mut named: Map<String, String> = Map::new();
        let mut results = Vec::new();

        for op in ops {
            let result = self.eval(&mut tables, &mut named, op);
            let failed = result.get("error").is_some();
            results.push(result);
            if failed {
                return results;
            }
        }

        gc_acls(&mut tables);
        *self.lock() = tables;
        results
    }

    fn eval(&self, tables: &mut Tables, named: &mut Map<String, String>, op: &Value) -> Value {
        let kind = op.get("op").and_then(Value::as_str).unwrap_or_default();
        let table = op.get("table").and_then(Value::as_str).unwrap_or_default();

        match kind {
            "insert" => {
                let Some(Value::Object(row)) = op.get("row").cloned() else {
                    return json!({"error": "constraint violation", "details": "missing row"});
                };
                let uuid = self.next_uuid();
                tables.entry(table.to_string()).or_default().insert(uuid.clone(), row);
                if let Some(name) = op.get("uuid-name").and_then(Value::as_str) {
                    named.insert(name.to_string(), uuid.clone());
                }
                json!({"uuid": ["uuid", uuid]})
            }
            "update" => {
                let Some(uuid) = where_uuid(op) else {
                    return json!({"error": "constraint violation", "details": "bad where"});
                };
                match tables.get_mut(table).and_then(|rows| rows.get_mut(&uuid)) {
                    None => json!({"count": 0}),
                    Some(row) => {
                        for (column, value) in op.get("row").and_then(Value::as_object).into_iter().flatten() {
                            row.insert(column.clone(), value.clone());
                        }
                        json!({"count": 1})
                    }
                }
            }
            "delete" => {
                let Some(uuid) = where_uuid(op) else {
                    return json!({"error": "constraint violation", "details": "bad where"});
                };
                let count = tables
                    .get_mut(table)
                    .and_then(|rows| rows.remove(&uuid))
                    .map_or(0, |_| 1);
                json!({"count": count})
            }
            "mutate" => {
                let Some(uuid) = where_uuid(op) else {
                    return json!({"error": "constraint violation", "details": "bad where"});
                };
                let Some(row) = tables.get_mut(table).and_then(|rows| rows.get_mut(&uuid)) else {
                    return json!({"count": 0});
                };
                for mutation in op.get("mutations").and_then(Value::as_array).into_iter().flatten() {
                    let Some([column, mutator, value]) = mutation.as_array().map(Vec::as_slice).and_then(|m| <&[Value; 3]>::try_from(m).ok())
                    else {
                        return json!({"error": "constraint violation", "details": "bad mutation"});
                    };
                    let Some(column) = column.as_str() else {
                        return json!({"error": "constraint violation", "details": "bad mutation"});
                    };
                    let mut current: Set<String> = cache::refs(row, column).into_iter().collect();
                    let ids = set_members(value)
                        .iter()
                        .filter_map(|m| {
                            let id = uuid_of(m)?;
                            named.get(id).cloned().or_else(|| Some(id.to_string()))
                        })
                        .collect::<Vec<_>>();
                    match mutator.as_str() {
                        Some("insert") => current.extend(ids),
                        Some("delete") => {
                            for id in &ids {
                                current.remove(id);
                            }
                        }
                        _ => return json!({"error": "constraint violation", "details": "bad mutator"}),
                    }
                    row.insert(column.to_string(), ovsdb_uuid_set(current.iter()));
                }
                json!({"count": 1})
            }
            "wait" => {
                let Some(uuid) = where_uuid(op) else {
                    return json!({"error": "constraint violation", "details": "bad where"});
                };
                let columns: Vec<&str> = op
                    .get("columns")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .collect();
                let expected = op
                    .get("rows")
                    .and_then(Value::as_array)
                    .and_then(|rows| rows.first())
                    .and_then(Value::as_object);
                let row = tables.get(table).and_then(|rows| rows.get(&uuid));
                let empty = json!(["set", []]);
                for column in columns {
                    let actual = row.and_then(|r| r.get(column)).unwrap_or(&empty);
                    let wanted = expected.and_then(|e| e.get(column)).unwrap_or(&empty);
                    if canonical_set(actual) != canonical_set(wanted) {
                        return json!({"error": "timed out"});
                    }
                }
                json!({})
            }
            "select" => {
                let rows: Vec<Value> = tables
                    .get(table)
                    .into_iter()
                    .flatten()
                    .map(|(uuid, row)| {
                        let mut row = row.clone();
                        row.insert("_uuid".to_string(), json!(["uuid", uuid]));
                        Value::Object(row)
                    })
                    .collect();
                json!({"rows": rows})
            }
            other => json!({"error": "unknown op", "details": other}),
        }
    }

    fn next_uuid(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("00000000-0000-0000-0000-{n:012x}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("memdb lock poisoned")
    }
}

/// ACL rows are strong references from `Port_Group.acls`: rows no longer
/// referenced by any group are garbage.
fn gc_acls(tables: &mut Tables) {
    let referenced: Set<String> = tables
        .get("Port_Group")
        .into_iter()
        .flat_map(|rows| rows.values())
        .flat_map(|row| cache::refs(row, "acls"))
        .collect();
    if let Some(acls) = tables.get_mut("ACL") {
        acls.retain(|uuid, _| referenced.contains(uuid));
    }
}

fn where_uuid(op: &Value) -> Option<String> {
    let clause = op.get("where")?.as_array()?.first()?.as_array()?;
    if clause.first()?.as_str()? != "_uuid" {
        return None;
    }
    Some(uuid_of(clause.get(2)?)?.to_string())
}

/// Order-insensitive comparison key for a set column; a bare atom counts as
/// a one-element set.
fn canonical_set(value: &Value) -> Set<String> {
    set_members(value).iter().map(Value::to_string).collect()
}
