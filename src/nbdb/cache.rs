use serde_json::{Value, json};
use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// A table row in OVSDB wire representation: column name to wire value.
/// Maps are `["map", [[k, v], ...]]`, sets `["set", [...]]`, and references
/// `["uuid", "..."]` (or `["named-uuid", "..."]` before commit).
pub type Row = serde_json::Map<String, Value>;

/// Read-through cache of northbound rows, keyed by table then row UUID.
///
/// Warmed with a full dump at startup and synchronized on every successful
/// commit, so write paths can consult it to deduplicate inserts and to read
/// foreign references without a round-trip.
#[derive(Default)]
pub struct Cache {
    tables: Map<String, Map<String, Row>>,
}

impl Cache {
    pub fn get(&self, table: &str, uuid: &str) -> Option<&Row> {
        self.tables.get(table)?.get(uuid)
    }

    pub fn rows(&self, table: &str) -> impl Iterator<Item = (&str, &Row)> {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(uuid, row)| (uuid.as_str(), row)))
    }

    /// Finds the row whose `name` column equals `name`.
    pub fn find_by_name(&self, table: &str, name: &str) -> Option<(&str, &Row)> {
        self.rows(table)
            .find(|(_, row)| row.get("name").and_then(Value::as_str) == Some(name))
    }

    /// Finds the row whose decoded `external_ids` map equals `wanted`.
    pub fn find_by_external_ids(
        &self,
        table: &str,
        wanted: &Map<String, String>,
    ) -> Option<(&str, &Row)> {
        self.rows(table)
            .find(|(_, row)| &external_ids(row) == wanted)
    }

    /// Finds the port group whose `column` reference set contains `uuid`.
    pub fn port_group_referencing(&self, column: &str, uuid: &str) -> Option<(&str, &Row)> {
        self.rows("Port_Group")
            .find(|(_, row)| refs(row, column).iter().any(|r| r == uuid))
    }

    pub(super) fn load_table(&mut self, table: &str, rows: Map<String, Row>) {
        self.tables.insert(table.to_string(), rows);
    }

    pub(super) fn insert_row(&mut self, table: &str, uuid: String, row: Row) {
        self.tables.entry(table.to_string()).or_default().insert(uuid, row);
    }

    pub(super) fn merge_row(&mut self, table: &str, uuid: &str, row: &Row) {
        if let Some(current) = self.tables.entry(table.to_string()).or_default().get_mut(uuid) {
            for (column, value) in row {
                current.insert(column.clone(), value.clone());
            }
        }
    }

    /// Removes a row. ACL rows are strong references from `Port_Group.acls`,
    /// so deleting a port group also drops its ACLs.
    pub(super) fn remove_row(&mut self, table: &str, uuid: &str) {
        let Some(rows) = self.tables.get_mut(table) else {
            return;
        };
        let Some(row) = rows.remove(uuid) else {
            return;
        };
        if table == "Port_Group" {
            let acls = refs(&row, "acls");
            if let Some(acl_rows) = self.tables.get_mut("ACL") {
                for acl in acls {
                    acl_rows.remove(&acl);
                }
            }
        }
    }

    pub(super) fn mutate_refs(&mut self, table: &str, uuid: &str, column: &str, insert: bool, ids: &[String]) {
        let Some(row) = self.tables.entry(table.to_string()).or_default().get_mut(uuid) else {
            return;
        };
        let mut current: Set<String> = refs(row, column).into_iter().collect();
        for id in ids {
            if insert {
                current.insert(id.clone());
            } else {
                current.remove(id);
            }
        }
        row.insert(column.to_string(), ovsdb_uuid_set(current.iter()));
    }
}

/// Decodes a reference-set column into its member UUIDs. A missing column
/// and the single-atom form both decode correctly.
pub fn refs(row: &Row, column: &str) -> Vec<String> {
    let Some(value) = row.get(column) else {
        return Vec::new();
    };
    set_members(value)
        .iter()
        .filter_map(|v| uuid_of(v).map(str::to_string))
        .collect()
}

/// Decodes the `external_ids` column into a plain map.
pub fn external_ids(row: &Row) -> Map<String, String> {
    let mut out = Map::new();
    let Some(Value::Array(parts)) = row.get("external_ids") else {
        return out;
    };
    if parts.len() != 2 || parts[0] != json!("map") {
        return out;
    }
    let Some(pairs) = parts[1].as_array() else {
        return out;
    };
    for pair in pairs {
        if let (Some(k), Some(v)) = (
            pair.get(0).and_then(Value::as_str),
            pair.get(1).and_then(Value::as_str),
        ) {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

/// Members of a set column; a bare atom is a one-element set.
pub fn set_members(value: &Value) -> Vec<Value> {
    if let Value::Array(parts) = value
        && parts.len() == 2
        && parts[0] == json!("set")
        && let Some(members) = parts[1].as_array()
    {
        return members.clone();
    }
    vec![value.clone()]
}

/// The UUID inside `["uuid", ...]` or `["named-uuid", ...]`.
pub fn uuid_of(value: &Value) -> Option<&str> {
    let parts = value.as_array()?;
    match parts.first()?.as_str()? {
        "uuid" | "named-uuid" => parts.get(1)?.as_str(),
        _ => None,
    }
}

pub fn ovsdb_uuid(uuid: &str) -> Value {
    json!(["uuid", uuid])
}

pub fn ovsdb_uuid_set<I, S>(uuids: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let members: Vec<Value> = uuids.into_iter().map(|u| ovsdb_uuid(u.as_ref())).collect();
    json!(["set", members])
}

pub fn ovsdb_string_set<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let members: Vec<Value> = items
        .into_iter()
        .map(|s| Value::String(s.as_ref().to_string()))
        .collect();
    json!(["set", members])
}

pub fn ovsdb_map(map: &Map<String, String>) -> Value {
    let pairs: Vec<Value> = map.iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(json: Value) -> Row {
        match json {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn external_ids_round_trip() {
        let mut ids = Map::new();
        ids.insert("namespace".into(), "dev".into());
        ids.insert("policy".into(), "allow-web".into());
        let r = row(json!({"external_ids": ovsdb_map(&ids)}));
        assert_eq!(external_ids(&r), ids);
    }

    #[test]
    fn refs_decode_set_and_atom() {
        let r = row(json!({"ports": ovsdb_uuid_set(["u1", "u2"])}));
        assert_eq!(refs(&r, "ports"), vec!["u1".to_string(), "u2".to_string()]);

        let r = row(json!({"ports": ovsdb_uuid("u1")}));
        assert_eq!(refs(&r, "ports"), vec!["u1".to_string()]);

        assert!(refs(&r, "acls").is_empty());
    }

    #[test]
    fn port_group_delete_drops_its_acls() {
        let mut cache = Cache::default();
        cache.insert_row("ACL", "acl1".into(), row(json!({"match": "x"})));
        cache.insert_row(
            "Port_Group",
            "pg1".into(),
            row(json!({"name": "g", "acls": ovsdb_uuid_set(["acl1"])})),
        );

        cache.remove_row("Port_Group", "pg1");
        assert!(cache.get("ACL", "acl1").is_none());
    }

    #[test]
    fn find_by_external_ids_is_exact() {
        let mut wanted = Map::new();
        wanted.insert("default-deny-policy-type".into(), "Ingress".into());

        let mut other = wanted.clone();
        other.insert("extra".into(), "x".into());

        let mut cache = Cache::default();
        cache.insert_row("ACL", "a1".into(), row(json!({"external_ids": ovsdb_map(&other)})));
        assert!(cache.find_by_external_ids("ACL", &wanted).is_none());

        cache.insert_row("ACL", "a2".into(), row(json!({"external_ids": ovsdb_map(&wanted)})));
        assert_eq!(cache.find_by_external_ids("ACL", &wanted).unwrap().0, "a2");
    }
}
