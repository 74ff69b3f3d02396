use eyre::format_err;
use serde_json::json;
use std::collections::BTreeMap as Map;

use crate::nbdb::cache::{ovsdb_map, refs};
use crate::nbdb::{Client, RefId, Row};

/// Maintains named groups of logical-port references in the northbound
/// database. A group is created once per logical scope and addressed by its
/// UUID afterwards.
#[derive(Clone)]
pub struct PortGroupManager {
    nb: Client,
}

impl PortGroupManager {
    pub fn new(nb: Client) -> Self {
        PortGroupManager { nb }
    }

    /// Creates a port group and returns its UUID; if a group with this
    /// hashed name already exists, returns the existing UUID.
    pub async fn create(&self, readable_name: &str, hashed_name: &str) -> eyre::Result<String> {
        let mut named = None;
        let commit = self
            .nb
            .run(|txn, cache| {
                named = None;
                if cache.find_by_name("Port_Group", hashed_name).is_some() {
                    return;
                }
                let mut external_ids = Map::new();
                external_ids.insert("name".to_string(), readable_name.to_string());

                let mut row = Row::new();
                row.insert("name".to_string(), json!(hashed_name));
                row.insert("external_ids".to_string(), ovsdb_map(&external_ids));
                named = Some(txn.insert("Port_Group", row));
            })
            .await?;

        if let Some(named) = named
            && let Some(uuid) = commit.uuid(&named)
        {
            return Ok(uuid.to_string());
        }
        self.nb
            .cache()
            .await
            .find_by_name("Port_Group", hashed_name)
            .map(|(uuid, _)| uuid.to_string())
            .ok_or_else(|| format_err!("port group {hashed_name} neither created nor found"))
    }

    /// Adds a logical port to a group; a no-op if already a member.
    pub async fn add_port(&self, port_group_uuid: &str, port_uuid: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let present = cache
                    .get("Port_Group", port_group_uuid)
                    .is_some_and(|row| refs(row, "ports").iter().any(|p| p == port_uuid));
                if present {
                    return;
                }
                txn.insert_references(
                    "Port_Group",
                    port_group_uuid,
                    "ports",
                    vec![RefId::Real(port_uuid.to_string())],
                    cache,
                );
            })
            .await?;
        Ok(())
    }

    /// Removes a logical port from a group; a no-op if absent.
    pub async fn remove_port(&self, port_group_uuid: &str, port_uuid: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let present = cache
                    .get("Port_Group", port_group_uuid)
                    .is_some_and(|row| refs(row, "ports").iter().any(|p| p == port_uuid));
                if !present {
                    return;
                }
                txn.delete_references(
                    "Port_Group",
                    port_group_uuid,
                    "ports",
                    vec![port_uuid.to_string()],
                    cache,
                );
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, hashed_name: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let Some((uuid, _)) = cache.find_by_name("Port_Group", hashed_name) else {
                    return;
                };
                txn.delete("Port_Group", uuid);
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbdb::mem::MemDb;

    #[tokio::test]
    async fn create_returns_existing_uuid() {
        let db = MemDb::new();
        let groups = PortGroupManager::new(Client::with_mem(db.clone()));

        let first = groups.create("dev_pol", "abcd").await.unwrap();
        let second = groups.create("dev_pol", "abcd").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(db.rows("Port_Group").len(), 1);
    }

    #[tokio::test]
    async fn port_membership_is_idempotent() {
        let db = MemDb::new();
        let groups = PortGroupManager::new(Client::with_mem(db.clone()));

        let pg = groups.create("dev_pol", "abcd").await.unwrap();
        groups.add_port(&pg, "lsp1").await.unwrap();
        groups.add_port(&pg, "lsp1").await.unwrap();

        let (_, row) = db.find_by_name("Port_Group", "abcd").unwrap();
        assert_eq!(refs(&row, "ports"), vec!["lsp1".to_string()]);

        groups.remove_port(&pg, "lsp1").await.unwrap();
        groups.remove_port(&pg, "lsp1").await.unwrap();
        let (_, row) = db.find_by_name("Port_Group", "abcd").unwrap();
        assert!(refs(&row, "ports").is_empty());
    }
}
