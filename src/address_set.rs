use serde_json::json;
use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::nbdb::cache::{ovsdb_map, ovsdb_string_set};
use crate::nbdb::{Client, Row};

/// Maintains named sets of IP addresses in the northbound database.
///
/// The only mutation is a full overwrite: callers keep the authoritative
/// membership in memory and hand over the complete set on every change.
#[derive(Clone)]
pub struct AddressSetManager {
    nb: Client,
}

impl AddressSetManager {
    pub fn new(nb: Client) -> Self {
        AddressSetManager { nb }
    }

    /// Creates an address set; a no-op if a set with this hashed name
    /// already exists. The readable name is kept in `external_ids` so the
    /// startup sync can map the row back to its policy.
    pub async fn create(
        &self,
        readable_name: &str,
        hashed_name: &str,
        initial: Option<&Set<String>>,
    ) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                if cache.find_by_name("Address_Set", hashed_name).is_some() {
                    return;
                }
                let mut external_ids = Map::new();
                external_ids.insert("name".to_string(), readable_name.to_string());

                let mut row = Row::new();
                row.insert("name".to_string(), json!(hashed_name));
                row.insert(
                    "addresses".to_string(),
                    ovsdb_string_set(initial.into_iter().flatten()),
                );
                row.insert("external_ids".to_string(), ovsdb_map(&external_ids));
                txn.insert("Address_Set", row);
            })
            .await?;
        Ok(())
    }

    /// Overwrites the contents of an existing set. Unknown sets are left
    /// alone; the create path owns bringing them into existence.
    pub async fn replace(&self, hashed_name: &str, addresses: &Set<String>) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let Some((uuid, _)) = cache.find_by_name("Address_Set", hashed_name) else {
                    return;
                };
                let mut row = Row::new();
                row.insert("addresses".to_string(), ovsdb_string_set(addresses));
                txn.update("Address_Set", uuid, row);
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, hashed_name: &str) -> eyre::Result<()> {
        self.nb
            .run(|txn, cache| {
                let Some((uuid, _)) = cache.find_by_name("Address_Set", hashed_name) else {
                    return;
                };
                txn.delete("Address_Set", uuid);
            })
            .await?;
        Ok(())
    }
}
