pub mod cache;
#[cfg(test)]
pub mod mem;
mod socket;

pub use cache::{Cache, Row};

use serde_json::{Value, json};
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// The northbound database name on the OVSDB server.
pub const DB_NAME: &str = "OVN_Northbound";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad wire data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported database address: {0}")]
    Address(String),
    #[error("rpc failed: {0}")]
    Rpc(String),
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// A row reference in a transaction: either a row that already exists in the
/// database, or one inserted earlier in the same transaction.
pub enum RefId {
    Real(String),
    Named(String),
}

impl RefId {
    fn wire(&self) -> Value {
        match self {
            RefId::Real(uuid) => json!(["uuid", uuid]),
            RefId::Named(name) => json!(["named-uuid", name]),
        }
    }

    fn resolve(&self, assigned: &Map<String, String>) -> Option<String> {
        match self {
            RefId::Real(uuid) => Some(uuid.clone()),
            RefId::Named(name) => assigned.get(name).cloned(),
        }
    }
}

enum Op {
    Insert {
        table: String,
        row: Row,
        named: String,
    },
    Update {
        table: String,
        uuid: String,
        row: Row,
    },
    Delete {
        table: String,
        uuid: String,
    },
    Mutate {
        table: String,
        uuid: String,
        column: String,
        insert: bool,
        ids: Vec<RefId>,
        /// Cached column value at build time; turned into a `wait` guard so
        /// the commit fails (and is retried) if the row moved underneath us.
        guard: Option<Value>,
    },
}

/// One transaction against the northbound database. Built fresh on every
/// attempt of the retry loop; see [`Client::run`].
#[derive(Default)]
pub struct Txn {
    ops: Vec<Op>,
}

impl Txn {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queues an insert; the returned name stands for the new row's UUID
    /// within this transaction.
    pub fn insert(&mut self, table: &str, row: Row) -> String {
        let named = format!("row{}", self.ops.len());
        self.ops.push(Op::Insert {
            table: table.to_string(),
            row,
            named: named.clone(),
        });
        named
    }

    pub fn update(&mut self, table: &str, uuid: &str, row: Row) {
        self.ops.push(Op::Update {
            table: table.to_string(),
            uuid: uuid.to_string(),
            row,
        });
    }

    pub fn delete(&mut self, table: &str, uuid: &str) {
        self.ops.push(Op::Delete {
            table: table.to_string(),
            uuid: uuid.to_string(),
        });
    }

    /// Adds references to a set column, guarded against concurrent writers
    /// by the cached value of that column.
    pub fn insert_references(
        &mut self,
        table: &str,
        uuid: &str,
        column: &str,
        ids: Vec<RefId>,
        cache: &Cache,
    ) {
        self.mutate(table, uuid, column, true, ids, cache);
    }

    pub fn delete_references(
        &mut self,
        table: &str,
        uuid: &str,
        column: &str,
        ids: Vec<String>,
        cache: &Cache,
    ) {
        let ids = ids.into_iter().map(RefId::Real).collect();
        self.mutate(table, uuid, column, false, ids, cache);
    }

    fn mutate(
        &mut self,
        table: &str,
        uuid: &str,
        column: &str,
        insert: bool,
        ids: Vec<RefId>,
        cache: &Cache,
    ) {
        let guard = cache.get(table, uuid).map(|row| {
            row.get(column)
                .cloned()
                .unwrap_or_else(|| json!(["set", []]))
        });
        self.ops.push(Op::Mutate {
            table: table.to_string(),
            uuid: uuid.to_string(),
            column: column.to_string(),
            insert,
            ids,
            guard,
        });
    }

    fn tables(&self) -> Set<String> {
        self.ops
            .iter()
            .map(|op| match op {
                Op::Insert { table, .. }
                | Op::Update { table, .. }
                | Op::Delete { table, .. }
                | Op::Mutate { table, .. } => table.clone(),
            })
            .collect()
    }

    /// Renders wire operations plus the wire index of every insert, so the
    /// reply can be mapped back to named UUIDs.
    fn wire(&self) -> (Vec<Value>, Vec<(usize, String)>) {
        let mut ops = Vec::new();
        let mut inserts = Vec::new();
        for op in &self.ops {
            match op {
                Op::Insert { table, row, named } => {
                    inserts.push((ops.len(), named.clone()));
                    ops.push(json!({
                        "op": "insert",
                        "table": table,
                        "row": row,
                        "uuid-name": named,
                    }));
                }
                Op::Update { table, uuid, row } => {
                    ops.push(json!({
                        "op": "update",
                        "table": table,
                        "where": [["_uuid", "==", ["uuid", uuid]]],
                        "row": row,
                    }));
                }
                Op::Delete { table, uuid } => {
                    ops.push(json!({
                        "op": "delete",
                        "table": table,
                        "where": [["_uuid", "==", ["uuid", uuid]]],
                    }));
                }
                Op::Mutate {
                    table,
                    uuid,
                    column,
                    insert,
                    ids,
                    guard,
                } => {
                    if let Some(guard) = guard {
                        let mut expect = Row::new();
                        expect.insert(column.clone(), guard.clone());
                        ops.push(json!({
                            "op": "wait",
                            "timeout": 0,
                            "table": table,
                            "where": [["_uuid", "==", ["uuid", uuid]]],
                            "columns": [column],
                            "until": "==",
                            "rows": [expect],
                        }));
                    }
                    let mutator = if *insert { "insert" } else { "delete" };
                    let members: Vec<Value> = ids.iter().map(RefId::wire).collect();
                    ops.push(json!({
                        "op": "mutate",
                        "table": table,
                        "where": [["_uuid", "==", ["uuid", uuid]]],
                        "mutations": [[column, mutator, ["set", members]]],
                    }));
                }
            }
        }
        (ops, inserts)
    }
}

/// Outcome of a committed transaction.
pub struct Commit {
    /// True when the commit hit transient contention and must be re-driven
    /// with a fresh transaction. [`Client::run`] handles this internally.
    pub retry: bool,
    assigned: Map<String, String>,
}

impl Commit {
    fn noop() -> Self {
        Commit {
            retry: false,
            assigned: Map::new(),
        }
    }

    fn retry() -> Self {
        Commit {
            retry: true,
            assigned: Map::new(),
        }
    }

    /// The real UUID assigned to a row inserted under `named`.
    pub fn uuid(&self, named: &str) -> Option<&str> {
        self.assigned.get(named).map(String::as_str)
    }
}

enum Backend {
    Socket(socket::Socket),
    #[cfg(test)]
    Mem(mem::MemDb),
}

impl Backend {
    async fn transact(&self, db: &str, ops: &[Value]) -> Result<Vec<Value>, Error> {
        match self {
            Backend::Socket(socket) => socket.transact(db, ops).await,
            #[cfg(test)]
            Backend::Mem(mem) => Ok(mem.transact(ops)),
        }
    }
}

/// Transactional client to the northbound database with a write-through row
/// cache and a retry-on-conflict commit loop.
#[derive(Clone)]
pub struct Client {
    backend: Arc<Backend>,
    cache: Arc<Mutex<Cache>>,
}

impl Client {
    /// Connects to `tcp:host:port` or `unix:/path`.
    pub async fn connect(addr: &str) -> Result<Self, Error> {
        Ok(Self::new(Backend::Socket(socket::Socket::connect(addr).await?)))
    }

    #[cfg(test)]
    pub fn with_mem(db: mem::MemDb) -> Self {
        Self::new(Backend::Mem(db))
    }

    fn new(backend: Backend) -> Self {
        Client {
            backend: Arc::new(backend),
            cache: Arc::new(Mutex::new(Cache::default())),
        }
    }

    pub async fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().await
    }

    /// Dumps the given tables into the cache.
    pub async fn warm_cache(&self, tables: &[&str]) -> Result<(), Error> {
        let ops: Vec<Value> = tables
            .iter()
            .map(|table| json!({"op": "select", "table": table, "where": []}))
            .collect();
        let results = self.backend.transact(DB_NAME, &ops).await?;

        let mut cache = self.cache.lock().await;
        for (table, result) in tables.iter().zip(&results) {
            if let Some(error) = result.get("error") {
                return Err(Error::Rejected(format!("dump of {table} failed: {error}")));
            }
            let mut rows = Map::new();
            for row in result.get("rows").and_then(Value::as_array).into_iter().flatten() {
                let Value::Object(mut row) = row.clone() else {
                    continue;
                };
                let Some(uuid) = row.remove("_uuid").as_ref().and_then(cache::uuid_of).map(str::to_string)
                else {
                    continue;
                };
                rows.insert(uuid, row);
            }
            cache.load_table(table, rows);
        }
        Ok(())
    }

    /// Drives a transaction to completion.
    ///
    /// `build` is called with a fresh [`Txn`] and the current cache on every
    /// attempt; the commit is repeated while it reports transient contention,
    /// with the cache refreshed in between so the next attempt sees current
    /// truth. An empty transaction commits nothing and returns immediately,
    /// which is how idempotent no-ops fall out of the build closures.
    pub async fn run<F>(&self, mut build: F) -> Result<Commit, Error>
    where
        F: FnMut(&mut Txn, &Cache),
    {
        loop {
            let txn = {
                let cache = self.cache.lock().await;
                let mut txn = Txn::default();
                build(&mut txn, &cache);
                txn
            };
            if txn.is_empty() {
                return Ok(Commit::noop());
            }
            let commit = self.commit(txn).await?;
            if !commit.retry {
                return Ok(commit);
            }
        }
    }

    async fn commit(&self, txn: Txn) -> Result<Commit, Error> {
        let (wire, inserts) = txn.wire();
        let results = self.backend.transact(DB_NAME, &wire).await?;

        for result in &results {
            match result.get("error").and_then(Value::as_str) {
                None => {}
                Some("timed out") => {
                    // A wait guard no longer held: refresh what we touched
                    // and let the caller rebuild against current truth.
                    let tables = txn.tables();
                    let tables: Vec<&str> = tables.iter().map(String::as_str).collect();
                    self.warm_cache(&tables).await?;
                    return Ok(Commit::retry());
                }
                Some(error) => {
                    let details = result
                        .get("details")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    return Err(Error::Rejected(format!("{error}: {details}")));
                }
            }
        }

        let mut assigned = Map::new();
        for (index, named) in inserts {
            if let Some(uuid) = results
                .get(index)
                .and_then(|r| r.get("uuid"))
                .and_then(cache::uuid_of)
            {
                assigned.insert(named, uuid.to_string());
            }
        }

        let mut cache = self.cache.lock().await;
        for op in &txn.ops {
            match op {
                Op::Insert { table, row, named } => {
                    if let Some(uuid) = assigned.get(named) {
                        cache.insert_row(table, uuid.clone(), row.clone());
                    }
                }
                Op::Update { table, uuid, row } => cache.merge_row(table, uuid, row),
                Op::Delete { table, uuid } => cache.remove_row(table, uuid),
                Op::Mutate {
                    table,
                    uuid,
                    column,
                    insert,
                    ids,
                    ..
                } => {
                    let ids: Vec<String> =
                        ids.iter().filter_map(|id| id.resolve(&assigned)).collect();
                    cache.mutate_refs(table, uuid, column, *insert, &ids);
                }
            }
        }

        Ok(Commit {
            retry: false,
            assigned,
        })
    }
}
