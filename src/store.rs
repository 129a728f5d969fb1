// 🗄️ Document Store - the persistence collaborator
//
// The core only needs a handful of document operations: point reads,
// filtered reads, change subscriptions, partial-field patches and
// append-only child records. `SqliteStore` implements them on top of a
// single SQLite file (WAL mode) holding JSON documents.
//
// Subscriptions are in-process: after every document write the store
// re-runs each subscription on that collection and hands it the full
// current match set.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub const CLIENTS: &str = "clients";
pub const WORKPLACES: &str = "workplaces";
pub const ACTIVITY_LOGS: &str = "activity_logs";
pub const STAGE_EVENTS: &str = "stage_events";

/// A stored document: a JSON object
pub type Record = Map<String, Value>;

pub type Predicate = Box<dyn Fn(&Record) -> bool + Send>;
pub type OnChange = Box<dyn FnMut(&[Record]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

// ============================================================================
// STORE TRAIT
// ============================================================================

pub trait Store {
    /// Point read; `None` when the document does not exist
    fn get_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Every document in `collection` matching `predicate`
    fn query(&self, collection: &str, predicate: &dyn Fn(&Record) -> bool) -> StoreResult<Vec<Record>>;

    /// Deliver the current match set now and after every change to `collection`.
    ///
    /// `on_change` must not call back into `subscribe`/`unsubscribe`.
    fn subscribe(
        &self,
        collection: &str,
        predicate: Predicate,
        on_change: OnChange,
    ) -> StoreResult<Subscription>;

    /// Returns false when the subscription was already gone
    fn unsubscribe(&self, subscription: Subscription) -> StoreResult<bool>;

    /// Create or fully replace a document
    fn put(&self, collection: &str, id: &str, record: Record) -> StoreResult<()>;

    /// Merge `fields` into an existing document; `null` removes a field
    fn patch(&self, collection: &str, id: &str, fields: Record) -> StoreResult<()>;

    /// Patch a document and append a child under it as one atomic write.
    ///
    /// Either both land or neither does. Returns the child id.
    fn patch_with_child(
        &self,
        collection: &str,
        id: &str,
        fields: Record,
        child_collection: &str,
        child: Record,
    ) -> StoreResult<String>;

    /// Append a child record under `parent_id`, returning the child id
    fn append(&self, collection: &str, parent_id: &str, record: Record) -> StoreResult<String>;

    /// Children of `parent_id`, oldest first
    fn children(&self, collection: &str, parent_id: &str) -> StoreResult<Vec<Record>>;
}

// ============================================================================
// SQLITE STORE
// ============================================================================

struct SubscriptionEntry {
    id: Subscription,
    collection: String,
    predicate: Predicate,
    on_change: OnChange,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    next_subscription: Mutex<u64>,
}

impl SqliteStore {
    /// Open (or create) a store file
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        // Enable WAL mode for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        info!(path = %path.as_ref().display(), "store opened");
        SqliteStore::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        SqliteStore::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        setup_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription: Mutex::new(1),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(format!("connection: {}", e)))
    }

    fn subscriptions(&self) -> StoreResult<MutexGuard<'_, Vec<SubscriptionEntry>>> {
        self.subscriptions
            .lock()
            .map_err(|e| StoreError::Lock(format!("subscriptions: {}", e)))
    }

    fn load_collection(&self, collection: &str) -> StoreResult<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM documents
             WHERE collection = ?1
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| decode(json))
            .collect::<StoreResult<Vec<_>>>()
    }

    fn write_document(&self, collection: &str, id: &str, record: &Record) -> StoreResult<()> {
        upsert_document(&*self.conn()?, collection, id, record)
    }

    fn notify(&self, collection: &str) -> StoreResult<()> {
        let mut subscriptions = self.subscriptions()?;
        if !subscriptions.iter().any(|s| s.collection == collection) {
            return Ok(());
        }

        let documents = self.load_collection(collection)?;
        for entry in subscriptions.iter_mut().filter(|s| s.collection == collection) {
            let matches: Vec<Record> = documents
                .iter()
                .filter(|r| (entry.predicate)(*r))
                .cloned()
                .collect();
            debug!(collection, subscription = entry.id.0, matches = matches.len(), "subscription refreshed");
            (entry.on_change)(&matches);
        }

        Ok(())
    }
}

impl Store for SqliteStore {
    fn get_by_id(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        read_document(&*self.conn()?, collection, id)
    }

    fn query(&self, collection: &str, predicate: &dyn Fn(&Record) -> bool) -> StoreResult<Vec<Record>> {
        Ok(self
            .load_collection(collection)?
            .into_iter()
            .filter(|r| predicate(r))
            .collect())
    }

    fn subscribe(
        &self,
        collection: &str,
        predicate: Predicate,
        mut on_change: OnChange,
    ) -> StoreResult<Subscription> {
        let initial = self.query(collection, &*predicate)?;
        on_change(&initial);

        let id = {
            let mut next = self
                .next_subscription
                .lock()
                .map_err(|e| StoreError::Lock(format!("subscription counter: {}", e)))?;
            let id = Subscription(*next);
            *next += 1;
            id
        };

        self.subscriptions()?.push(SubscriptionEntry {
            id,
            collection: collection.to_string(),
            predicate,
            on_change,
        });

        debug!(collection, subscription = id.0, "subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, subscription: Subscription) -> StoreResult<bool> {
        let mut subscriptions = self.subscriptions()?;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != subscription);
        Ok(subscriptions.len() != before)
    }

    fn put(&self, collection: &str, id: &str, record: Record) -> StoreResult<()> {
        self.write_document(collection, id, &record)?;
        self.notify(collection)
    }

    fn patch(&self, collection: &str, id: &str, fields: Record) -> StoreResult<()> {
        {
            let conn = self.conn()?;
            let record = merged(&conn, collection, id, fields)?;
            upsert_document(&conn, collection, id, &record)?;
        }
        self.notify(collection)
    }

    fn patch_with_child(
        &self,
        collection: &str,
        id: &str,
        fields: Record,
        child_collection: &str,
        child: Record,
    ) -> StoreResult<String> {
        let child_id = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;

            let record = merged(&tx, collection, id, fields)?;
            upsert_document(&tx, collection, id, &record)?;
            let child_id = insert_child(&tx, child_collection, id, &child)?;

            tx.commit()?;
            child_id
        };

        self.notify(collection)?;
        Ok(child_id)
    }

    fn append(&self, collection: &str, parent_id: &str, record: Record) -> StoreResult<String> {
        insert_child(&*self.conn()?, collection, parent_id, &record)
    }

    fn children(&self, collection: &str, parent_id: &str) -> StoreResult<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM children
             WHERE collection = ?1 AND parent_id = ?2
             ORDER BY seq",
        )?;

        let rows = stmt
            .query_map(params![collection, parent_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter().map(|json| decode(json)).collect()
    }
}

fn decode(json: &str) -> StoreResult<Record> {
    Ok(serde_json::from_str(json)?)
}

// ============================================================================
// SQL HELPERS (shared by plain and transactional writes)
// ============================================================================

fn read_document(conn: &Connection, collection: &str, id: &str) -> StoreResult<Option<Record>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;

    data.map(|json| decode(&json)).transpose()
}

/// Existing document with `fields` merged in; `null` removes a field
fn merged(conn: &Connection, collection: &str, id: &str, fields: Record) -> StoreResult<Record> {
    let mut record = read_document(conn, collection, id)?.ok_or_else(|| StoreError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    })?;

    for (key, value) in fields {
        if value.is_null() {
            record.remove(&key);
        } else {
            record.insert(key, value);
        }
    }

    Ok(record)
}

fn upsert_document(conn: &Connection, collection: &str, id: &str, record: &Record) -> StoreResult<()> {
    let data = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO documents (collection, id, data, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![collection, id, data, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn insert_child(conn: &Connection, collection: &str, parent_id: &str, record: &Record) -> StoreResult<String> {
    let child_id = uuid::Uuid::new_v4().to_string();
    let data = serde_json::to_string(record)?;

    conn.execute(
        "INSERT INTO children (id, collection, parent_id, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![child_id, collection, parent_id, data, Utc::now().to_rfc3339()],
    )?;

    Ok(child_id)
}

fn setup_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        )",
        [],
    )?;

    // Append-only children (activity logs, stage events)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS children (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            collection TEXT NOT NULL,
            parent_id TEXT NOT NULL,
            data TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_children_parent ON children(collection, parent_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_put_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put(CLIENTS, "c-1", record(json!({ "id": "c-1", "stage": "inquiry" })))
            .unwrap();

        let doc = store.get_by_id(CLIENTS, "c-1").unwrap().unwrap();
        assert_eq!(doc["stage"], "inquiry");

        assert!(store.get_by_id(CLIENTS, "missing").unwrap().is_none());
        assert!(store.get_by_id(WORKPLACES, "c-1").unwrap().is_none());
    }

    #[test]
    fn test_query_with_predicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(CLIENTS, "a", record(json!({ "stage": "closed" }))).unwrap();
        store.put(CLIENTS, "b", record(json!({ "stage": "trial" }))).unwrap();
        store.put(CLIENTS, "c", record(json!({ "stage": "closed" }))).unwrap();

        let closed = store.query(CLIENTS, &|r: &Record| r["stage"] == "closed").unwrap();
        assert_eq!(closed.len(), 2);

        let all = store.query(CLIENTS, &|_: &Record| true).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_patch_merges_and_removes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put(CLIENTS, "a", record(json!({ "status": "lead-new", "name": "A" })))
            .unwrap();

        store
            .patch(CLIENTS, "a", record(json!({ "stage": "interview", "status": null })))
            .unwrap();

        let doc = store.get_by_id(CLIENTS, "a").unwrap().unwrap();
        assert_eq!(doc["stage"], "interview");
        assert_eq!(doc["name"], "A");
        assert!(doc.get("status").is_none());
    }

    #[test]
    fn test_patch_missing_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .patch(CLIENTS, "ghost", record(json!({ "stage": "trial" })))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_subscription_delivers_full_match_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(CLIENTS, "a", record(json!({ "stage": "trial" }))).unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let sub = store
            .subscribe(
                CLIENTS,
                Box::new(|r: &Record| r["stage"] == "trial"),
                Box::new(move |records: &[Record]| sink.lock().unwrap().push(records.len())),
            )
            .unwrap();

        store.put(CLIENTS, "b", record(json!({ "stage": "trial" }))).unwrap();
        store.patch(CLIENTS, "a", record(json!({ "stage": "closed" }))).unwrap();
        // Other collections don't trigger
        store.put(WORKPLACES, "main_office", record(json!({ "capacity": 10 }))).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 1]);

        assert!(store.unsubscribe(sub).unwrap());
        assert!(!store.unsubscribe(sub).unwrap());

        store.put(CLIENTS, "c", record(json!({ "stage": "trial" }))).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_append_children_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();

        let first = store
            .append(ACTIVITY_LOGS, "c-1", record(json!({ "type": "call", "content": "1" })))
            .unwrap();
        store
            .append(ACTIVITY_LOGS, "c-1", record(json!({ "type": "visit", "content": "2" })))
            .unwrap();
        store
            .append(ACTIVITY_LOGS, "c-2", record(json!({ "type": "call", "content": "x" })))
            .unwrap();

        assert!(!first.is_empty());

        let logs = store.children(ACTIVITY_LOGS, "c-1").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["content"], "1");
        assert_eq!(logs[1]["content"], "2");

        assert!(store.children(STAGE_EVENTS, "c-1").unwrap().is_empty());
    }

    #[test]
    fn test_patch_with_child_writes_both() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(CLIENTS, "a", record(json!({ "stage": "trial" }))).unwrap();

        store
            .patch_with_child(
                CLIENTS,
                "a",
                record(json!({ "stage": "pre_contract" })),
                STAGE_EVENTS,
                record(json!({ "from": "trial", "to": "pre_contract" })),
            )
            .unwrap();

        let doc = store.get_by_id(CLIENTS, "a").unwrap().unwrap();
        assert_eq!(doc["stage"], "pre_contract");
        let events = store.children(STAGE_EVENTS, "a").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["to"], "pre_contract");
    }

    #[test]
    fn test_patch_with_child_rolls_back_when_child_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(CLIENTS, "a", record(json!({ "stage": "trial" }))).unwrap();

        let calls = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&calls);
        store
            .subscribe(
                CLIENTS,
                Box::new(|_: &Record| true),
                Box::new(move |_: &[Record]| *sink.lock().unwrap() += 1),
            )
            .unwrap();

        store.conn().unwrap().execute("DROP TABLE children", []).unwrap();

        let result = store.patch_with_child(
            CLIENTS,
            "a",
            record(json!({ "stage": "pre_contract" })),
            STAGE_EVENTS,
            record(json!({ "from": "trial", "to": "pre_contract" })),
        );
        assert!(matches!(result, Err(StoreError::Sqlite(_))));

        let doc = store.get_by_id(CLIENTS, "a").unwrap().unwrap();
        assert_eq!(doc["stage"], "trial");
        // Only the initial delivery; a failed write notifies nobody
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_patch_with_child_missing_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .patch_with_child(
                CLIENTS,
                "ghost",
                record(json!({ "stage": "trial" })),
                STAGE_EVENTS,
                record(json!({})),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.children(STAGE_EVENTS, "ghost").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("funnel.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(CLIENTS, "a", record(json!({ "stage": "trial" }))).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let doc = store.get_by_id(CLIENTS, "a").unwrap().unwrap();
        assert_eq!(doc["stage"], "trial");
    }
}
