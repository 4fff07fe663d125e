//! Record Store.
//!
//! Persists [`MemoryRecord`]s to a local SQLite database, one table per
//! [`Partition`], and keeps an in-memory [`VectorIndex`] per partition for
//! retrieval. Opening the database and loading the indexes is deferred until
//! the first operation, so constructing a store costs nothing.
//!
//! # Storage layout
//!
//! Partition tables (`observations`, `actions`, `workflows`) are created on
//! the first insert into that partition:
//!
//! | column      | type    | description                                    |
//! |-------------|---------|------------------------------------------------|
//! | id          | TEXT    | [`MemoryId`] primary key                       |
//! | created_at  | INTEGER | Creation time, microseconds since the epoch    |
//! | kind        | TEXT    | JSON-encoded [`RecordKind`](mneme_types::RecordKind) |
//! | content     | TEXT    | Text the embedding was derived from            |
//! | vector      | BLOB    | Little-endian f32 vector (4 × N bytes)         |
//! | metadata    | TEXT    | JSON object                                    |
//!
//! A separate `mneme_config` table holds named configuration blobs such as
//! the retention tier definitions.
//!
//! # Concurrency
//!
//! Each partition sits behind its own async `RwLock`. Writers hold the write
//! lock while the SQLite statement runs on the blocking pool, then publish
//! the change to the in-memory state, so a record is visible to readers only
//! once it is durable. Batch operations take the locks of every partition
//! they touch in [`Partition::ALL`] order and commit in one transaction.
//!
//! # Example
//!
//! ```rust
//! use mneme_memory::store::RecordStore;
//! use mneme_types::{Metadata, MemoryRecord, RecordKind};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = RecordStore::in_memory(3);
//! let record = MemoryRecord::new(
//!     RecordKind::observation(),
//!     "Settings page is open",
//!     vec![0.1, 0.9, 0.3],
//!     Metadata::new(),
//! );
//! let id = store.insert(record).await.unwrap();
//! assert_eq!(store.get(&id).await.unwrap().content, "Settings page is open");
//! # });
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mneme_types::{Metadata, MemoryId, MemoryRecord, Partition};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tokio::sync::{OnceCell, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use crate::error::MemoryError;
use crate::index::{FlatIndex, IndexFactory, VectorIndex};

const CONFIG_TABLE: &str = "mneme_config";

// ─────────────────────────────────────────────────────────────────────────────
// Row encoding
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// A record flattened into its column values.
struct Row {
    id: String,
    created_at: i64,
    kind: String,
    content: String,
    vector: Vec<u8>,
    metadata: String,
}

impl Row {
    fn encode(record: &MemoryRecord) -> Result<Self, MemoryError> {
        Ok(Self {
            id: record.id.to_string(),
            created_at: record.id.timestamp_micros(),
            kind: serde_json::to_string(&record.kind)?,
            content: record.content.clone(),
            vector: embedding_to_bytes(&record.vector),
            metadata: serde_json::to_string(&record.metadata)?,
        })
    }

    fn decode(self) -> Result<MemoryRecord, MemoryError> {
        let id: MemoryId = self
            .id
            .parse()
            .map_err(|e| MemoryError::InvalidRecord(format!("{e}")))?;
        Ok(MemoryRecord {
            id,
            kind: serde_json::from_str(&self.kind)?,
            content: self.content,
            vector: bytes_to_embedding(&self.vector),
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }

    /// Approximate on-disk footprint, used for size quotas.
    fn size(&self) -> u64 {
        let columns = self.id.len() + self.kind.len() + self.content.len() + self.metadata.len();
        (columns + 8 + self.vector.len()) as u64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQL helpers (run on the blocking pool)
// ─────────────────────────────────────────────────────────────────────────────

fn open_connection(path: Option<&Path>) -> Result<Connection, MemoryError> {
    let conn = match path {
        Some(p) => Connection::open(p)?,
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {CONFIG_TABLE} (
            key        TEXT NOT NULL PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"
    ))?;
    Ok(conn)
}

fn existing_tables(conn: &Connection) -> Result<HashSet<String>, MemoryError> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

fn create_table(conn: &Connection, partition: Partition) -> Result<(), MemoryError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id         TEXT NOT NULL PRIMARY KEY,
            created_at INTEGER NOT NULL,
            kind       TEXT NOT NULL,
            content    TEXT NOT NULL,
            vector     BLOB NOT NULL,
            metadata   TEXT NOT NULL
        );",
        table = partition.table()
    ))?;
    Ok(())
}

fn insert_row(conn: &Connection, partition: Partition, row: &Row) -> Result<(), MemoryError> {
    let sql = format!(
        "INSERT INTO {} (id, created_at, kind, content, vector, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        partition.table()
    );
    conn.execute(
        &sql,
        params![row.id, row.created_at, row.kind, row.content, row.vector, row.metadata],
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => MemoryError::DuplicateId(row.id.clone()),
        _ => MemoryError::from(e),
    })?;
    Ok(())
}

fn delete_rows(
    conn: &mut Connection,
    partition: Partition,
    ids: &[MemoryId],
) -> Result<(), MemoryError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!("DELETE FROM {} WHERE id = ?1", partition.table()))?;
        for id in ids {
            stmt.execute(params![id.as_str()])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn load_partition(
    conn: &Connection,
    partition: Partition,
) -> Result<Vec<(MemoryRecord, u64)>, MemoryError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, created_at, kind, content, vector, metadata FROM {} ORDER BY created_at ASC",
        partition.table()
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(Row {
            id: row.get(0)?,
            created_at: row.get(1)?,
            kind: row.get(2)?,
            content: row.get(3)?,
            vector: row.get(4)?,
            metadata: row.get(5)?,
        })
    })?;
    let mut records = Vec::new();
    for row in rows {
        let row = row?;
        let size = row.size();
        records.push((row.decode()?, size));
    }
    Ok(records)
}

async fn run_blocking<T, F>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T, MemoryError>
where
    F: FnOnce(&mut Connection) -> Result<T, MemoryError> + Send + 'static,
    T: Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn)
    })
    .await?
}

/// Run `write` and then `apply` on one blocking task. The task outlives a
/// dropped caller, so a committed row always reaches the in-memory state.
async fn commit_then_apply<S, W, A>(
    conn: &Arc<Mutex<Connection>>,
    mut state: S,
    write: W,
    apply: A,
) -> Result<(), MemoryError>
where
    S: Send + 'static,
    W: FnOnce(&mut Connection) -> Result<(), MemoryError> + Send + 'static,
    A: FnOnce(&mut S) + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        write(&mut conn)?;
        apply(&mut state);
        Ok(())
    })
    .await?
}

// ─────────────────────────────────────────────────────────────────────────────
// PartitionState
// ─────────────────────────────────────────────────────────────────────────────

struct Stored {
    record: MemoryRecord,
    size: u64,
}

/// In-memory view of one partition: its records in creation order plus the
/// vector index over them.
pub struct PartitionState {
    partition: Partition,
    records: BTreeMap<MemoryId, Stored>,
    index: Box<dyn VectorIndex>,
    bytes: u64,
    total_bytes: Arc<AtomicU64>,
    table_ready: bool,
}

impl PartitionState {
    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get(&self, id: &MemoryId) -> Option<&MemoryRecord> {
        self.records.get(id).map(|s| &s.record)
    }

    /// Estimated footprint of a single record.
    pub fn size_of(&self, id: &MemoryId) -> Option<u64> {
        self.records.get(id).map(|s| s.size)
    }

    /// Records oldest first.
    pub fn records(&self) -> impl DoubleEndedIterator<Item = &MemoryRecord> {
        self.records.values().map(|s| &s.record)
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    fn put(&mut self, record: MemoryRecord, size: u64) {
        self.index.insert(record.id.clone(), record.vector.clone());
        if let Some(old) = self.records.insert(record.id.clone(), Stored { record, size }) {
            self.bytes -= old.size;
            self.total_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.bytes += size;
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn take(&mut self, id: &MemoryId) -> Option<u64> {
        let stored = self.records.remove(id)?;
        self.index.remove(id);
        self.bytes -= stored.size;
        self.total_bytes.fetch_sub(stored.size, Ordering::Relaxed);
        Some(stored.size)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PartitionGuard
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive section over one partition. Inserts into the partition wait
/// until the guard is dropped.
pub struct PartitionGuard {
    state: OwnedRwLockWriteGuard<PartitionState>,
    conn: Arc<Mutex<Connection>>,
}

impl PartitionGuard {
    /// Delete `ids` that are present. Returns `(deleted, freed_bytes)`.
    pub async fn delete(&mut self, ids: &[MemoryId]) -> Result<(usize, u64), MemoryError> {
        let present: Vec<MemoryId> = ids
            .iter()
            .filter(|id| self.state.records.contains_key(*id))
            .cloned()
            .collect();
        if present.is_empty() {
            return Ok((0, 0));
        }
        let partition = self.state.partition;
        let doomed = present.clone();
        run_blocking(&self.conn, move |conn| delete_rows(conn, partition, &doomed)).await?;
        let freed: u64 = present.iter().filter_map(|id| self.state.take(id)).sum();
        Ok((present.len(), freed))
    }
}

impl Deref for PartitionGuard {
    type Target = PartitionState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStore
// ─────────────────────────────────────────────────────────────────────────────

struct Backend {
    conn: Arc<Mutex<Connection>>,
    partitions: [Arc<RwLock<PartitionState>>; 3],
    total_bytes: Arc<AtomicU64>,
}

impl Backend {
    fn slot(&self, partition: Partition) -> &Arc<RwLock<PartitionState>> {
        let idx = match partition {
            Partition::Observation => 0,
            Partition::Action => 1,
            Partition::Workflow => 2,
        };
        &self.partitions[idx]
    }
}

/// Persistent, partitioned collection of memory records.
pub struct RecordStore {
    path: Option<PathBuf>,
    dimension: usize,
    max_bytes: Option<u64>,
    index_factory: Arc<IndexFactory>,
    backend: OnceCell<Backend>,
}

impl RecordStore {
    /// Store backed by the SQLite file at `path` (or memory when `None`).
    /// Nothing is opened until the first operation.
    pub fn new(path: Option<PathBuf>, dimension: usize) -> Self {
        Self {
            path,
            dimension,
            max_bytes: None,
            index_factory: Arc::new(|dim| Box::new(FlatIndex::new(dim)) as Box<dyn VectorIndex>),
            backend: OnceCell::new(),
        }
    }

    pub fn in_memory(dimension: usize) -> Self {
        Self::new(None, dimension)
    }

    /// Hard size cap; inserts beyond it fail with [`MemoryError::QuotaExceeded`].
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Replace the per-partition vector index implementation.
    pub fn with_index_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> Box<dyn VectorIndex> + Send + Sync + 'static,
    {
        self.index_factory = Arc::new(factory);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    /// `true` once the backing database has been opened.
    pub fn is_open(&self) -> bool {
        self.backend.initialized()
    }

    async fn backend(&self) -> Result<&Backend, MemoryError> {
        self.backend.get_or_try_init(|| self.open_backend()).await
    }

    async fn open_backend(&self) -> Result<Backend, MemoryError> {
        let path = self.path.clone();
        let (conn, mut loaded) = tokio::task::spawn_blocking(move || {
            let conn = open_connection(path.as_deref())?;
            let tables = existing_tables(&conn)?;
            let mut loaded = BTreeMap::new();
            for partition in Partition::ALL {
                if tables.contains(partition.table()) {
                    loaded.insert(partition, load_partition(&conn, partition)?);
                }
            }
            Ok::<_, MemoryError>((conn, loaded))
        })
        .await?
        .map_err(|e| match e {
            MemoryError::Sqlite(e) => MemoryError::StorageUnavailable(e.to_string()),
            other => other,
        })?;

        let total_bytes = Arc::new(AtomicU64::new(0));
        let mut states = Vec::with_capacity(Partition::ALL.len());
        for partition in Partition::ALL {
            let mut state = PartitionState {
                partition,
                records: BTreeMap::new(),
                index: (self.index_factory)(self.dimension),
                bytes: 0,
                total_bytes: Arc::clone(&total_bytes),
                table_ready: false,
            };
            if let Some(records) = loaded.remove(&partition) {
                state.table_ready = true;
                for (record, size) in records {
                    if record.vector.len() != self.dimension {
                        return Err(MemoryError::DimensionMismatch {
                            expected: self.dimension,
                            actual: record.vector.len(),
                        });
                    }
                    state.put(record, size);
                }
            }
            states.push(Arc::new(RwLock::new(state)));
        }
        let [obs, act, wf]: [Arc<RwLock<PartitionState>>; 3] = states
            .try_into()
            .map_err(|_| MemoryError::InvalidRecord("partition table layout".into()))?;

        info!(
            path = ?self.path,
            bytes = total_bytes.load(Ordering::Relaxed),
            "record store opened"
        );
        Ok(Backend {
            conn: Arc::new(Mutex::new(conn)),
            partitions: [obs, act, wf],
            total_bytes,
        })
    }

    fn check_record(&self, record: &MemoryRecord) -> Result<(), MemoryError> {
        if record.vector.len() != self.dimension {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: record.vector.len(),
            });
        }
        if record.id.partition() != Some(record.partition()) {
            return Err(MemoryError::InvalidRecord(format!(
                "id {} does not belong to partition {}",
                record.id,
                record.partition()
            )));
        }
        Ok(())
    }

    fn check_quota(&self, backend: &Backend, incoming: u64) -> Result<(), MemoryError> {
        if let Some(limit) = self.max_bytes {
            let used = backend.total_bytes.load(Ordering::Relaxed);
            if used.saturating_add(incoming) > limit {
                return Err(MemoryError::QuotaExceeded { used, limit });
            }
        }
        Ok(())
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Persist one record and make it visible.
    pub async fn insert(&self, record: MemoryRecord) -> Result<MemoryId, MemoryError> {
        self.check_record(&record)?;
        let backend = self.backend().await?;
        let partition = record.partition();
        let state = Arc::clone(backend.slot(partition)).write_owned().await;
        if state.records.contains_key(&record.id) {
            return Err(MemoryError::DuplicateId(record.id.to_string()));
        }
        let row = Row::encode(&record)?;
        let size = row.size();
        self.check_quota(backend, size)?;

        let create = !state.table_ready;
        let id = record.id.clone();
        commit_then_apply(
            &backend.conn,
            state,
            move |conn| {
                if create {
                    create_table(conn, partition)?;
                }
                insert_row(conn, partition, &row)
            },
            move |state| {
                state.table_ready = true;
                state.put(record, size);
            },
        )
        .await?;
        debug!(%id, %partition, "record inserted");
        Ok(id)
    }

    /// Persist many records in one transaction. Either all become visible or
    /// none do.
    pub async fn insert_batch(
        &self,
        records: Vec<MemoryRecord>,
    ) -> Result<Vec<MemoryId>, MemoryError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        for record in &records {
            self.check_record(record)?;
        }
        let backend = self.backend().await?;
        let involved: BTreeSet<Partition> = records.iter().map(MemoryRecord::partition).collect();
        let mut guards: BTreeMap<Partition, OwnedRwLockWriteGuard<PartitionState>> =
            BTreeMap::new();
        for partition in involved {
            let guard = Arc::clone(backend.slot(partition)).write_owned().await;
            guards.insert(partition, guard);
        }

        let mut seen = HashSet::new();
        let mut rows = Vec::with_capacity(records.len());
        let mut sizes = Vec::with_capacity(records.len());
        for record in &records {
            let partition = record.partition();
            let duplicate = guards
                .get(&partition)
                .is_some_and(|g| g.records.contains_key(&record.id));
            if duplicate || !seen.insert(record.id.clone()) {
                return Err(MemoryError::DuplicateId(record.id.to_string()));
            }
            let row = Row::encode(record)?;
            sizes.push(row.size());
            rows.push((partition, row));
        }
        self.check_quota(backend, sizes.iter().sum())?;

        let creates: Vec<Partition> = guards
            .iter()
            .filter(|(_, g)| !g.table_ready)
            .map(|(p, _)| *p)
            .collect();
        let ids: Vec<MemoryId> = records.iter().map(|r| r.id.clone()).collect();
        commit_then_apply(
            &backend.conn,
            guards,
            move |conn| {
                let tx = conn.transaction()?;
                for partition in creates {
                    create_table(&tx, partition)?;
                }
                for (partition, row) in &rows {
                    insert_row(&tx, *partition, row)?;
                }
                tx.commit()?;
                Ok(())
            },
            move |guards| {
                for guard in guards.values_mut() {
                    guard.table_ready = true;
                }
                for (record, size) in records.into_iter().zip(sizes) {
                    if let Some(guard) = guards.get_mut(&record.partition()) {
                        guard.put(record, size);
                    }
                }
            },
        )
        .await?;
        debug!(count = ids.len(), "batch inserted");
        Ok(ids)
    }

    /// Remove a record. Returns `false` when it did not exist.
    pub async fn delete(&self, id: &MemoryId) -> Result<bool, MemoryError> {
        let Some(partition) = id.partition() else {
            return Ok(false);
        };
        let mut guard = self.lock_partition(partition).await?;
        let (deleted, _) = guard.delete(std::slice::from_ref(id)).await?;
        Ok(deleted == 1)
    }

    /// Remove every listed record that exists. Returns how many were removed.
    pub async fn delete_batch(&self, ids: &[MemoryId]) -> Result<usize, MemoryError> {
        let mut by_partition: BTreeMap<Partition, Vec<MemoryId>> = BTreeMap::new();
        for id in ids {
            if let Some(p) = id.partition() {
                by_partition.entry(p).or_default().push(id.clone());
            }
        }
        let backend = self.backend().await?;
        let mut guards = Vec::new();
        for partition in by_partition.keys() {
            guards.push(Arc::clone(backend.slot(*partition)).write_owned().await);
        }
        let plan: Vec<(Partition, Vec<MemoryId>)> = by_partition
            .into_iter()
            .zip(&guards)
            .map(|((p, ids), g)| {
                let present = ids.into_iter().filter(|id| g.records.contains_key(id)).collect();
                (p, present)
            })
            .collect();
        let to_persist = plan.clone();
        run_blocking(&backend.conn, move |conn| {
            let tx = conn.transaction()?;
            for (partition, ids) in &to_persist {
                let sql = format!("DELETE FROM {} WHERE id = ?1", partition.table());
                let mut stmt = tx.prepare(&sql)?;
                for id in ids {
                    stmt.execute(params![id.as_str()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        let mut count = 0;
        for ((_, ids), guard) in plan.iter().zip(guards.iter_mut()) {
            for id in ids {
                if guard.take(id).is_some() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Apply an additive metadata patch and return the updated record.
    pub async fn update_metadata(
        &self,
        id: &MemoryId,
        patch: Metadata,
    ) -> Result<MemoryRecord, MemoryError> {
        let partition = id
            .partition()
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let backend = self.backend().await?;
        let mut state = backend.slot(partition).write().await;
        let mut record = state
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        record.metadata.merge(patch)?;

        let row = Row::encode(&record)?;
        let size = row.size();
        run_blocking(&backend.conn, move |conn| {
            conn.execute(
                &format!("UPDATE {} SET metadata = ?1 WHERE id = ?2", partition.table()),
                params![row.metadata, row.id],
            )?;
            Ok(())
        })
        .await?;
        state.put(record.clone(), size);
        Ok(record)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub async fn get(&self, id: &MemoryId) -> Result<MemoryRecord, MemoryError> {
        let partition = id
            .partition()
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        let backend = self.backend().await?;
        let state = backend.slot(partition).read().await;
        state
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    pub async fn count(&self, partition: Partition) -> Result<usize, MemoryError> {
        let backend = self.backend().await?;
        Ok(backend.slot(partition).read().await.len())
    }

    /// Estimated bytes used by one partition.
    pub async fn size_estimate(&self, partition: Partition) -> Result<u64, MemoryError> {
        let backend = self.backend().await?;
        Ok(backend.slot(partition).read().await.bytes())
    }

    /// Estimated bytes used across all partitions.
    pub async fn total_size(&self) -> Result<u64, MemoryError> {
        let backend = self.backend().await?;
        Ok(backend.total_bytes.load(Ordering::Relaxed))
    }

    /// Shared read access to a partition, suitable for moving onto the
    /// blocking pool.
    pub async fn read_partition(
        &self,
        partition: Partition,
    ) -> Result<OwnedRwLockReadGuard<PartitionState>, MemoryError> {
        let backend = self.backend().await?;
        Ok(Arc::clone(backend.slot(partition)).read_owned().await)
    }

    /// Exclusive section over one partition.
    pub async fn lock_partition(
        &self,
        partition: Partition,
    ) -> Result<PartitionGuard, MemoryError> {
        let backend = self.backend().await?;
        Ok(PartitionGuard {
            state: Arc::clone(backend.slot(partition)).write_owned().await,
            conn: Arc::clone(&backend.conn),
        })
    }

    /// Exclusive sections over every partition, acquired in
    /// [`Partition::ALL`] order.
    pub async fn lock_all(&self) -> Result<Vec<PartitionGuard>, MemoryError> {
        let mut guards = Vec::with_capacity(Partition::ALL.len());
        for partition in Partition::ALL {
            guards.push(self.lock_partition(partition).await?);
        }
        Ok(guards)
    }

    // ── Configuration blobs ──────────────────────────────────────────────────

    pub async fn load_blob(&self, key: &str) -> Result<Option<String>, MemoryError> {
        let backend = self.backend().await?;
        let key = key.to_string();
        run_blocking(&backend.conn, move |conn| {
            let value = conn
                .query_row(
                    &format!("SELECT value FROM {CONFIG_TABLE} WHERE key = ?1"),
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn save_blob(&self, key: &str, value: String) -> Result<(), MemoryError> {
        let backend = self.backend().await?;
        let key = key.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        run_blocking(&backend.conn, move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {CONFIG_TABLE} (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE
                     SET value = excluded.value, updated_at = excluded.updated_at"
                ),
                params![key, value, now],
            )?;
            Ok(())
        })
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use mneme_types::{ActionSpec, RecordKind, keys};

    fn obs(content: &str, vector: Vec<f32>) -> MemoryRecord {
        MemoryRecord::new(RecordKind::observation(), content, vector, Metadata::new())
    }

    fn act(content: &str, vector: Vec<f32>) -> MemoryRecord {
        let kind = RecordKind::Action {
            action: ActionSpec::new("click"),
            success: true,
        };
        MemoryRecord::new(kind, content, vector, Metadata::new())
    }

    // ── row encoding ─────────────────────────────────────────────────────────

    #[test]
    fn embedding_bytes_roundtrip() {
        let original = vec![1.5f32, -0.25, 0.0, 42.0];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&original)), original);
    }

    #[test]
    fn row_decode_restores_record() {
        let record = act("clicked save", vec![0.5, 0.5]);
        let decoded = Row::encode(&record).unwrap().decode().unwrap();
        assert_eq!(decoded, record);
    }

    // ── lazy open ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn construction_does_not_open_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy.db");
        let store = RecordStore::new(Some(path.clone()), 2);
        assert!(!store.is_open());
        assert!(!path.exists());
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 0);
        assert!(store.is_open());
    }

    #[tokio::test]
    async fn partition_tables_are_created_on_first_insert() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.db");
        let store = RecordStore::new(Some(path.clone()), 2);
        store.insert(obs("first", vec![1.0, 0.0])).await.unwrap();
        drop(store);

        let conn = Connection::open(&path).unwrap();
        let tables = existing_tables(&conn).unwrap();
        assert!(tables.contains("observations"));
        assert!(!tables.contains("actions"));
        assert!(tables.contains(CONFIG_TABLE));
    }

    #[tokio::test]
    async fn unopenable_path_is_storage_unavailable() {
        let store = RecordStore::new(Some(PathBuf::from("/nonexistent-dir/deeper/mneme.db")), 2);
        let err = store.insert(obs("x", vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, MemoryError::StorageUnavailable(_)));
    }

    // ── insert / get / delete ────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_then_get_returns_record() {
        let store = RecordStore::in_memory(2);
        let record = obs("login page", vec![1.0, 0.0]);
        let id = store.insert(record.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), record);
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 1);
        assert!(store.size_estimate(Partition::Observation).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn abandoned_insert_is_still_visible_once_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abandoned.db");
        let store = RecordStore::new(Some(path.clone()), 2);
        store.insert(obs("opens the backend", vec![1.0, 0.0])).await.unwrap();

        let single = obs("dropped mid-commit", vec![0.0, 1.0]);
        let batch = vec![act("batch one", vec![0.6, 0.8]), act("batch two", vec![0.8, 0.6])];
        let _ = tokio::time::timeout(Duration::ZERO, store.insert(single)).await;
        let _ = tokio::time::timeout(Duration::ZERO, store.insert_batch(batch)).await;

        // Whatever reached disk is also in memory.
        let observations = store.count(Partition::Observation).await.unwrap();
        let actions = store.count(Partition::Action).await.unwrap();
        assert_eq!((observations, actions), (2, 2));
        drop(store);
        let reopened = RecordStore::new(Some(path), 2);
        assert_eq!(reopened.count(Partition::Observation).await.unwrap(), observations);
        assert_eq!(reopened.count(Partition::Action).await.unwrap(), actions);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = RecordStore::in_memory(2);
        let record = obs("a", vec![1.0, 0.0]);
        store.insert(record.clone()).await.unwrap();
        let err = store.insert(record).await.unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let store = RecordStore::in_memory(3);
        let err = store.insert(obs("a", vec![1.0])).await.unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { expected: 3, actual: 1 }));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = RecordStore::in_memory(2);
        let id = MemoryId::generate(Partition::Workflow);
        assert!(matches!(store.get(&id).await, Err(MemoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = RecordStore::in_memory(2);
        let id = store.insert(obs("a", vec![1.0, 0.0])).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert_eq!(store.size_estimate(Partition::Observation).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_batch_counts_only_present_records() {
        let store = RecordStore::in_memory(2);
        let a = store.insert(obs("a", vec![1.0, 0.0])).await.unwrap();
        let b = store.insert(act("b", vec![0.0, 1.0])).await.unwrap();
        let ghost = MemoryId::generate(Partition::Observation);
        assert_eq!(store.delete_batch(&[a, b, ghost]).await.unwrap(), 2);
        assert_eq!(store.total_size().await.unwrap(), 0);
    }

    // ── batches ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn batch_spans_partitions() {
        let store = RecordStore::in_memory(2);
        let ids = store
            .insert_batch(vec![obs("a", vec![1.0, 0.0]), act("b", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 1);
        assert_eq!(store.count(Partition::Action).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_batch_leaves_nothing_visible() {
        let store = RecordStore::in_memory(2);
        let existing = obs("existing", vec![1.0, 0.0]);
        store.insert(existing.clone()).await.unwrap();
        let fresh = obs("fresh", vec![0.0, 1.0]);
        let err = store
            .insert_batch(vec![fresh.clone(), existing])
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateId(_)));
        assert!(matches!(store.get(&fresh.id).await, Err(MemoryError::NotFound(_))));
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn quota_rejects_oversized_insert() {
        let store = RecordStore::in_memory(2).with_max_bytes(200);
        store.insert(obs("small", vec![1.0, 0.0])).await.unwrap();
        let err = store
            .insert(obs(&"x".repeat(500), vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::QuotaExceeded { limit: 200, .. }));
    }

    // ── persistence ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let aged = MemoryRecord {
            id: MemoryId::generate_at(Partition::Observation, Utc::now() - ChronoDuration::days(3)),
            ..obs("aged", vec![0.0, 1.0])
        };
        let id = {
            let store = RecordStore::new(Some(path.clone()), 2);
            store.insert(aged.clone()).await.unwrap();
            store.insert(obs("kept", vec![1.0, 0.0])).await.unwrap()
        };
        let store = RecordStore::new(Some(path), 2);
        assert_eq!(store.get(&id).await.unwrap().content, "kept");
        assert_eq!(store.get(&aged.id).await.unwrap().created_at(), aged.created_at());
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reopen_with_other_dimension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim.db");
        RecordStore::new(Some(path.clone()), 2)
            .insert(obs("a", vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = RecordStore::new(Some(path), 3).count(Partition::Observation).await.unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn metadata_patch_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.db");
        let id = {
            let store = RecordStore::new(Some(path.clone()), 2);
            let id = store.insert(obs("a", vec![1.0, 0.0])).await.unwrap();
            let updated = store
                .update_metadata(&id, Metadata::new().with(keys::PINNED, true))
                .await
                .unwrap();
            assert!(updated.is_pinned());
            id
        };
        let store = RecordStore::new(Some(path), 2);
        assert!(store.get(&id).await.unwrap().is_pinned());
    }

    #[tokio::test]
    async fn blobs_roundtrip() {
        let store = RecordStore::in_memory(2);
        assert_eq!(store.load_blob("retention").await.unwrap(), None);
        store.save_blob("retention", "{\"a\":1}".into()).await.unwrap();
        store.save_blob("retention", "{\"a\":2}".into()).await.unwrap();
        assert_eq!(store.load_blob("retention").await.unwrap().as_deref(), Some("{\"a\":2}"));
    }

    // ── exclusive sections ───────────────────────────────────────────────────

    #[tokio::test]
    async fn partition_guard_deletes_and_blocks_writers() {
        let store = Arc::new(RecordStore::in_memory(2));
        let id = store.insert(obs("a", vec![1.0, 0.0])).await.unwrap();
        let mut guard = store.lock_partition(Partition::Observation).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.insert(obs("b", vec![0.0, 1.0])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        let (deleted, freed) = guard.delete(&[id.clone()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(freed > 0);
        drop(guard);

        writer.await.unwrap().unwrap();
        assert_eq!(store.count(Partition::Observation).await.unwrap(), 1);
        assert!(matches!(store.get(&id).await, Err(MemoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn custom_index_factory_is_used() {
        let store = RecordStore::in_memory(2)
            .with_index_factory(|dim| Box::new(FlatIndex::new(dim)) as Box<dyn VectorIndex>);
        store.insert(obs("a", vec![1.0, 0.0])).await.unwrap();
        let state = store.read_partition(Partition::Observation).await.unwrap();
        assert_eq!(state.index().len(), 1);
    }
}
