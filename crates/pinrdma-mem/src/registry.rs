use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use pinrdma_types::{ProcessId, SessionId};
use serde::{Deserialize, Serialize};

/// Identifies one registered table: the owning process and a per-registry
/// session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub pid: ProcessId,
    pub session: SessionId,
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.session)
    }
}

/// Process-keyed table registry.
///
/// Writers (insert/remove) take the write lock; lookups take the read lock.
/// Keys order by process first, so all tables of one process are adjacent
/// and iterate oldest first.
pub struct TableRegistry<T> {
    tables: RwLock<BTreeMap<TableKey, Arc<T>>>,
    next_session: AtomicU64,
}

impl<T> Default for TableRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TableRegistry<T> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh key for `pid`.
    pub fn next_key(&self, pid: ProcessId) -> TableKey {
        TableKey {
            pid,
            session: SessionId(self.next_session.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Insert a table, returning any previous table under the same key.
    pub fn insert(&self, key: TableKey, table: Arc<T>) -> Option<Arc<T>> {
        self.tables.write().insert(key, table)
    }

    pub fn remove(&self, key: &TableKey) -> Option<Arc<T>> {
        self.tables.write().remove(key)
    }

    pub fn get(&self, key: &TableKey) -> Option<Arc<T>> {
        self.tables.read().get(key).cloned()
    }

    /// The oldest table registered for `pid`.
    pub fn lookup_pid(&self, pid: ProcessId) -> Option<Arc<T>> {
        self.tables
            .read()
            .range(pid_range(pid))
            .next()
            .map(|(_, t)| t.clone())
    }

    pub fn keys_for_pid(&self, pid: ProcessId) -> Vec<TableKey> {
        self.tables.read().range(pid_range(pid)).map(|(k, _)| *k).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}

fn pid_range(pid: ProcessId) -> std::ops::RangeInclusive<TableKey> {
    TableKey { pid, session: SessionId(0) }..=TableKey { pid, session: SessionId(u64::MAX) }
}
