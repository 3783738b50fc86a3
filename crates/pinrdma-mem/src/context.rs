use std::sync::atomic::{AtomicU64, Ordering};

use pinrdma_types::ProcessId;
use serde::{Deserialize, Serialize};

use crate::error::MemError;

/// Defaults applied to newly created memory contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    /// Pinned-page limit per process, in pages.
    #[serde(default = "default_lock_limit_pages")]
    pub lock_limit_pages: u64,

    /// Whether new contexts may pin past the limit.
    #[serde(default)]
    pub ipc_lock: bool,
}

fn default_lock_limit_pages() -> u64 {
    // 64 MiB of 4 KiB pages.
    16 * 1024
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            lock_limit_pages: default_lock_limit_pages(),
            ipc_lock: false,
        }
    }
}

/// Per-process pinning account.
///
/// Tracks how many pages the process currently has pinned against a lock
/// limit. A process holding the lock-override capability may exceed the
/// limit.
#[derive(Debug)]
pub struct MemoryContext {
    pid: ProcessId,
    pinned: AtomicU64,
    lock_limit_pages: u64,
    ipc_lock: bool,
}

impl MemoryContext {
    pub fn new(pid: ProcessId, lock_limit_pages: u64) -> Self {
        Self {
            pid,
            pinned: AtomicU64::new(0),
            lock_limit_pages,
            ipc_lock: false,
        }
    }

    pub fn from_config(pid: ProcessId, config: &PinConfig) -> Self {
        Self::new(pid, config.lock_limit_pages).with_ipc_lock(config.ipc_lock)
    }

    /// Grant or revoke the capability to pin past the limit.
    pub fn with_ipc_lock(mut self, ipc_lock: bool) -> Self {
        self.ipc_lock = ipc_lock;
        self
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn pinned_pages(&self) -> u64 {
        self.pinned.load(Ordering::Acquire)
    }

    /// Whether this process may pin at all.
    pub fn can_pin(&self) -> bool {
        self.lock_limit_pages > 0 || self.ipc_lock
    }

    /// Reserve `npages` against the limit.
    ///
    /// The add happens first and is rolled back on failure, so two racing
    /// callers can both briefly observe an over-limit total.
    pub(crate) fn charge(&self, npages: u64) -> Result<u64, MemError> {
        let pinned = self.pinned.fetch_add(npages, Ordering::AcqRel) + npages;
        if pinned > self.lock_limit_pages && !self.ipc_lock {
            self.pinned.fetch_sub(npages, Ordering::AcqRel);
            return Err(MemError::ResourceExhausted {
                requested: npages,
                pinned,
                limit: self.lock_limit_pages,
            });
        }
        Ok(pinned)
    }

    pub(crate) fn uncharge(&self, npages: u64) {
        let prev = self.pinned.fetch_sub(npages, Ordering::AcqRel);
        if prev < npages {
            tracing::error!(pid = %self.pid, prev, npages, "pinned page counter underflow");
        }
    }
}
