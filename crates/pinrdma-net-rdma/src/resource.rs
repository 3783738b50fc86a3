//! Owned verbs resources.
//!
//! Each guard releases its resource on drop. A [`ConnectionContext`] holds
//! them in fields declared in teardown order, so an early return at any
//! setup step unwinds exactly what was acquired, newest first.
//!
//! [`ConnectionContext`]: crate::connection::ConnectionContext

use std::sync::Arc;

use pinrdma_mem::{DmaMapping, MemorySubsystem, ScatterGatherTable, SgBuilder};
use pinrdma_types::{Iova, QpNum};

use crate::verbs::{AhAttr, AhHandle, CqHandle, MrHandle, MrInfo, PdHandle, QpHandle, QpInfo, VerbsDevice, VerbsError};

pub struct PdGuard {
    device: Arc<dyn VerbsDevice>,
    pd: PdHandle,
}

impl PdGuard {
    pub fn alloc(device: Arc<dyn VerbsDevice>) -> Result<Self, VerbsError> {
        let pd = device.alloc_pd()?;
        Ok(Self { device, pd })
    }

    pub fn handle(&self) -> PdHandle {
        self.pd
    }
}

impl Drop for PdGuard {
    fn drop(&mut self) {
        if let Err(e) = self.device.dealloc_pd(self.pd) {
            tracing::warn!(pd = %self.pd, error = %e, "failed to deallocate protection domain");
        }
    }
}

pub struct MrGuard {
    device: Arc<dyn VerbsDevice>,
    mr: MrInfo,
}

impl MrGuard {
    pub fn new(device: Arc<dyn VerbsDevice>, mr: MrInfo) -> Self {
        Self { device, mr }
    }

    pub fn handle(&self) -> MrHandle {
        self.mr.handle
    }

    pub fn lkey(&self) -> u32 {
        self.mr.lkey
    }
}

impl Drop for MrGuard {
    fn drop(&mut self) {
        if let Err(e) = self.device.dereg_mr(self.mr.handle) {
            tracing::warn!(mr = %self.mr.handle, error = %e, "failed to deregister memory region");
        }
    }
}

pub struct CqGuard {
    device: Arc<dyn VerbsDevice>,
    cq: CqHandle,
}

impl CqGuard {
    pub fn create(device: Arc<dyn VerbsDevice>, cqe: u32) -> Result<Self, VerbsError> {
        let cq = device.create_cq(cqe)?;
        Ok(Self { device, cq })
    }

    pub fn handle(&self) -> CqHandle {
        self.cq
    }
}

impl Drop for CqGuard {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_cq(self.cq) {
            tracing::warn!(cq = %self.cq, error = %e, "failed to destroy completion queue");
        }
    }
}

pub struct QpGuard {
    device: Arc<dyn VerbsDevice>,
    qp: QpInfo,
}

impl QpGuard {
    pub fn new(device: Arc<dyn VerbsDevice>, qp: QpInfo) -> Self {
        Self { device, qp }
    }

    pub fn handle(&self) -> QpHandle {
        self.qp.handle
    }

    pub fn qpn(&self) -> QpNum {
        self.qp.qpn
    }
}

impl Drop for QpGuard {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_qp(self.qp.handle) {
            tracing::warn!(qpn = %self.qp.qpn, error = %e, "failed to destroy queue pair");
        }
    }
}

/// Transient address handle; only lives long enough to validate an address
/// vector before the RTR transition.
pub struct AhGuard {
    device: Arc<dyn VerbsDevice>,
    ah: Option<AhHandle>,
}

impl AhGuard {
    pub fn create(device: Arc<dyn VerbsDevice>, pd: PdHandle, attr: &AhAttr) -> Result<Self, VerbsError> {
        let ah = device.create_ah(pd, attr)?;
        Ok(Self { device, ah: Some(ah) })
    }

    /// Destroy now and report the result.
    pub fn destroy(mut self) -> Result<(), VerbsError> {
        match self.ah.take() {
            Some(ah) => self.device.destroy_ah(ah),
            None => Ok(()),
        }
    }
}

impl Drop for AhGuard {
    fn drop(&mut self) {
        if let Some(ah) = self.ah.take() {
            if let Err(e) = self.device.destroy_ah(ah) {
                tracing::warn!(ah = %ah, error = %e, "failed to destroy address handle");
            }
        }
    }
}

/// A live DMA mapping of a scatter-gather table.
pub struct DmaGuard {
    mem: Arc<dyn MemorySubsystem>,
    mapping: DmaMapping,
}

impl DmaGuard {
    pub fn new(mem: Arc<dyn MemorySubsystem>, mapping: DmaMapping) -> Self {
        Self { mem, mapping }
    }

    pub fn mapping(&self) -> &DmaMapping {
        &self.mapping
    }

    pub fn first_address(&self) -> Option<Iova> {
        self.mapping.first_address()
    }
}

impl Drop for DmaGuard {
    fn drop(&mut self) {
        self.mem.unmap_dma(&self.mapping);
    }
}

/// A registered scatter-gather table owned by a session.
///
/// Dropping the guard unregisters the table and releases its pages, unless
/// [`persist`](Self::persist) was called: a table that carried a completed
/// transfer stays registered until the owner releases it explicitly.
pub struct TableGuard {
    builder: Arc<SgBuilder>,
    table: Arc<ScatterGatherTable>,
    keep: bool,
}

impl TableGuard {
    pub fn new(builder: Arc<SgBuilder>, table: Arc<ScatterGatherTable>) -> Self {
        Self { builder, table, keep: false }
    }

    pub fn table(&self) -> &Arc<ScatterGatherTable> {
        &self.table
    }

    pub fn memory(&self) -> &Arc<dyn MemorySubsystem> {
        self.builder.memory()
    }

    pub fn persist(&mut self) {
        self.keep = true;
    }
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = self.builder.release(&self.table) {
            tracing::warn!(table = %self.table.key(), error = %e, "scatter-gather table already released");
        }
    }
}
