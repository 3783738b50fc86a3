use pinrdma_types::{MemCode, Pfn, ProcessId, Status, StatusCode};
use thiserror::Error;

use crate::registry::TableKey;

/// Errors from pinning, table construction and DMA mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("address range overflows: addr={addr:#x} len={len}")]
    RangeOverflow { addr: u64, len: u64 },

    /// The caller has no lock quota and no override capability.
    #[error("process {0} may not pin memory")]
    PermissionDenied(ProcessId),

    #[error("pinned page quota exceeded: requested {requested}, would reach {pinned} of {limit}")]
    ResourceExhausted {
        requested: u64,
        pinned: u64,
        limit: u64,
    },

    #[error("no page mapped at {addr:#x}")]
    InvalidAddress { addr: u64 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("DMA mapping failed: {0}")]
    DmaMapFailed(String),

    #[error("cannot map frame {0} into the address space")]
    KmapFailed(Pfn),

    #[error("no table registered for {0}")]
    NotRegistered(TableKey),

    #[error("table {0} has been released")]
    Released(TableKey),
}

impl MemError {
    pub fn code(&self) -> pinrdma_types::status_code_t {
        match self {
            MemError::InvalidArgument(_) => StatusCode::INVALID_ARG,
            MemError::RangeOverflow { .. } => MemCode::RANGE_OVERFLOW,
            MemError::PermissionDenied(_) => MemCode::PERMISSION_DENIED,
            MemError::ResourceExhausted { .. } => MemCode::RESOURCE_EXHAUSTED,
            MemError::InvalidAddress { .. } => MemCode::INVALID_ADDRESS,
            MemError::OutOfMemory(_) => MemCode::OUT_OF_MEMORY,
            MemError::DmaMapFailed(_) => MemCode::DMA_MAP_FAILED,
            MemError::KmapFailed(_) => MemCode::KMAP_FAILED,
            MemError::NotRegistered(_) | MemError::Released(_) => MemCode::TABLE_NOT_FOUND,
        }
    }
}

impl From<&MemError> for Status {
    fn from(err: &MemError) -> Self {
        Status::with_message(err.code(), err.to_string())
    }
}

impl From<MemError> for Status {
    fn from(err: MemError) -> Self {
        Status::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = MemError::ResourceExhausted { requested: 4, pinned: 10, limit: 8 };
        let status = Status::from(&err);
        assert_eq!(status.code(), MemCode::RESOURCE_EXHAUSTED);
        assert!(status.message().contains("quota"));

        let status: Status = MemError::PermissionDenied(ProcessId(7)).into();
        assert_eq!(status.code(), MemCode::PERMISSION_DENIED);
    }
}
