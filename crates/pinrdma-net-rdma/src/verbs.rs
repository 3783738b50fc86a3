//! Transport verbs seam.
//!
//! [`VerbsDevice`] is the subset of the verbs interface a session needs.
//! Resource handles are opaque integers issued by the device; attribute
//! structs and masks follow the verbs layout closely enough that a binding
//! to a real provider is a thin translation.

use std::fmt;
use std::net::Ipv4Addr;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use pinrdma_types::{strong_type, QpNum};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceInfo, PortInfo};

strong_type!(PdHandle, u32);
strong_type!(MrHandle, u32);
strong_type!(CqHandle, u32);
strong_type!(QpHandle, u32);
strong_type!(AhHandle, u32);

/// 128-bit global identifier, raw network byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// IPv4-mapped form used by RoCE v2: `::ffff:a.b.c.d`.
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        let mut raw = [0u8; 16];
        raw[10] = 0xff;
        raw[11] = 0xff;
        raw[12..].copy_from_slice(&addr.octets());
        Gid(raw)
    }

    /// Link-local form `fe80::<interface id>`.
    pub fn link_local(interface_id: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[8..].copy_from_slice(&interface_id.to_be_bytes());
        Gid(raw)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

bitflags! {
    /// Memory region access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1 << 0;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

bitflags! {
    /// Which [`QpAttr`] fields a `modify_qp` call applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QpAttrMask: u32 {
        const STATE = 1 << 0;
        const CUR_STATE = 1 << 1;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const DEST_QPN = 1 << 20;
    }
}

impl QpAttrMask {
    pub const TO_INIT: QpAttrMask = QpAttrMask::STATE
        .union(QpAttrMask::PKEY_INDEX)
        .union(QpAttrMask::PORT)
        .union(QpAttrMask::ACCESS_FLAGS);

    pub const TO_RTR: QpAttrMask = QpAttrMask::STATE
        .union(QpAttrMask::AV)
        .union(QpAttrMask::PATH_MTU)
        .union(QpAttrMask::DEST_QPN)
        .union(QpAttrMask::RQ_PSN)
        .union(QpAttrMask::MAX_DEST_RD_ATOMIC)
        .union(QpAttrMask::MIN_RNR_TIMER);

    pub const TO_RTS: QpAttrMask = QpAttrMask::STATE
        .union(QpAttrMask::TIMEOUT)
        .union(QpAttrMask::RETRY_CNT)
        .union(QpAttrMask::RNR_RETRY)
        .union(QpAttrMask::SQ_PSN)
        .union(QpAttrMask::MAX_QP_RD_ATOMIC);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum QpState {
    Reset = 0,
    Init = 1,
    Rtr = 2,
    Rts = 3,
    Sqd = 4,
    Sqe = 5,
    Error = 6,
}

impl Default for QpState {
    fn default() -> Self {
        QpState::Reset
    }
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QpState::Reset => "RESET",
            QpState::Init => "INIT",
            QpState::Rtr => "RTR",
            QpState::Rts => "RTS",
            QpState::Sqd => "SQD",
            QpState::Sqe => "SQE",
            QpState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu::Mtu1024
    }
}

impl Mtu {
    pub fn from_bytes(bytes: u32) -> Option<Mtu> {
        match bytes {
            256 => Some(Mtu::Mtu256),
            512 => Some(Mtu::Mtu512),
            1024 => Some(Mtu::Mtu1024),
            2048 => Some(Mtu::Mtu2048),
            4096 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    pub fn bytes(self) -> u32 {
        128 << u8::from(self)
    }
}

/// Global routing header fields of an address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector describing the remote end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub grh: Option<GlobalRoute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub pkey_index: u16,
    pub port_num: u8,
    pub access: AccessFlags,
    pub path_mtu: Mtu,
    pub dest_qp_num: QpNum,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub max_dest_rd_atomic: u8,
    pub max_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub ah_attr: AhAttr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Creation attributes for a reliable-connected QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub caps: QpCaps,
    /// Every send work request generates a completion.
    pub sq_sig_all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInfo {
    pub handle: QpHandle,
    pub qpn: QpNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrInfo {
    pub handle: MrHandle,
    pub lkey: u32,
    pub rkey: u32,
}

/// Scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub sge: Sge,
    pub signaled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum WcStatus {
    Success = 0,
    LocLenErr = 1,
    LocQpOpErr = 2,
    LocProtErr = 4,
    WrFlushErr = 5,
    RemInvReqErr = 9,
    RemAccessErr = 10,
    RemOpErr = 11,
    RetryExcErr = 12,
    RnrRetryExcErr = 13,
    GeneralErr = 21,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qpn: QpNum,
}

/// The verb that failed, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerbsOp {
    AllocPd,
    DeallocPd,
    GetDmaMr,
    DeregMr,
    CreateCq,
    DestroyCq,
    CreateQp,
    DestroyQp,
    QueryPort,
    QueryGid,
    ModifyQp,
    CreateAh,
    DestroyAh,
    PostSend,
    PostRecv,
    PollCq,
}

impl fmt::Display for VerbsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerbsOp::AllocPd => "alloc_pd",
            VerbsOp::DeallocPd => "dealloc_pd",
            VerbsOp::GetDmaMr => "get_dma_mr",
            VerbsOp::DeregMr => "dereg_mr",
            VerbsOp::CreateCq => "create_cq",
            VerbsOp::DestroyCq => "destroy_cq",
            VerbsOp::CreateQp => "create_qp",
            VerbsOp::DestroyQp => "destroy_qp",
            VerbsOp::QueryPort => "query_port",
            VerbsOp::QueryGid => "query_gid",
            VerbsOp::ModifyQp => "modify_qp",
            VerbsOp::CreateAh => "create_ah",
            VerbsOp::DestroyAh => "destroy_ah",
            VerbsOp::PostSend => "post_send",
            VerbsOp::PostRecv => "post_recv",
            VerbsOp::PollCq => "poll_cq",
        };
        f.write_str(s)
    }
}

/// A failed verb and the errno the provider reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed with errno {errno}")]
pub struct VerbsError {
    pub op: VerbsOp,
    pub errno: i32,
}

impl VerbsError {
    pub fn new(op: VerbsOp, errno: i32) -> Self {
        Self { op, errno }
    }
}

pub type VerbsResult<T> = Result<T, VerbsError>;

/// One transport-capable device.
pub trait VerbsDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn alloc_pd(&self) -> VerbsResult<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle) -> VerbsResult<()>;

    /// Register a memory region covering all DMA-addressable memory.
    fn get_dma_mr(&self, pd: PdHandle, access: AccessFlags) -> VerbsResult<MrInfo>;
    fn dereg_mr(&self, mr: MrHandle) -> VerbsResult<()>;

    fn create_cq(&self, cqe: u32) -> VerbsResult<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle) -> VerbsResult<()>;

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> VerbsResult<QpInfo>;
    fn destroy_qp(&self, qp: QpHandle) -> VerbsResult<()>;
    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> VerbsResult<()>;

    fn query_port(&self, port_num: u8) -> VerbsResult<PortInfo>;
    fn query_gid(&self, port_num: u8, index: u8) -> VerbsResult<Gid>;

    fn create_ah(&self, pd: PdHandle, attr: &AhAttr) -> VerbsResult<AhHandle>;
    fn destroy_ah(&self, ah: AhHandle) -> VerbsResult<()>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> VerbsResult<()>;
    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> VerbsResult<()>;

    /// Non-blocking; appends at most `max` completions to `out`.
    fn poll_cq(&self, cq: CqHandle, max: usize, out: &mut Vec<WorkCompletion>) -> VerbsResult<usize>;

    /// Largest DMA segment the device accepts, in bytes.
    fn max_segment_size(&self) -> u32 {
        self.info().max_segment_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_forms() {
        let gid = Gid::from_ipv4(Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(gid.to_string(), "0000:0000:0000:0000:0000:ffff:c0a8:0107");
        let ll = Gid::link_local(0x0202_c9ff_fe00_0001);
        assert_eq!(&ll.0[..2], &[0xfe, 0x80]);
        assert!(!ll.is_zero());
        assert!(Gid::default().is_zero());
    }

    #[test]
    fn test_mtu() {
        assert_eq!(Mtu::from_bytes(1024), Some(Mtu::Mtu1024));
        assert_eq!(Mtu::Mtu1024.bytes(), 1024);
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
        assert_eq!(Mtu::from_bytes(1500), None);
    }

    #[test]
    fn test_transition_masks() {
        assert!(QpAttrMask::TO_INIT.contains(QpAttrMask::ACCESS_FLAGS | QpAttrMask::PORT));
        assert!(QpAttrMask::TO_RTR.contains(QpAttrMask::AV | QpAttrMask::DEST_QPN));
        assert!(!QpAttrMask::TO_RTS.contains(QpAttrMask::AV));
    }

    #[test]
    fn test_state_conversions() {
        assert_eq!(u8::from(QpState::Rts), 3);
        assert_eq!(QpState::try_from(2u8).unwrap(), QpState::Rtr);
        assert!(QpState::try_from(9u8).is_err());
        assert_eq!(WcStatus::try_from(10u8).unwrap(), WcStatus::RemAccessErr);
        assert_eq!(QpState::Rtr.to_string(), "RTR");
    }
}
