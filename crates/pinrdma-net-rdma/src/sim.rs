//! In-process fabric implementing [`VerbsDevice`].
//!
//! Devices created from one [`SimFabric`] share a queue-pair namespace, so a
//! send posted on one device is matched against receives posted on the peer
//! QP named by its RTR destination. Payload moves through the shared
//! [`SimMemory`] DMA space. Faults are armed per device with
//! [`SimFabric::inject`] and fire once.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pinrdma_mem::sim::{EventLog, SimMemory};
use pinrdma_types::{Iova, QpNum};
use tokio::io::DuplexStream;

use crate::control::{ControlConnector, ControlStream, Role};
use crate::device::{DeviceInfo, LinkLayer, PortInfo, PortState};
use crate::error::RdmaError;
use crate::verbs::{
    AccessFlags, AhAttr, AhHandle, CqHandle, Gid, MrHandle, MrInfo, PdHandle, QpAttr, QpAttrMask, QpCaps, QpHandle,
    QpInfo, QpInitAttr, QpState, RecvWr, SendWr, VerbsDevice, VerbsError, VerbsOp, VerbsResult, WcOpcode, WcStatus,
    WorkCompletion,
};

/// Per-device limits advertised by simulated devices.
pub const SIM_MAX_SEGMENT_SIZE: u32 = 64 * 1024;
const SIM_MAX_WR: u32 = 16 * 1024;
const SIM_MAX_SGE: u32 = 32;
const SIM_MAX_CQE: u32 = 64 * 1024;
const SIM_PORT: u8 = 1;
const FIRST_QPN: u32 = 0x100;
const FIRST_KEY: u32 = 0x1000;

/// A one-shot fault armed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The next call of this verb fails with `EIO`.
    Op(VerbsOp),
    /// The next `modify_qp` into this state fails with `EINVAL`.
    Transition(QpState),
    /// The next completion generated on the device carries this status.
    CompletionStatus(WcStatus),
}

struct SimMr {
    device: String,
    pd: PdHandle,
    lkey: u32,
}

struct SimCq {
    device: String,
    depth: u32,
    entries: VecDeque<WorkCompletion>,
}

struct SimQp {
    device: String,
    pd: PdHandle,
    qpn: QpNum,
    state: QpState,
    send_cq: CqHandle,
    recv_cq: CqHandle,
    caps: QpCaps,
    dest_qpn: Option<QpNum>,
    recv_queue: VecDeque<RecvWr>,
    /// Sends from peers that arrived before a receive was posted.
    inbound: VecDeque<(QpHandle, SendWr)>,
}

struct SimAh {
    device: String,
    pd: PdHandle,
}

struct FabricState {
    next_handle: u32,
    next_qpn: u32,
    next_key: u32,
    next_lid: u16,
    pds: HashMap<PdHandle, String>,
    mrs: HashMap<MrHandle, SimMr>,
    cqs: HashMap<CqHandle, SimCq>,
    qps: HashMap<QpHandle, SimQp>,
    by_qpn: HashMap<QpNum, QpHandle>,
    ahs: HashMap<AhHandle, SimAh>,
    faults: Vec<(String, SimFault)>,
}

impl FabricState {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_fault(&mut self, device: &str, pred: impl Fn(&SimFault) -> bool) -> Option<SimFault> {
        let idx = self.faults.iter().position(|(d, f)| d == device && pred(f))?;
        Some(self.faults.remove(idx).1)
    }

    fn check_op(&mut self, device: &str, op: VerbsOp) -> VerbsResult<()> {
        match self.take_fault(device, |f| *f == SimFault::Op(op)) {
            Some(_) => Err(VerbsError::new(op, libc::EIO)),
            None => Ok(()),
        }
    }

    fn complete(&mut self, cq: CqHandle, mut wc: WorkCompletion) {
        let Some(device) = self.cqs.get(&cq).map(|c| c.device.clone()) else {
            tracing::debug!(cq = %cq, "completion for a destroyed CQ dropped");
            return;
        };
        if let Some(SimFault::CompletionStatus(status)) =
            self.take_fault(&device, |f| matches!(f, SimFault::CompletionStatus(_)))
        {
            wc.status = status;
        }
        if let Some(c) = self.cqs.get_mut(&cq) {
            if c.entries.len() >= c.depth as usize {
                tracing::warn!(cq = %cq, depth = c.depth, "completion queue overrun");
            }
            c.entries.push_back(wc);
        }
    }

    fn complete_send(&mut self, src: QpHandle, wr: &SendWr, status: WcStatus, byte_len: u32) {
        let Some(qp) = self.qps.get(&src) else {
            return;
        };
        let (cq, qpn) = (qp.send_cq, qp.qpn);
        if wr.signaled || status != WcStatus::Success {
            self.complete(cq, WorkCompletion { wr_id: wr.wr_id, status, opcode: WcOpcode::Send, byte_len, qpn });
        }
    }

    fn complete_recv(&mut self, dst: QpHandle, wr: &RecvWr, status: WcStatus, byte_len: u32) {
        let Some(qp) = self.qps.get(&dst) else {
            return;
        };
        let (cq, qpn) = (qp.recv_cq, qp.qpn);
        self.complete(cq, WorkCompletion { wr_id: wr.wr_id, status, opcode: WcOpcode::Recv, byte_len, qpn });
    }

    fn lkey_valid(&self, qp: QpHandle, lkey: u32) -> bool {
        let Some(qp) = self.qps.get(&qp) else {
            return false;
        };
        self.mrs.values().any(|mr| mr.lkey == lkey && mr.pd == qp.pd && mr.device == qp.device)
    }

    /// Match one send against one receive and move the payload.
    fn deliver(&mut self, memory: &SimMemory, src: QpHandle, send: SendWr, dst: QpHandle, recv: RecvWr) {
        if !self.lkey_valid(src, send.sge.lkey) {
            self.complete_send(src, &send, WcStatus::LocProtErr, 0);
            if let Some(qp) = self.qps.get_mut(&dst) {
                qp.recv_queue.push_front(recv);
            }
            return;
        }
        if !self.lkey_valid(dst, recv.sge.lkey) {
            self.complete_recv(dst, &recv, WcStatus::LocProtErr, 0);
            self.complete_send(src, &send, WcStatus::RemOpErr, 0);
            return;
        }
        if send.sge.length > recv.sge.length {
            self.complete_recv(dst, &recv, WcStatus::LocLenErr, 0);
            self.complete_send(src, &send, WcStatus::RemInvReqErr, 0);
            return;
        }

        let data = match memory.dma_read(Iova(send.sge.addr), send.sge.length as usize) {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(error = %e, "send gather failed");
                self.complete_send(src, &send, WcStatus::LocProtErr, 0);
                if let Some(qp) = self.qps.get_mut(&dst) {
                    qp.recv_queue.push_front(recv);
                }
                return;
            }
        };
        if let Err(e) = memory.dma_write(Iova(recv.sge.addr), &data) {
            tracing::debug!(error = %e, "receive scatter failed");
            self.complete_recv(dst, &recv, WcStatus::LocProtErr, 0);
            self.complete_send(src, &send, WcStatus::RemOpErr, 0);
            return;
        }
        let len = send.sge.length;
        self.complete_recv(dst, &recv, WcStatus::Success, len);
        self.complete_send(src, &send, WcStatus::Success, len);
    }
}

struct FabricShared {
    state: Mutex<FabricState>,
    memory: Arc<SimMemory>,
    events: EventLog,
}

/// A set of simulated devices wired to one memory model.
#[derive(Clone)]
pub struct SimFabric {
    shared: Arc<FabricShared>,
}

impl SimFabric {
    /// Fabric events go to the memory model's event log, so verbs and memory
    /// side effects interleave in one ordered record.
    pub fn new(memory: Arc<SimMemory>) -> Self {
        let events = memory.events().clone();
        Self {
            shared: Arc::new(FabricShared {
                state: Mutex::new(FabricState {
                    next_handle: 0,
                    next_qpn: FIRST_QPN,
                    next_key: FIRST_KEY,
                    next_lid: 1,
                    pds: HashMap::new(),
                    mrs: HashMap::new(),
                    cqs: HashMap::new(),
                    qps: HashMap::new(),
                    by_qpn: HashMap::new(),
                    ahs: HashMap::new(),
                    faults: Vec::new(),
                }),
                memory,
                events,
            }),
        }
    }

    /// Create a device with one active InfiniBand port. GID index 0 is the
    /// link-local GID, index 1 an IPv4-mapped one.
    pub fn add_device(&self, name: &str) -> Arc<SimDevice> {
        self.add_device_with_port_state(name, PortState::Active)
    }

    pub fn add_device_with_port_state(&self, name: &str, state: PortState) -> Arc<SimDevice> {
        let lid = {
            let mut st = self.shared.state.lock();
            let lid = st.next_lid;
            st.next_lid += 1;
            lid
        };
        let mut info = DeviceInfo::new(name, SIM_MAX_SEGMENT_SIZE);
        info.add_port(PortInfo {
            port_num: SIM_PORT,
            link_layer: LinkLayer::Infiniband,
            state,
            lid,
            gids: vec![
                Gid::link_local(0x0002_c903_0000_0000 | lid as u64),
                Gid::from_ipv4(Ipv4Addr::new(10, 0, (lid >> 8) as u8, lid as u8)),
            ],
        });
        Arc::new(SimDevice {
            info,
            shared: self.shared.clone(),
        })
    }

    pub fn inject(&self, device: &str, fault: SimFault) {
        self.shared.state.lock().faults.push((device.to_string(), fault));
    }

    pub fn memory(&self) -> &Arc<SimMemory> {
        &self.shared.memory
    }

    pub fn events(&self) -> EventLog {
        self.shared.events.clone()
    }

    /// Protection domains, MRs, CQs, QPs and AHs still allocated.
    pub fn live_resources(&self) -> usize {
        let st = self.shared.state.lock();
        st.pds.len() + st.mrs.len() + st.cqs.len() + st.qps.len() + st.ahs.len()
    }

    pub fn qp_state(&self, qpn: QpNum) -> Option<QpState> {
        let st = self.shared.state.lock();
        st.by_qpn.get(&qpn).and_then(|h| st.qps.get(h)).map(|qp| qp.state)
    }
}

pub struct SimDevice {
    info: DeviceInfo,
    shared: Arc<FabricShared>,
}

impl SimDevice {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn event(&self, what: std::fmt::Arguments<'_>) {
        self.shared.events.push(format!("{} {}", self.info.name, what));
    }

    fn owns(&self, device: &str) -> bool {
        device == self.info.name
    }

    fn port(&self, port_num: u8, op: VerbsOp) -> VerbsResult<&PortInfo> {
        self.info.port(port_num).ok_or(VerbsError::new(op, libc::EINVAL))
    }
}

impl VerbsDevice for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn alloc_pd(&self) -> VerbsResult<PdHandle> {
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), VerbsOp::AllocPd)?;
        let pd = PdHandle(st.handle());
        st.pds.insert(pd, self.info.name.clone());
        drop(st);
        self.event(format_args!("alloc_pd {}", pd));
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: PdHandle) -> VerbsResult<()> {
        let op = VerbsOp::DeallocPd;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.pds.get(&pd).is_some_and(|d| self.owns(d)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        let in_use = st.mrs.values().any(|m| m.pd == pd)
            || st.qps.values().any(|q| q.pd == pd)
            || st.ahs.values().any(|a| a.pd == pd);
        if in_use {
            return Err(VerbsError::new(op, libc::EBUSY));
        }
        st.pds.remove(&pd);
        drop(st);
        self.event(format_args!("dealloc_pd {}", pd));
        Ok(())
    }

    fn get_dma_mr(&self, pd: PdHandle, _access: AccessFlags) -> VerbsResult<MrInfo> {
        let op = VerbsOp::GetDmaMr;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.pds.get(&pd).is_some_and(|d| self.owns(d)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        let handle = MrHandle(st.handle());
        let lkey = st.next_key;
        st.next_key += 1;
        st.mrs.insert(handle, SimMr { device: self.info.name.clone(), pd, lkey });
        drop(st);
        self.event(format_args!("get_dma_mr lkey={:#x}", lkey));
        Ok(MrInfo { handle, lkey, rkey: lkey })
    }

    fn dereg_mr(&self, mr: MrHandle) -> VerbsResult<()> {
        let op = VerbsOp::DeregMr;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.mrs.get(&mr).is_some_and(|m| self.owns(&m.device)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        st.mrs.remove(&mr);
        drop(st);
        self.event(format_args!("dereg_mr {}", mr));
        Ok(())
    }

    fn create_cq(&self, cqe: u32) -> VerbsResult<CqHandle> {
        let op = VerbsOp::CreateCq;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if cqe == 0 || cqe > SIM_MAX_CQE {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        let cq = CqHandle(st.handle());
        st.cqs.insert(
            cq,
            SimCq { device: self.info.name.clone(), depth: cqe, entries: VecDeque::new() },
        );
        drop(st);
        self.event(format_args!("create_cq {} cqe={}", cq, cqe));
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqHandle) -> VerbsResult<()> {
        let op = VerbsOp::DestroyCq;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.cqs.get(&cq).is_some_and(|c| self.owns(&c.device)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        if st.qps.values().any(|q| q.send_cq == cq || q.recv_cq == cq) {
            return Err(VerbsError::new(op, libc::EBUSY));
        }
        st.cqs.remove(&cq);
        drop(st);
        self.event(format_args!("destroy_cq {}", cq));
        Ok(())
    }

    fn create_qp(&self, pd: PdHandle, attr: &QpInitAttr) -> VerbsResult<QpInfo> {
        let op = VerbsOp::CreateQp;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        let pd_ok = st.pds.get(&pd).is_some_and(|d| self.owns(d));
        let cqs_ok = [attr.send_cq, attr.recv_cq]
            .iter()
            .all(|cq| st.cqs.get(cq).is_some_and(|c| self.owns(&c.device)));
        let caps = attr.caps;
        let caps_ok = caps.max_send_wr <= SIM_MAX_WR
            && caps.max_recv_wr <= SIM_MAX_WR
            && caps.max_send_sge <= SIM_MAX_SGE
            && caps.max_recv_sge <= SIM_MAX_SGE;
        if !(pd_ok && cqs_ok && caps_ok) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }

        let handle = QpHandle(st.handle());
        let qpn = QpNum(st.next_qpn);
        st.next_qpn += 1;
        st.qps.insert(
            handle,
            SimQp {
                device: self.info.name.clone(),
                pd,
                qpn,
                state: QpState::Reset,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                caps,
                dest_qpn: None,
                recv_queue: VecDeque::new(),
                inbound: VecDeque::new(),
            },
        );
        st.by_qpn.insert(qpn, handle);
        drop(st);
        self.event(format_args!("create_qp qpn={}", qpn));
        Ok(QpInfo { handle, qpn })
    }

    fn destroy_qp(&self, qp: QpHandle) -> VerbsResult<()> {
        let op = VerbsOp::DestroyQp;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.qps.get(&qp).is_some_and(|q| self.owns(&q.device)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        let Some(removed) = st.qps.remove(&qp) else {
            return Err(VerbsError::new(op, libc::EINVAL));
        };
        st.by_qpn.remove(&removed.qpn);
        // Senders still waiting on this QP will never see a receiver.
        for (src, wr) in removed.inbound {
            st.complete_send(src, &wr, WcStatus::RetryExcErr, 0);
        }
        drop(st);
        self.event(format_args!("destroy_qp qpn={}", removed.qpn));
        Ok(())
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr, mask: QpAttrMask) -> VerbsResult<()> {
        let op = VerbsOp::ModifyQp;
        let invalid = VerbsError::new(op, libc::EINVAL);
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        let Some(cur) = st.qps.get(&qp).filter(|q| self.owns(&q.device)).map(|q| q.state) else {
            return Err(invalid);
        };
        if !mask.contains(QpAttrMask::STATE) {
            return Err(invalid);
        }
        let target = attr.qp_state;
        if st.take_fault(self.name(), |f| *f == SimFault::Transition(target)).is_some() {
            return Err(invalid);
        }

        match (cur, target) {
            (QpState::Reset, QpState::Init) => {
                if !mask.contains(QpAttrMask::TO_INIT) {
                    return Err(invalid);
                }
                self.port(attr.port_num, op)?;
            }
            (QpState::Init, QpState::Rtr) => {
                if !mask.contains(QpAttrMask::TO_RTR) {
                    return Err(invalid);
                }
                self.port(attr.ah_attr.port_num, op)?;
            }
            (QpState::Rtr, QpState::Rts) => {
                if !mask.contains(QpAttrMask::TO_RTS) {
                    return Err(invalid);
                }
            }
            (_, QpState::Reset) | (_, QpState::Error) => {}
            _ => return Err(invalid),
        }

        if let Some(q) = st.qps.get_mut(&qp) {
            match target {
                QpState::Rtr => q.dest_qpn = Some(attr.dest_qp_num),
                QpState::Reset => {
                    q.dest_qpn = None;
                    q.recv_queue.clear();
                }
                _ => {}
            }
            q.state = target;
        }
        drop(st);
        self.event(format_args!("modify_qp {}", target));
        Ok(())
    }

    fn query_port(&self, port_num: u8) -> VerbsResult<PortInfo> {
        self.shared.state.lock().check_op(self.name(), VerbsOp::QueryPort)?;
        self.port(port_num, VerbsOp::QueryPort).cloned()
    }

    fn query_gid(&self, port_num: u8, index: u8) -> VerbsResult<Gid> {
        let op = VerbsOp::QueryGid;
        self.shared.state.lock().check_op(self.name(), op)?;
        self.port(port_num, op)?
            .gid(index)
            .ok_or(VerbsError::new(op, libc::EINVAL))
    }

    fn create_ah(&self, pd: PdHandle, attr: &AhAttr) -> VerbsResult<AhHandle> {
        let op = VerbsOp::CreateAh;
        let invalid = VerbsError::new(op, libc::EINVAL);
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.pds.get(&pd).is_some_and(|d| self.owns(d)) {
            return Err(invalid);
        }
        let port = self.port(attr.port_num, op)?;
        match &attr.grh {
            Some(grh) if port.gid(grh.sgid_index).is_none() => return Err(invalid),
            None if attr.dlid == 0 => return Err(invalid),
            _ => {}
        }
        let ah = AhHandle(st.handle());
        st.ahs.insert(ah, SimAh { device: self.info.name.clone(), pd });
        drop(st);
        self.event(format_args!("create_ah {}", ah));
        Ok(ah)
    }

    fn destroy_ah(&self, ah: AhHandle) -> VerbsResult<()> {
        let op = VerbsOp::DestroyAh;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        if !st.ahs.get(&ah).is_some_and(|a| self.owns(&a.device)) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        st.ahs.remove(&ah);
        drop(st);
        self.event(format_args!("destroy_ah {}", ah));
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> VerbsResult<()> {
        let op = VerbsOp::PostSend;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        let Some(src) = st.qps.get(&qp).filter(|q| self.owns(&q.device)) else {
            return Err(VerbsError::new(op, libc::EINVAL));
        };
        if src.state != QpState::Rts {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        let dest = src.dest_qpn;
        self.event(format_args!("post_send wr_id={} len={}", wr.wr_id, wr.sge.length));

        let Some(dst) = dest.and_then(|qpn| st.by_qpn.get(&qpn).copied()) else {
            st.complete_send(qp, wr, WcStatus::RetryExcErr, 0);
            return Ok(());
        };
        let recv = st.qps.get_mut(&dst).and_then(|q| q.recv_queue.pop_front());
        match recv {
            Some(recv) => st.deliver(&self.shared.memory, qp, *wr, dst, recv),
            None => {
                if let Some(q) = st.qps.get_mut(&dst) {
                    q.inbound.push_back((qp, *wr));
                }
            }
        }
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> VerbsResult<()> {
        let op = VerbsOp::PostRecv;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        let Some(dst) = st.qps.get_mut(&qp).filter(|q| q.device == self.info.name) else {
            return Err(VerbsError::new(op, libc::EINVAL));
        };
        if !matches!(dst.state, QpState::Init | QpState::Rtr | QpState::Rts) {
            return Err(VerbsError::new(op, libc::EINVAL));
        }
        if dst.recv_queue.len() >= dst.caps.max_recv_wr as usize {
            return Err(VerbsError::new(op, libc::ENOMEM));
        }
        dst.recv_queue.push_back(*wr);
        self.event(format_args!("post_recv wr_id={} len={}", wr.wr_id, wr.sge.length));

        while let Some((src, send)) = st.qps.get_mut(&qp).and_then(|q| q.inbound.pop_front()) {
            let Some(recv) = st.qps.get_mut(&qp).and_then(|q| q.recv_queue.pop_front()) else {
                if let Some(q) = st.qps.get_mut(&qp) {
                    q.inbound.push_front((src, send));
                }
                break;
            };
            st.deliver(&self.shared.memory, src, send, qp, recv);
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize, out: &mut Vec<WorkCompletion>) -> VerbsResult<usize> {
        let op = VerbsOp::PollCq;
        let mut st = self.shared.state.lock();
        st.check_op(self.name(), op)?;
        let Some(c) = st.cqs.get_mut(&cq).filter(|c| c.device == self.info.name) else {
            return Err(VerbsError::new(op, libc::EINVAL));
        };
        let n = max.min(c.entries.len());
        out.extend(c.entries.drain(..n));
        Ok(n)
    }
}

/// One end of an in-memory control channel.
pub struct DuplexConnector {
    stream: Mutex<Option<DuplexStream>>,
}

/// Two connectors whose single streams are joined to each other.
pub fn duplex_pair() -> (DuplexConnector, DuplexConnector) {
    let (a, b) = tokio::io::duplex(4096);
    (
        DuplexConnector { stream: Mutex::new(Some(a)) },
        DuplexConnector { stream: Mutex::new(Some(b)) },
    )
}

#[async_trait]
impl ControlConnector for DuplexConnector {
    async fn establish(&self, _role: Role, _addr: SocketAddrV4) -> Result<Box<dyn ControlStream>, RdmaError> {
        match self.stream.lock().take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(RdmaError::transport("connect", io::Error::from(io::ErrorKind::NotConnected))),
        }
    }
}
