//! Per-session connection state.
//!
//! [`ConnectionContext`] acquires the session's resources one step at a time
//! and walks the queue pair through INIT, RTR and RTS. Steps must run in
//! order; calling one out of order is a protocol error. Resources are held in
//! guards whose fields are declared newest-first, so dropping the context at
//! any point releases exactly what was acquired in reverse order:
//! control channel, QP, CQ, DMA mapping, memory region, scatter-gather table,
//! protection domain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pinrdma_mem::page::page_offset;
use pinrdma_mem::{MemoryContext, MemorySubsystem, ScatterGatherTable, SgBuilder};
use pinrdma_types::QpNum;
use tokio::sync::watch;

use crate::completion::{self, CompletionSource, LivenessCheck, LoopOutcome, LoopReport};
use crate::config::RdmaConfig;
use crate::control::{ControlStream, Role};
use crate::error::RdmaError;
use crate::handshake::{self, ConnParam};
use crate::resource::{AhGuard, CqGuard, DmaGuard, MrGuard, PdGuard, QpGuard, TableGuard};
use crate::verbs::{
    AccessFlags, AhAttr, CqHandle, GlobalRoute, QpAttr, QpAttrMask, QpCaps, QpInitAttr, QpState, RecvWr, SendWr,
    Sge, VerbsDevice, WorkCompletion,
};

/// Work request id of the one request a session posts.
pub const SESSION_WR_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Init,
    Rtr,
    Rts,
    /// The work request is posted.
    Active,
    Closed,
    Failed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnState::Created => write!(f, "CREATED"),
            ConnState::Init => write!(f, "INIT"),
            ConnState::Rtr => write!(f, "RTR"),
            ConnState::Rts => write!(f, "RTS"),
            ConnState::Active => write!(f, "ACTIVE"),
            ConnState::Closed => write!(f, "CLOSED"),
            ConnState::Failed => write!(f, "FAILED"),
        }
    }
}

pub struct ConnectionContext {
    role: Role,
    state: ConnState,
    device: Arc<dyn VerbsDevice>,
    port_num: u8,
    sgid_index: u8,
    local: Option<ConnParam>,
    remote: Option<ConnParam>,
    dma_addr: Option<u64>,

    // Teardown order.
    channel: Option<Box<dyn ControlStream>>,
    qp: Option<QpGuard>,
    cq: Option<CqGuard>,
    dma: Option<DmaGuard>,
    mr: Option<MrGuard>,
    table: Option<TableGuard>,
    pd: Option<PdGuard>,
}

impl ConnectionContext {
    pub fn new(device: Arc<dyn VerbsDevice>, role: Role, port_num: u8, sgid_index: u8) -> Self {
        Self {
            role,
            state: ConnState::Created,
            device,
            port_num,
            sgid_index,
            local: None,
            remote: None,
            dma_addr: None,
            channel: None,
            qp: None,
            cq: None,
            dma: None,
            mr: None,
            table: None,
            pd: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn device(&self) -> &Arc<dyn VerbsDevice> {
        &self.device
    }

    pub fn local(&self) -> Option<&ConnParam> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&ConnParam> {
        self.remote.as_ref()
    }

    /// Device address of the first byte of the user buffer.
    pub fn dma_addr(&self) -> Option<u64> {
        self.dma_addr
    }

    pub fn qpn(&self) -> Option<QpNum> {
        self.qp.as_ref().map(QpGuard::qpn)
    }

    pub fn table(&self) -> Option<&Arc<ScatterGatherTable>> {
        self.table.as_ref().map(TableGuard::table)
    }

    fn expect_state(&self, want: ConnState, phase: &'static str) -> Result<(), RdmaError> {
        if self.state != want {
            return Err(RdmaError::protocol(phase, format!("connection is {}, expected {}", self.state, want)));
        }
        Ok(())
    }

    fn missing(phase: &'static str, what: &str) -> RdmaError {
        RdmaError::protocol(phase, format!("{} not set up", what))
    }

    fn failed<T>(&mut self, err: RdmaError) -> Result<T, RdmaError> {
        self.state = ConnState::Failed;
        Err(err)
    }

    pub fn alloc_pd(&mut self) -> Result<(), RdmaError> {
        if self.pd.is_some() {
            return Err(RdmaError::protocol("alloc_pd", "protection domain already allocated"));
        }
        self.pd = Some(PdGuard::alloc(self.device.clone())?);
        Ok(())
    }

    /// Pin and describe `[virt_addr, virt_addr + length)` with segments no
    /// larger than the device accepts.
    pub fn build_table(
        &mut self,
        sg: &Arc<SgBuilder>,
        ctx: &Arc<MemoryContext>,
        virt_addr: u64,
        length: u64,
    ) -> Result<(), RdmaError> {
        if self.pd.is_none() {
            return Err(Self::missing("build_table", "protection domain"));
        }
        if u32::try_from(length).is_err() {
            return Err(RdmaError::InvalidArgument(format!(
                "length {} exceeds a single work request",
                length
            )));
        }
        let table = sg.build(ctx, virt_addr, length, self.device.max_segment_size())?;
        tracing::debug!(table = %table.key(), nents = table.nents(), "buffer pinned");
        self.table = Some(TableGuard::new(sg.clone(), table));
        Ok(())
    }

    pub fn register_mr(&mut self) -> Result<(), RdmaError> {
        let pd = self.pd.as_ref().ok_or_else(|| Self::missing("register_mr", "protection domain"))?;
        let mr = self.device.get_dma_mr(pd.handle(), AccessFlags::LOCAL_WRITE)?;
        self.mr = Some(MrGuard::new(self.device.clone(), mr));
        Ok(())
    }

    /// Map the table for DMA and derive the address of the buffer's first
    /// byte: the first segment's device address plus the buffer's in-page
    /// offset.
    pub fn map_dma(&mut self) -> Result<u64, RdmaError> {
        let guard = self.table.as_ref().ok_or_else(|| Self::missing("map_dma", "scatter-gather table"))?;
        let table = guard.table();
        let mem = guard.memory().clone();
        let mapping = mem.map_for_dma(table.segments())?;
        let Some(first) = mapping.first_address() else {
            mem.unmap_dma(&mapping);
            return Err(RdmaError::Memory(pinrdma_mem::MemError::DmaMapFailed("empty mapping".into())));
        };
        let dma_addr = first.advance(page_offset(table.virt_addr())).get();
        self.dma = Some(DmaGuard::new(mem, mapping));
        self.dma_addr = Some(dma_addr);
        tracing::debug!(dma_addr = format_args!("{:#x}", dma_addr), "buffer mapped for DMA");
        Ok(dma_addr)
    }

    pub fn create_cq(&mut self, depth: u32) -> Result<(), RdmaError> {
        self.cq = Some(CqGuard::create(self.device.clone(), depth)?);
        Ok(())
    }

    /// Reliable-connected QP sharing one CQ for sends and receives, with
    /// every send signaled.
    pub fn create_qp(&mut self, caps: QpCaps) -> Result<QpNum, RdmaError> {
        let pd = self.pd.as_ref().ok_or_else(|| Self::missing("create_qp", "protection domain"))?;
        let cq = self.cq.as_ref().ok_or_else(|| Self::missing("create_qp", "completion queue"))?;
        let attr = QpInitAttr {
            send_cq: cq.handle(),
            recv_cq: cq.handle(),
            caps,
            sq_sig_all: true,
        };
        let qp = self.device.create_qp(pd.handle(), &attr)?;
        tracing::debug!(qpn = %qp.qpn, "queue pair created");
        self.qp = Some(QpGuard::new(self.device.clone(), qp));
        Ok(qp.qpn)
    }

    /// Collect the record this side advertises in the handshake.
    pub fn query_local(&mut self, start_psn: u32) -> Result<ConnParam, RdmaError> {
        let qpn = self.qpn().ok_or_else(|| Self::missing("query_local", "queue pair"))?;
        let port = self.device.query_port(self.port_num)?;
        if !port.is_active() {
            return Err(RdmaError::InvalidArgument(format!(
                "port {} of {} is {}",
                self.port_num,
                self.device.info().name,
                port.state
            )));
        }
        let gid = self.device.query_gid(self.port_num, self.sgid_index)?;
        let local = ConnParam { qpn, psn: start_psn, lid: port.lid, gid };
        tracing::debug!(%qpn, lid = local.lid, %gid, "local connection parameters");
        self.local = Some(local);
        Ok(local)
    }

    pub fn attach_channel(&mut self, channel: Box<dyn ControlStream>) {
        self.channel = Some(channel);
    }

    /// Swap records with the peer and keep theirs.
    pub async fn exchange(&mut self) -> Result<ConnParam, RdmaError> {
        let local = self.local.ok_or_else(|| Self::missing("handshake", "local parameters"))?;
        let channel = self.channel.as_mut().ok_or_else(|| Self::missing("handshake", "control channel"))?;
        let remote = handshake::exchange(&mut **channel, self.role, &local).await?;
        tracing::debug!(role = %self.role, remote_qpn = %remote.qpn, remote_lid = remote.lid, "handshake complete");
        self.remote = Some(remote);
        Ok(remote)
    }

    fn modify(&mut self, attr: &QpAttr, mask: QpAttrMask, next: ConnState) -> Result<(), RdmaError> {
        let Some((handle, qpn)) = self.qp.as_ref().map(|qp| (qp.handle(), qp.qpn())) else {
            return self.failed(Self::missing("modify_qp", "queue pair"));
        };
        if let Err(e) = self.device.modify_qp(handle, attr, mask) {
            tracing::warn!(%qpn, to = %attr.qp_state, error = %e, "queue pair transition failed");
            return self.failed(e.into());
        }
        self.state = next;
        tracing::debug!(%qpn, state = %next, "queue pair transitioned");
        Ok(())
    }

    pub fn modify_to_init(&mut self, cfg: &RdmaConfig) -> Result<(), RdmaError> {
        self.expect_state(ConnState::Created, "INIT")?;
        let attr = QpAttr {
            qp_state: QpState::Init,
            pkey_index: cfg.pkey_index,
            port_num: self.port_num,
            access: AccessFlags::LOCAL_WRITE,
            ..Default::default()
        };
        self.modify(&attr, QpAttrMask::TO_INIT, ConnState::Init)
    }

    /// The address vector is first validated by creating and destroying a
    /// transient address handle.
    pub fn modify_to_rtr(&mut self, cfg: &RdmaConfig) -> Result<(), RdmaError> {
        self.expect_state(ConnState::Init, "RTR")?;
        let remote = self.remote.ok_or_else(|| Self::missing("RTR", "remote parameters"))?;
        let pd = self.pd.as_ref().map(PdGuard::handle).ok_or_else(|| Self::missing("RTR", "protection domain"))?;
        let Some(path_mtu) = cfg.mtu() else {
            return Err(RdmaError::InvalidArgument(format!("path MTU {}", cfg.path_mtu)));
        };

        let ah_attr = AhAttr {
            dlid: remote.lid,
            sl: cfg.sl,
            src_path_bits: 0,
            port_num: self.port_num,
            grh: Some(GlobalRoute {
                dgid: remote.gid,
                flow_label: 0,
                sgid_index: self.sgid_index,
                hop_limit: cfg.hop_limit,
                traffic_class: cfg.traffic_class,
            }),
        };
        let checked = AhGuard::create(self.device.clone(), pd, &ah_attr).and_then(AhGuard::destroy);
        if let Err(e) = checked {
            return self.failed(e.into());
        }

        let attr = QpAttr {
            qp_state: QpState::Rtr,
            path_mtu,
            dest_qp_num: remote.qpn,
            rq_psn: remote.psn,
            max_dest_rd_atomic: cfg.max_dest_rd_atomic,
            min_rnr_timer: cfg.min_rnr_timer,
            ah_attr,
            ..Default::default()
        };
        self.modify(&attr, QpAttrMask::TO_RTR, ConnState::Rtr)
    }

    pub fn modify_to_rts(&mut self, cfg: &RdmaConfig) -> Result<(), RdmaError> {
        self.expect_state(ConnState::Rtr, "RTS")?;
        let local = self.local.ok_or_else(|| Self::missing("RTS", "local parameters"))?;
        let attr = QpAttr {
            qp_state: QpState::Rts,
            sq_psn: local.psn,
            timeout: cfg.timeout,
            retry_cnt: cfg.retry_cnt,
            rnr_retry: cfg.rnr_retry,
            max_rd_atomic: cfg.max_rd_atomic,
            ..Default::default()
        };
        self.modify(&attr, QpAttrMask::TO_RTS, ConnState::Rts)
    }

    /// Post the session's one work request over the whole buffer: a receive
    /// on the server, a send on the client.
    pub fn post(&mut self) -> Result<(), RdmaError> {
        self.expect_state(ConnState::Rts, "post")?;
        let qp = self.qp.as_ref().map(QpGuard::handle).ok_or_else(|| Self::missing("post", "queue pair"))?;
        let lkey = self.mr.as_ref().map(MrGuard::lkey).ok_or_else(|| Self::missing("post", "memory region"))?;
        let addr = self.dma_addr.ok_or_else(|| Self::missing("post", "DMA mapping"))?;
        let length = self.table().map(|t| t.length()).ok_or_else(|| Self::missing("post", "scatter-gather table"))?;
        let length = u32::try_from(length)
            .map_err(|_| RdmaError::InvalidArgument(format!("length {} exceeds a single work request", length)))?;

        let sge = Sge { addr, length, lkey };
        let posted = match self.role {
            Role::Server => self.device.post_recv(qp, &RecvWr { wr_id: SESSION_WR_ID, sge }),
            Role::Client => self.device.post_send(qp, &SendWr { wr_id: SESSION_WR_ID, sge, signaled: true }),
        };
        if let Err(e) = posted {
            return self.failed(e.into());
        }
        self.state = ConnState::Active;
        tracing::debug!(role = %self.role, length, "work request posted");
        Ok(())
    }

    /// Run the completion loop for the posted request.
    pub async fn drive(
        &mut self,
        timeout: Option<Duration>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<LoopReport, RdmaError> {
        self.expect_state(ConnState::Active, "completion")?;
        let cq = self.cq.as_ref().map(CqGuard::handle).ok_or_else(|| Self::missing("completion", "completion queue"))?;
        let local = self.local.ok_or_else(|| Self::missing("completion", "local parameters"))?;
        let Some(channel) = self.channel.as_mut() else {
            return self.failed(Self::missing("completion", "control channel"));
        };

        let mut poller = CqPoller { device: self.device.clone(), cq, buf: Vec::with_capacity(1) };
        let mut check = HandshakeCheck { stream: &mut **channel, role: self.role, local };
        let res = completion::drive_completion(&mut poller, &mut check, timeout, cancel).await;
        match res {
            Ok(report) => {
                self.state = ConnState::Closed;
                if let LoopOutcome::PeerDisconnected = report.outcome {
                    tracing::debug!(role = %self.role, "peer left before a completion was seen");
                }
                Ok(report)
            }
            Err(e) => self.failed(e),
        }
    }

    /// Keep the scatter-gather table registered past teardown; it is then
    /// released through the builder by its owning process.
    pub fn persist_table(&mut self) -> Option<Arc<ScatterGatherTable>> {
        let guard = self.table.as_mut()?;
        guard.persist();
        Some(guard.table().clone())
    }

    /// Close the control channel now, ahead of the other resources.
    pub async fn close_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = channel.shutdown().await {
                tracing::debug!(error = %e, "control channel shutdown");
            }
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        tracing::debug!(role = %self.role, state = %self.state, qpn = ?self.qpn(), "tearing down connection");
    }
}

struct CqPoller {
    device: Arc<dyn VerbsDevice>,
    cq: CqHandle,
    buf: Vec<WorkCompletion>,
}

impl CompletionSource for CqPoller {
    fn poll_one(&mut self) -> Result<Option<WorkCompletion>, RdmaError> {
        self.buf.clear();
        self.device.poll_cq(self.cq, 1, &mut self.buf)?;
        Ok(self.buf.pop())
    }
}

/// Re-runs the handshake; a peer that already finished has closed its end.
struct HandshakeCheck<'a> {
    stream: &'a mut dyn ControlStream,
    role: Role,
    local: ConnParam,
}

#[async_trait]
impl LivenessCheck for HandshakeCheck<'_> {
    async fn check(&mut self) -> Result<(), RdmaError> {
        handshake::exchange(&mut *self.stream, self.role, &self.local).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{duplex_pair, SimFabric, SimFault};
    use crate::control::ControlConnector;
    use crate::device::PortState;
    use pinrdma_mem::sim::{FrameLayout, SimMemory};
    use pinrdma_types::ProcessId;
    use std::net::{Ipv4Addr, SocketAddrV4};

    struct Rig {
        mem: Arc<SimMemory>,
        fabric: SimFabric,
        sg: Arc<SgBuilder>,
    }

    fn rig() -> Rig {
        let mem = Arc::new(SimMemory::new());
        let fabric = SimFabric::new(mem.clone());
        let sg = Arc::new(SgBuilder::new(mem.clone()));
        Rig { mem, fabric, sg }
    }

    fn prepare(rig: &Rig, dev: &str, role: Role, pid: u32, addr: u64, len: u64) -> (ConnectionContext, Arc<MemoryContext>) {
        let pid = ProcessId(pid);
        rig.mem.map_user(pid, addr & !0xfff, len + 0x1000, FrameLayout::Contiguous);
        let ctx = Arc::new(MemoryContext::new(pid, 64));
        let device: Arc<dyn VerbsDevice> = rig.fabric.add_device(dev);
        let cfg = RdmaConfig::default();

        let mut conn = ConnectionContext::new(device, role, 1, 0);
        conn.alloc_pd().unwrap();
        conn.build_table(&rig.sg, &ctx, addr, len).unwrap();
        conn.register_mr().unwrap();
        conn.map_dma().unwrap();
        conn.create_cq(cfg.cq_depth).unwrap();
        conn.create_qp(cfg.qp_caps()).unwrap();
        conn.query_local(cfg.start_psn).unwrap();
        (conn, ctx)
    }

    #[test]
    fn test_dma_address_includes_page_offset() {
        let rig = rig();
        let (conn, _ctx) = prepare(&rig, "sim0", Role::Server, 1, 0x40_0123, 100);
        assert_eq!(conn.dma_addr().unwrap() & 0xfff, 0x123);
        assert_eq!(conn.table().unwrap().nents(), 1);
    }

    #[test]
    fn test_inactive_port_is_rejected() {
        let rig = rig();
        let pid = ProcessId(1);
        rig.mem.map_user(pid, 0x40_0000, 4096, FrameLayout::Contiguous);
        let ctx = Arc::new(MemoryContext::new(pid, 64));
        let device: Arc<dyn VerbsDevice> = rig.fabric.add_device_with_port_state("sim0", PortState::Down);
        let cfg = RdmaConfig::default();

        let mut conn = ConnectionContext::new(device, Role::Server, 1, 0);
        conn.alloc_pd().unwrap();
        conn.build_table(&rig.sg, &ctx, 0x40_0000, 4096).unwrap();
        conn.register_mr().unwrap();
        conn.map_dma().unwrap();
        conn.create_cq(cfg.cq_depth).unwrap();
        conn.create_qp(cfg.qp_caps()).unwrap();
        let err = conn.query_local(cfg.start_psn).unwrap_err();
        assert!(matches!(err, RdmaError::InvalidArgument(ref m) if m.contains("DOWN")), "{err}");

        drop(conn);
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(rig.fabric.live_resources(), 0);
    }

    #[test]
    fn test_out_of_order_transition_is_rejected() {
        let rig = rig();
        let (mut conn, _ctx) = prepare(&rig, "sim0", Role::Server, 1, 0x40_0000, 4096);
        let cfg = RdmaConfig::default();
        let err = conn.modify_to_rtr(&cfg).unwrap_err();
        assert!(matches!(err, RdmaError::Protocol { phase: "RTR", .. }));
        conn.modify_to_init(&cfg).unwrap();
        // No remote parameters yet.
        assert!(conn.modify_to_rtr(&cfg).is_err());
        assert!(conn.post().is_err());
    }

    #[test]
    fn test_teardown_runs_in_reverse_acquisition_order() {
        let rig = rig();
        let (conn, ctx) = prepare(&rig, "sim0", Role::Client, 4, 0x80_0000, 8192);
        assert_eq!(ctx.pinned_pages(), 2);
        let events = rig.fabric.events();
        events.clear();
        drop(conn);

        let order: Vec<usize> = ["destroy_qp", "destroy_cq", "dma_unmap", "dereg_mr", "put_page", "dealloc_pd"]
            .iter()
            .map(|e| events.position(e).unwrap_or_else(|| panic!("missing {e}")))
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", events.snapshot());
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(rig.fabric.live_resources(), 0);
        assert_eq!(rig.mem.active_dma_mappings(), 0);
    }

    #[test]
    fn test_persisted_table_survives_teardown() {
        let rig = rig();
        let (mut conn, ctx) = prepare(&rig, "sim0", Role::Server, 5, 0x80_0000, 4096);
        let table = conn.persist_table().unwrap();
        drop(conn);
        assert_eq!(ctx.pinned_pages(), 1);
        assert!(rig.sg.lookup(ProcessId(5)).is_some());
        rig.sg.release(&table).unwrap();
        assert_eq!(ctx.pinned_pages(), 0);
    }

    #[tokio::test]
    async fn test_two_contexts_transfer() {
        let rig = rig();
        let (mut server, _sctx) = prepare(&rig, "sim0", Role::Server, 1, 0x10_0000, 4096);
        let (mut client, _cctx) = prepare(&rig, "sim1", Role::Client, 2, 0x20_0000, 4096);
        rig.mem.write_user(ProcessId(2), 0x20_0000, b"Hello, I'm client!").unwrap();

        let (a, b) = duplex_pair();
        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        server.attach_channel(a.establish(Role::Server, any).await.unwrap());
        client.attach_channel(b.establish(Role::Client, any).await.unwrap());

        let (s, c) = tokio::join!(server.exchange(), client.exchange());
        assert_eq!(s.unwrap().qpn, client.qpn().unwrap());
        assert_eq!(c.unwrap().qpn, server.qpn().unwrap());

        let cfg = RdmaConfig::default();
        for conn in [&mut server, &mut client] {
            conn.modify_to_init(&cfg).unwrap();
            conn.modify_to_rtr(&cfg).unwrap();
            conn.modify_to_rts(&cfg).unwrap();
        }
        server.post().unwrap();
        client.post().unwrap();
        assert_eq!(server.state(), ConnState::Active);

        let (_tx, mut rx) = watch::channel(false);
        let mut rx2 = rx.clone();
        let (s, c) = tokio::join!(server.drive(None, &mut rx), client.drive(None, &mut rx2));
        let s = s.unwrap();
        let c = c.unwrap();
        assert!(matches!(c.outcome, LoopOutcome::Completed(wc) if wc.byte_len == 4096));
        assert!(matches!(s.outcome, LoopOutcome::Completed(_) | LoopOutcome::PeerDisconnected));
        assert_eq!(server.state(), ConnState::Closed);
        assert_eq!(&rig.mem.read_user(ProcessId(1), 0x10_0000, 18).unwrap(), b"Hello, I'm client!");
    }

    #[tokio::test]
    async fn test_rtr_fault_marks_failed() {
        let rig = rig();
        let (mut conn, _ctx) = prepare(&rig, "sim0", Role::Server, 1, 0x10_0000, 4096);
        conn.remote = Some(ConnParam { qpn: QpNum(0x999), lid: 7, ..Default::default() });
        let cfg = RdmaConfig::default();
        conn.modify_to_init(&cfg).unwrap();
        rig.fabric.inject("sim0", SimFault::Transition(QpState::Rtr));
        assert!(matches!(conn.modify_to_rtr(&cfg), Err(RdmaError::Verbs(_))));
        assert_eq!(conn.state(), ConnState::Failed);
        assert!(conn.modify_to_rts(&cfg).is_err());
    }
}
