//! One two-party transfer, start to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pinrdma_mem::{MemoryContext, SgBuilder, TableKey};
use pinrdma_types::QpNum;
use serde::Serialize;
use tokio::sync::watch;
use tracing::Instrument;

use crate::completion::{self, LoopOutcome};
use crate::config::{RdmaConfig, SessionConfig};
use crate::connection::ConnectionContext;
use crate::control::{ControlConnector, Role};
use crate::device::DeviceRegistry;
use crate::error::RdmaError;
use crate::request::SessionRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    Completed { byte_len: u32 },
    /// The peer closed the control channel before this side saw its
    /// completion. Not an error: the peer only closes once it is done.
    PeerDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub role: Role,
    /// Registry key of the table left registered for the caller.
    pub table: TableKey,
    pub nents: usize,
    pub dma_addr: u64,
    pub local_qpn: QpNum,
    pub remote_qpn: QpNum,
    pub outcome: SessionOutcome,
    pub polls: usize,
}

/// Runs sessions against a set of devices.
pub struct SessionEngine {
    devices: Arc<DeviceRegistry>,
    sg: Arc<SgBuilder>,
    connector: Arc<dyn ControlConnector>,
    rdma: RdmaConfig,
    session: SessionConfig,
}

impl SessionEngine {
    pub fn new(devices: Arc<DeviceRegistry>, sg: Arc<SgBuilder>, connector: Arc<dyn ControlConnector>) -> Self {
        Self {
            devices,
            sg,
            connector,
            rdma: RdmaConfig::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn with_rdma_config(mut self, rdma: RdmaConfig) -> Self {
        self.rdma = rdma;
        self
    }

    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn sg(&self) -> &Arc<SgBuilder> {
        &self.sg
    }

    /// Run one session for the process owning `ctx`.
    ///
    /// On success the buffer's scatter-gather table stays registered under
    /// the returned key until the process releases it. On failure every
    /// acquired resource, the table included, is released before returning.
    pub async fn run(
        &self,
        ctx: &Arc<MemoryContext>,
        req: &SessionRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SessionReport, RdmaError> {
        let role = req.role();
        let span = tracing::info_span!("session", pid = %ctx.pid(), %role, device = %req.device_name);
        async move {
            tracing::info!(peer = %req.peer, virt_addr = format_args!("{:#x}", req.virt_addr), length = req.length, "session starting");
            match self.execute(ctx, req, role, cancel).await {
                Ok(report) => {
                    tracing::info!(table = %report.table, outcome = ?report.outcome, polls = report.polls, "session finished");
                    Ok(report)
                }
                Err(e) => {
                    tracing::error!(error = %e, "session failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        ctx: &Arc<MemoryContext>,
        req: &SessionRequest,
        role: Role,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SessionReport, RdmaError> {
        let device = self.devices.resolve(&req.device_name)?;
        let mut conn = ConnectionContext::new(device, role, req.rdma_port, req.sgid_index);

        conn.alloc_pd()?;
        conn.build_table(&self.sg, ctx, req.virt_addr, req.length)?;
        conn.register_mr()?;
        let dma_addr = conn.map_dma()?;
        conn.create_cq(self.rdma.cq_depth)?;
        let local_qpn = conn.create_qp(self.rdma.qp_caps())?;
        conn.query_local(self.rdma.start_psn)?;

        let limit = self.session.handshake_timeout();
        let channel = guarded("control channel", limit, cancel, self.connector.establish(role, req.peer)).await?;
        conn.attach_channel(channel);
        let remote = guarded("handshake", limit, cancel, conn.exchange()).await?;

        conn.modify_to_init(&self.rdma)?;
        conn.modify_to_rtr(&self.rdma)?;
        conn.modify_to_rts(&self.rdma)?;
        conn.post()?;

        let report = conn.drive(self.session.completion_timeout(), cancel).await?;
        let outcome = match report.outcome {
            LoopOutcome::Completed(wc) => SessionOutcome::Completed { byte_len: wc.byte_len },
            LoopOutcome::PeerDisconnected => SessionOutcome::PeerDisconnected,
        };
        let table = conn
            .persist_table()
            .ok_or_else(|| RdmaError::protocol("teardown", "scatter-gather table missing"))?;
        conn.close_channel().await;

        Ok(SessionReport {
            role,
            table: table.key(),
            nents: table.nents(),
            dma_addr,
            local_qpn,
            remote_qpn: remote.qpn,
            outcome,
            polls: report.polls,
        })
    }
}

/// Bound `fut` by `after` and abandon it on cancellation.
async fn guarded<T, F>(
    what: &'static str,
    after: Duration,
    cancel: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<T, RdmaError>
where
    F: Future<Output = Result<T, RdmaError>>,
{
    tokio::select! {
        biased;
        _ = completion::cancelled(cancel) => Err(RdmaError::Cancelled),
        res = tokio::time::timeout(after, fut) => match res {
            Ok(res) => res,
            Err(_) => Err(RdmaError::Timeout { what, after }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlStream, TcpControlConnector};
    use crate::handshake::{self, ConnParam};
    use crate::sim::{duplex_pair, DuplexConnector, SimFabric, SimFault};
    use crate::verbs::{Gid, QpState, VerbsOp, WcStatus};
    use pinrdma_mem::sim::{FrameLayout, SimMemory};
    use pinrdma_types::ProcessId;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const SERVER_BUF: u64 = 0x7f00_0000_0000;
    const CLIENT_BUF: u64 = 0x7f10_0000_0000;
    const PORT: u16 = 18515;

    struct Harness {
        mem: Arc<SimMemory>,
        fabric: SimFabric,
        sg: Arc<SgBuilder>,
    }

    impl Harness {
        fn new() -> Self {
            let mem = Arc::new(SimMemory::new());
            let fabric = SimFabric::new(mem.clone());
            let sg = Arc::new(SgBuilder::new(mem.clone()));
            Self { mem, fabric, sg }
        }

        fn engine(&self, device: &str, connector: Arc<dyn ControlConnector>) -> SessionEngine {
            let devices = Arc::new(DeviceRegistry::new());
            devices.register(self.fabric.add_device(device)).unwrap();
            SessionEngine::new(devices, self.sg.clone(), connector)
        }

        fn process(&self, pid: u32, addr: u64, len: u64, text: &[u8]) -> Arc<MemoryContext> {
            let pid = ProcessId(pid);
            self.mem.map_user(pid, addr, len, FrameLayout::Contiguous);
            self.mem.write_user(pid, addr, text).unwrap();
            Arc::new(MemoryContext::new(pid, 1024))
        }
    }

    fn request(device: &str, peer: Ipv4Addr, addr: u64, len: u64) -> SessionRequest {
        SessionRequest {
            device_name: device.into(),
            peer: SocketAddrV4::new(peer, PORT),
            rdma_port: 1,
            sgid_index: 0,
            virt_addr: addr,
            length: len,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_transfer() {
        let h = Harness::new();
        let (a, b) = duplex_pair();
        let server = h.engine("sim0", Arc::new(a));
        let client = h.engine("sim1", Arc::new(b));
        let sctx = h.process(1, SERVER_BUF, 4096, b"I'm server!\0");
        let cctx = h.process(2, CLIENT_BUF, 4096, b"Hello, I'm client!\0");

        let sreq = request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096);
        let creq = request("sim1", Ipv4Addr::LOCALHOST, CLIENT_BUF, 4096);
        let (_tx, mut srx) = watch::channel(false);
        let mut crx = srx.clone();

        let (s, c) = tokio::join!(server.run(&sctx, &sreq, &mut srx), client.run(&cctx, &creq, &mut crx));
        let s = s.unwrap();
        let c = c.unwrap();

        assert_eq!(s.role, Role::Server);
        assert_eq!(s.nents, 1);
        assert_eq!(s.remote_qpn, c.local_qpn);
        assert_eq!(c.outcome, SessionOutcome::Completed { byte_len: 4096 });
        let table = h.sg.get(&s.table).unwrap();
        assert_eq!(table.length(), 4096);
        assert_eq!(h.mem.read_user(ProcessId(1), SERVER_BUF, 19).unwrap(), b"Hello, I'm client!\0");

        // Tables outlive the session until the owner releases them.
        assert_eq!(sctx.pinned_pages(), 1);
        assert_eq!(h.sg.release_for_process(ProcessId(1)), 1);
        assert_eq!(h.sg.release_for_process(ProcessId(2)), 1);
        assert_eq!(sctx.pinned_pages(), 0);
        assert_eq!(cctx.pinned_pages(), 0);
        assert_eq!(h.fabric.live_resources(), 0);
        assert_eq!(h.mem.active_dma_mappings(), 0);
    }

    /// Drive the server against a hand-rolled client that only does the
    /// first handshake, with `fault` armed on the server's device.
    async fn server_with_fault(fault: SimFault) -> (Harness, Arc<MemoryContext>, RdmaError) {
        let h = Harness::new();
        let (a, b) = duplex_pair();
        let server = h.engine("sim0", Arc::new(a));
        let sctx = h.process(1, SERVER_BUF, 8192, b"");
        h.fabric.inject("sim0", fault);

        let sreq = request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 8192);
        let (_tx, mut rx) = watch::channel(false);
        let peer = ConnParam { qpn: QpNum(0xabc), psn: 0, lid: 99, gid: Gid::link_local(99) };

        let (res, _stream) = tokio::join!(server.run(&sctx, &sreq, &mut rx), async {
            let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            let mut stream: Box<dyn ControlStream> = b.establish(Role::Client, any).await.unwrap();
            handshake::exchange(&mut *stream, Role::Client, &peer).await.unwrap();
            stream
        });
        let err = res.unwrap_err();
        (h, sctx, err)
    }

    fn assert_full_teardown(h: &Harness, sctx: &MemoryContext) {
        let events = h.fabric.events();
        let order: Vec<usize> = [
            "sim0 destroy_qp",
            "sim0 destroy_cq",
            "dma_unmap",
            "sim0 dereg_mr",
            "put_page",
            "sim0 dealloc_pd",
        ]
        .iter()
        .map(|e| events.position(e).unwrap_or_else(|| panic!("missing {e}")))
        .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", events.snapshot());
        assert_eq!(sctx.pinned_pages(), 0);
        assert_eq!(h.fabric.live_resources(), 0);
        assert!(h.sg.lookup(sctx.pid()).is_none());
    }

    #[tokio::test]
    async fn test_fault_at_init_stops_before_rtr() {
        let (h, sctx, err) = server_with_fault(SimFault::Transition(QpState::Init)).await;
        assert!(matches!(err, RdmaError::Verbs(e) if e.op == VerbsOp::ModifyQp));
        assert!(h.fabric.events().position("sim0 modify_qp").is_none());
        assert_full_teardown(&h, &sctx);
    }

    #[tokio::test]
    async fn test_fault_at_rtr_stops_before_rts() {
        let (h, sctx, err) = server_with_fault(SimFault::Transition(QpState::Rtr)).await;
        assert!(matches!(err, RdmaError::Verbs(_)));
        let events = h.fabric.events();
        assert!(events.position("sim0 modify_qp INIT").is_some());
        assert!(events.position("sim0 modify_qp RTR").is_none());
        assert!(events.position("sim0 modify_qp RTS").is_none());
        assert_full_teardown(&h, &sctx);
    }

    #[tokio::test]
    async fn test_fault_at_rts_stops_before_post() {
        let (h, sctx, err) = server_with_fault(SimFault::Transition(QpState::Rts)).await;
        assert!(matches!(err, RdmaError::Verbs(_)));
        let events = h.fabric.events();
        assert!(events.position("sim0 modify_qp RTR").is_some());
        assert!(events.position("sim0 post_recv").is_none());
        assert_full_teardown(&h, &sctx);
    }

    #[tokio::test]
    async fn test_address_handle_failure_aborts_rtr() {
        let (h, sctx, err) = server_with_fault(SimFault::Op(VerbsOp::CreateAh)).await;
        assert!(matches!(err, RdmaError::Verbs(e) if e.op == VerbsOp::CreateAh));
        assert!(h.fabric.events().position("sim0 modify_qp RTR").is_none());
        assert_full_teardown(&h, &sctx);
    }

    #[tokio::test]
    async fn test_device_not_found_pins_nothing() {
        let h = Harness::new();
        let (a, _b) = duplex_pair();
        let engine = h.engine("sim0", Arc::new(a));
        let ctx = h.process(1, SERVER_BUF, 4096, b"");
        let (_tx, mut rx) = watch::channel(false);

        let err = engine
            .run(&ctx, &request("mlx5_0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::DeviceNotFound(_)));
        assert_eq!(h.mem.pin_calls(), 0);
        assert_eq!(h.fabric.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_over_quota_fails_before_connecting() {
        let h = Harness::new();
        let (a, _b) = duplex_pair();
        let engine = h.engine("sim0", Arc::new(a));
        h.mem.map_user(ProcessId(1), SERVER_BUF, 4 * 4096, FrameLayout::Contiguous);
        let ctx = Arc::new(MemoryContext::new(ProcessId(1), 2));
        let (_tx, mut rx) = watch::channel(false);

        let err = engine
            .run(&ctx, &request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4 * 4096), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::Memory(pinrdma_mem::MemError::ResourceExhausted { .. })));
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(h.fabric.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_handshake() {
        let h = Harness::new();
        let (a, b) = duplex_pair();
        let engine = h.engine("sim0", Arc::new(a));
        let ctx = h.process(1, SERVER_BUF, 4096, b"");
        let (tx, mut rx) = watch::channel(false);
        let sreq = request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096);

        // The peer connects but never speaks.
        let _silent = b;
        let (res, _) = tokio::join!(engine.run(&ctx, &sreq, &mut rx), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
        });
        assert!(matches!(res, Err(RdmaError::Cancelled)));
        assert_eq!(ctx.pinned_pages(), 0);
        assert_eq!(h.fabric.live_resources(), 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let h = Harness::new();
        let (a, _silent) = duplex_pair();
        let engine = h.engine("sim0", Arc::new(a)).with_session_config(SessionConfig {
            handshake_timeout_ms: 20,
            ..Default::default()
        });
        let ctx = h.process(1, SERVER_BUF, 4096, b"");
        let (_tx, mut rx) = watch::channel(false);

        let err = engine
            .run(&ctx, &request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::Timeout { what: "handshake", .. }));
        assert_eq!(ctx.pinned_pages(), 0);
    }

    #[tokio::test]
    async fn test_failed_completion_is_reported() {
        let h = Harness::new();
        let (a, b) = duplex_pair();
        let server = h.engine("sim0", Arc::new(a));
        let client = h.engine("sim1", Arc::new(b));
        let sctx = h.process(1, SERVER_BUF, 4096, b"");
        let cctx = h.process(2, CLIENT_BUF, 4096, b"");
        h.fabric.inject("sim1", SimFault::CompletionStatus(WcStatus::RemAccessErr));

        let sreq = request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096);
        let creq = request("sim1", Ipv4Addr::LOCALHOST, CLIENT_BUF, 4096);
        let (_tx, mut srx) = watch::channel(false);
        let mut crx = srx.clone();

        let (_s, c) = tokio::join!(server.run(&sctx, &sreq, &mut srx), client.run(&cctx, &creq, &mut crx));
        assert!(matches!(c, Err(RdmaError::RemoteFailure(WcStatus::RemAccessErr))));
        assert_eq!(cctx.pinned_pages(), 0);
        assert!(h.sg.lookup(ProcessId(2)).is_none());
    }

    #[tokio::test]
    async fn test_second_session_after_connector_is_spent() {
        let h = Harness::new();
        let connector: Arc<DuplexConnector> = Arc::new(duplex_pair().0);
        let engine = h.engine("sim0", connector.clone());
        let ctx = h.process(1, SERVER_BUF, 4096, b"");
        let (_tx, mut rx) = watch::channel(false);
        let any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let _taken = connector.establish(Role::Server, any).await.unwrap();

        let err = engine
            .run(&ctx, &request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, RdmaError::Transport { op: "connect", .. }));
        assert_eq!(ctx.pinned_pages(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_over_tcp() {
        let h = Harness::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cfg = SessionConfig { connect_retries: 20, connect_retry_interval_ms: 10, ..Default::default() };
        let server = h.engine("sim0", Arc::new(TcpControlConnector::new(&cfg).with_listener(listener)));
        let client = h.engine("sim1", Arc::new(TcpControlConnector::new(&cfg)));
        let sctx = h.process(1, SERVER_BUF, 4096, b"");
        let cctx = h.process(2, CLIENT_BUF, 4096, b"over tcp\0");

        let mut sreq = request("sim0", Ipv4Addr::UNSPECIFIED, SERVER_BUF, 4096);
        sreq.peer.set_port(port);
        let mut creq = request("sim1", Ipv4Addr::LOCALHOST, CLIENT_BUF, 4096);
        creq.peer.set_port(port);
        let (_tx, mut srx) = watch::channel(false);
        let mut crx = srx.clone();

        let (s, c) = tokio::join!(server.run(&sctx, &sreq, &mut srx), client.run(&cctx, &creq, &mut crx));
        s.unwrap();
        c.unwrap();
        assert_eq!(h.mem.read_user(ProcessId(1), SERVER_BUF, 9).unwrap(), b"over tcp\0");
    }
}
