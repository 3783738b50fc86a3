//! Write-style entry point for sessions.
//!
//! A caller writes one [`SessionRequest`] record and blocks until its
//! session ends; the call returns the record size on success. When the
//! caller goes away, [`ControlSurface::release`] drops whatever tables its
//! sessions left registered.

use std::sync::Arc;

use pinrdma_mem::MemoryContext;
use pinrdma_types::{ProcessId, Result, Status};
use tokio::sync::watch;

use crate::request::SessionRequest;
use crate::session::{SessionEngine, SessionReport};

pub struct ControlSurface {
    engine: Arc<SessionEngine>,
    shutdown: watch::Sender<bool>,
}

impl ControlSurface {
    pub fn new(engine: Arc<SessionEngine>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { engine, shutdown }
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    /// Decode `bytes` and run the session it describes for `caller`.
    pub async fn write(&self, caller: &Arc<MemoryContext>, bytes: &[u8]) -> Result<usize> {
        self.write_report(caller, bytes).await.map(|_| bytes.len())
    }

    pub async fn write_report(&self, caller: &Arc<MemoryContext>, bytes: &[u8]) -> Result<SessionReport> {
        let req = SessionRequest::decode(bytes).map_err(Status::from)?;
        let mut cancel = self.shutdown.subscribe();
        self.engine.run(caller, &req, &mut cancel).await.map_err(Status::from)
    }

    /// [`write`](Self::write) folded into a syscall-style return: the byte
    /// count, or a negated errno.
    pub async fn write_ret(&self, caller: &Arc<MemoryContext>, bytes: &[u8]) -> isize {
        match self.write(caller, bytes).await {
            Ok(n) => n as isize,
            Err(status) => {
                tracing::debug!(pid = %caller.pid(), status = %status, "write failed");
                -(status.errno() as isize)
            }
        }
    }

    /// Release every table still registered for `pid`.
    pub fn release(&self, pid: ProcessId) -> usize {
        let released = self.engine.sg().release_for_process(pid);
        if released > 0 {
            tracing::info!(%pid, released, "released tables on close");
        }
        released
    }

    /// Cancel running sessions and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
