//! Completion loop for the single posted work request.
//!
//! The loop polls the completion queue without blocking. While it is empty
//! the handshake is re-run over the control channel as a liveness check: a
//! peer that finished and closed its end shows up as a closed channel, which
//! ends the loop cleanly. Every iteration yields to the runtime, and the
//! whole loop is bounded by an optional timeout and a cancellation signal.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::RdmaError;
use crate::verbs::WorkCompletion;

/// Non-blocking source of work completions.
pub trait CompletionSource {
    fn poll_one(&mut self) -> Result<Option<WorkCompletion>, RdmaError>;
}

/// Checks that the peer is still there.
#[async_trait]
pub trait LivenessCheck: Send {
    async fn check(&mut self) -> Result<(), RdmaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed(WorkCompletion),
    /// The control channel closed before a completion arrived.
    PeerDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    /// Completion-queue polls performed, including the final one.
    pub polls: usize,
}

/// Resolves once `true` is observed on `rx`. A dropped sender never cancels.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn poll_loop<C, P>(cq: &mut C, check: &mut P) -> Result<LoopReport, RdmaError>
where
    C: CompletionSource + Send + ?Sized,
    P: LivenessCheck + ?Sized,
{
    let mut polls = 0;
    loop {
        polls += 1;
        if let Some(wc) = cq.poll_one()? {
            if !wc.status.is_success() {
                tracing::warn!(wr_id = wc.wr_id, status = ?wc.status, polls, "work request failed");
                return Err(RdmaError::RemoteFailure(wc.status));
            }
            tracing::debug!(wr_id = wc.wr_id, byte_len = wc.byte_len, polls, "work request completed");
            return Ok(LoopReport { outcome: LoopOutcome::Completed(wc), polls });
        }

        match check.check().await {
            Ok(()) => {}
            Err(e) if e.is_peer_closed() => {
                tracing::debug!(polls, error = %e, "peer closed the control channel");
                return Ok(LoopReport { outcome: LoopOutcome::PeerDisconnected, polls });
            }
            Err(e) => return Err(e),
        }
        tokio::task::yield_now().await;
    }
}

/// Drive `cq` until the work request completes or the peer leaves.
pub async fn drive_completion<C, P>(
    cq: &mut C,
    check: &mut P,
    timeout: Option<Duration>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<LoopReport, RdmaError>
where
    C: CompletionSource + Send + ?Sized,
    P: LivenessCheck + ?Sized,
{
    let run = async {
        match timeout {
            Some(after) => match tokio::time::timeout(after, poll_loop(cq, check)).await {
                Ok(res) => res,
                Err(_) => Err(RdmaError::Timeout { what: "completion", after }),
            },
            None => poll_loop(cq, check).await,
        }
    };
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(RdmaError::Cancelled),
        res = run => res,
    }
}
