//! Out-of-band exchange of queue-pair identifiers.
//!
//! Each round moves one fixed-size record, with no framing and no byte-order
//! conversion: both ends are assumed to share endianness. Two rounds make an
//! exchange; in round `i` the server receives when `i` is even and the
//! client receives when `i` is odd.

use bytes::{Buf, BufMut};
use pinrdma_types::QpNum;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::control::Role;
use crate::error::RdmaError;
use crate::verbs::Gid;

/// Encoded size of [`ConnParam`].
pub const CONN_PARAM_LEN: usize = 4 + 4 + 2 + 16;

pub const ROUNDS: usize = 2;

/// What one side tells the other about its queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnParam {
    pub qpn: QpNum,
    /// Starting packet sequence number.
    pub psn: u32,
    pub lid: u16,
    pub gid: Gid,
}

impl ConnParam {
    pub fn encode(&self) -> [u8; CONN_PARAM_LEN] {
        let mut out = [0u8; CONN_PARAM_LEN];
        let mut buf = &mut out[..];
        buf.put_u32_ne(self.qpn.get());
        buf.put_u32_ne(self.psn);
        buf.put_u16_ne(self.lid);
        buf.put_slice(&self.gid.0);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, RdmaError> {
        if raw.len() != CONN_PARAM_LEN {
            return Err(RdmaError::protocol(
                "handshake",
                format!("record is {} bytes, expected {}", raw.len(), CONN_PARAM_LEN),
            ));
        }
        let mut buf = raw;
        let qpn = QpNum(buf.get_u32_ne());
        let psn = buf.get_u32_ne();
        let lid = buf.get_u16_ne();
        let mut gid = [0u8; 16];
        buf.copy_to_slice(&mut gid);
        Ok(Self { qpn, psn, lid, gid: Gid(gid) })
    }
}

/// Whether `role` receives in `round`.
///
/// The client speaks first: the server receives in round 0 and sends in
/// round 1. A peer that also waits to receive in round 0 deadlocks.
pub fn receives_in_round(round: usize, role: Role) -> bool {
    (round % 2 == 1) ^ role.is_server()
}

/// Run both rounds over `stream` and return the peer's record.
pub async fn exchange<S>(stream: &mut S, role: Role, local: &ConnParam) -> Result<ConnParam, RdmaError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut remote = None;
    for round in 0..ROUNDS {
        if receives_in_round(round, role) {
            let mut raw = [0u8; CONN_PARAM_LEN];
            stream
                .read_exact(&mut raw)
                .await
                .map_err(|e| RdmaError::transport("recv", e))?;
            remote = Some(ConnParam::decode(&raw)?);
        } else {
            stream
                .write_all(&local.encode())
                .await
                .map_err(|e| RdmaError::transport("send", e))?;
            stream.flush().await.map_err(|e| RdmaError::transport("send", e))?;
        }
    }
    remote.ok_or_else(|| RdmaError::protocol("handshake", "no record received"))
}
