//! Binary session request.
//!
//! A session is triggered by writing one fixed-size record laid out like the
//! C struct
//!
//! ```text
//! offset  size  field
//!      0    50  device name, NUL-padded
//!     52    16  sockaddr_in (family native-endian, port and address big-endian)
//!     68     4  transport port (i32)
//!     72     4  GID index (i32)
//!     80     8  virtual address (u64)
//!     88     8  length (u64)
//! ```
//!
//! Integers other than the socket address are native-endian. Padding bytes
//! are written as zero and ignored on decode.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::control::Role;
use crate::error::RdmaError;

pub const DEVICE_NAME_LEN: usize = 50;
pub const REQUEST_LEN: usize = 96;

const SOCKADDR_OFFSET: usize = 52;
const SOCKADDR_ZERO_LEN: usize = 8;
const PORT_OFFSET: usize = 68;
const VIRT_OFFSET: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub device_name: String,
    /// Wildcard address for the server; the server's address for a client.
    pub peer: SocketAddrV4,
    /// Port number on the device.
    pub rdma_port: u8,
    pub sgid_index: u8,
    pub virt_addr: u64,
    pub length: u64,
}

impl SessionRequest {
    pub fn role(&self) -> Role {
        Role::from_addr(&self.peer)
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_LEN], RdmaError> {
        let name = self.device_name.as_bytes();
        if name.len() > DEVICE_NAME_LEN {
            return Err(RdmaError::InvalidArgument(format!(
                "device name {:?} is longer than {} bytes",
                self.device_name, DEVICE_NAME_LEN
            )));
        }

        let mut out = [0u8; REQUEST_LEN];
        out[..name.len()].copy_from_slice(name);

        let mut buf = &mut out[SOCKADDR_OFFSET..];
        buf.put_u16_ne(libc::AF_INET as u16);
        buf.put_u16(self.peer.port());
        buf.put_slice(&self.peer.ip().octets());
        buf.put_bytes(0, SOCKADDR_ZERO_LEN);
        buf.put_i32_ne(self.rdma_port as i32);
        buf.put_i32_ne(self.sgid_index as i32);

        let mut buf = &mut out[VIRT_OFFSET..];
        buf.put_u64_ne(self.virt_addr);
        buf.put_u64_ne(self.length);
        Ok(out)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, RdmaError> {
        if raw.len() != REQUEST_LEN {
            return Err(RdmaError::InvalidArgument(format!(
                "record is {} bytes, expected {}",
                raw.len(),
                REQUEST_LEN
            )));
        }

        let name_bytes = &raw[..DEVICE_NAME_LEN];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
        let device_name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| RdmaError::BadRequest("device name is not UTF-8".into()))?
            .to_string();

        let mut buf = &raw[SOCKADDR_OFFSET..];
        let family = buf.get_u16_ne();
        if family != libc::AF_INET as u16 {
            return Err(RdmaError::BadRequest(format!("address family {} is not AF_INET", family)));
        }
        let port = buf.get_u16();
        let ip = Ipv4Addr::from(buf.get_u32());

        let mut buf = &raw[PORT_OFFSET..];
        let rdma_port = narrow("rdma_port", buf.get_i32_ne())?;
        let sgid_index = narrow("sgid_index", buf.get_i32_ne())?;

        let mut buf = &raw[VIRT_OFFSET..];
        let virt_addr = buf.get_u64_ne();
        let length = buf.get_u64_ne();

        Ok(Self {
            device_name,
            peer: SocketAddrV4::new(ip, port),
            rdma_port,
            sgid_index,
            virt_addr,
            length,
        })
    }
}

fn narrow(field: &str, value: i32) -> Result<u8, RdmaError> {
    u8::try_from(value).map_err(|_| RdmaError::BadRequest(format!("{} {} out of range", field, value)))
}
