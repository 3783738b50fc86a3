//! RDMA session plumbing.
//!
//! One session moves one buffer between two parties:
//!
//! 1. the buffer is pinned and described by a scatter-gather table
//!    (`pinrdma-mem`), then DMA-mapped;
//! 2. the parties meet over a TCP control channel ([`control`]) and swap
//!    queue-pair identifiers ([`handshake`]);
//! 3. the queue pair walks RESET → INIT → RTR → RTS ([`connection`]);
//! 4. one work request is posted and the completion queue is polled, with
//!    the handshake re-run as a liveness check while it is empty
//!    ([`completion`]).
//!
//! Hardware access goes through [`verbs::VerbsDevice`]. [`sim`] provides an
//! in-process fabric that implements it.

pub mod completion;
pub mod config;
pub mod connection;
pub mod control;
pub mod device;
pub mod error;
pub mod handshake;
pub mod request;
pub mod resource;
pub mod session;
pub mod sim;
pub mod surface;
pub mod verbs;

pub use config::{RdmaConfig, SessionConfig};
pub use connection::{ConnState, ConnectionContext};
pub use control::{ControlConnector, ControlStream, Role, TcpControlConnector};
pub use device::{DeviceInfo, DeviceRegistry, LinkLayer, PortInfo, PortState};
pub use error::RdmaError;
pub use handshake::ConnParam;
pub use request::SessionRequest;
pub use session::{SessionEngine, SessionOutcome, SessionReport};
pub use surface::ControlSurface;
pub use verbs::{Gid, VerbsDevice, VerbsError, VerbsOp};
