//! Device metadata and the by-name device registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::RdmaError;
use crate::verbs::{Gid, VerbsDevice};

/// Link layer type for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    Infiniband,
    /// RoCE.
    Ethernet,
    Unspecified,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
            LinkLayer::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Nop => write!(f, "NOP"),
            PortState::Down => write!(f, "DOWN"),
            PortState::Init => write!(f, "INIT"),
            PortState::Armed => write!(f, "ARMED"),
            PortState::Active => write!(f, "ACTIVE"),
            PortState::ActiveDefer => write!(f, "ACTIVE_DEFER"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_num: u8,
    pub link_layer: LinkLayer,
    pub state: PortState,
    /// Local identifier; zero on Ethernet ports.
    pub lid: u16,
    /// GID table, indexed by SGID index.
    pub gids: Vec<Gid>,
}

impl PortInfo {
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active || self.state == PortState::ActiveDefer
    }

    pub fn gid(&self, index: u8) -> Option<Gid> {
        self.gids.get(index as usize).copied()
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub ports: BTreeMap<u8, PortInfo>,
    /// Upper bound on a single DMA segment, in bytes.
    pub max_segment_size: u32,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, max_segment_size: u32) -> Self {
        Self {
            name: name.into(),
            ports: BTreeMap::new(),
            max_segment_size,
        }
    }

    pub fn add_port(&mut self, port: PortInfo) {
        self.ports.insert(port.port_num, port);
    }

    pub fn port(&self, num: u8) -> Option<&PortInfo> {
        self.ports.get(&num)
    }
}

/// Devices available to sessions, by name.
///
/// Devices come and go at run time; a session resolves its device once at
/// start and holds the `Arc` until teardown, so unregistering does not pull
/// a device out from under a running session.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<dyn VerbsDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, device: Arc<dyn VerbsDevice>) -> Result<(), RdmaError> {
        let name = device.info().name.clone();
        match self.devices.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(RdmaError::InvalidArgument(format!(
                "device {} already registered",
                e.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                tracing::info!(device = %e.key(), "device registered");
                e.insert(device);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn VerbsDevice>> {
        let removed = self.devices.remove(name).map(|(_, dev)| dev);
        if removed.is_some() {
            tracing::info!(device = name, "device unregistered");
        }
        removed
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn VerbsDevice>, RdmaError> {
        self.devices
            .get(name)
            .map(|d| d.value().clone())
            .ok_or_else(|| RdmaError::DeviceNotFound(name.to_string()))
    }
}
