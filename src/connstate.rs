// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-connection VFConfig store. Stages
//! that allocate resources write here; downstream stages and the close path
//! read here to reverse their operations.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::sync::RwLock;

use crate::pci::address::PciAddress;

/* ---------------------------------------------------------------------------------------------- */

/// Opaque connection identifier, as provided on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A connection plays exactly one of these roles; each (connection, role)
/// pair has at most one [`VfConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Per-connection record of the kernel-mechanism VF assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfConfig {
    pub pf_interface_name: String,
    pub vf_interface_name: String,
    pub vf_index: u32,
    pub vf_address: PciAddress,
    pub iommu_group: u32,
}

/// Concurrent `(ConnectionId, Role) -> VfConfig` map. Writes are atomic
/// (last-writer-wins on the same key within one request); entries are
/// removed at connection close.
#[derive(Debug, Default)]
pub struct ConnectionStateStore {
    entries: RwLock<HashMap<(ConnectionId, Role), VfConfig>>,
}

impl ConnectionStateStore {
    pub fn new() -> ConnectionStateStore {
        ConnectionStateStore {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, conn: &ConnectionId, role: Role) -> Option<VfConfig> {
        self.entries
            .read()
            .unwrap()
            .get(&(conn.clone(), role))
            .cloned()
    }

    pub fn set(&self, conn: &ConnectionId, role: Role, config: VfConfig) {
        self.entries
            .write()
            .unwrap()
            .insert((conn.clone(), role), config);
    }

    pub fn remove(&self, conn: &ConnectionId, role: Role) -> Option<VfConfig> {
        self.entries.write().unwrap().remove(&(conn.clone(), role))
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
