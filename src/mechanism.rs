// SPDX-License-Identifier: MIT OR Apache-2.0

//! The mechanism-parameters map carried on every connection request, and
//! the central glossary of well-known key names used across it.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;

use crate::connstate::ConnectionId;

/* ---------------------------------------------------------------------------------------------- */

/// Well-known mechanism-parameter keys. Stages document the keys they own
/// and must ignore unknown keys on pass-through.
pub mod keys {
    pub const TOKEN_ID: &str = "tokenID";
    pub const DEVICE_TOKEN_ID: &str = "deviceTokenID";
    pub const PCI_ADDRESS: &str = "pciAddress";
    pub const IOMMU_GROUP: &str = "iommuGroup";
    pub const CGROUP_DIR: &str = "cgroupDir";
    pub const VFIO_MAJOR: &str = "vfioMajor";
    pub const VFIO_MINOR: &str = "vfioMinor";
    pub const DEVICE_MAJOR: &str = "deviceMajor";
    pub const DEVICE_MINOR: &str = "deviceMinor";
    pub const NET_NS_INODE: &str = "netNsInode";
    pub const IFACE_NAME: &str = "ifaceName";
    pub const VLAN: &str = "vlan";
    pub const IP: &str = "ip";
    pub const MAC: &str = "mac";
}

/// Well-known mechanism type names (the two delivery styles
/// distinguished below).
pub mod types {
    pub const KERNEL: &str = "KERNEL";
    pub const VFIO: &str = "VFIO";
}

/* ---------------------------------------------------------------------------------------------- */

/// The connection's declared device-delivery style, plus its
/// string->string parameters map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mechanism {
    pub mechanism_type: String,
    pub parameters: HashMap<String, String>,
}

impl Mechanism {
    pub fn new(mechanism_type: impl Into<String>) -> Mechanism {
        Mechanism {
            mechanism_type: mechanism_type.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.parameters.insert(key.to_string(), value.into());
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A connection flowing through the request chain. Each element reads and
/// writes the fields, labels, and mechanism parameters it owns and must
/// ignore ones it doesn't recognise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub labels: HashMap<String, String>,
    pub mechanism: Mechanism,
    /// Set by the caller re-submitting a request on a connection it already
    /// holds (a periodic refresh, not a fresh allocation), so downstream
    /// stages can detect that the mechanism parameters already reflect a
    /// prior successful allocation and short-circuit their own idempotent
    /// logic instead of re-allocating. This is one *typical* implementation
    /// of "the next path-segment already exists", not the only one (see
    /// `DESIGN.md`).
    pub established: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, mechanism: Mechanism) -> Connection {
        Connection {
            id,
            labels: HashMap::new(),
            mechanism,
            established: false,
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */
