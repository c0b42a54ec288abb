// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;
use std::path::PathBuf;

/* ---------------------------------------------------------------------------------------------- */

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The seven error kinds of the resource-management plane.
///
/// Stages wrap lower-level failures with enough context (which address,
/// which token, which cgroup) that the outermost chain element can surface
/// the error to its caller verbatim; nothing here is ever swallowed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid YAML, a missing required PF field, or an unknown PCI address
    /// in configuration. Fatal at startup.
    #[error("configuration error: {detail}")]
    Configuration { detail: String },

    /// No free VF satisfies the token's PF set, driver type, and IOMMU-group
    /// constraint.
    #[error("no free VF available for token {token_name}")]
    InventoryExhausted { token_name: String },

    /// The kernel refused the target driver for an IOMMU group.
    #[error("failed to bind IOMMU group {group} to driver {driver}: {source}")]
    DriverBind {
        group: u32,
        driver: String,
        #[source]
        source: io::Error,
    },

    /// Moving an interface, setting an address, or creating a device node
    /// failed.
    #[error("kernel operation failed ({detail}): {source}")]
    KernelOperation {
        detail: String,
        #[source]
        source: io::Error,
    },

    /// `devices.list` could not be parsed, or an allow/deny write was
    /// refused on at least one container.
    #[error("cgroup authorization failed for {}: {detail}", cgroup_path.display())]
    CgroupAuthorization { cgroup_path: PathBuf, detail: String },

    /// `next.Request` returned an error; the current stage has undone its
    /// own work and is propagating.
    #[error("downstream stage failed: {0}")]
    Downstream(Box<Error>),

    /// An attempt to transition a token (or VF, or IOMMU group) through a
    /// forbidden edge.
    #[error("state inconsistency: {detail}")]
    StateInconsistency { detail: String },
}

impl Error {
    pub fn configuration(detail: impl Into<String>) -> Error {
        Error::Configuration {
            detail: detail.into(),
        }
    }

    pub fn state_inconsistency(detail: impl Into<String>) -> Error {
        Error::StateInconsistency {
            detail: detail.into(),
        }
    }

    pub fn downstream(self) -> Error {
        Error::Downstream(Box::new(self))
    }
}

/* ---------------------------------------------------------------------------------------------- */
