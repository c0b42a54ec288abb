// SPDX-License-Identifier: MIT OR Apache-2.0

//! VFIO stage: exposes the control and group device nodes
//! for a VFIO-bound VF, authorising them in the client pod's cgroups and
//! (client side) creating the corresponding device nodes.

/* ---------------------------------------------------------------------------------------------- */

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::cgroup::CgroupBroker;
use crate::chain::{ChainElement, Next, RequestContext};
use crate::error::Result;
use crate::mechanism::{keys, Connection};
use crate::netctl::NetworkControl;

/* ---------------------------------------------------------------------------------------------- */

/// Server side: stats the control (`<vfioDir>/vfio`) and group
/// (`<vfioDir>/<iommuGroup>`) device nodes, authorises both in every
/// container cgroup matching the client-provided glob, and records their
/// `(major, minor)` on the mechanism.
pub struct VfioServerStage {
    netctl: Arc<dyn NetworkControl>,
    cgroups: Arc<CgroupBroker>,
    vfio_dir: PathBuf,
}

impl VfioServerStage {
    pub fn new(netctl: Arc<dyn NetworkControl>, cgroups: Arc<CgroupBroker>, vfio_dir: PathBuf) -> VfioServerStage {
        VfioServerStage { netctl, cgroups, vfio_dir }
    }
}

impl ChainElement for VfioServerStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        let Some(group) = conn.mechanism.get(keys::IOMMU_GROUP).map(str::to_string) else {
            return next.request(ctx, conn);
        };
        let Some(cgroup_glob) = conn.mechanism.get(keys::CGROUP_DIR).map(str::to_string) else {
            return next.request(ctx, conn);
        };

        let control_path = self.vfio_dir.join("vfio");
        let group_path = self.vfio_dir.join(&group);

        let (ctrl_major, ctrl_minor) = self.netctl.stat_device(&control_path)?;
        let (dev_major, dev_minor) = self.netctl.stat_device(&group_path)?;

        self.cgroups.allow(&cgroup_glob, ctrl_major, ctrl_minor)?;
        if let Err(err) = self.cgroups.allow(&cgroup_glob, dev_major, dev_minor) {
            self.cgroups.deny(&cgroup_glob, ctrl_major, ctrl_minor).ok();
            return Err(err);
        }

        conn.mechanism.set(keys::VFIO_MAJOR, ctrl_major.to_string());
        conn.mechanism.set(keys::VFIO_MINOR, ctrl_minor.to_string());
        conn.mechanism.set(keys::DEVICE_MAJOR, dev_major.to_string());
        conn.mechanism.set(keys::DEVICE_MINOR, dev_minor.to_string());

        debug!(connection = %conn.id, group, ctrl_major, ctrl_minor, dev_major, dev_minor, "authorised VFIO devices");

        match next.request(ctx, conn) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.cgroups.deny(&cgroup_glob, ctrl_major, ctrl_minor).ok();
                self.cgroups.deny(&cgroup_glob, dev_major, dev_minor).ok();
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;

        let (Some(cgroup_glob), Some(ctrl_major), Some(ctrl_minor), Some(dev_major), Some(dev_minor)) = (
            conn.mechanism.get(keys::CGROUP_DIR),
            conn.mechanism.get(keys::VFIO_MAJOR).and_then(|s| s.parse::<u32>().ok()),
            conn.mechanism.get(keys::VFIO_MINOR).and_then(|s| s.parse::<u32>().ok()),
            conn.mechanism.get(keys::DEVICE_MAJOR).and_then(|s| s.parse::<u32>().ok()),
            conn.mechanism.get(keys::DEVICE_MINOR).and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return Ok(());
        };

        self.cgroups.deny(cgroup_glob, ctrl_major, ctrl_minor)?;
        self.cgroups.deny(cgroup_glob, dev_major, dev_minor)?;
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Client side: once the server leg of the same request has returned with
/// `(major, minor)` for both devices, creates the corresponding device
/// nodes under the client's own VFIO directory.
pub struct VfioClientStage {
    netctl: Arc<dyn NetworkControl>,
    client_vfio_dir: PathBuf,
}

impl VfioClientStage {
    pub fn new(netctl: Arc<dyn NetworkControl>, client_vfio_dir: PathBuf) -> VfioClientStage {
        VfioClientStage { netctl, client_vfio_dir }
    }
}

impl ChainElement for VfioClientStage {
    fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
        let result = next.request(ctx, conn)?;

        let (Some(group), Some(ctrl_major), Some(ctrl_minor), Some(dev_major), Some(dev_minor)) = (
            result.mechanism.get(keys::IOMMU_GROUP),
            result.mechanism.get(keys::VFIO_MAJOR).and_then(|s| s.parse::<u32>().ok()),
            result.mechanism.get(keys::VFIO_MINOR).and_then(|s| s.parse::<u32>().ok()),
            result.mechanism.get(keys::DEVICE_MAJOR).and_then(|s| s.parse::<u32>().ok()),
            result.mechanism.get(keys::DEVICE_MINOR).and_then(|s| s.parse::<u32>().ok()),
        ) else {
            return Ok(result);
        };

        self.netctl.mknod_char_device(&self.client_vfio_dir.join("vfio"), ctrl_major, ctrl_minor)?;
        self.netctl.mknod_char_device(&self.client_vfio_dir.join(group), dev_major, dev_minor)?;

        Ok(result)
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
