// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::pci::address::PciAddress;

/* ---------------------------------------------------------------------------------------------- */

pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
pub const SYSFS_PCI_DRIVERS: &str = "/sys/bus/pci/drivers";

fn device_dir(addr: PciAddress) -> PathBuf {
    Path::new(SYSFS_PCI_DEVICES).join(addr.to_string())
}

/* ---------------------------------------------------------------------------------------------- */

/// The sysfs operations the PCI function model needs, behind a trait so
/// tests can run without `/sys/bus/pci` present.
#[cfg_attr(any(test, feature = "test-mocks"), mockall::automock)]
pub trait PciFunctionSource: Send + Sync + std::fmt::Debug {
    /// Reads `<addr>/sriov_totalvfs`. Absence of this attribute means the
    /// device is not SR-IOV capable.
    fn sriov_totalvfs(&self, addr: PciAddress) -> io::Result<Option<u32>>;

    /// Reads `<addr>/sriov_numvfs`.
    fn sriov_numvfs(&self, addr: PciAddress) -> io::Result<u32>;

    /// Writes `<addr>/sriov_numvfs`, materialising VFs.
    fn set_sriov_numvfs(&self, addr: PciAddress, count: u32) -> io::Result<()>;

    /// Lists `<addr>/virtfn*` symlinks, returning `(index, target address)`
    /// pairs sorted by numeric suffix.
    fn list_virtfns(&self, addr: PciAddress) -> io::Result<Vec<(u32, PciAddress)>>;

    /// Reads the basename of `<addr>/iommu_group`.
    fn iommu_group(&self, addr: PciAddress) -> io::Result<u32>;

    /// Reads the basename of `<addr>/driver`, or `None` if unbound.
    fn current_driver(&self, addr: PciAddress) -> io::Result<Option<String>>;

    /// Writes `addr` to `<addr>/driver/unbind`.
    fn unbind(&self, addr: PciAddress, driver: &str) -> io::Result<()>;

    /// Writes `addr` to `/sys/bus/pci/drivers/<driver>/bind`.
    fn bind(&self, addr: PciAddress, driver: &str) -> io::Result<()>;

    /// Lists the basenames of `<addr>/net/*`.
    fn net_interfaces(&self, addr: PciAddress) -> io::Result<Vec<String>>;

    /// Checks that `<device_dir>` exists and has a sane PCI layout.
    fn device_exists(&self, addr: PciAddress) -> bool;
}

/* ---------------------------------------------------------------------------------------------- */

/// Real, filesystem-backed implementation of [`PciFunctionSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxSysfs;

impl PciFunctionSource for LinuxSysfs {
    fn sriov_totalvfs(&self, addr: PciAddress) -> io::Result<Option<u32>> {
        let path = device_dir(addr).join("sriov_totalvfs");
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "non-numeric sriov_totalvfs")
            })?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn sriov_numvfs(&self, addr: PciAddress) -> io::Result<u32> {
        let path = device_dir(addr).join("sriov_numvfs");
        fs::read_to_string(&path)?
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-numeric sriov_numvfs"))
    }

    fn set_sriov_numvfs(&self, addr: PciAddress, count: u32) -> io::Result<()> {
        let path = device_dir(addr).join("sriov_numvfs");
        fs::write(path, count.to_string())
    }

    fn list_virtfns(&self, addr: PciAddress) -> io::Result<Vec<(u32, PciAddress)>> {
        let dir = device_dir(addr);
        let mut out = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            let Some(suffix) = name.strip_prefix("virtfn") else {
                continue;
            };
            let index: u32 = suffix
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad virtfn suffix"))?;

            let target = fs::read_link(entry.path())?;
            let target_addr: PciAddress = target
                .file_name()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad virtfn symlink"))?
                .to_string_lossy()
                .parse()
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "virtfn target not a PCI address")
                })?;

            out.push((index, target_addr));
        }

        out.sort_by_key(|(index, _)| *index);
        Ok(out)
    }

    fn iommu_group(&self, addr: PciAddress) -> io::Result<u32> {
        let link = fs::read_link(device_dir(addr).join("iommu_group"))?;
        let basename = link
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad iommu_group symlink"))?
            .to_string_lossy();
        basename
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-numeric iommu group"))
    }

    fn current_driver(&self, addr: PciAddress) -> io::Result<Option<String>> {
        match fs::read_link(device_dir(addr).join("driver")) {
            Ok(link) => Ok(link.file_name().map(|s| s.to_string_lossy().into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn unbind(&self, addr: PciAddress, driver: &str) -> io::Result<()> {
        let path = Path::new(SYSFS_PCI_DRIVERS).join(driver).join("unbind");
        fs::write(path, addr.to_string())
    }

    fn bind(&self, addr: PciAddress, driver: &str) -> io::Result<()> {
        let path = Path::new(SYSFS_PCI_DRIVERS).join(driver).join("bind");
        fs::write(path, addr.to_string())
    }

    fn net_interfaces(&self, addr: PciAddress) -> io::Result<Vec<String>> {
        let dir = device_dir(addr).join("net");
        match fs::read_dir(&dir) {
            Ok(entries) => entries
                .map(|e| Ok(e?.file_name().to_string_lossy().into_owned()))
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn device_exists(&self, addr: PciAddress) -> bool {
        device_dir(addr).is_dir()
    }
}

/* ---------------------------------------------------------------------------------------------- */
