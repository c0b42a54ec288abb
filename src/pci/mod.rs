// SPDX-License-Identifier: MIT OR Apache-2.0

//! Read-only(+bind) view over the host's SR-IOV-capable PCI physical
//! functions and their virtual functions.

/* ---------------------------------------------------------------------------------------------- */

pub mod address;
pub mod sysfs;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pci::address::PciAddress;
use crate::pci::sysfs::PciFunctionSource;

/* ---------------------------------------------------------------------------------------------- */

/// A virtual function instantiated by a [`PhysicalFunction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    pub address: PciAddress,
    /// Index within the PF, derived from the `virtfn<N>` symlink.
    pub index: u32,
    pub iommu_group: u32,
}

/// A PF declared in configuration, plus everything scanned from sysfs at
/// construction time.
#[derive(Debug, Clone)]
pub struct PhysicalFunction {
    pub address: PciAddress,
    pub pf_kernel_driver: String,
    pub vf_kernel_driver: String,
    pub capabilities: Vec<String>,
    pub service_domains: Vec<String>,
    pub skip_driver_check: bool,
    pub vfs: Vec<VirtualFunction>,
}

impl PhysicalFunction {
    /// Cartesian product of service-domains x capabilities: the set of
    /// token names this PF can satisfy.
    pub fn token_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.service_domains.len() * self.capabilities.len());
        for domain in &self.service_domains {
            for capability in &self.capabilities {
                names.push(format!("{domain}/{capability}"));
            }
        }
        names
    }

    pub fn vf(&self, addr: PciAddress) -> Option<&VirtualFunction> {
        self.vfs.iter().find(|vf| vf.address == addr)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Owns the set of PFs declared in configuration and the sysfs handle used
/// to scan and (re-)bind them.
#[derive(Debug)]
pub struct PciModel {
    source: Arc<dyn PciFunctionSource>,
    pfs: HashMap<PciAddress, PhysicalFunction>,
}

impl PciModel {
    /// Scans every PF declared in `config`, validating PCI address format,
    /// sysfs device-directory existence, and SR-IOV capability. If fewer
    /// VFs exist than the PF's hardware maximum, materialises the maximum.
    pub fn new(config: &Config, source: Arc<dyn PciFunctionSource>) -> Result<PciModel> {
        let mut pfs = HashMap::with_capacity(config.physical_functions.len());

        for (addr_str, pf_config) in &config.physical_functions {
            let address: PciAddress = addr_str.parse()?;

            if !source.device_exists(address) {
                return Err(Error::configuration(format!(
                    "PF {address} has no sysfs device directory"
                )));
            }

            let total_vfs = source.sriov_totalvfs(address).map_err(|e| {
                Error::configuration(format!("failed to read sriov_totalvfs for {address}: {e}"))
            })?;
            let Some(total_vfs) = total_vfs else {
                return Err(Error::configuration(format!(
                    "{address} has no sriov_totalvfs attribute (not SR-IOV capable)"
                )));
            };

            let current_vfs = source.sriov_numvfs(address).unwrap_or(0);
            if current_vfs < total_vfs {
                debug!(%address, current_vfs, total_vfs, "materialising VFs");
                source
                    .set_sriov_numvfs(address, total_vfs)
                    .map_err(|e| {
                        Error::configuration(format!(
                            "failed to set sriov_numvfs={total_vfs} on {address}: {e}"
                        ))
                    })?;
            }

            let mut vfs = Vec::new();
            for (index, vf_addr) in source.list_virtfns(address).map_err(|e| {
                Error::configuration(format!("failed to enumerate VFs of {address}: {e}"))
            })? {
                let iommu_group = source.iommu_group(vf_addr).map_err(|e| {
                    Error::configuration(format!("failed to read iommu_group for {vf_addr}: {e}"))
                })?;
                vfs.push(VirtualFunction {
                    address: vf_addr,
                    index,
                    iommu_group,
                });
            }
            vfs.sort_by_key(|vf| vf.index);

            pfs.insert(
                address,
                PhysicalFunction {
                    address,
                    pf_kernel_driver: pf_config.pf_kernel_driver.clone(),
                    vf_kernel_driver: pf_config.vf_kernel_driver.clone(),
                    capabilities: pf_config.capabilities.clone(),
                    service_domains: pf_config.service_domains.clone(),
                    skip_driver_check: pf_config.skip_driver_check,
                    vfs,
                },
            );
        }

        Ok(PciModel { source, pfs })
    }

    pub fn physical_functions(&self) -> impl Iterator<Item = &PhysicalFunction> {
        self.pfs.values()
    }

    pub fn pf(&self, addr: PciAddress) -> Option<&PhysicalFunction> {
        self.pfs.get(&addr)
    }

    /// Finds the PF that owns `vf_addr`, if any.
    pub fn owning_pf(&self, vf_addr: PciAddress) -> Option<&PhysicalFunction> {
        self.pfs.values().find(|pf| pf.vf(vf_addr).is_some())
    }

    /// Bind-driver contract: no-op if already bound to
    /// `driver`; otherwise unbind the current driver (if any) then bind the
    /// target. Verifies success by re-reading the bound driver rather than
    /// by write error, since the kernel sometimes reports EINVAL on a bind
    /// that actually succeeded.
    pub fn bind_driver(&self, vf_addr: PciAddress, driver: &str) -> Result<()> {
        let current = self
            .source
            .current_driver(vf_addr)
            .map_err(|e| self.driver_bind_error(vf_addr, driver, e))?;

        if current.as_deref() == Some(driver) {
            return Ok(());
        }

        if let Some(current) = current {
            self.source
                .unbind(vf_addr, &current)
                .map_err(|e| self.driver_bind_error(vf_addr, driver, e))?;
        }

        if let Err(e) = self.source.bind(vf_addr, driver) {
            warn!(%vf_addr, driver, error = %e, "bind write reported an error, re-checking bound driver before giving up");
        }

        let now_bound = self
            .source
            .current_driver(vf_addr)
            .map_err(|e| self.driver_bind_error(vf_addr, driver, e))?;

        if now_bound.as_deref() == Some(driver) {
            Ok(())
        } else {
            Err(Error::DriverBind {
                group: 0,
                driver: driver.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{vf_addr} bound to {now_bound:?} instead of {driver}"),
                ),
            })
        }
    }

    fn driver_bind_error(&self, vf_addr: PciAddress, driver: &str, source: std::io::Error) -> Error {
        let group = self
            .owning_pf(vf_addr)
            .and_then(|pf| pf.vf(vf_addr))
            .map(|vf| vf.iommu_group)
            .unwrap_or(0);
        Error::DriverBind {
            group,
            driver: driver.to_string(),
            source,
        }
    }

    /// The net interface name bound to `vf_addr`, if the VF is
    /// kernel-driver-bound and exposes one. `skipDriverCheck` only changes
    /// how callers treat an empty result; this always reports the raw
    /// sysfs state.
    pub fn net_interface_name(&self, vf_addr: PciAddress) -> Result<Option<String>> {
        let names = self
            .source
            .net_interfaces(vf_addr)
            .map_err(|e| self.driver_bind_error(vf_addr, "", e))?;
        Ok(names.into_iter().next())
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
