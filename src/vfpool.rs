// SPDX-License-Identifier: MIT OR Apache-2.0

//! VF resource pool: maps token IDs to concrete VFs, honouring IOMMU-group
//! driver exclusivity and ranking candidates by driver affinity and
//! fragmentation.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pci::address::PciAddress;
use crate::pci::PciModel;
use crate::token::id::TokenId;
use crate::token::TokenPool;

/* ---------------------------------------------------------------------------------------------- */

/// The two driver types a VF may be claimed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Kernel,
    Vfio,
}

impl DriverKind {
    pub fn driver_name<'a>(&self, pf: &'a crate::pci::PhysicalFunction) -> &'a str {
        match self {
            DriverKind::Kernel => &pf.vf_kernel_driver,
            DriverKind::Vfio => "vfio-pci",
        }
    }
}

struct Inner {
    /// `None` means the IOMMU group is currently bound to neither driver.
    group_driver: HashMap<u32, DriverKind>,
    vf_holder: HashMap<PciAddress, TokenId>,
    token_vf: HashMap<TokenId, PciAddress>,
    pf_free_count: HashMap<PciAddress, u32>,
}

/// Maps token IDs to concrete VFs. Selection and release are serialised by
/// an externally-supplied `resource_lock`, shared with whatever else needs
/// token-state transitions and VF selection to be one atomic section.
pub struct VfResourcePool {
    pci: Arc<PciModel>,
    tokens: Arc<TokenPool>,
    resource_lock: Arc<Mutex<()>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for VfResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfResourcePool").finish_non_exhaustive()
    }
}

impl VfResourcePool {
    pub fn new(pci: Arc<PciModel>, tokens: Arc<TokenPool>, resource_lock: Arc<Mutex<()>>) -> VfResourcePool {
        let mut pf_free_count = HashMap::new();
        for pf in pci.physical_functions() {
            pf_free_count.insert(pf.address, pf.vfs.len() as u32);
        }

        VfResourcePool {
            pci,
            tokens,
            resource_lock,
            inner: Mutex::new(Inner {
                group_driver: HashMap::new(),
                vf_holder: HashMap::new(),
                token_vf: HashMap::new(),
                pf_free_count,
            }),
        }
    }

    fn vf_group(&self, addr: PciAddress) -> Option<u32> {
        self.pci.owning_pf(addr)?.vf(addr).map(|vf| vf.iommu_group)
    }

    /// Selects a VF for `token_id` under `driver_kind`. Idempotent when the
    /// token already holds a VF whose group matches `driver_kind`; rebinds
    /// (freeing the old VF first) when the driver type changed.
    pub fn select(&self, token_id: &TokenId, driver_kind: DriverKind) -> Result<PciAddress> {
        let _guard = self.resource_lock.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();

        if let Some(&existing) = inner.token_vf.get(token_id) {
            let group = self
                .vf_group(existing)
                .ok_or_else(|| Error::state_inconsistency(format!("VF {existing} has no PF record")))?;
            if inner.group_driver.get(&group) == Some(&driver_kind) {
                trace!(%token_id, %existing, "select is idempotent, token already holds matching VF");
                return Ok(existing);
            }
            debug!(%token_id, %existing, "driver type changed, freeing existing VF before reselecting");
            self.free_locked(&mut inner, existing)?;
        }

        let name = self.tokens.find(token_id)?;

        let mut candidates: Vec<(PciAddress, u32, u32, &crate::pci::PhysicalFunction)> = Vec::new();
        for pf in self.pci.physical_functions() {
            if !pf.token_names().iter().any(|n| *n == name) {
                continue;
            }
            let free_count = *inner.pf_free_count.get(&pf.address).unwrap_or(&0);
            for vf in &pf.vfs {
                if inner.vf_holder.contains_key(&vf.address) {
                    continue;
                }
                match inner.group_driver.get(&vf.iommu_group) {
                    None => {}
                    Some(bound) if *bound == driver_kind => {}
                    Some(_) => continue,
                }
                candidates.push((vf.address, vf.iommu_group, free_count, pf));
            }
        }

        candidates.sort_by(|a, b| {
            let a_bound = inner.group_driver.get(&a.1) == Some(&driver_kind);
            let b_bound = inner.group_driver.get(&b.1) == Some(&driver_kind);
            b_bound
                .cmp(&a_bound)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
        });

        let Some((vf_addr, group, _free_count, pf)) = candidates.into_iter().next() else {
            return Err(Error::InventoryExhausted { token_name: name });
        };

        self.tokens.use_token(token_id, &pf.token_names())?;

        inner.vf_holder.insert(vf_addr, token_id.clone());
        inner.token_vf.insert(token_id.clone(), vf_addr);
        *inner.pf_free_count.get_mut(&pf.address).unwrap() -= 1;
        inner.group_driver.insert(group, driver_kind);

        debug!(%token_id, %vf_addr, ?driver_kind, "selected VF");
        Ok(vf_addr)
    }

    /// Releases the VF held for `vf_addr`'s holder token, resetting the
    /// IOMMU group to unbound if no other VF in the group is still held.
    pub fn free(&self, vf_addr: PciAddress) -> Result<()> {
        let _guard = self.resource_lock.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        self.free_locked(&mut inner, vf_addr)
    }

    fn free_locked(&self, inner: &mut Inner, vf_addr: PciAddress) -> Result<()> {
        let pf = self
            .pci
            .owning_pf(vf_addr)
            .ok_or_else(|| Error::state_inconsistency(format!("{vf_addr} is not a known VF")))?;

        let Some(holder) = inner.vf_holder.remove(&vf_addr) else {
            return Ok(());
        };

        self.tokens.stop_using(&holder)?;
        inner.token_vf.remove(&holder);

        *inner.pf_free_count.get_mut(&pf.address).unwrap() += 1;

        let group = pf
            .vf(vf_addr)
            .map(|vf| vf.iommu_group)
            .ok_or_else(|| Error::state_inconsistency(format!("{vf_addr} missing from PF record")))?;

        let group_still_held = inner
            .vf_holder
            .keys()
            .any(|held_addr| self.vf_group(*held_addr) == Some(group));
        if !group_still_held {
            inner.group_driver.remove(&group);
        }

        debug!(%vf_addr, %holder, "freed VF");
        Ok(())
    }

    /// Current driver binding for an IOMMU group, if bound.
    pub fn group_driver(&self, group: u32) -> Option<DriverKind> {
        self.inner.lock().unwrap().group_driver.get(&group).copied()
    }

    pub fn free_count(&self, pf_addr: PciAddress) -> u32 {
        *self.inner.lock().unwrap().pf_free_count.get(&pf_addr).unwrap_or(&0)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
