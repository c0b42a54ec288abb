// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource stage: turns a SR-IOV token ID into a bound VF
//! and records the result in the per-connection VFConfig store.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::Arc;

use tracing::debug;

use crate::chain::{ChainElement, Next, RequestContext};
use crate::connstate::{ConnectionStateStore, Role, VfConfig};
use crate::error::{Error, Result};
use crate::mechanism::{keys, types, Connection};
use crate::pci::PciModel;
use crate::token::id::looks_like_sriov_token;
use crate::vfpool::{DriverKind, VfResourcePool};

/* ---------------------------------------------------------------------------------------------- */

pub struct ResourceStage {
    pci: Arc<PciModel>,
    vfpool: Arc<VfResourcePool>,
    conn_states: Arc<ConnectionStateStore>,
    role: Role,
}

impl ResourceStage {
    pub fn new(
        pci: Arc<PciModel>,
        vfpool: Arc<VfResourcePool>,
        conn_states: Arc<ConnectionStateStore>,
        role: Role,
    ) -> ResourceStage {
        ResourceStage { pci, vfpool, conn_states, role }
    }

    fn driver_kind_for(mechanism_type: &str) -> Result<DriverKind> {
        match mechanism_type {
            types::KERNEL => Ok(DriverKind::Kernel),
            types::VFIO => Ok(DriverKind::Vfio),
            other => Err(Error::state_inconsistency(format!(
                "resource stage reached with unsupported mechanism type '{other}'"
            ))),
        }
    }
}

impl ChainElement for ResourceStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        let Some(token_str) = conn.mechanism.get(keys::TOKEN_ID).map(str::to_string) else {
            return next.request(ctx, conn);
        };
        if !looks_like_sriov_token(&token_str) {
            return next.request(ctx, conn);
        }

        if conn.established && conn.mechanism.get(keys::PCI_ADDRESS).is_some() {
            debug!(connection = %conn.id, "resource stage re-entry already established, short-circuiting");
            return next.request(ctx, conn);
        }

        let conn_id = conn.id.clone();
        let token_id = token_str.parse()?;
        let driver_kind = Self::driver_kind_for(&conn.mechanism.mechanism_type)?;

        let vf_addr = self.vfpool.select(&token_id, driver_kind)?;
        let pf = self
            .pci
            .owning_pf(vf_addr)
            .ok_or_else(|| Error::state_inconsistency(format!("{vf_addr} has no owning PF")))?
            .clone();
        let vf = pf
            .vf(vf_addr)
            .cloned()
            .ok_or_else(|| Error::state_inconsistency(format!("{vf_addr} missing from PF record")))?;

        conn.mechanism.set(keys::PCI_ADDRESS, vf_addr.to_string());

        let driver = driver_kind.driver_name(&pf).to_string();
        if let Err(err) = self.pci.bind_driver(vf_addr, &driver) {
            self.vfpool.free(vf_addr).ok();
            return Err(err);
        }

        match driver_kind {
            DriverKind::Kernel => {
                let pf_iface = self.pci.net_interface_name(pf.address)?.unwrap_or_default();
                let vf_iface = match self.pci.net_interface_name(vf_addr)? {
                    Some(name) => name,
                    None if pf.skip_driver_check => String::new(),
                    None => {
                        self.vfpool.free(vf_addr).ok();
                        return Err(Error::state_inconsistency(format!(
                            "{vf_addr} bound but exposes no net interface"
                        )));
                    }
                };
                self.conn_states.set(
                    &conn.id,
                    self.role,
                    VfConfig {
                        pf_interface_name: pf_iface,
                        vf_interface_name: vf_iface,
                        vf_index: vf.index,
                        vf_address: vf_addr,
                        iommu_group: vf.iommu_group,
                    },
                );
            }
            DriverKind::Vfio => {
                conn.mechanism.set(keys::IOMMU_GROUP, vf.iommu_group.to_string());
            }
        }

        match next.request(ctx, conn) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.conn_states.remove(&conn_id, self.role);
                self.vfpool.free(vf_addr)?;
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;

        if let Some(config) = self.conn_states.remove(&conn.id, self.role) {
            self.vfpool.free(config.vf_address)?;
        }
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::compose;
    use crate::config::Config;
    use crate::connstate::ConnectionId;
    use crate::mechanism::Mechanism;
    use crate::pci::address::PciAddress;
    use crate::pci::sysfs::MockPciFunctionSource;
    use crate::token::{PersistedToken, TokenPool};
    use std::sync::Mutex;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<PciModel>, Arc<VfResourcePool>, Arc<ConnectionStateStore>, crate::token::id::TokenId) {
        let config = Config::parse(
            r#"
physicalFunctions:
  0000:01:00.0:
    pfKernelDriver: i40e
    vfKernelDriver: iavf
    capabilities: ["10G"]
    serviceDomains: ["service.domain.1"]
"#,
        )
        .unwrap();

        let mut source = MockPciFunctionSource::new();
        source.expect_device_exists().return_const(true);
        source.expect_sriov_totalvfs().returning(|_| Ok(Some(1)));
        source.expect_sriov_numvfs().returning(|_| Ok(1));
        source.expect_set_sriov_numvfs().returning(|_, _| Ok(()));
        source.expect_list_virtfns().returning(|_| Ok(vec![(0, addr("0000:01:00.1"))]));
        source.expect_iommu_group().returning(|_| Ok(1u32));
        source.expect_current_driver().returning(|_| Ok(Some("iavf".to_string())));
        source.expect_unbind().returning(|_, _| Ok(()));
        source.expect_bind().returning(|_, _| Ok(()));
        source
            .expect_net_interfaces()
            .withf(move |a| *a == addr("0000:01:00.1"))
            .returning(|_| Ok(vec!["eth1v0".to_string()]));
        source
            .expect_net_interfaces()
            .withf(move |a| *a == addr("0000:01:00.0"))
            .returning(|_| Ok(vec!["eth1".to_string()]));

        let pci = Arc::new(PciModel::new(&config, Arc::new(source)).unwrap());
        let tokens = Arc::new(TokenPool::from_persisted(vec![PersistedToken {
            id: crate::token::id::TokenId::generate(),
            name: "service.domain.1/10G".to_string(),
        }]));
        let token_id = tokens.tokens()["service.domain.1/10G"][0].0.clone();
        let vfpool = Arc::new(VfResourcePool::new(pci.clone(), tokens, Arc::new(Mutex::new(()))));
        let conn_states = Arc::new(ConnectionStateStore::new());

        (pci, vfpool, conn_states, token_id)
    }

    fn conn_with_token(token_id: &crate::token::id::TokenId) -> Connection {
        let mut conn = Connection::new(ConnectionId("c1".into()), Mechanism::new(types::KERNEL));
        conn.mechanism.set(keys::TOKEN_ID, token_id.to_string());
        conn
    }

    #[test]
    fn passes_through_without_a_token_id() {
        let (pci, vfpool, conn_states, _token_id) = setup();
        let stage = ResourceStage::new(pci, vfpool, conn_states, Role::Client);
        let chain = compose(vec![Arc::new(stage)]);

        let conn = Connection::new(ConnectionId("c1".into()), Mechanism::new(types::KERNEL));
        let result = chain.request(&RequestContext::new(), conn).unwrap();
        assert!(result.mechanism.get(keys::PCI_ADDRESS).is_none());
    }

    #[test]
    fn selects_and_binds_a_vf_then_records_vfconfig() {
        let (pci, vfpool, conn_states, token_id) = setup();
        let stage = ResourceStage::new(pci, vfpool, conn_states.clone(), Role::Client);
        let chain = compose(vec![Arc::new(stage)]);

        let result = chain.request(&RequestContext::new(), conn_with_token(&token_id)).unwrap();
        assert_eq!(result.mechanism.get(keys::PCI_ADDRESS), Some("0000:01:00.1"));

        let config = conn_states.get(&ConnectionId("c1".into()), Role::Client).unwrap();
        assert_eq!(config.vf_interface_name, "eth1v0");
        assert_eq!(config.pf_interface_name, "eth1");
    }

    #[test]
    fn established_re_entry_with_pci_address_is_idempotent() {
        let (pci, vfpool, conn_states, token_id) = setup();
        let stage = ResourceStage::new(pci, vfpool, conn_states, Role::Client);
        let chain = compose(vec![Arc::new(stage)]);

        let mut conn = conn_with_token(&token_id);
        conn.mechanism.set(keys::PCI_ADDRESS, "0000:01:00.1");
        conn.established = true;

        let result = chain.request(&RequestContext::new(), conn).unwrap();
        assert_eq!(result.mechanism.get(keys::PCI_ADDRESS), Some("0000:01:00.1"));
    }

    #[test]
    fn close_frees_the_vf_back_to_the_pool() {
        let (pci, vfpool, conn_states, token_id) = setup();
        let stage = ResourceStage::new(pci, vfpool.clone(), conn_states.clone(), Role::Client);
        let chain = compose(vec![Arc::new(stage)]);
        let ctx = RequestContext::new();

        let result = chain.request(&ctx, conn_with_token(&token_id)).unwrap();
        let pf_addr = addr("0000:01:00.0");
        assert_eq!(vfpool.free_count(pf_addr), 0);

        chain.close(&ctx, &result).unwrap();
        assert_eq!(vfpool.free_count(pf_addr), 1);
        assert!(conn_states.get(&ConnectionId("c1".into()), Role::Client).is_none());
    }
}
