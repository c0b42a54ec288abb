// SPDX-License-Identifier: MIT OR Apache-2.0

//! Kernel-injection stage: moves a kernel-driver-bound VF
//! link into the client's network namespace and configures it there, after
//! setting its PF-administrative attributes from the forwarder's own netns.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::Arc;

use tracing::{debug, warn};

use crate::chain::{ChainElement, Next, RequestContext};
use crate::connstate::{ConnectionStateStore, Role, VfConfig};
use crate::error::{Error, Result};
use crate::mechanism::{keys, Connection};
use crate::netctl::NetworkControl;

/* ---------------------------------------------------------------------------------------------- */

pub struct KernelInjectionStage {
    conn_states: Arc<ConnectionStateStore>,
    netctl: Arc<dyn NetworkControl>,
    role: Role,
}

impl KernelInjectionStage {
    pub fn new(conn_states: Arc<ConnectionStateStore>, netctl: Arc<dyn NetworkControl>, role: Role) -> KernelInjectionStage {
        KernelInjectionStage { conn_states, netctl, role }
    }

    fn apply_pf_attributes(&self, config: &VfConfig, conn: &Connection) -> Result<()> {
        if let Some(mac) = conn.mechanism.get(keys::MAC) {
            self.netctl.set_vf_mac(&config.pf_interface_name, config.vf_index, mac)?;
        }
        if let Some(vlan) = conn.mechanism.get(keys::VLAN) {
            let vlan: u16 = vlan
                .parse()
                .map_err(|_| Error::configuration(format!("invalid vlan '{vlan}'")))?;
            self.netctl.set_vf_vlan(&config.pf_interface_name, config.vf_index, vlan)?;
        }
        self.netctl.set_vf_trust(&config.pf_interface_name, config.vf_index, true)?;
        self.netctl.set_vf_spoofchk(&config.pf_interface_name, config.vf_index, false)?;
        Ok(())
    }

    /// Best-effort reversal of everything `request` did: move the link
    /// back, restore its original name, reset the PF-side attributes. Used
    /// both for rollback-on-failure and for a genuine `Close`; logs instead
    /// of failing outright so one unwind step failing doesn't skip the rest.
    fn unwind(&self, config: &VfConfig, target_netns_inode: u64, current_name: &str) {
        let result: Result<()> = (|| {
            let guard = self.netctl.enter_netns(target_netns_inode)?;
            self.netctl.rename_link(current_name, &config.vf_interface_name)?;
            drop(guard);
            self.netctl.move_link_to_netns(&config.vf_interface_name, 0)?;
            self.netctl.set_vf_trust(&config.pf_interface_name, config.vf_index, false)?;
            self.netctl.set_vf_spoofchk(&config.pf_interface_name, config.vf_index, true)?;
            Ok(())
        })();

        if let Err(err) = result {
            warn!(vf = %config.vf_interface_name, %err, "kernel-injection unwind step failed");
        }
    }
}

impl ChainElement for KernelInjectionStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        let Some(config) = self.conn_states.get(&conn.id, self.role) else {
            return next.request(ctx, conn);
        };
        let Some(netns_inode_str) = conn.mechanism.get(keys::NET_NS_INODE).map(str::to_string) else {
            return next.request(ctx, conn);
        };
        let netns_inode: u64 = netns_inode_str
            .parse()
            .map_err(|_| Error::configuration(format!("invalid {} '{netns_inode_str}'", keys::NET_NS_INODE)))?;

        let target_name = conn
            .mechanism
            .get(keys::IFACE_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| config.vf_interface_name.clone());

        self.apply_pf_attributes(&config, &conn)?;

        self.netctl.move_link_to_netns(&config.vf_interface_name, netns_inode)?;
        let unwind_on_err = |netctl: &Arc<dyn NetworkControl>| {
            let _ = netctl.move_link_to_netns(&config.vf_interface_name, 0);
        };

        let setup: Result<()> = (|| {
            let guard = self.netctl.enter_netns(netns_inode)?;
            self.netctl.rename_link(&config.vf_interface_name, &target_name)?;
            if let Some(ip) = conn.mechanism.get(keys::IP) {
                self.netctl.set_link_addr(&target_name, ip)?;
            }
            self.netctl.set_link_up(&target_name)?;
            drop(guard);
            Ok(())
        })();

        if let Err(err) = setup {
            unwind_on_err(&self.netctl);
            return Err(err);
        }

        debug!(connection = %conn.id, vf = %config.vf_interface_name, target = %target_name, "VF link injected into client namespace");

        match next.request(ctx, conn) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.unwind(&config, netns_inode, &target_name);
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;

        let Some(config) = self.conn_states.get(&conn.id, self.role) else {
            return Ok(());
        };
        let Some(netns_inode_str) = conn.mechanism.get(keys::NET_NS_INODE) else {
            return Ok(());
        };
        let Ok(netns_inode) = netns_inode_str.parse::<u64>() else {
            return Ok(());
        };
        let current_name = conn
            .mechanism
            .get(keys::IFACE_NAME)
            .unwrap_or(&config.vf_interface_name);

        self.unwind(&config, netns_inode, current_name);
        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::compose;
    use crate::connstate::ConnectionId;
    use crate::mechanism::Mechanism;
    use crate::netctl::{MockNetworkControl, NetnsGuard};
    use crate::pci::address::PciAddress;

    struct NoopGuard;
    impl NetnsGuard for NoopGuard {}

    fn config() -> VfConfig {
        VfConfig {
            pf_interface_name: "eth0".into(),
            vf_interface_name: "eth0v0".into(),
            vf_index: 0,
            vf_address: "0000:01:00.1".parse::<PciAddress>().unwrap(),
            iommu_group: 1,
        }
    }

    #[test]
    fn passes_through_without_vfconfig() {
        let conn_states = Arc::new(ConnectionStateStore::new());
        let netctl: Arc<dyn NetworkControl> = Arc::new(MockNetworkControl::new());
        let stage = KernelInjectionStage::new(conn_states, netctl, Role::Client);
        let chain = compose(vec![Arc::new(stage)]);

        let conn = Connection::new(ConnectionId("c1".into()), Mechanism::new("KERNEL"));
        assert!(chain.request(&RequestContext::new(), conn).is_ok());
    }

    #[test]
    fn injects_the_link_and_rolls_back_on_downstream_failure() {
        let conn_states = Arc::new(ConnectionStateStore::new());
        conn_states.set(&ConnectionId("c1".into()), Role::Client, config());

        let mut mock = MockNetworkControl::new();
        mock.expect_set_vf_trust().returning(|_, _, _| Ok(()));
        mock.expect_set_vf_spoofchk().returning(|_, _, _| Ok(()));
        mock.expect_move_link_to_netns().returning(|_, _| Ok(()));
        mock.expect_enter_netns().returning(|_| Ok(Box::new(NoopGuard)));
        mock.expect_rename_link().returning(|_, _| Ok(()));
        mock.expect_set_link_up().returning(|_| Ok(()));

        let netctl: Arc<dyn NetworkControl> = Arc::new(mock);
        let stage = KernelInjectionStage::new(conn_states, netctl, Role::Client);

        struct Failing;
        impl ChainElement for Failing {
            fn request(&self, _ctx: &RequestContext, _conn: Connection, _next: &dyn Next) -> Result<Connection> {
                Err(Error::state_inconsistency("boom"))
            }
            fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
                next.close(ctx, conn)
            }
        }

        let chain = compose(vec![Arc::new(stage), Arc::new(Failing)]);

        let mut conn = Connection::new(ConnectionId("c1".into()), Mechanism::new("KERNEL"));
        conn.mechanism.set(keys::NET_NS_INODE, "12345");

        assert!(chain.request(&RequestContext::new(), conn).is_err());
    }
}

/* ---------------------------------------------------------------------------------------------- */
