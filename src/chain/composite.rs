// SPDX-License-Identifier: MIT OR Apache-2.0

//! Composite [`ChainElement`]s built over the chain primitive: mechanism
//! demultiplexing, predicate-gated subchains, and mechanism-change reset.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::{Chain, ChainElement, Next, RequestContext};
use crate::connstate::ConnectionId;
use crate::error::{Error, Result};
use crate::mechanism::Connection;

/* ---------------------------------------------------------------------------------------------- */

/// Dispatches to one of several named subchains by the connection's
/// mechanism type, then continues into whatever follows the demux in the
/// outer chain.
pub struct MechanismDemux {
    subchains: HashMap<String, Chain>,
}

impl MechanismDemux {
    pub fn new(subchains: HashMap<String, Chain>) -> MechanismDemux {
        MechanismDemux { subchains }
    }

    fn subchain_for(&self, mechanism_type: &str) -> Result<&Chain> {
        self.subchains.get(mechanism_type).ok_or_else(|| {
            Error::state_inconsistency(format!("no subchain registered for mechanism '{mechanism_type}'"))
        })
    }
}

impl ChainElement for MechanismDemux {
    fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
        let sub = self.subchain_for(&conn.mechanism.mechanism_type)?;
        let conn = sub.request(ctx, conn)?;
        next.request(ctx, conn)
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;
        let sub = self.subchain_for(&conn.mechanism.mechanism_type)?;
        sub.close(ctx, conn)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Runs a subchain only when a predicate on the connection holds, otherwise
/// passes the connection through untouched. Used, for instance, to gate the
/// kernel-injection stage on `!skipDriverCheck`.
pub struct SwitchCase {
    predicate: Box<dyn Fn(&Connection) -> bool + Send + Sync>,
    subchain: Chain,
}

impl SwitchCase {
    pub fn new(predicate: impl Fn(&Connection) -> bool + Send + Sync + 'static, subchain: Chain) -> SwitchCase {
        SwitchCase { predicate: Box::new(predicate), subchain }
    }
}

impl ChainElement for SwitchCase {
    fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
        let conn = if (self.predicate)(&conn) {
            self.subchain.request(ctx, conn)?
        } else {
            conn
        };
        next.request(ctx, conn)
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;
        if (self.predicate)(conn) {
            self.subchain.close(ctx, conn)
        } else {
            Ok(())
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Remembers the last-seen mechanism type per connection ID. When a
/// `Request` arrives with a mechanism different from the one stored,
/// synthesises a `Close` of the downstream chain under the *old* mechanism
/// before continuing with the new request, so everything after this
/// element can assume a connection's mechanism identity is monotone once
/// established.
pub struct ResetMechanism {
    last_seen: Mutex<HashMap<ConnectionId, String>>,
}

impl Default for ResetMechanism {
    fn default() -> Self {
        ResetMechanism::new()
    }
}

impl ResetMechanism {
    pub fn new() -> ResetMechanism {
        ResetMechanism { last_seen: Mutex::new(HashMap::new()) }
    }
}

impl ChainElement for ResetMechanism {
    fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
        let prior = self.last_seen.lock().unwrap().get(&conn.id).cloned();

        if let Some(prior_mechanism) = prior {
            if prior_mechanism != conn.mechanism.mechanism_type {
                debug!(
                    connection = %conn.id,
                    from = %prior_mechanism,
                    to = %conn.mechanism.mechanism_type,
                    "mechanism changed, resetting downstream subtree"
                );
                let mut old_conn = conn.clone();
                old_conn.mechanism.mechanism_type = prior_mechanism;
                next.close(ctx, &old_conn)?;
            }
        }

        let result = next.request(ctx, conn.clone())?;
        self.last_seen
            .lock()
            .unwrap()
            .insert(conn.id.clone(), conn.mechanism.mechanism_type.clone());
        Ok(result)
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        self.last_seen.lock().unwrap().remove(&conn.id);
        next.close(ctx, conn)
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
