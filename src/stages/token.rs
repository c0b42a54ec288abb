// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token stage: assigns a SR-IOV token to a connection and
//! rewrites its labels / mechanism parameters accordingly. The client and
//! server sides of a connection see different variants.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::chain::{ChainElement, Next, RequestContext};
use crate::connstate::ConnectionId;
use crate::error::Result;
use crate::mechanism::{keys, Connection};
use crate::token::id::TokenId;
use crate::token::TokenPool;

/* ---------------------------------------------------------------------------------------------- */

pub const LABEL_SRIOV_TOKEN: &str = "sriovToken";
pub const LABEL_SERVICE_DOMAIN: &str = "serviceDomain";

fn service_domain_of(token_name: &str) -> &str {
    token_name.split('/').next().unwrap_or(token_name)
}

/* ---------------------------------------------------------------------------------------------- */

/// Source of device-plugin-advertised token IDs for a given token name
/// (`NSM_SRIOV_TOKENS_<tokenName>`). Abstracted behind a trait
/// so tests can inject a fake environment instead of mutating real process
/// env.
#[cfg_attr(any(test, feature = "test-mocks"), mockall::automock)]
pub trait EnvTokenSource: Send + Sync {
    /// The token IDs advertised for `name`, if any. Entries that aren't
    /// well-formed SR-IOV token IDs are silently dropped rather than
    /// treated as an error; the env var is produced by an external
    /// collaborator this crate doesn't control.
    fn advertised_tokens(&self, name: &str) -> HashSet<TokenId>;
}

/// Reads `NSM_SRIOV_TOKENS_<name>` from the process environment as a
/// comma-separated list of token IDs.
#[derive(Debug, Default)]
pub struct ProcessEnvTokenSource;

impl EnvTokenSource for ProcessEnvTokenSource {
    fn advertised_tokens(&self, name: &str) -> HashSet<TokenId> {
        let key = format!("NSM_SRIOV_TOKENS_{name}");
        std::env::var(&key)
            .ok()
            .map(|value| value.split(',').filter_map(|s| s.trim().parse().ok()).collect())
            .unwrap_or_default()
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Client side. If the request's labels name a token the pool advertises,
/// assigns one free token of that name, rewrites `sriovToken` into
/// `serviceDomain`, and stamps the token ID onto the mechanism. Releases the
/// assignment if anything downstream fails.
pub struct ClientTokenStage {
    tokens: Arc<TokenPool>,
    assigned: Mutex<HashMap<ConnectionId, TokenId>>,
}

impl ClientTokenStage {
    pub fn new(tokens: Arc<TokenPool>) -> ClientTokenStage {
        ClientTokenStage { tokens, assigned: Mutex::new(HashMap::new()) }
    }

    fn release(&self, conn_id: &ConnectionId) -> Result<()> {
        if let Some(token_id) = self.assigned.lock().unwrap().remove(conn_id) {
            debug!(connection = %conn_id, token = %token_id, "releasing client token assignment");
            self.tokens.free(&token_id)?;
        }
        Ok(())
    }
}

impl ChainElement for ClientTokenStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        let Some(requested_name) = conn.labels.get(LABEL_SRIOV_TOKEN).cloned() else {
            return next.request(ctx, conn);
        };
        if !self.tokens.tokens().contains_key(&requested_name) {
            return next.request(ctx, conn);
        }

        let conn_id = conn.id.clone();
        let token_id = self.tokens.allocate_any(&requested_name)?;

        conn.labels.remove(LABEL_SRIOV_TOKEN);
        conn.labels.insert(LABEL_SERVICE_DOMAIN.to_string(), service_domain_of(&requested_name).to_string());
        conn.mechanism.set(keys::TOKEN_ID, token_id.to_string());
        self.assigned.lock().unwrap().insert(conn_id.clone(), token_id);

        match next.request(ctx, conn) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.release(&conn_id)?;
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;
        self.release(&conn.id)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Server side, shared-token variant: a single configured token name backed
/// by exactly one token ID, stamped onto every request without any
/// allocation bookkeeping.
pub struct SharedServerTokenStage {
    tokens: Arc<TokenPool>,
    name: String,
}

impl SharedServerTokenStage {
    pub fn new(tokens: Arc<TokenPool>, name: impl Into<String>) -> SharedServerTokenStage {
        SharedServerTokenStage { tokens, name: name.into() }
    }
}

impl ChainElement for SharedServerTokenStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        if let Some(token_id) = self.tokens.sole_token_for(&self.name) {
            conn.mechanism.set(keys::TOKEN_ID, token_id.to_string());
        }
        next.request(ctx, conn)
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// Server side, multi-token variant: assigns one token per connection,
/// releasing it on downstream failure or on `Close`. When inventory is
/// exhausted, leaves the mechanism's token ID empty so the resource stage
/// declines to act rather than failing the request outright. When
/// constructed with an [`EnvTokenSource`], assignment is additionally
/// restricted to the token IDs the device-plugin advertised for this name
/// (`NSM_SRIOV_TOKENS_<name>`), so this process never hands
/// out a token the orchestrator didn't grant to it.
pub struct MultiServerTokenStage {
    tokens: Arc<TokenPool>,
    name: String,
    env: Option<Arc<dyn EnvTokenSource>>,
    assigned: Mutex<HashMap<ConnectionId, TokenId>>,
}

impl MultiServerTokenStage {
    pub fn new(tokens: Arc<TokenPool>, name: impl Into<String>) -> MultiServerTokenStage {
        MultiServerTokenStage { tokens, name: name.into(), env: None, assigned: Mutex::new(HashMap::new()) }
    }

    pub fn with_env_source(
        tokens: Arc<TokenPool>,
        name: impl Into<String>,
        env: Arc<dyn EnvTokenSource>,
    ) -> MultiServerTokenStage {
        MultiServerTokenStage { tokens, name: name.into(), env: Some(env), assigned: Mutex::new(HashMap::new()) }
    }

    fn allocate(&self) -> Result<TokenId> {
        match &self.env {
            Some(env) => {
                let allowed = env.advertised_tokens(&self.name);
                self.tokens.allocate_any_restricted(&self.name, &allowed)
            }
            None => self.tokens.allocate_any(&self.name),
        }
    }

    fn release(&self, conn_id: &ConnectionId) -> Result<()> {
        if let Some(token_id) = self.assigned.lock().unwrap().remove(conn_id) {
            debug!(connection = %conn_id, token = %token_id, "releasing server token assignment");
            self.tokens.free(&token_id)?;
        }
        Ok(())
    }
}

impl ChainElement for MultiServerTokenStage {
    fn request(&self, ctx: &RequestContext, mut conn: Connection, next: &dyn Next) -> Result<Connection> {
        let conn_id = conn.id.clone();

        match self.allocate() {
            Ok(token_id) => {
                conn.mechanism.set(keys::TOKEN_ID, token_id.to_string());
                self.assigned.lock().unwrap().insert(conn_id.clone(), token_id);
            }
            Err(crate::error::Error::InventoryExhausted { .. }) => {
                debug!(name = %self.name, "token inventory exhausted, leaving token ID empty");
            }
            Err(err) => return Err(err),
        }

        match next.request(ctx, conn) {
            Ok(result) => Ok(result),
            Err(err) => {
                self.release(&conn_id)?;
                Err(err)
            }
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
        next.close(ctx, conn)?;
        self.release(&conn.id)
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::compose;
    use crate::mechanism::Mechanism;
    use crate::token::PersistedToken;

    fn pool_with(name: &str, count: usize) -> Arc<TokenPool> {
        let entries = (0..count)
            .map(|_| PersistedToken { id: TokenId::generate(), name: name.to_string() })
            .collect();
        Arc::new(TokenPool::from_persisted(entries))
    }

    fn conn(id: &str) -> Connection {
        Connection::new(ConnectionId(id.to_string()), Mechanism::new("KERNEL"))
    }

    #[test]
    fn client_stage_ignores_requests_without_sriov_token_label() {
        let tokens = pool_with("service.domain.1/10G", 1);
        let stage = ClientTokenStage::new(tokens);
        let chain = compose(vec![Arc::new(stage)]);

        let result = chain.request(&RequestContext::new(), conn("c1")).unwrap();
        assert!(result.mechanism.get(keys::TOKEN_ID).is_none());
    }

    #[test]
    fn client_stage_assigns_token_and_rewrites_labels() {
        let tokens = pool_with("service.domain.1/10G", 1);
        let stage = ClientTokenStage::new(tokens);
        let chain = compose(vec![Arc::new(stage)]);

        let mut request = conn("c1");
        request.labels.insert(LABEL_SRIOV_TOKEN.to_string(), "service.domain.1/10G".to_string());

        let result = chain.request(&RequestContext::new(), request).unwrap();
        assert!(result.labels.get(LABEL_SRIOV_TOKEN).is_none());
        assert_eq!(result.labels.get(LABEL_SERVICE_DOMAIN), Some(&"service.domain.1".to_string()));
        assert!(result.mechanism.get(keys::TOKEN_ID).is_some());
    }

    #[test]
    fn client_stage_releases_assignment_on_downstream_failure() {
        struct Failing;
        impl ChainElement for Failing {
            fn request(&self, _ctx: &RequestContext, _conn: Connection, _next: &dyn Next) -> Result<Connection> {
                Err(crate::error::Error::state_inconsistency("boom"))
            }
            fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
                next.close(ctx, conn)
            }
        }

        let tokens = pool_with("service.domain.1/10G", 1);
        let chain = compose(vec![Arc::new(ClientTokenStage::new(tokens.clone())), Arc::new(Failing)]);

        let mut request = conn("c1");
        request.labels.insert(LABEL_SRIOV_TOKEN.to_string(), "service.domain.1/10G".to_string());
        assert!(chain.request(&RequestContext::new(), request).is_err());

        // the token must be free again, not leaked as allocated
        let id = tokens.tokens().remove("service.domain.1/10G").unwrap().remove(0).0;
        assert!(tokens.allocate_any("service.domain.1/10G").is_ok());
        let _ = id;
    }

    #[test]
    fn shared_server_stage_tags_every_request_with_sole_token() {
        let tokens = pool_with("service.domain.1/10G", 1);
        let chain = compose(vec![Arc::new(SharedServerTokenStage::new(tokens.clone(), "service.domain.1/10G"))]);

        let r1 = chain.request(&RequestContext::new(), conn("c1")).unwrap();
        let r2 = chain.request(&RequestContext::new(), conn("c2")).unwrap();
        assert_eq!(r1.mechanism.get(keys::TOKEN_ID), r2.mechanism.get(keys::TOKEN_ID));
    }

    #[test]
    fn multi_server_stage_leaves_token_id_empty_when_exhausted() {
        let tokens = pool_with("service.domain.1/10G", 1);
        let stage = MultiServerTokenStage::new(tokens, "service.domain.1/10G");
        let chain = compose(vec![Arc::new(stage)]);
        let ctx = RequestContext::new();

        let first = chain.request(&ctx, conn("c1")).unwrap();
        assert!(first.mechanism.get(keys::TOKEN_ID).is_some());

        let second = chain.request(&ctx, conn("c2")).unwrap();
        assert!(second.mechanism.get(keys::TOKEN_ID).is_none());
    }

    #[test]
    fn multi_server_stage_with_env_source_only_hands_out_advertised_tokens() {
        let tokens = pool_with("service.domain.1/10G", 2);
        let not_advertised = tokens.tokens().remove("service.domain.1/10G").unwrap()[0].0.clone();
        let advertised: TokenId = tokens
            .tokens()
            .remove("service.domain.1/10G")
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .find(|id| *id != not_advertised)
            .unwrap();

        let mut env = MockEnvTokenSource::new();
        let advertised_clone = advertised.clone();
        env.expect_advertised_tokens()
            .returning(move |_| [advertised_clone.clone()].into_iter().collect());

        let stage = MultiServerTokenStage::with_env_source(tokens, "service.domain.1/10G", Arc::new(env));
        let chain = compose(vec![Arc::new(stage)]);

        let result = chain.request(&RequestContext::new(), conn("c1")).unwrap();
        assert_eq!(result.mechanism.get(keys::TOKEN_ID), Some(advertised.to_string()).as_deref());
    }
}

/* ---------------------------------------------------------------------------------------------- */
