// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token pool: a declarative inventory of tokens derived from the configured
//! PFs, with a four-state lifecycle and cross-name closure.

/* ---------------------------------------------------------------------------------------------- */

pub mod id;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::pci::PciModel;
use crate::token::id::TokenId;

/* ---------------------------------------------------------------------------------------------- */

/// Token lifecycle state and its permitted transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Free,
    Allocated,
    InUse,
    Closed,
}

#[derive(Debug, Clone)]
struct TokenRecord {
    name: String,
    state: TokenState,
}

/// A listener is notified, outside any lock held by the pool, whenever a
/// transition changes some token's closed-set membership. Listeners must be
/// idempotent since they may be invoked concurrently and may observe a state
/// newer than the one that triggered them.
pub trait TokenPoolListener: Send + Sync {
    fn on_change(&self);
}

impl<F: Fn() + Send + Sync> TokenPoolListener for F {
    fn on_change(&self) {
        self()
    }
}

/// `{id, name}` pair captured by the persistence hook at construction; on
/// restart the pool is re-hydrated from these with every token reset to
/// `free` (the closed set is ephemeral and never persisted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedToken {
    pub id: TokenId,
    pub name: String,
}

struct Inner {
    tokens: HashMap<TokenId, TokenRecord>,
    by_name: HashMap<String, Vec<TokenId>>,
    /// `C(t)`: the set of tokens closed on behalf of in-use token `t`.
    closed_by: HashMap<TokenId, HashSet<TokenId>>,
}

/// Coordinates four-state token lifecycles and cross-name exclusion.
pub struct TokenPool {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn TokenPoolListener>>>,
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool").finish_non_exhaustive()
    }
}

impl TokenPool {
    /// Derives one token per `(name, VF slot)` from every configured PF:
    /// `|serviceDomains| x |capabilities| x |VFs|` tokens per PF.
    pub fn from_pci_model(model: &PciModel) -> TokenPool {
        let mut entries = Vec::new();
        for pf in model.physical_functions() {
            for name in pf.token_names() {
                for _ in &pf.vfs {
                    entries.push(PersistedToken {
                        id: TokenId::generate(),
                        name: name.clone(),
                    });
                }
            }
        }
        TokenPool::from_persisted(entries)
    }

    /// Re-hydrates the pool from a previously captured persistence snapshot.
    /// All tokens start `free`; the closed set is never persisted.
    pub fn from_persisted(entries: Vec<PersistedToken>) -> TokenPool {
        let mut tokens = HashMap::with_capacity(entries.len());
        let mut by_name: HashMap<String, Vec<TokenId>> = HashMap::new();

        for entry in entries {
            by_name.entry(entry.name.clone()).or_default().push(entry.id.clone());
            tokens.insert(
                entry.id,
                TokenRecord {
                    name: entry.name,
                    state: TokenState::Free,
                },
            );
        }

        TokenPool {
            inner: Mutex::new(Inner {
                tokens,
                by_name,
                closed_by: HashMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Captures the `{id, name}` pairs for the persistence hook.
    pub fn snapshot_persisted(&self) -> Vec<PersistedToken> {
        let inner = self.inner.lock().unwrap();
        inner
            .tokens
            .iter()
            .map(|(id, record)| PersistedToken {
                id: id.clone(),
                name: record.name.clone(),
            })
            .collect()
    }

    pub fn register_listener(&self, listener: Arc<dyn TokenPoolListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// For each name, the set of its tokens with `available = state != Closed`.
    /// This is the advertisement surfaced to the device-plugin.
    pub fn tokens(&self) -> HashMap<String, Vec<(TokenId, bool)>> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_name
            .iter()
            .map(|(name, ids)| {
                let entries = ids
                    .iter()
                    .map(|id| {
                        let state = inner.tokens[id].state;
                        (id.clone(), state != TokenState::Closed)
                    })
                    .collect();
                (name.clone(), entries)
            })
            .collect()
    }

    /// Atomically picks one `Free` token of `name` and transitions it to
    /// `Allocated`, returning its id. Used by the token stage to assign a
    /// token to a connection on first contact.
    pub fn allocate_any(&self, name: &str) -> Result<TokenId> {
        let mut inner = self.inner.lock().unwrap();
        let candidates = inner
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::state_inconsistency(format!("unknown token name {name}")))?;

        let id = candidates
            .iter()
            .find(|id| inner.tokens[*id].state == TokenState::Free)
            .cloned()
            .ok_or_else(|| Error::InventoryExhausted { token_name: name.to_string() })?;

        inner.tokens.get_mut(&id).unwrap().state = TokenState::Allocated;
        trace!(%id, name, "token free -> allocated via allocate_any");
        Ok(id)
    }

    /// Like [`TokenPool::allocate_any`], but restricted to `allowed` — the
    /// set of token IDs the device-plugin advertised for `name` via
    /// `NSM_SRIOV_TOKENS_<name>`. A candidate outside
    /// `allowed` is never chosen even if it's `Free`.
    pub fn allocate_any_restricted(&self, name: &str, allowed: &HashSet<TokenId>) -> Result<TokenId> {
        let mut inner = self.inner.lock().unwrap();
        let candidates = inner
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::state_inconsistency(format!("unknown token name {name}")))?;

        let id = candidates
            .iter()
            .filter(|id| allowed.contains(id))
            .find(|id| inner.tokens[*id].state == TokenState::Free)
            .cloned()
            .ok_or_else(|| Error::InventoryExhausted { token_name: name.to_string() })?;

        inner.tokens.get_mut(&id).unwrap().state = TokenState::Allocated;
        trace!(%id, name, "token free -> allocated via allocate_any_restricted");
        Ok(id)
    }

    /// Returns the sole token of `name` iff exactly one exists (the
    /// shared-token server variant's precondition).
    pub fn sole_token_for(&self, name: &str) -> Option<TokenId> {
        let inner = self.inner.lock().unwrap();
        let ids = inner.by_name.get(name)?;
        if ids.len() == 1 {
            Some(ids[0].clone())
        } else {
            None
        }
    }

    pub fn find(&self, id: &TokenId) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .tokens
            .get(id)
            .map(|r| r.name.clone())
            .ok_or_else(|| Error::state_inconsistency(format!("unknown token {id}")))
    }

    /// free -> allocated; allocated is a no-op; in-use implicitly stops
    /// using first; closed is an error. The pool converges rather than
    /// rejects because the device-plugin may race.
    pub fn allocate(&self, id: &TokenId) -> Result<()> {
        let to_notify = {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::state_of(&inner, id)?;

            match state {
                TokenState::Free => {
                    inner.tokens.get_mut(id).unwrap().state = TokenState::Allocated;
                    trace!(%id, "token free -> allocated");
                    false
                }
                TokenState::Allocated => false,
                TokenState::InUse => {
                    warn!(%id, "allocate on in-use token: performing implicit stop-using");
                    Self::stop_using_locked(&mut inner, id)?;
                    true
                }
                TokenState::Closed => {
                    return Err(Error::state_inconsistency(format!(
                        "cannot allocate closed token {id}"
                    )))
                }
            }
        };

        if to_notify {
            self.notify();
        }
        Ok(())
    }

    /// allocated -> free; in-use -> (stop-using) -> free; free is a no-op;
    /// closed is a no-op (cannot be un-closed through this path).
    pub fn free(&self, id: &TokenId) -> Result<()> {
        let to_notify = {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::state_of(&inner, id)?;

            match state {
                TokenState::Allocated => {
                    inner.tokens.get_mut(id).unwrap().state = TokenState::Free;
                    false
                }
                TokenState::InUse => {
                    Self::stop_using_locked(&mut inner, id)?;
                    inner.tokens.get_mut(id).unwrap().state = TokenState::Free;
                    true
                }
                TokenState::Free | TokenState::Closed => false,
            }
        };

        if to_notify {
            self.notify();
        }
        Ok(())
    }

    /// Marks `id` in-use, then closes one sibling per name in `names` (other
    /// than `id`'s own name), preferring free siblings over allocated ones.
    pub fn use_token(&self, id: &TokenId, names: &[String]) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::state_of(&inner, id)?;
            if matches!(state, TokenState::InUse | TokenState::Closed) {
                return Err(Error::state_inconsistency(format!(
                    "cannot use token {id} in state {state:?}"
                )));
            }

            let own_name = inner.tokens[id].name.clone();

            // Pick every sibling to close before mutating any state, so a
            // later name failing to produce a candidate leaves `id` and all
            // siblings untouched instead of half-applied.
            let mut to_close = Vec::new();
            for name in names {
                if *name == own_name {
                    continue;
                }
                let Some(sibling) = Self::pick_sibling_to_close(&inner, name) else {
                    return Err(Error::state_inconsistency(format!(
                        "no sibling of {name} available to close on behalf of {id}"
                    )));
                };
                to_close.push(sibling);
            }

            inner.tokens.get_mut(id).unwrap().state = TokenState::InUse;
            let mut closed = HashSet::new();
            for sibling in to_close {
                inner.tokens.get_mut(&sibling).unwrap().state = TokenState::Closed;
                closed.insert(sibling);
            }

            inner.closed_by.insert(id.clone(), closed);
        }

        self.notify();
        Ok(())
    }

    /// in-use -> allocated; frees every member of `C(id)`.
    pub fn stop_using(&self, id: &TokenId) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::state_of(&inner, id)?;
            if state != TokenState::InUse {
                return Err(Error::state_inconsistency(format!(
                    "cannot stop-using token {id} in state {state:?}"
                )));
            }
            Self::stop_using_locked(&mut inner, id)?;
        }
        self.notify();
        Ok(())
    }

    fn state_of(inner: &Inner, id: &TokenId) -> Result<TokenState> {
        inner
            .tokens
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| Error::state_inconsistency(format!("unknown token {id}")))
    }

    fn pick_sibling_to_close(inner: &Inner, name: &str) -> Option<TokenId> {
        let candidates = inner.by_name.get(name)?;
        candidates
            .iter()
            .find(|id| inner.tokens[id].state == TokenState::Free)
            .or_else(|| {
                candidates
                    .iter()
                    .find(|id| inner.tokens[id].state == TokenState::Allocated)
            })
            .cloned()
    }

    fn stop_using_locked(inner: &mut Inner, id: &TokenId) -> Result<()> {
        inner.tokens.get_mut(id).unwrap().state = TokenState::Allocated;
        if let Some(closed) = inner.closed_by.remove(id) {
            for closed_id in closed {
                if let Some(record) = inner.tokens.get_mut(&closed_id) {
                    record.state = TokenState::Free;
                }
            }
        }
        Ok(())
    }

    fn notify(&self) {
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            std::thread::spawn(move || listener.on_change());
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(names_and_counts: &[(&str, usize)]) -> TokenPool {
        let mut entries = Vec::new();
        for (name, count) in names_and_counts {
            for _ in 0..*count {
                entries.push(PersistedToken {
                    id: TokenId::generate(),
                    name: name.to_string(),
                });
            }
        }
        TokenPool::from_persisted(entries)
    }

    fn ids_for(pool: &TokenPool, name: &str) -> Vec<TokenId> {
        pool.tokens()
            .remove(name)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn allocate_free_is_idempotent() {
        let pool = pool_with(&[("svc/10G", 1)]);
        let id = ids_for(&pool, "svc/10G").remove(0);

        pool.allocate(&id).unwrap();
        pool.allocate(&id).unwrap(); // no-op on allocated
        pool.free(&id).unwrap();
        pool.free(&id).unwrap(); // no-op on free
    }

    #[test]
    fn allocate_on_closed_fails() {
        let pool = pool_with(&[("svc/10G", 2), ("svc/20G", 1)]);
        let ten_g = ids_for(&pool, "svc/10G");
        let twenty_g = ids_for(&pool, "svc/20G").remove(0);

        pool.use_token(&ten_g[0], &["svc/10G".into(), "svc/20G".into()])
            .unwrap();

        assert!(pool.allocate(&twenty_g).is_err());
    }

    #[test]
    fn use_closes_sibling_across_names_preferring_free() {
        let pool = pool_with(&[("svc/10G", 2), ("svc/20G", 2)]);
        let ten_g = ids_for(&pool, "svc/10G");
        let twenty_g = ids_for(&pool, "svc/20G");

        pool.allocate(&twenty_g[0]).unwrap();
        pool.use_token(&ten_g[0], &["svc/10G".into(), "svc/20G".into()])
            .unwrap();

        let twenty_g_after = pool.tokens().remove("svc/20G").unwrap();
        let available: usize = twenty_g_after.iter().filter(|(_, a)| *a).count();
        assert_eq!(available, 1, "one /20G token should now be closed");

        let closed_id = twenty_g_after
            .iter()
            .find(|(_, a)| !*a)
            .map(|(id, _)| id.clone())
            .unwrap();
        assert_eq!(closed_id, twenty_g[1], "free sibling should be closed first");
    }

    #[test]
    fn use_token_leaves_state_untouched_when_a_later_sibling_has_no_candidate() {
        let pool = pool_with(&[("svc/10G", 1), ("svc/20G", 1)]);
        let ten_g = ids_for(&pool, "svc/10G").remove(0);
        let twenty_g = ids_for(&pool, "svc/20G").remove(0);

        let err = pool
            .use_token(&ten_g, &["svc/10G".into(), "svc/30G".into()])
            .unwrap_err();
        assert!(matches!(err, Error::StateInconsistency { .. }));

        // Neither `ten_g` nor the `svc/20G` sibling should have been
        // mutated: `ten_g` must still be free to allocate, and `twenty_g`
        // must not have been closed on its behalf.
        assert_eq!(pool.allocate_any("svc/10G").unwrap(), ten_g);
        let twenty_g_after = pool.tokens().remove("svc/20G").unwrap();
        assert!(twenty_g_after.contains(&(twenty_g, true)));
    }

    #[test]
    fn stop_using_restores_closed_siblings() {
        let pool = pool_with(&[("svc/10G", 1), ("svc/20G", 1)]);
        let ten_g = ids_for(&pool, "svc/10G").remove(0);

        pool.use_token(&ten_g, &["svc/10G".into(), "svc/20G".into()])
            .unwrap();
        pool.stop_using(&ten_g).unwrap();

        let twenty_g_after = pool.tokens().remove("svc/20G").unwrap();
        assert!(twenty_g_after.iter().all(|(_, available)| *available));
    }

    #[test]
    fn closed_tokens_are_never_advertised_available() {
        let pool = pool_with(&[("svc/10G", 1), ("svc/20G", 1)]);
        let ten_g = ids_for(&pool, "svc/10G").remove(0);

        pool.use_token(&ten_g, &["svc/10G".into(), "svc/20G".into()])
            .unwrap();

        let twenty_g_after = pool.tokens().remove("svc/20G").unwrap();
        assert!(twenty_g_after.iter().all(|(_, available)| !*available));
    }

    #[test]
    fn allocate_any_picks_a_free_token_and_errors_when_exhausted() {
        let pool = pool_with(&[("svc/10G", 1)]);
        let id = pool.allocate_any("svc/10G").unwrap();
        assert!(ids_for(&pool, "svc/10G").contains(&id));
        assert!(matches!(pool.allocate_any("svc/10G"), Err(Error::InventoryExhausted { .. })));
    }

    #[test]
    fn allocate_any_restricted_ignores_free_tokens_outside_the_allowed_set() {
        let pool = pool_with(&[("svc/10G", 2)]);
        let ids = ids_for(&pool, "svc/10G");
        let allowed: HashSet<TokenId> = [ids[1].clone()].into_iter().collect();

        let picked = pool.allocate_any_restricted("svc/10G", &allowed).unwrap();
        assert_eq!(picked, ids[1]);
        assert!(matches!(
            pool.allocate_any_restricted("svc/10G", &allowed),
            Err(Error::InventoryExhausted { .. })
        ));
    }

    #[test]
    fn sole_token_for_requires_exactly_one_token() {
        let pool = pool_with(&[("svc/10G", 1), ("svc/20G", 2)]);
        assert!(pool.sole_token_for("svc/10G").is_some());
        assert!(pool.sole_token_for("svc/20G").is_none());
    }

    #[test]
    fn listeners_are_notified_outside_the_lock() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let pool = pool_with(&[("svc/10G", 1), ("svc/20G", 1)]);
        let ten_g = ids_for(&pool, "svc/10G").remove(0);

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        pool.register_listener(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        pool.use_token(&ten_g, &["svc/10G".into(), "svc/20G".into()])
            .unwrap();

        // listener fan-out happens on background threads
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

/* ---------------------------------------------------------------------------------------------- */
