// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request-chain core. An ordered sequence of
//! [`ChainElement`]s processes every `Request`/`Close` call; each element
//! sees only its own predecessor/successor via the [`Next`] handle it is
//! given, never the chain as a whole.

pub mod composite;
pub mod context;

pub use context::RequestContext;

use crate::error::Result;
use crate::mechanism::Connection;

/* ---------------------------------------------------------------------------------------------- */

/// One link in the chain. `request` runs front-to-back, `close` runs the
/// same order (each element is expected to delegate to `next` before or
/// after its own teardown, mirroring how it used `next` on the way in).
///
/// An element that fails a `request` after already calling `next` must
/// unwind what it already did (typically by calling its own `close` logic
/// before returning the error) so a failed request leaves no partial state
/// behind.
pub trait ChainElement: Send + Sync {
    fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection>;

    fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()>;
}

/// The remainder of the chain, as seen from one element's position in it.
pub trait Next {
    fn request(&self, ctx: &RequestContext, conn: Connection) -> Result<Connection>;

    fn close(&self, ctx: &RequestContext, conn: &Connection) -> Result<()>;
}

/* ---------------------------------------------------------------------------------------------- */

struct Tail<'a> {
    stages: &'a [std::sync::Arc<dyn ChainElement>],
}

impl<'a> Next for Tail<'a> {
    fn request(&self, ctx: &RequestContext, conn: Connection) -> Result<Connection> {
        match self.stages.split_first() {
            None => Ok(conn),
            Some((head, rest)) => head.request(ctx, conn, &Tail { stages: rest }),
        }
    }

    fn close(&self, ctx: &RequestContext, conn: &Connection) -> Result<()> {
        match self.stages.split_first() {
            None => Ok(()),
            Some((head, rest)) => head.close(ctx, conn, &Tail { stages: rest }),
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A composed, runnable chain. Itself cheap to hold behind an `Arc` and
/// share across connections: all per-request state lives in the elements,
/// not in the `Chain`.
pub struct Chain {
    stages: Vec<std::sync::Arc<dyn ChainElement>>,
}

impl Chain {
    pub fn request(&self, ctx: &RequestContext, conn: Connection) -> Result<Connection> {
        Tail { stages: &self.stages }.request(ctx, conn)
    }

    pub fn close(&self, ctx: &RequestContext, conn: &Connection) -> Result<()> {
        Tail { stages: &self.stages }.close(ctx, conn)
    }
}

/// Composes a fixed ordered sequence of elements into a runnable [`Chain`].
pub fn compose(stages: Vec<std::sync::Arc<dyn ChainElement>>) -> Chain {
    Chain { stages }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::Mechanism;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::connstate::ConnectionId;

    struct Counting {
        label: &'static str,
        order: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl ChainElement for Counting {
        fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
            self.order.lock().unwrap().push(self.label);
            next.request(ctx, conn)
        }

        fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
            next.close(ctx, conn)?;
            self.order.lock().unwrap().push(self.label);
            Ok(())
        }
    }

    struct Failing;

    impl ChainElement for Failing {
        fn request(&self, _ctx: &RequestContext, _conn: Connection, _next: &dyn Next) -> Result<Connection> {
            Err(crate::error::Error::state_inconsistency("boom"))
        }

        fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
            next.close(ctx, conn)
        }
    }

    fn conn() -> Connection {
        Connection::new(ConnectionId("c1".into()), Mechanism::new("KERNEL"))
    }

    #[test]
    fn request_runs_front_to_back_and_close_runs_back_to_front() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let chain = compose(vec![
            Arc::new(Counting { label: "a", order: order.clone() }),
            Arc::new(Counting { label: "b", order: order.clone() }),
        ]);

        let ctx = RequestContext::new();
        let result = chain.request(&ctx, conn()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

        order.lock().unwrap().clear();
        chain.close(&ctx, &result).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn empty_chain_passes_connection_through_unchanged() {
        let chain = compose(vec![]);
        let ctx = RequestContext::new();
        let input = conn();
        let result = chain.request(&ctx, input.clone()).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn a_failing_element_short_circuits_downstream_elements() {
        let reached = Arc::new(AtomicU32::new(0));
        struct Marker(Arc<AtomicU32>);
        impl ChainElement for Marker {
            fn request(&self, ctx: &RequestContext, conn: Connection, next: &dyn Next) -> Result<Connection> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next.request(ctx, conn)
            }
            fn close(&self, ctx: &RequestContext, conn: &Connection, next: &dyn Next) -> Result<()> {
                next.close(ctx, conn)
            }
        }

        let chain = compose(vec![Arc::new(Failing), Arc::new(Marker(reached.clone()))]);
        let ctx = RequestContext::new();
        assert!(chain.request(&ctx, conn()).is_err());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }
}

/* ---------------------------------------------------------------------------------------------- */
