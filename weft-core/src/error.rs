//! Error types for the attribute graph.
//!
//! The engine distinguishes three failure classes:
//!
//! 1. Programmer-contract violations (no subgraph established, reading a
//!    freed attribute, cyclic dependencies, value-type mismatches). These
//!    abort immediately via [`fatal!`] with a diagnosable message; they are
//!    not recoverable and are never silently ignored.
//!
//! 2. Reported errors ([`GraphError`]): operations against a destroyed
//!    subgraph, and reads that opt out of the liveness contract.
//!
//! 3. Soft misses: cache lookups that find nothing. Those are ordinary
//!    `Option` results, not errors.

use thiserror::Error;

use crate::graph::node::AttributeId;
use crate::graph::subgraph::SubgraphId;

/// Reported (recoverable-by-caller) graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// The subgraph has already been invalidated; its nodes are gone.
    #[error("subgraph {0:?} has been destroyed")]
    SubgraphDestroyed(SubgraphId),

    /// The subgraph is mid-invalidation and cannot accept new work.
    #[error("subgraph {0:?} is invalidating")]
    SubgraphInvalidating(SubgraphId),

    /// The attribute id does not resolve to a live node.
    #[error("attribute {0:?} is not alive")]
    DeadAttribute(AttributeId),
}

/// Abort on a programmer-contract violation with a diagnosable message.
///
/// Logs through `tracing` before panicking so the violation shows up in
/// structured output even when the panic is swallowed by a test harness.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;
