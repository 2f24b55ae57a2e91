//! Weighted routing between the two targets of a service.
//!
//! A [`RoutingTargetPair`] owns the role assignment (primary/secondary) and
//! the current traffic split of one service. Weight changes are pushed
//! through a [`WeightProvisioner`]; the pair only records a split after the
//! provisioner accepted it.
//!
//! [`LocalRouter`] is the in-process provisioner used by the daemon and in
//! tests. It keeps per-pair weight tables, a write history, and listener
//! rule priorities, and can be told to fail writes.

pub mod error;
pub mod pair;
pub mod provisioner;

pub use error::{RoutingError, RoutingResult};
pub use pair::RoutingTargetPair;
pub use provisioner::{ListenerRules, LocalRouter, WeightProvisioner};
