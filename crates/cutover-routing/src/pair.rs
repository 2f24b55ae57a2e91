//! Routing target pair: two interchangeable targets behind one service.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use cutover_core::{TargetRef, Weights};
use cutover_state::PairSnapshot;

use crate::error::RoutingResult;
use crate::provisioner::WeightProvisioner;

/// Handle to one target pair. Clones share the same state.
///
/// The recorded split always equals the last split the provisioner
/// accepted: a rejected or failed write leaves it unchanged.
#[derive(Clone)]
pub struct RoutingTargetPair {
    id: String,
    state: Arc<RwLock<PairSnapshot>>,
    provisioner: Arc<dyn WeightProvisioner>,
    write_lock: Arc<Mutex<()>>,
}

impl RoutingTargetPair {
    /// New pair with all traffic on `primary`.
    pub fn new(
        id: impl Into<String>,
        primary: TargetRef,
        secondary: TargetRef,
        provisioner: Arc<dyn WeightProvisioner>,
    ) -> Self {
        Self::from_snapshot(id, PairSnapshot::new(primary, secondary), provisioner)
    }

    /// Pair restored from a persisted snapshot.
    pub fn from_snapshot(
        id: impl Into<String>,
        snapshot: PairSnapshot,
        provisioner: Arc<dyn WeightProvisioner>,
    ) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(RwLock::new(snapshot)),
            provisioner,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn primary(&self) -> TargetRef {
        self.state.read().expect("pair lock").primary.clone()
    }

    pub fn secondary(&self) -> TargetRef {
        self.state.read().expect("pair lock").secondary.clone()
    }

    pub fn weights(&self) -> Weights {
        self.state.read().expect("pair lock").weights
    }

    pub fn snapshot(&self) -> PairSnapshot {
        self.state.read().expect("pair lock").clone()
    }

    /// Validate and apply a split. Invalid splits never reach the provisioner.
    pub async fn set_weights(&self, primary: u32, secondary: u32) -> RoutingResult<Weights> {
        let weights = Weights::new(primary, secondary)?;
        self.apply(weights).await?;
        Ok(weights)
    }

    /// Apply an already validated split.
    pub async fn apply(&self, weights: Weights) -> RoutingResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.snapshot();
        next.weights = weights;

        self.provisioner
            .set_weights(&self.id, &next.weighted_targets())
            .await?;

        *self.state.write().expect("pair lock") = next;
        debug!(pair = %self.id, %weights, "pair weights updated");
        Ok(())
    }

    /// Replace roles and split with a persisted snapshot without writing.
    /// Follow with [`sync`](Self::sync) to push it to the routing layer.
    pub fn restore(&self, snapshot: PairSnapshot) {
        *self.state.write().expect("pair lock") = snapshot;
    }

    /// Re-push the recorded split, e.g. after a restart.
    pub async fn sync(&self) -> RoutingResult<()> {
        let weights = self.weights();
        self.apply(weights).await
    }

    /// Exchange the primary and secondary roles.
    ///
    /// Each target keeps the traffic it carries, so nothing is written to
    /// the routing layer. After a completed cutover this puts the pair back
    /// at (100,0) with the new revision as primary.
    pub fn swap_roles(&self) {
        let mut state = self.state.write().expect("pair lock");
        *state = state.swapped();
        info!(
            pair = %self.id,
            primary = %state.primary,
            secondary = %state.secondary,
            weights = %state.weights,
            "pair roles swapped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RoutingError;
    use crate::provisioner::LocalRouter;

    fn pair(router: &LocalRouter) -> RoutingTargetPair {
        RoutingTargetPair::new(
            "svc",
            TargetRef::new("blue"),
            TargetRef::new("green"),
            Arc::new(router.clone()),
        )
    }

    #[test]
    fn new_pair_sends_everything_to_primary() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        assert_eq!(pair.weights(), Weights::all_primary());
        assert_eq!(pair.primary(), TargetRef::new("blue"));
    }

    #[tokio::test]
    async fn every_valid_split_is_recorded() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        for a in 0..=100 {
            pair.set_weights(a, 100 - a).await.unwrap();
            assert_eq!(pair.weights(), Weights::new(a, 100 - a).unwrap());
        }
        assert_eq!(router.history("svc").len(), 101);
    }

    #[tokio::test]
    async fn invalid_split_leaves_pair_and_router_untouched() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        pair.set_weights(50, 50).await.unwrap();

        let err = pair.set_weights(50, 49).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidWeight(_)));
        let err = pair.set_weights(101, 0).await.unwrap_err();
        assert!(matches!(err, RoutingError::InvalidWeight(_)));

        assert_eq!(pair.weights(), Weights::new(50, 50).unwrap());
        assert_eq!(router.history("svc").len(), 1);
    }

    #[tokio::test]
    async fn failed_write_is_not_recorded() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        router.fail_next(1);

        let err = pair.set_weights(0, 100).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(pair.weights(), Weights::all_primary());
    }

    #[tokio::test]
    async fn swap_roles_twice_is_identity() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        pair.set_weights(0, 100).await.unwrap();
        let before = pair.snapshot();

        pair.swap_roles();
        assert_eq!(pair.primary(), TargetRef::new("green"));
        assert_eq!(pair.weights(), Weights::all_primary());

        pair.swap_roles();
        assert_eq!(pair.snapshot(), before);
        assert_eq!(router.history("svc").len(), 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let router = LocalRouter::new();
        let pair = pair(&router);
        let other = pair.clone();
        other.set_weights(30, 70).await.unwrap();
        assert_eq!(pair.weights(), Weights::new(30, 70).unwrap());
    }
}
