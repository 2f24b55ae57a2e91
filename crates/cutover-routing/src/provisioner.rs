//! The seam between target pairs and whatever applies traffic weights.
//!
//! `WeightProvisioner` receives full weight tables for a pair. The write
//! is idempotent: applying the same table twice has the same effect as
//! applying it once. `ListenerRules` reorders listener rules when a
//! promotion moves a service onto the production path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use cutover_core::TargetRef;

use crate::error::{RoutingError, RoutingResult};

/// Applies weight tables to the routing layer.
#[async_trait]
pub trait WeightProvisioner: Send + Sync {
    /// Replace the weights for `pair_id` with `weights`.
    async fn set_weights(&self, pair_id: &str, weights: &[(TargetRef, u32)]) -> RoutingResult<()>;
}

/// Assigns priorities to listener rules.
#[async_trait]
pub trait ListenerRules: Send + Sync {
    async fn set_rule_priorities(&self, priorities: &[(String, u32)]) -> RoutingResult<()>;
}

/// Internal state for a single pair.
#[derive(Default)]
struct PairEntry {
    weights: Vec<(TargetRef, u32)>,
    history: Vec<Vec<(TargetRef, u32)>>,
    counter: AtomicU64,
}

/// In-process weighted router.
///
/// Stores the last table written for each pair and picks targets by
/// walking the cumulative weights with a per-pair request counter, so
/// over any 100 consecutive picks each target is chosen exactly as often
/// as its weight says.
#[derive(Clone, Default)]
pub struct LocalRouter {
    pairs: Arc<RwLock<HashMap<String, PairEntry>>>,
    rules: Arc<RwLock<HashMap<String, u32>>>,
    fail_next: Arc<AtomicU32>,
    unavailable: Arc<AtomicBool>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` weight writes.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every weight write until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current table for a pair.
    pub fn weights_for(&self, pair_id: &str) -> Option<Vec<(TargetRef, u32)>> {
        let pairs = self.pairs.read().expect("pairs lock");
        pairs.get(pair_id).map(|e| e.weights.clone())
    }

    /// Every table successfully written for a pair, oldest first.
    pub fn history(&self, pair_id: &str) -> Vec<Vec<(TargetRef, u32)>> {
        let pairs = self.pairs.read().expect("pairs lock");
        pairs
            .get(pair_id)
            .map(|e| e.history.clone())
            .unwrap_or_default()
    }

    /// Weight of one target in each write, oldest first.
    pub fn weight_history(&self, pair_id: &str, target: &TargetRef) -> Vec<u32> {
        self.history(pair_id)
            .iter()
            .map(|table| {
                table
                    .iter()
                    .find(|(t, _)| t == target)
                    .map(|(_, w)| *w)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Pick the target for the next request on a pair.
    pub fn pick(&self, pair_id: &str) -> Option<TargetRef> {
        let pairs = self.pairs.read().expect("pairs lock");
        let entry = pairs.get(pair_id)?;
        let total: u64 = entry.weights.iter().map(|(_, w)| u64::from(*w)).sum();
        if total == 0 {
            return None;
        }

        let slot = entry.counter.fetch_add(1, Ordering::Relaxed) % total;
        let mut cumulative = 0u64;
        for (target, weight) in &entry.weights {
            cumulative += u64::from(*weight);
            if slot < cumulative {
                return Some(target.clone());
            }
        }
        None
    }

    /// Current listener rule priorities.
    pub fn rule_priorities(&self) -> HashMap<String, u32> {
        self.rules.read().expect("rules lock").clone()
    }

    fn should_fail(&self) -> bool {
        if self.unavailable.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WeightProvisioner for LocalRouter {
    async fn set_weights(&self, pair_id: &str, weights: &[(TargetRef, u32)]) -> RoutingResult<()> {
        if self.should_fail() {
            return Err(RoutingError::WriteFailed {
                pair: pair_id.to_string(),
                reason: "routing layer unavailable".to_string(),
            });
        }

        let mut pairs = self.pairs.write().expect("pairs lock");
        let entry = pairs.entry(pair_id.to_string()).or_default();
        entry.weights = weights.to_vec();
        entry.history.push(weights.to_vec());
        entry.counter.store(0, Ordering::Relaxed);
        debug!(pair = pair_id, ?weights, "weights applied");
        Ok(())
    }
}

#[async_trait]
impl ListenerRules for LocalRouter {
    async fn set_rule_priorities(&self, priorities: &[(String, u32)]) -> RoutingResult<()> {
        let mut rules = self.rules.write().expect("rules lock");
        for (rule, priority) in priorities {
            rules.insert(rule.clone(), *priority);
            debug!(rule = %rule, priority, "rule priority set");
        }
        Ok(())
    }
}
