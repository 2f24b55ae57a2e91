//! Promotion hook: moves the production path onto a group at one checkpoint.
//!
//! At its checkpoint the hook sets listener rule priorities and can scale
//! a retired service down to zero. Any failure rejects the checkpoint, so
//! the shift rolls back.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use cutover_core::ServiceRef;
use cutover_routing::ListenerRules;

use crate::hooks::{HookContext, HookDecision, LifecycleCheckpoint, LifecycleValidator};
use crate::scheduler::ServiceScheduler;

pub struct RulePromotionHook {
    checkpoint: LifecycleCheckpoint,
    rules: Arc<dyn ListenerRules>,
    priorities: Vec<(String, u32)>,
    scale_down: Option<(Arc<dyn ServiceScheduler>, ServiceRef)>,
}

impl RulePromotionHook {
    pub fn new(
        checkpoint: LifecycleCheckpoint,
        rules: Arc<dyn ListenerRules>,
        priorities: Vec<(String, u32)>,
    ) -> Self {
        Self {
            checkpoint,
            rules,
            priorities,
            scale_down: None,
        }
    }

    /// Also scale `service` to zero once the rules are in place.
    pub fn with_scale_down(
        mut self,
        scheduler: Arc<dyn ServiceScheduler>,
        service: ServiceRef,
    ) -> Self {
        self.scale_down = Some((scheduler, service));
        self
    }

    async fn promote(&self, ctx: &HookContext) -> anyhow::Result<()> {
        self.rules.set_rule_priorities(&self.priorities).await?;
        if let Some((scheduler, service)) = &self.scale_down {
            scheduler.set_desired_count(service, 0).await?;
            info!(group = %ctx.group_id, service = %service, "retired service scaled down");
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleValidator for RulePromotionHook {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision {
        if checkpoint != self.checkpoint {
            return HookDecision::Allow;
        }
        match self.promote(ctx).await {
            Ok(()) => {
                info!(
                    group = %ctx.group_id,
                    shift = %ctx.shift_id,
                    rules = self.priorities.len(),
                    "listener rules promoted"
                );
                HookDecision::Allow
            }
            Err(e) => {
                warn!(group = %ctx.group_id, error = %e, "promotion failed");
                HookDecision::reject(format!("promotion failed: {e}"))
            }
        }
    }
}
