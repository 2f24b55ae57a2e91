//! Lifecycle validators, consulted at each checkpoint of a shift.
//!
//! A validator answers allow or reject for a checkpoint. Implementations
//! range from in-process closures to remote endpoints; [`Scoped`] limits a
//! validator to some checkpoints and [`ChainValidator`] composes several.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cutover_core::{ServiceRef, TargetRef, Weights};

/// Points in a shift where validators are consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleCheckpoint {
    /// Before any traffic reaches the new target.
    BeforeAllowTraffic,
    /// After the canary split is applied.
    AfterAllowTraffic,
    /// After the bake wait, before the full cutover.
    BeforeTraffic,
    /// After all traffic reaches the new target.
    AfterAllowTestTraffic,
}

impl LifecycleCheckpoint {
    pub const ALL: [LifecycleCheckpoint; 4] = [
        LifecycleCheckpoint::BeforeAllowTraffic,
        LifecycleCheckpoint::AfterAllowTraffic,
        LifecycleCheckpoint::BeforeTraffic,
        LifecycleCheckpoint::AfterAllowTestTraffic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCheckpoint::BeforeAllowTraffic => "BeforeAllowTraffic",
            LifecycleCheckpoint::AfterAllowTraffic => "AfterAllowTraffic",
            LifecycleCheckpoint::BeforeTraffic => "BeforeTraffic",
            LifecycleCheckpoint::AfterAllowTestTraffic => "AfterAllowTestTraffic",
        }
    }
}

impl fmt::Display for LifecycleCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleCheckpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle checkpoint: {s}"))
    }
}

/// What a validator sees about the shift it is asked about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub group_id: String,
    pub shift_id: String,
    pub revision: String,
    pub service: ServiceRef,
    pub primary: TargetRef,
    pub secondary: TargetRef,
    pub weights: Weights,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Reject { reason: String },
}

impl HookDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        HookDecision::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, HookDecision::Allow)
    }
}

/// Decides whether a shift may pass a checkpoint.
#[async_trait]
pub trait LifecycleValidator: Send + Sync {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision;
}

/// Ask `validator`, treating no answer within `timeout` as a rejection.
pub async fn consult(
    validator: &dyn LifecycleValidator,
    checkpoint: LifecycleCheckpoint,
    ctx: &HookContext,
    timeout: Duration,
) -> HookDecision {
    match tokio::time::timeout(timeout, validator.validate(checkpoint, ctx)).await {
        Ok(decision) => {
            debug!(group = %ctx.group_id, shift = %ctx.shift_id, %checkpoint, ?decision, "hook answered");
            decision
        }
        Err(_) => {
            warn!(
                group = %ctx.group_id,
                shift = %ctx.shift_id,
                %checkpoint,
                timeout_ms = timeout.as_millis() as u64,
                "hook timed out"
            );
            HookDecision::reject(format!("hook timed out after {}ms", timeout.as_millis()))
        }
    }
}

/// Allows every checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl LifecycleValidator for AllowAll {
    async fn validate(&self, _checkpoint: LifecycleCheckpoint, _ctx: &HookContext) -> HookDecision {
        HookDecision::Allow
    }
}

type HookFn = Arc<
    dyn Fn(LifecycleCheckpoint, HookContext) -> Pin<Box<dyn Future<Output = HookDecision> + Send>>
        + Send
        + Sync,
>;

/// Validator backed by an async closure.
#[derive(Clone)]
pub struct FnValidator {
    f: HookFn,
}

impl FnValidator {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(LifecycleCheckpoint, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookDecision> + Send + 'static,
    {
        Self {
            f: Arc::new(move |checkpoint, ctx| Box::pin(f(checkpoint, ctx))),
        }
    }
}

#[async_trait]
impl LifecycleValidator for FnValidator {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision {
        (self.f)(checkpoint, ctx.clone()).await
    }
}

/// Restricts a validator to a set of checkpoints; others are allowed.
pub struct Scoped {
    checkpoints: HashSet<LifecycleCheckpoint>,
    inner: Arc<dyn LifecycleValidator>,
}

impl Scoped {
    pub fn new(
        checkpoints: impl IntoIterator<Item = LifecycleCheckpoint>,
        inner: Arc<dyn LifecycleValidator>,
    ) -> Self {
        Self {
            checkpoints: checkpoints.into_iter().collect(),
            inner,
        }
    }
}

#[async_trait]
impl LifecycleValidator for Scoped {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision {
        if self.checkpoints.contains(&checkpoint) {
            self.inner.validate(checkpoint, ctx).await
        } else {
            HookDecision::Allow
        }
    }
}

/// Consults validators in order; the first rejection wins.
#[derive(Default)]
pub struct ChainValidator {
    validators: Vec<Arc<dyn LifecycleValidator>>,
}

impl ChainValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: Arc<dyn LifecycleValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

#[async_trait]
impl LifecycleValidator for ChainValidator {
    async fn validate(&self, checkpoint: LifecycleCheckpoint, ctx: &HookContext) -> HookDecision {
        for validator in &self.validators {
            let decision = validator.validate(checkpoint, ctx).await;
            if !decision.is_allow() {
                return decision;
            }
        }
        HookDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context() -> HookContext {
        HookContext {
            group_id: "latest".to_string(),
            shift_id: "s1".to_string(),
            revision: "abc".to_string(),
            service: ServiceRef::new("main", "latest"),
            primary: TargetRef::new("a"),
            secondary: TargetRef::new("b"),
            weights: Weights::all_primary(),
        }
    }

    fn reject_at(at: LifecycleCheckpoint) -> Arc<dyn LifecycleValidator> {
        Arc::new(FnValidator::new(move |checkpoint, _ctx| async move {
            if checkpoint == at {
                HookDecision::reject("no")
            } else {
                HookDecision::Allow
            }
        }))
    }

    #[test]
    fn checkpoint_names_roundtrip() {
        for checkpoint in LifecycleCheckpoint::ALL {
            assert_eq!(checkpoint.as_str().parse::<LifecycleCheckpoint>().unwrap(), checkpoint);
        }
        assert!("Whenever".parse::<LifecycleCheckpoint>().is_err());
    }

    #[tokio::test]
    async fn scoped_validator_only_sees_its_checkpoints() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let inner = Arc::new(FnValidator::new(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                HookDecision::reject("scoped")
            }
        }));
        let scoped = Scoped::new([LifecycleCheckpoint::BeforeTraffic], inner);

        let ctx = context();
        assert!(scoped.validate(LifecycleCheckpoint::AfterAllowTraffic, &ctx).await.is_allow());
        assert!(!scoped.validate(LifecycleCheckpoint::BeforeTraffic, &ctx).await.is_allow());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chain_returns_first_rejection() {
        let chain = ChainValidator::new()
            .with(Arc::new(AllowAll))
            .with(reject_at(LifecycleCheckpoint::AfterAllowTraffic))
            .with(Arc::new(FnValidator::new(|_, _| async { HookDecision::reject("second") })));

        let ctx = context();
        assert_eq!(
            chain.validate(LifecycleCheckpoint::AfterAllowTraffic, &ctx).await,
            HookDecision::reject("no")
        );
        assert_eq!(
            chain.validate(LifecycleCheckpoint::BeforeTraffic, &ctx).await,
            HookDecision::reject("second")
        );
    }

    #[tokio::test]
    async fn empty_chain_allows() {
        let chain = ChainValidator::new();
        assert!(chain.is_empty());
        assert!(chain.validate(LifecycleCheckpoint::BeforeAllowTraffic, &context()).await.is_allow());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hook_is_a_rejection() {
        let slow = FnValidator::new(|_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            HookDecision::Allow
        });
        let decision = consult(
            &slow,
            LifecycleCheckpoint::BeforeAllowTraffic,
            &context(),
            Duration::from_secs(30),
        )
        .await;
        assert!(matches!(decision, HookDecision::Reject { .. }));
    }
}
