//! Traffic shifter. Drives one shift through the canary steps.
//!
//! ```text
//! BeforeAllowTraffic → (100-c, c) → AfterAllowTraffic
//!     → bake wait → BeforeTraffic → (0,100) → AfterAllowTestTraffic
//! ```
//!
//! Without a bake time the first write is already `(0,100)` and the bake
//! wait, `BeforeTraffic` and the second write are skipped. A rejection,
//! a cancellation or an exhausted write budget sends the pair back to
//! `(100,0)`; if that write cannot be made either, the shift is `Failed`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cutover_core::config::RolloutConfig;
use cutover_core::{DeploymentConfig, ServiceRef, Weights, epoch_secs, parse_duration};
use cutover_routing::{RoutingError, RoutingTargetPair};
use cutover_state::{PairSnapshot, ShiftState};

use crate::error::{ShiftError, ShiftResult};
use crate::hooks::{HookContext, HookDecision, LifecycleCheckpoint, LifecycleValidator, consult};

/// Timing and retry knobs for shifts.
#[derive(Debug, Clone, PartialEq)]
pub struct ShifterSettings {
    /// How long a validator may take before its silence counts as a rejection.
    pub hook_timeout: Duration,
    /// Wait after each weight write for the routing layer to converge.
    pub propagation_delay: Duration,
    /// Attempts per weight write, including the first.
    pub write_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How far past its deadline a resumed bake wait may be.
    pub bake_overrun_limit: Duration,
}

impl Default for ShifterSettings {
    fn default() -> Self {
        Self {
            hook_timeout: Duration::from_secs(30),
            propagation_delay: Duration::ZERO,
            write_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            bake_overrun_limit: Duration::from_secs(15 * 60),
        }
    }
}

impl ShifterSettings {
    pub fn from_config(config: &RolloutConfig) -> Self {
        let defaults = Self::default();
        let duration = |value: &Option<String>, default: Duration| {
            value.as_deref().and_then(parse_duration).unwrap_or(default)
        };
        Self {
            hook_timeout: duration(&config.hook_timeout, defaults.hook_timeout),
            propagation_delay: duration(&config.propagation_delay, defaults.propagation_delay),
            write_attempts: config.write_attempts.unwrap_or(defaults.write_attempts).max(1),
            backoff_base: duration(&config.backoff_base, defaults.backoff_base),
            backoff_max: duration(&config.backoff_max, defaults.backoff_max),
            bake_overrun_limit: duration(&config.bake_overrun_limit, defaults.bake_overrun_limit),
        }
    }
}

/// Exponential backoff: doubles from `base` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, max }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Receives progress of a shift so it can be persisted.
pub trait ShiftJournal: Send + Sync {
    /// A weight write was accepted by the routing layer.
    fn weights_changed(&self, _pair: &PairSnapshot) {}

    /// The bake wait started; it ends at `deadline` (Unix seconds).
    fn bake_started(&self, _deadline: u64) {}

    /// The bake wait ended and the shift moved on to the final write.
    fn bake_finished(&self) {}
}

/// Journal that records nothing.
pub struct NoJournal;

impl ShiftJournal for NoJournal {}

/// Identity of the shift being driven.
#[derive(Debug, Clone)]
pub struct ShiftContext {
    pub group_id: String,
    pub shift_id: String,
    pub revision: String,
    pub service: ServiceRef,
}

impl ShiftContext {
    fn hook_context(&self, pair: &RoutingTargetPair) -> HookContext {
        let snapshot = pair.snapshot();
        HookContext {
            group_id: self.group_id.clone(),
            shift_id: self.shift_id.clone(),
            revision: self.revision.clone(),
            service: self.service.clone(),
            primary: snapshot.primary,
            secondary: snapshot.secondary,
            weights: snapshot.weights,
        }
    }
}

/// How a shift ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShiftOutcome {
    /// All traffic is on the new target.
    Succeeded,
    /// The shift was aborted and `(100,0)` restored.
    RolledBack { reason: String },
    /// The pair could not be brought back to a known split, or a resumed
    /// bake wait had overrun its limit.
    Failed { reason: String },
}

impl From<ShiftOutcome> for ShiftState {
    fn from(outcome: ShiftOutcome) -> Self {
        match outcome {
            ShiftOutcome::Succeeded => ShiftState::Succeeded,
            ShiftOutcome::RolledBack { reason } => ShiftState::RolledBack { reason },
            ShiftOutcome::Failed { reason } => ShiftState::Failed { reason },
        }
    }
}

/// Where a shift starts from.
enum Entry {
    Start,
    Bake { deadline: u64 },
}

/// Everything a shift run needs besides the shifter's settings.
pub struct ShiftRun<'a> {
    pub pair: &'a RoutingTargetPair,
    pub config: &'a DeploymentConfig,
    pub validator: &'a dyn LifecycleValidator,
    pub ctx: &'a ShiftContext,
    pub journal: &'a dyn ShiftJournal,
    pub cancel: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct TrafficShifter {
    settings: ShifterSettings,
}

impl TrafficShifter {
    pub fn new(settings: ShifterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ShifterSettings {
        &self.settings
    }

    /// Drive a shift from the start.
    pub async fn run(&self, mut run: ShiftRun<'_>) -> ShiftOutcome {
        info!(
            group = %run.ctx.group_id,
            shift = %run.ctx.shift_id,
            revision = %run.ctx.revision,
            config = %run.config.name,
            canary = run.config.canary_percentage,
            bake_minutes = run.config.bake_time_minutes,
            "shift started"
        );
        let result = self.forward(&mut run, Entry::Start).await;
        self.settle(&run, result).await
    }

    /// Continue a shift that was waiting out its bake when the process stopped.
    pub async fn resume(&self, mut run: ShiftRun<'_>, bake_deadline: u64) -> ShiftOutcome {
        let now = epoch_secs();
        let overrun = Duration::from_secs(now.saturating_sub(bake_deadline));
        if overrun > self.settings.bake_overrun_limit {
            let cause = ShiftError::BakeOverrun { overrun };
            error!(
                group = %run.ctx.group_id,
                shift = %run.ctx.shift_id,
                overrun_secs = overrun.as_secs(),
                "bake wait overran its limit"
            );
            let reason = match self.restore_primary(run.pair, run.journal).await {
                Ok(()) => format!("{cause}; traffic restored to primary"),
                Err(e) => format!("{cause}; {e}"),
            };
            return ShiftOutcome::Failed { reason };
        }

        info!(
            group = %run.ctx.group_id,
            shift = %run.ctx.shift_id,
            remaining_secs = bake_deadline.saturating_sub(now),
            "resuming bake wait"
        );
        let result = self
            .forward(&mut run, Entry::Bake { deadline: bake_deadline })
            .await;
        self.settle(&run, result).await
    }

    /// Put all traffic back on the primary, retrying transient failures.
    pub async fn restore_primary(
        &self,
        pair: &RoutingTargetPair,
        journal: &dyn ShiftJournal,
    ) -> ShiftResult<()> {
        self.write(pair, Weights::all_primary(), journal)
            .await
            .map_err(|failure| ShiftError::RollbackFailed {
                attempts: failure.attempts,
                reason: failure.error.to_string(),
            })
    }

    async fn forward(&self, run: &mut ShiftRun<'_>, entry: Entry) -> ShiftResult<()> {
        let bake = match entry {
            Entry::Start => {
                self.check(run, LifecycleCheckpoint::BeforeAllowTraffic).await?;
                let first = run.config.canary_weights()?;
                self.write(run.pair, first, run.journal).await?;
                self.check(run, LifecycleCheckpoint::AfterAllowTraffic).await?;

                if run.config.is_all_at_once() {
                    self.check(run, LifecycleCheckpoint::AfterAllowTestTraffic).await?;
                    return Ok(());
                }

                let bake = run.config.bake_time();
                run.journal.bake_started(epoch_secs() + bake.as_secs());
                bake
            }
            Entry::Bake { deadline } => {
                Duration::from_secs(deadline.saturating_sub(epoch_secs()))
            }
        };

        self.bake(run, bake).await?;
        run.journal.bake_finished();
        self.check(run, LifecycleCheckpoint::BeforeTraffic).await?;
        self.write(run.pair, Weights::all_secondary(), run.journal).await?;
        self.check(run, LifecycleCheckpoint::AfterAllowTestTraffic).await?;
        Ok(())
    }

    async fn settle(&self, run: &ShiftRun<'_>, result: ShiftResult<()>) -> ShiftOutcome {
        let cause = match result {
            Ok(()) => {
                info!(group = %run.ctx.group_id, shift = %run.ctx.shift_id, "shift succeeded");
                return ShiftOutcome::Succeeded;
            }
            Err(cause) => cause,
        };

        warn!(
            group = %run.ctx.group_id,
            shift = %run.ctx.shift_id,
            cause = %cause,
            "rolling back shift"
        );
        match self.restore_primary(run.pair, run.journal).await {
            Ok(()) => ShiftOutcome::RolledBack {
                reason: cause.to_string(),
            },
            Err(e) => {
                error!(
                    group = %run.ctx.group_id,
                    shift = %run.ctx.shift_id,
                    weights = %run.pair.weights(),
                    error = %e,
                    "rollback failed, pair left inconsistent"
                );
                ShiftOutcome::Failed {
                    reason: format!("{cause}; {e}"),
                }
            }
        }
    }

    async fn check(&self, run: &ShiftRun<'_>, checkpoint: LifecycleCheckpoint) -> ShiftResult<()> {
        if *run.cancel.borrow() {
            return Err(ShiftError::Cancelled);
        }
        let ctx = run.ctx.hook_context(run.pair);
        match consult(run.validator, checkpoint, &ctx, self.settings.hook_timeout).await {
            HookDecision::Allow => Ok(()),
            HookDecision::Reject { reason } => {
                Err(ShiftError::ValidationRejected { checkpoint, reason })
            }
        }
    }

    /// Wait out the bake time unless the shift is cancelled first.
    async fn bake(&self, run: &mut ShiftRun<'_>, duration: Duration) -> ShiftResult<()> {
        if *run.cancel.borrow() {
            return Err(ShiftError::Cancelled);
        }
        debug!(
            group = %run.ctx.group_id,
            shift = %run.ctx.shift_id,
            secs = duration.as_secs(),
            "baking"
        );
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancelled(&mut run.cancel) => Err(ShiftError::Cancelled),
        }
    }

    /// One weight write with bounded retries on transient failures.
    async fn write(
        &self,
        pair: &RoutingTargetPair,
        weights: Weights,
        journal: &dyn ShiftJournal,
    ) -> Result<(), WriteFailure> {
        let mut backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let mut attempt = 1;
        loop {
            match pair.apply(weights).await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < self.settings.write_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        pair = %pair.id(),
                        %weights,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "weight write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(WriteFailure { attempts: attempt, error }),
            }
        }

        journal.weights_changed(&pair.snapshot());
        if !self.settings.propagation_delay.is_zero() {
            tokio::time::sleep(self.settings.propagation_delay).await;
        }
        Ok(())
    }
}

/// A weight write that gave up, and how many attempts it made.
#[derive(Debug)]
struct WriteFailure {
    attempts: u32,
    error: RoutingError,
}

impl From<WriteFailure> for ShiftError {
    fn from(failure: WriteFailure) -> Self {
        failure.error.into()
    }
}

/// Resolves once the cancel flag is raised. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *cancel.borrow() {
            return;
        }
    }
}
