//! Deployment group: one service, its target pair and the shift state machine.
//!
//! ```text
//! Idle → Shifting → { Succeeded | RolledBack | Failed }
//!          ↑                 │           │
//!          └──── next shift ─┴───────────┘      Failed → reset → Idle
//! ```
//!
//! A group runs at most one shift at a time and is the only writer of its
//! pair's weights while a shift is active. Every transition is persisted
//! so a restarted daemon can resume a bake wait or roll back a shift that
//! was interrupted elsewhere.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use cutover_core::{DeploymentConfig, GroupId, ServiceRef, ShiftId, TargetRef, epoch_secs};
use cutover_routing::RoutingTargetPair;
use cutover_state::{GroupRecord, PairSnapshot, ShiftRecord, ShiftState, StateStore};

use crate::error::{ShiftError, ShiftResult};
use crate::hooks::LifecycleValidator;
use crate::shifter::{ShiftContext, ShiftJournal, ShiftOutcome, ShiftRun, TrafficShifter};

/// Permission to drive one accepted shift. Returned by [`DeploymentGroup::begin`].
#[derive(Debug)]
pub struct ShiftTicket {
    shift_id: ShiftId,
    revision: String,
    cancel: watch::Receiver<bool>,
    resume_deadline: Option<u64>,
}

impl ShiftTicket {
    pub fn shift_id(&self) -> &str {
        &self.shift_id
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Whether this ticket continues a bake wait from before a restart.
    pub fn is_resumed(&self) -> bool {
        self.resume_deadline.is_some()
    }
}

struct ActiveShift {
    shift_id: ShiftId,
    revision: String,
    from: TargetRef,
    to: TargetRef,
    started_at: u64,
    cancel_tx: watch::Sender<bool>,
    /// State and revision to return to if the shift is abandoned.
    prior_state: ShiftState,
    prior_revision: Option<String>,
}

/// What currently holds the group.
enum Slot {
    Shift(ActiveShift),
    Reset,
}

pub struct DeploymentGroup {
    id: GroupId,
    service: ServiceRef,
    config: DeploymentConfig,
    pair: RoutingTargetPair,
    validator: Arc<dyn LifecycleValidator>,
    shifter: TrafficShifter,
    store: Option<StateStore>,
    record: Mutex<GroupRecord>,
    history: Mutex<Vec<ShiftRecord>>,
    slot: Mutex<Option<Slot>>,
    state_tx: watch::Sender<ShiftState>,
}

impl DeploymentGroup {
    pub fn new(
        id: impl Into<GroupId>,
        service: ServiceRef,
        config: DeploymentConfig,
        pair: RoutingTargetPair,
        validator: Arc<dyn LifecycleValidator>,
        shifter: TrafficShifter,
    ) -> Self {
        let id = id.into();
        let record = GroupRecord {
            group_id: id.clone(),
            service: service.clone(),
            state: ShiftState::Idle,
            pair: pair.snapshot(),
            active_shift_id: None,
            revision: None,
            bake_deadline: None,
            updated_at: epoch_secs(),
        };
        let (state_tx, _) = watch::channel(ShiftState::Idle);
        Self {
            id,
            service,
            config,
            pair,
            validator,
            shifter,
            store: None,
            record: Mutex::new(record),
            history: Mutex::new(Vec::new()),
            slot: Mutex::new(None),
            state_tx,
        }
    }

    /// Persist every transition to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn pair(&self) -> &RoutingTargetPair {
        &self.pair
    }

    pub fn state(&self) -> ShiftState {
        self.state_tx.borrow().clone()
    }

    pub fn record(&self) -> GroupRecord {
        self.record.lock().expect("group record lock").clone()
    }

    /// Finished shifts, oldest first.
    pub fn shifts(&self) -> Vec<ShiftRecord> {
        self.history.lock().expect("shift history lock").clone()
    }

    pub fn active_shift_id(&self) -> Option<ShiftId> {
        match self.slot.lock().expect("shift slot lock").as_ref() {
            Some(Slot::Shift(active)) => Some(active.shift_id.clone()),
            _ => None,
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShiftState> {
        self.state_tx.subscribe()
    }

    /// Reload persisted state and push the recorded weights.
    ///
    /// A shift that was in its bake wait comes back as a ticket to
    /// [`drive`](Self::drive). A shift interrupted anywhere else is rolled
    /// back here.
    pub async fn recover(&self) -> ShiftResult<Option<ShiftTicket>> {
        let saved = match &self.store {
            Some(store) => store.get_group(&self.id)?,
            None => None,
        };

        let Some(saved) = saved else {
            self.pair.sync().await?;
            self.update_record(|_| {})?;
            info!(group = %self.id, primary = %self.pair.primary(), "group registered");
            return Ok(None);
        };

        if let Some(store) = &self.store {
            *self.history.lock().expect("shift history lock") =
                store.list_shifts_for_group(&self.id)?;
        }
        self.pair.restore(saved.pair.clone());
        *self.record.lock().expect("group record lock") = saved.clone();
        self.state_tx.send_replace(saved.state.clone());
        self.pair.sync().await?;

        if saved.state != ShiftState::Shifting {
            info!(
                group = %self.id,
                state = saved.state.label(),
                weights = %saved.pair.weights,
                "group restored"
            );
            return Ok(None);
        }

        let Some(shift_id) = saved.active_shift_id.clone() else {
            error!(group = %self.id, "shifting record has no shift id, rolling back");
            let state = match self.shifter.restore_primary(&self.pair, self).await {
                Ok(()) => ShiftState::RolledBack {
                    reason: "shift record had no id".to_string(),
                },
                Err(e) => ShiftState::Failed {
                    reason: format!("shift record had no id; {e}"),
                },
            };
            self.update_record(|r| {
                r.state = state.clone();
                r.bake_deadline = None;
            })?;
            self.state_tx.send_replace(state);
            return Ok(None);
        };
        let revision = saved.revision.clone().unwrap_or_default();
        let (cancel_tx, cancel) = watch::channel(false);
        *self.slot.lock().expect("shift slot lock") = Some(Slot::Shift(ActiveShift {
            shift_id: shift_id.clone(),
            revision: revision.clone(),
            from: saved.pair.primary.clone(),
            to: saved.pair.secondary.clone(),
            started_at: saved.updated_at,
            cancel_tx,
            prior_state: ShiftState::Idle,
            prior_revision: None,
        }));

        if let Some(deadline) = saved.bake_deadline {
            info!(group = %self.id, shift = %shift_id, deadline, "resuming shift in bake wait");
            return Ok(Some(ShiftTicket {
                shift_id,
                revision,
                cancel,
                resume_deadline: Some(deadline),
            }));
        }

        warn!(group = %self.id, shift = %shift_id, "shift interrupted outside bake wait, rolling back");
        let outcome = match self.shifter.restore_primary(&self.pair, self).await {
            Ok(()) => ShiftOutcome::RolledBack {
                reason: "interrupted by restart".to_string(),
            },
            Err(e) => ShiftOutcome::Failed {
                reason: format!("interrupted by restart; {e}"),
            },
        };
        self.finish(&shift_id, outcome)?;
        Ok(None)
    }

    /// Accept a shift for `revision`.
    ///
    /// Fails with `ShiftInProgress` while another shift (or a reset) holds
    /// the group, and with `RequiresIntervention` while the group is failed.
    pub fn begin(&self, revision: &str) -> ShiftResult<ShiftTicket> {
        let mut slot = self.slot.lock().expect("shift slot lock");
        if slot.is_some() {
            return Err(ShiftError::ShiftInProgress(self.id.clone()));
        }
        if matches!(*self.state_tx.borrow(), ShiftState::Failed { .. }) {
            return Err(ShiftError::RequiresIntervention(self.id.clone()));
        }

        let (prior_state, prior_revision) = {
            let record = self.record.lock().expect("group record lock");
            (record.state.clone(), record.revision.clone())
        };
        let shift_id = Uuid::new_v4().to_string();
        self.update_record(|r| {
            r.state = ShiftState::Shifting;
            r.active_shift_id = Some(shift_id.clone());
            r.revision = Some(revision.to_string());
            r.bake_deadline = None;
        })?;

        let snapshot = self.pair.snapshot();
        let (cancel_tx, cancel) = watch::channel(false);
        *slot = Some(Slot::Shift(ActiveShift {
            shift_id: shift_id.clone(),
            revision: revision.to_string(),
            from: snapshot.primary.clone(),
            to: snapshot.secondary.clone(),
            started_at: epoch_secs(),
            cancel_tx,
            prior_state,
            prior_revision,
        }));
        drop(slot);

        self.state_tx.send_replace(ShiftState::Shifting);
        info!(
            group = %self.id,
            shift = %shift_id,
            revision,
            from = %snapshot.primary,
            to = %snapshot.secondary,
            "shift accepted"
        );

        Ok(ShiftTicket {
            shift_id,
            revision: revision.to_string(),
            cancel,
            resume_deadline: None,
        })
    }

    /// Drive an accepted shift to its terminal state.
    pub async fn drive(&self, ticket: ShiftTicket) -> ShiftResult<ShiftOutcome> {
        let ShiftTicket {
            shift_id,
            revision,
            cancel,
            resume_deadline,
        } = ticket;

        let ctx = ShiftContext {
            group_id: self.id.clone(),
            shift_id: shift_id.clone(),
            revision,
            service: self.service.clone(),
        };
        let run = ShiftRun {
            pair: &self.pair,
            config: &self.config,
            validator: self.validator.as_ref(),
            ctx: &ctx,
            journal: self,
            cancel,
        };

        let outcome = match resume_deadline {
            None => self.shifter.run(run).await,
            Some(deadline) => self.shifter.resume(run, deadline).await,
        };
        self.finish(&shift_id, outcome.clone())?;
        Ok(outcome)
    }

    /// Hand back a ticket from [`begin`](Self::begin) before any traffic moved.
    ///
    /// The group returns to the state and revision it had before the shift
    /// was accepted. Nothing is archived.
    pub fn abandon(&self, ticket: ShiftTicket) -> ShiftResult<()> {
        let mut slot = self.slot.lock().expect("shift slot lock");
        let (state, revision) = match slot.as_ref() {
            Some(Slot::Shift(active)) if active.shift_id == ticket.shift_id => {
                (active.prior_state.clone(), active.prior_revision.clone())
            }
            _ => return Err(self.unknown_shift(&ticket.shift_id)),
        };

        let persisted = self.update_record(|r| {
            r.state = state.clone();
            r.active_shift_id = None;
            r.revision = revision;
            r.bake_deadline = None;
        });
        *slot = None;
        drop(slot);
        self.state_tx.send_replace(state);
        info!(group = %self.id, shift = %ticket.shift_id, "shift abandoned before traffic moved");
        persisted
    }

    /// Submit `revision` and drive the shift to completion.
    pub async fn shift(&self, revision: &str) -> ShiftResult<ShiftOutcome> {
        let ticket = self.begin(revision)?;
        self.drive(ticket).await
    }

    /// Ask the active shift to roll back.
    pub fn cancel(&self) -> ShiftResult<ShiftId> {
        match self.slot.lock().expect("shift slot lock").as_ref() {
            Some(Slot::Shift(active)) => {
                active.cancel_tx.send_replace(true);
                info!(group = %self.id, shift = %active.shift_id, "shift cancellation requested");
                Ok(active.shift_id.clone())
            }
            _ => Err(ShiftError::NoActiveShift(self.id.clone())),
        }
    }

    /// Operator reset: re-apply `(100,0)` and return the group to `Idle`.
    pub async fn reset(&self) -> ShiftResult<()> {
        {
            let mut slot = self.slot.lock().expect("shift slot lock");
            if slot.is_some() {
                return Err(ShiftError::ShiftInProgress(self.id.clone()));
            }
            *slot = Some(Slot::Reset);
        }

        let result = match self.shifter.restore_primary(&self.pair, self).await {
            Ok(()) => self.update_record(|r| {
                r.state = ShiftState::Idle;
                r.active_shift_id = None;
                r.bake_deadline = None;
            }),
            Err(e) => Err(e),
        };
        *self.slot.lock().expect("shift slot lock") = None;

        match &result {
            Ok(()) => {
                self.state_tx.send_replace(ShiftState::Idle);
                info!(group = %self.id, primary = %self.pair.primary(), "group reset");
            }
            Err(e) => error!(group = %self.id, error = %e, "group reset failed"),
        }
        result
    }

    /// Wait until `shift_id` finishes and return its terminal state.
    pub async fn wait_for(&self, shift_id: &str) -> ShiftResult<ShiftState> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let running = matches!(
                self.slot.lock().expect("shift slot lock").as_ref(),
                Some(Slot::Shift(active)) if active.shift_id == shift_id
            );
            if !running {
                return self
                    .history
                    .lock()
                    .expect("shift history lock")
                    .iter()
                    .rev()
                    .find(|s| s.shift_id == shift_id)
                    .map(|s| s.outcome.clone())
                    .ok_or_else(|| self.unknown_shift(shift_id));
            }
            if rx.changed().await.is_err() {
                return Err(self.unknown_shift(shift_id));
            }
        }
    }

    fn unknown_shift(&self, shift_id: &str) -> ShiftError {
        ShiftError::UnknownShift {
            group: self.id.clone(),
            shift: shift_id.to_string(),
        }
    }

    /// Record the terminal state, archive the shift, and release the group.
    fn finish(&self, shift_id: &str, outcome: ShiftOutcome) -> ShiftResult<()> {
        let mut slot = self.slot.lock().expect("shift slot lock");
        let active = match slot.as_ref() {
            Some(Slot::Shift(active)) if active.shift_id == shift_id => active,
            _ => return Err(self.unknown_shift(shift_id)),
        };

        if outcome == ShiftOutcome::Succeeded {
            self.pair.swap_roles();
        }
        let state = ShiftState::from(outcome);
        let archived = ShiftRecord {
            shift_id: shift_id.to_string(),
            group_id: self.id.clone(),
            revision: active.revision.clone(),
            config_name: self.config.name.clone(),
            from: active.from.clone(),
            to: active.to.clone(),
            outcome: state.clone(),
            started_at: active.started_at,
            finished_at: epoch_secs(),
        };

        let persisted = self
            .update_record(|r| {
                r.state = state.clone();
                r.active_shift_id = None;
                r.bake_deadline = None;
            })
            .and_then(|()| match &self.store {
                Some(store) => store.put_shift(&archived).map_err(ShiftError::from),
                None => Ok(()),
            });

        self.history
            .lock()
            .expect("shift history lock")
            .push(archived);
        *slot = None;
        drop(slot);
        self.state_tx.send_replace(state.clone());

        match &state {
            ShiftState::Succeeded => info!(
                group = %self.id,
                shift = %shift_id,
                primary = %self.pair.primary(),
                "shift finished, roles swapped"
            ),
            ShiftState::RolledBack { reason } => {
                warn!(group = %self.id, shift = %shift_id, %reason, "shift rolled back")
            }
            ShiftState::Failed { reason } => error!(
                group = %self.id,
                shift = %shift_id,
                %reason,
                weights = %self.pair.weights(),
                "shift failed, operator reset required"
            ),
            ShiftState::Idle | ShiftState::Shifting => {}
        }
        persisted
    }

    /// Apply `f` to the record, refresh its pair snapshot, and persist it.
    fn update_record(&self, f: impl FnOnce(&mut GroupRecord)) -> ShiftResult<()> {
        let mut record = self.record.lock().expect("group record lock");
        f(&mut record);
        record.pair = self.pair.snapshot();
        record.updated_at = epoch_secs();
        if let Some(store) = &self.store {
            store.put_group(&record)?;
        }
        Ok(())
    }
}

impl ShiftJournal for DeploymentGroup {
    fn weights_changed(&self, _pair: &PairSnapshot) {
        if let Err(e) = self.update_record(|_| {}) {
            warn!(group = %self.id, error = %e, "failed to persist weights");
        }
    }

    fn bake_started(&self, deadline: u64) {
        if let Err(e) = self.update_record(|r| r.bake_deadline = Some(deadline)) {
            warn!(group = %self.id, error = %e, "failed to persist bake deadline");
        }
    }

    fn bake_finished(&self) {
        if let Err(e) = self.update_record(|r| r.bake_deadline = None) {
            warn!(group = %self.id, error = %e, "failed to clear bake deadline");
        }
    }
}
