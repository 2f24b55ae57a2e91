//! Canary traffic shifting for deployment groups.
//!
//! A [`DeploymentGroup`] binds one service to a routing target pair, a
//! deployment config and a lifecycle validator. Each submitted revision
//! becomes a shift, which the [`TrafficShifter`] drives through the canary
//! steps, consulting the validator at every checkpoint and restoring the
//! previous split when anything goes wrong.

pub mod error;
pub mod group;
pub mod hooks;
pub mod http_hook;
pub mod promotion;
pub mod scheduler;
pub mod shifter;
pub mod strategy;

pub use error::{ShiftError, ShiftResult};
pub use group::{DeploymentGroup, ShiftTicket};
pub use hooks::{
    AllowAll, ChainValidator, FnValidator, HookContext, HookDecision, LifecycleCheckpoint,
    LifecycleValidator, Scoped,
};
pub use http_hook::HttpHookValidator;
pub use promotion::RulePromotionHook;
pub use scheduler::{LocalScheduler, ServiceScheduler};
pub use shifter::{
    NoJournal, ShiftContext, ShiftJournal, ShiftOutcome, ShiftRun, ShifterSettings, TrafficShifter,
};
pub use strategy::ConfigCatalog;
