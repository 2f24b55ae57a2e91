//! Shared types used across Cutover crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a deployment group ("latest", "stable", ...).
pub type GroupId = String;

/// Identifier of a single shift execution.
pub type ShiftId = String;

/// Identifier of a pipeline run.
pub type RunId = String;

/// Handle to one routing destination (a target group behind the listener).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRef(pub String);

impl TargetRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a scheduled container service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    pub cluster: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
        }
    }

    /// Composite `{cluster}/{name}` key.
    pub fn key(&self) -> String {
        format!("{}/{}", self.cluster, self.name)
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.name)
    }
}

/// A weight request that cannot be applied to a target pair.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid weight: primary={primary} secondary={secondary} (each must be 0..=100, summing to 100)")]
pub struct WeightError {
    pub primary: u32,
    pub secondary: u32,
}

/// Traffic split across a target pair, in percent.
///
/// Always sums to [`Weights::TOTAL`]; the only way to build one from
/// arbitrary numbers is [`Weights::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    pub primary: u32,
    pub secondary: u32,
}

impl Weights {
    pub const TOTAL: u32 = 100;

    pub fn new(primary: u32, secondary: u32) -> Result<Self, WeightError> {
        let valid = primary <= Self::TOTAL
            && secondary <= Self::TOTAL
            && primary + secondary == Self::TOTAL;
        if !valid {
            return Err(WeightError { primary, secondary });
        }
        Ok(Self { primary, secondary })
    }

    /// All traffic on the primary target (steady state).
    pub const fn all_primary() -> Self {
        Self {
            primary: Self::TOTAL,
            secondary: 0,
        }
    }

    /// All traffic on the secondary target (completed cutover).
    pub const fn all_secondary() -> Self {
        Self {
            primary: 0,
            secondary: Self::TOTAL,
        }
    }

    /// Split that sends `percent` of traffic to the secondary target.
    pub fn canary(percent: u32) -> Result<Self, WeightError> {
        Self::new(Self::TOTAL.saturating_sub(percent), percent)
    }

    /// Same split with the sides exchanged.
    pub fn swapped(self) -> Self {
        Self {
            primary: self.secondary,
            secondary: self.primary,
        }
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self::all_primary()
    }
}

impl fmt::Display for Weights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.primary, self.secondary)
    }
}

/// Named canary policy: how much traffic moves first, and for how long it bakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    /// Percentage of traffic sent to the new target during the bake.
    pub canary_percentage: u32,
    /// Minutes to hold the canary split. Zero means immediate full cutover.
    pub bake_time_minutes: u64,
}

impl DeploymentConfig {
    pub fn new(name: impl Into<String>, canary_percentage: u32, bake_time_minutes: u64) -> Self {
        Self {
            name: name.into(),
            canary_percentage,
            bake_time_minutes,
        }
    }

    pub fn validate(&self) -> Result<(), WeightError> {
        self.canary_weights().map(|_| ())
    }

    /// Whether traffic moves in a single step.
    pub fn is_all_at_once(&self) -> bool {
        self.bake_time_minutes == 0
    }

    pub fn bake_time(&self) -> Duration {
        Duration::from_secs(self.bake_time_minutes * 60)
    }

    /// The first split applied by a shift.
    ///
    /// With no bake time there is no canary hold, so the first split is
    /// already the full cutover.
    pub fn canary_weights(&self) -> Result<Weights, WeightError> {
        let canary = Weights::canary(self.canary_percentage)?;
        if self.is_all_at_once() {
            Ok(Weights::all_secondary())
        } else {
            Ok(canary)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_valid_split_is_accepted() {
        for a in 0..=100 {
            let w = Weights::new(a, 100 - a).unwrap();
            assert_eq!((w.primary, w.secondary), (a, 100 - a));
        }
    }

    #[test]
    fn splits_not_summing_to_100_are_rejected() {
        assert_eq!(
            Weights::new(50, 49),
            Err(WeightError {
                primary: 50,
                secondary: 49
            })
        );
        assert!(Weights::new(101, 0).is_err());
        assert!(Weights::new(0, 0).is_err());
        assert!(Weights::new(200, 100).is_err());
    }

    #[test]
    fn canary_split_puts_percentage_on_secondary() {
        assert_eq!(Weights::canary(10).unwrap(), Weights::new(90, 10).unwrap());
        assert!(Weights::canary(120).is_err());
    }

    #[test]
    fn swapped_twice_is_identity() {
        let w = Weights::new(30, 70).unwrap();
        assert_eq!(w.swapped(), Weights::new(70, 30).unwrap());
        assert_eq!(w.swapped().swapped(), w);
    }

    #[test]
    fn zero_bake_goes_straight_to_full_cutover() {
        let cfg = DeploymentConfig::new("AllAtOnce", 50, 0);
        assert!(cfg.is_all_at_once());
        assert_eq!(cfg.canary_weights().unwrap(), Weights::all_secondary());
    }

    #[test]
    fn bake_time_in_seconds() {
        let cfg = DeploymentConfig::new("Canary50Percent2Minutes", 50, 2);
        assert_eq!(cfg.bake_time(), Duration::from_secs(120));
        assert_eq!(cfg.canary_weights().unwrap(), Weights::new(50, 50).unwrap());
    }

    #[test]
    fn invalid_canary_percentage_fails_validation() {
        assert!(DeploymentConfig::new("bad", 150, 5).validate().is_err());
    }

    #[test]
    fn service_key_format() {
        assert_eq!(ServiceRef::new("main", "stable").key(), "main/stable");
    }
}
