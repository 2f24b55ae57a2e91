pub mod artifacts;
pub mod config;
pub mod duration;
pub mod types;

pub use artifacts::RevisionArtifacts;
pub use config::CutoverConfig;
pub use duration::{epoch_secs, parse_duration};
pub use types::*;
