//! `chronolock-core`: configuration, identity keys and the clock shared by
//! every chronolock crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChronolockConfig;
pub use error::{CoreError, Result};
pub use types::{GroupMatcher, JobKey, MatchOperator, TriggerKey, DEFAULT_GROUP};
