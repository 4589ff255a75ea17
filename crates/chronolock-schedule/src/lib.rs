//! `chronolock-schedule`: next-fire-time strategies for stored triggers.
//!
//! # Schedule kinds
//!
//! | Tag      | Behaviour                                                   |
//! |----------|-------------------------------------------------------------|
//! | `simple` | Fire at `start`, then every N ms, a bounded or unbounded number of times |
//! | `cron`   | Cron expression evaluated in UTC                            |
//! | `weekly` | Cron expression that only fires every N-th ISO week         |
//!
//! The tag is persisted next to each trigger and mapped back to a
//! [`Schedule`] through a static registry (see [`schedule::restore`]).

pub mod calendar;
pub mod cron_expr;
pub mod error;
pub mod misfire;
pub mod schedule;
pub mod simple;
pub mod weekly;

pub use calendar::Calendar;
pub use cron_expr::CronSchedule;
pub use error::{Result, ScheduleError};
pub use misfire::MisfireInstruction;
pub use schedule::{FireContext, Schedule, ScheduleKind};
pub use simple::{SimpleSchedule, REPEAT_INDEFINITELY};
pub use weekly::WeeklySchedule;
