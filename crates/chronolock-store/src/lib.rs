//! `chronolock-store`: clustered job store on a shared SQLite database.
//!
//! # Overview
//!
//! Several scheduler processes open the same database file. Every
//! coordination decision goes through it: a trigger is only handed to one
//! process because that process inserted its row in the `locks` table
//! first, under a unique index, inside a `BEGIN IMMEDIATE` transaction.
//!
//! | Component               | Responsibility                                   |
//! |-------------------------|--------------------------------------------------|
//! | [`LockManager`]         | insert-wins locks with timeout-based takeover    |
//! | [`MisfireHandler`]      | misfire detection and policy application         |
//! | [`TriggerStateManager`] | trigger state machine, pause/resume overlays     |
//! | [`TriggerRunner`]       | acquire → fire → release lifecycle               |
//! | [`JobCompleteHandler`]  | completion instructions, lock release            |
//! | [`Persister`]           | multi-row stores/removals, orphan cleanup        |
//! | [`TriggerRecoverer`]    | reclaiming a dead instance's locks               |
//! | [`CheckinExecutor`]     | heartbeat and dead-peer detection                |
//!
//! [`JobStore`] wires them together and is what a host talks to.

pub mod checkin;
pub mod complete;
pub mod connector;
pub mod dao;
pub mod db;
pub mod envelope;
pub mod error;
pub mod lock;
pub mod misfire;
pub mod persister;
pub mod recovery;
pub mod runner;
pub mod state;
pub mod store;
pub mod types;

pub use checkin::CheckinExecutor;
pub use complete::JobCompleteHandler;
pub use connector::Connector;
pub use error::{Result, StoreError};
pub use lock::LockManager;
pub use misfire::MisfireHandler;
pub use persister::Persister;
pub use recovery::{RecoveryReport, TriggerRecoverer, RECOVERY_TRIGGER_GROUP};
pub use runner::TriggerRunner;
pub use state::{TriggerStateManager, ALL_GROUPS_PAUSED};
pub use store::JobStore;
pub use types::{
    CompletedExecutionInstruction, FireResult, Job, JobData, Lock, LockKey, LockOutcome,
    RecoveryMarker, ResourceType, SchedulerCheckin, Trigger, TriggerState,
};
