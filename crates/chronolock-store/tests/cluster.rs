// Several JobStore instances sharing one database file, the way separate
// scheduler processes share it in production.

use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
};

use chrono::{DateTime, Duration, TimeZone, Utc};
use chronolock_core::{ChronolockConfig, Clock, GroupMatcher, JobKey, ManualClock, TriggerKey};
use chronolock_schedule::{MisfireInstruction, Schedule, SimpleSchedule};
use chronolock_store::{
    CompletedExecutionInstruction, Job, JobStore, LockKey, StoreError, Trigger, TriggerState,
    RECOVERY_TRIGGER_GROUP,
};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 6, 0, 0).unwrap()
}

fn config(dir: &TempDir, instance_id: &str, clustered: bool) -> ChronolockConfig {
    let mut config = ChronolockConfig::default();
    config.store.path = dir.path().join("chronolock.db").to_string_lossy().into_owned();
    config.scheduler.instance_id = instance_id.to_string();
    config.cluster.enabled = clustered;
    config.cluster.checkin_interval_ms = 1_000;
    config.cluster.dead_factor = 2;
    config
}

fn open(dir: &TempDir, instance_id: &str, clock: &Arc<ManualClock>) -> JobStore {
    JobStore::open_with_clock(&config(dir, instance_id, true), clock.clone()).unwrap()
}

fn started(dir: &TempDir, instance_id: &str, clock: &Arc<ManualClock>) -> JobStore {
    let store = open(dir, instance_id, clock);
    store.startup().unwrap();
    store
}

fn once_at(group: &str, name: &str, job: &str, at: DateTime<Utc>) -> Trigger {
    Trigger::new(
        TriggerKey::new(group, name),
        JobKey::new("jobs", job),
        Schedule::Simple(SimpleSchedule::once()),
        at,
    )
}

fn job(name: &str) -> Job {
    Job::new(JobKey::new("jobs", name), "noop")
}

#[test]
fn store_then_acquire_marks_acquired() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = started(&dir, "a", &clock);
    store.store_job_and_trigger(&job("j1"), &once_at("g", "t1", "j1", t0())).unwrap();

    let acquired = store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].key, TriggerKey::new("g", "t1"));
    assert_eq!(
        store.trigger_state(&TriggerKey::new("g", "t1")).unwrap(),
        Some(TriggerState::Acquired)
    );
}

#[test]
fn racing_instances_never_share_a_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let a = started(&dir, "a", &clock);
    let b = started(&dir, "b", &clock);
    a.store_job_and_trigger(&job("j1"), &once_at("g", "t1", "j1", t0())).unwrap();

    let barrier = Barrier::new(2);
    let (got_a, got_b) = thread::scope(|s| {
        let ha = s.spawn(|| {
            barrier.wait();
            a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap()
        });
        let hb = s.spawn(|| {
            barrier.wait();
            b.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap()
        });
        (ha.join().unwrap(), hb.join().unwrap())
    });
    assert_eq!(got_a.len() + got_b.len(), 1);
}

#[test]
fn racing_instances_split_a_backlog() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let stores: Vec<JobStore> = ["a", "b", "c"].iter().map(|id| started(&dir, id, &clock)).collect();
    stores[0].store_job(&job("j").durable(true), false).unwrap();
    for i in 0..30 {
        stores[0]
            .store_trigger(&once_at("g", &format!("t{i}"), "j", t0() + Duration::seconds(i)), false)
            .unwrap();
    }

    let barrier = Barrier::new(stores.len());
    let batches: Vec<Vec<TriggerKey>> = thread::scope(|s| {
        let handles: Vec<_> = stores
            .iter()
            .map(|store| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    loop {
                        let batch = store
                            .acquire_next_triggers(t0(), 4, Duration::minutes(1))
                            .unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        assert!(batch.len() <= 4);
                        mine.extend(batch.into_iter().map(|t| t.key));
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total: usize = batches.iter().map(Vec::len).sum();
    let distinct: HashSet<_> = batches.into_iter().flatten().collect();
    assert_eq!(total, 30);
    assert_eq!(distinct.len(), 30);
}

#[test]
fn removing_last_trigger_removes_non_durable_job() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = open(&dir, "a", &clock);
    store.store_job_and_trigger(&job("j1"), &once_at("g", "t1", "j1", t0())).unwrap();

    assert!(store.remove_trigger(&TriggerKey::new("g", "t1")).unwrap());
    assert!(!store.check_trigger_exists(&TriggerKey::new("g", "t1")).unwrap());
    assert!(!store.check_job_exists(&JobKey::new("jobs", "j1")).unwrap());
}

#[test]
fn misfired_trigger_fires_now() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = started(&dir, "a", &clock);
    let late = once_at("g", "t2", "j2", t0() - Duration::hours(1))
        .with_misfire_instruction(MisfireInstruction::FireNow);
    store.store_job_and_trigger(&job("j2"), &late).unwrap();

    let acquired = store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].next_fire_time, Some(t0()));
}

#[test]
fn dead_instance_is_recovered_by_peer() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let a = open(&dir, "a", &clock);
    let b = open(&dir, "b", &clock);
    a.startup().unwrap();
    b.startup().unwrap();
    a.store_job_and_trigger(&job("j3"), &once_at("g", "t3", "j3", t0())).unwrap();
    assert_eq!(a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().len(), 1);

    // A goes silent; B keeps checking in.
    let checkin = b.checkin_executor().unwrap();
    clock.advance(Duration::milliseconds(2_000));
    assert!(checkin.checkin_once().unwrap().is_empty());

    clock.advance(Duration::milliseconds(1));
    let reports = checkin.checkin_once().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].instance_id, "a");
    assert_eq!(reports[0].triggers_reset, 1);

    assert_eq!(
        b.trigger_state(&TriggerKey::new("g", "t3")).unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(b.locks().unwrap().iter().all(|l| l.instance_id != "a"));

    // A second pass finds nothing left to do.
    let again = checkin.checkin_once().unwrap();
    assert!(again.iter().all(|r| r.is_empty()));
    assert_eq!(b.acquire_next_triggers(clock.now(), 1, Duration::zero()).unwrap().len(), 1);
}

#[test]
fn restarted_instance_recovers_its_own_locks() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    {
        let before_crash = open(&dir, "a", &clock);
        before_crash.startup().unwrap();
        before_crash
            .store_job_and_trigger(&job("j").requests_recovery(true), &once_at("g", "t", "j", t0()))
            .unwrap();
        let acquired = before_crash
            .acquire_next_triggers(t0(), 1, Duration::zero())
            .unwrap();
        let fired = before_crash.triggers_fired(&acquired);
        assert!(fired[0].as_ref().unwrap().is_some());
    }

    clock.advance(Duration::minutes(1));
    let restarted = open(&dir, "a", &clock);
    let reports = restarted.startup().unwrap();
    assert_eq!(reports.iter().map(|r| r.recovery_triggers).sum::<usize>(), 1);
    assert!(restarted.locks().unwrap().is_empty());

    let keys = restarted
        .trigger_keys(&GroupMatcher::equals(RECOVERY_TRIGGER_GROUP))
        .unwrap();
    assert_eq!(keys.len(), 1);

    let acquired = restarted
        .acquire_next_triggers(clock.now(), 1, Duration::zero())
        .unwrap();
    let fired = restarted.triggers_fired(&acquired);
    let result = fired.into_iter().next().unwrap().unwrap().unwrap();
    let marker = result.recovering.unwrap();
    assert_eq!(marker.original, TriggerKey::new("g", "t"));
    assert_eq!(marker.scheduled_fire_time, t0());
    assert_eq!(marker.failed_instance, "a");
}

#[test]
fn full_fire_cycle_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = started(&dir, "a", &clock);
    let every_second = Trigger::new(
        TriggerKey::new("g", "tick"),
        JobKey::new("jobs", "j"),
        Schedule::Simple(SimpleSchedule::repeating(1_000, 2).unwrap()),
        t0(),
    );
    store.store_job_and_trigger(&job("j"), &every_second).unwrap();

    let mut runs = 0;
    for _ in 0..5 {
        let acquired = store
            .acquire_next_triggers(clock.now(), 1, Duration::zero())
            .unwrap();
        for result in store.triggers_fired(&acquired) {
            let Some(fired) = result.unwrap() else { continue };
            runs += 1;
            let instruction = if fired.next_fire_time.is_none() {
                CompletedExecutionInstruction::DeleteTrigger
            } else {
                CompletedExecutionInstruction::NoOp
            };
            store
                .triggered_job_complete(&fired.trigger, &fired.job, instruction)
                .unwrap();
        }
        clock.advance(Duration::seconds(1));
    }

    assert_eq!(runs, 3);
    assert_eq!(store.number_of_triggers().unwrap(), 0);
    assert_eq!(store.number_of_jobs().unwrap(), 0);
    assert!(store.locks().unwrap().is_empty());
}

#[test]
fn blocked_job_does_not_run_twice_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let a = started(&dir, "a", &clock);
    let b = started(&dir, "b", &clock);
    let exclusive = job("exclusive").disallow_concurrent_execution(true);
    a.store_job(&exclusive, false).unwrap();
    a.store_trigger(&once_at("g", "first", "exclusive", t0()), false).unwrap();
    a.store_trigger(&once_at("g", "second", "exclusive", t0()), false).unwrap();

    let acquired = a.acquire_next_triggers(t0(), 5, Duration::zero()).unwrap();
    assert_eq!(acquired.len(), 1);
    let fired = a.triggers_fired(&acquired);
    let running = fired.into_iter().next().unwrap().unwrap().unwrap();

    // The sibling is BLOCKED while the job runs, so B cannot take it.
    assert!(b.acquire_next_triggers(t0(), 5, Duration::zero()).unwrap().is_empty());

    a.triggered_job_complete(&running.trigger, &running.job, CompletedExecutionInstruction::DeleteTrigger)
        .unwrap();
    assert_eq!(b.acquire_next_triggers(t0(), 5, Duration::zero()).unwrap().len(), 1);
}

#[test]
fn storing_into_paused_group_starts_paused() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = started(&dir, "a", &clock);
    store.store_job(&job("j").durable(true), false).unwrap();
    store.pause_triggers(&GroupMatcher::equals("paused")).unwrap();
    store.store_trigger(&once_at("paused", "t", "j", t0()), false).unwrap();

    assert_eq!(
        store.trigger_state(&TriggerKey::new("paused", "t")).unwrap(),
        Some(TriggerState::Paused)
    );
    assert!(store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().is_empty());

    store.resume_triggers(&GroupMatcher::equals("paused")).unwrap();
    assert_eq!(store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().len(), 1);
}

#[test]
fn abandoned_trigger_is_reclaimed_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let mut short = config(&dir, "a", false);
    short.scheduler.trigger_timeout_ms = 1_000;
    let a = JobStore::open_with_clock(&short, clock.clone()).unwrap();
    short.scheduler.instance_id = "b".into();
    let b = JobStore::open_with_clock(&short, clock.clone()).unwrap();
    a.startup().unwrap();
    b.startup().unwrap();

    a.store_job_and_trigger(&job("j"), &once_at("g", "t", "j", t0())).unwrap();
    let abandoned = a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap();
    assert_eq!(abandoned.len(), 1);
    assert!(b.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().is_empty());

    clock.advance(Duration::milliseconds(1_001));
    let acquired = b.acquire_next_triggers(clock.now(), 1, Duration::zero()).unwrap();
    assert_eq!(acquired.len(), 1);
    let lock = b
        .locks()
        .unwrap()
        .into_iter()
        .find(|l| l.key == LockKey::trigger(&acquired[0].key))
        .unwrap();
    assert_eq!(lock.instance_id, "b");

    // The original owner lost the lock and must not fire it.
    assert!(a.triggers_fired(&abandoned)[0].as_ref().unwrap().is_none());
    assert!(b.triggers_fired(&acquired)[0].as_ref().unwrap().is_some());
}

#[test]
fn replace_rejects_foreign_job_and_keeps_old_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = open(&dir, "a", &clock);
    store.store_job_and_trigger(&job("j"), &once_at("g", "t", "j", t0())).unwrap();
    store.store_job(&job("other").durable(true), false).unwrap();

    let err = store
        .replace_trigger(&TriggerKey::new("g", "t"), &once_at("g", "t2", "other", t0()))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTrigger(_)));
    assert!(store.check_trigger_exists(&TriggerKey::new("g", "t")).unwrap());
    assert!(!store
        .replace_trigger(&TriggerKey::new("g", "missing"), &once_at("g", "t3", "j", t0()))
        .unwrap());
}

#[test]
fn unreachable_recovery_leaves_live_peers_alone() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let a = open(&dir, "a", &clock);
    let b = open(&dir, "b", &clock);
    a.startup().unwrap();
    a.store_job_and_trigger(&job("j"), &once_at("g", "t", "j", t0())).unwrap();
    assert_eq!(a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().len(), 1);

    assert!(b.recover_unreachable().unwrap().is_empty());
    assert_eq!(
        b.trigger_state(&TriggerKey::new("g", "t")).unwrap(),
        Some(TriggerState::Acquired)
    );

    clock.advance(Duration::milliseconds(2_001));
    let reports = b.recover_unreachable().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].instance_id, "a");
    assert_eq!(
        b.trigger_state(&TriggerKey::new("g", "t")).unwrap(),
        Some(TriggerState::Waiting)
    );
}

/// Two non-clustered stores where a trigger lock goes stale after one second.
fn short_timeout_pair(dir: &TempDir, clock: &Arc<ManualClock>) -> (JobStore, JobStore) {
    let mut short = config(dir, "a", false);
    short.scheduler.trigger_timeout_ms = 1_000;
    let a = JobStore::open_with_clock(&short, clock.clone()).unwrap();
    short.scheduler.instance_id = "b".into();
    let b = JobStore::open_with_clock(&short, clock.clone()).unwrap();
    a.startup().unwrap();
    b.startup().unwrap();
    (a, b)
}

fn lock_owner(store: &JobStore, key: &TriggerKey) -> Option<String> {
    store
        .locks()
        .unwrap()
        .into_iter()
        .find(|l| l.key == LockKey::trigger(key))
        .map(|l| l.instance_id)
}

#[test]
fn late_release_by_previous_owner_leaves_reclaimed_trigger_alone() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let (a, b) = short_timeout_pair(&dir, &clock);
    let key = TriggerKey::new("g", "t");
    a.store_job_and_trigger(&job("j"), &once_at("g", "t", "j", t0())).unwrap();
    assert_eq!(a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().len(), 1);

    clock.advance(Duration::milliseconds(1_001));
    let acquired = b.acquire_next_triggers(clock.now(), 1, Duration::zero()).unwrap();
    assert_eq!(acquired.len(), 1);

    a.release_acquired_trigger(&key).unwrap();
    assert_eq!(b.trigger_state(&key).unwrap(), Some(TriggerState::Acquired));
    assert_eq!(lock_owner(&b, &key).as_deref(), Some("b"));
    assert!(b.triggers_fired(&acquired)[0].as_ref().unwrap().is_some());
}

#[test]
fn late_completion_by_previous_owner_leaves_reclaimed_trigger_alone() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let (a, b) = short_timeout_pair(&dir, &clock);
    let key = TriggerKey::new("g", "minutely");
    let minutely = Trigger::new(
        key.clone(),
        JobKey::new("jobs", "j"),
        Schedule::Simple(SimpleSchedule::forever(60_000).unwrap()),
        t0(),
    );
    a.store_job_and_trigger(&job("j"), &minutely).unwrap();
    let acquired = a.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap();
    let running = a.triggers_fired(&acquired).remove(0).unwrap().unwrap();

    // A's run outlives the lock timeout and B picks up the next fire.
    clock.advance(Duration::milliseconds(1_001));
    let reclaimed = b
        .acquire_next_triggers(clock.now(), 1, Duration::minutes(1))
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(lock_owner(&b, &key).as_deref(), Some("b"));

    a.triggered_job_complete(&running.trigger, &running.job, CompletedExecutionInstruction::NoOp)
        .unwrap();
    assert_eq!(b.trigger_state(&key).unwrap(), Some(TriggerState::Acquired));
    assert_eq!(lock_owner(&b, &key).as_deref(), Some("b"));
    assert!(b.triggers_fired(&reclaimed)[0].as_ref().unwrap().is_some());
}

#[test]
fn acquiring_before_startup_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let store = open(&dir, "a", &clock);
    store.store_job_and_trigger(&job("j"), &once_at("g", "t", "j", t0())).unwrap();

    let err = store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap_err();
    assert!(matches!(err, StoreError::NotStarted));
    assert_eq!(
        store.trigger_state(&TriggerKey::new("g", "t")).unwrap(),
        Some(TriggerState::Waiting)
    );

    store.startup().unwrap();
    assert_eq!(store.acquire_next_triggers(t0(), 1, Duration::zero()).unwrap().len(), 1);
}
