use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chronolock_store::{CompletedExecutionInstruction, JobStore, Trigger};

/// Fire an acquired batch and report completion for every job that ran.
///
/// Returns how many jobs fired. A trigger the store refuses to fire is
/// skipped; one that errors is handed back to the pool.
pub fn fire_batch(store: &JobStore, triggers: &[Trigger]) -> usize {
    let mut fired = 0;
    for (trigger, result) in triggers.iter().zip(store.triggers_fired(triggers)) {
        match result {
            Ok(Some(bundle)) => {
                fired += 1;
                info!(
                    trigger = %bundle.trigger.key,
                    job = %bundle.job.key,
                    job_type = %bundle.job.job_type,
                    scheduled = %bundle.scheduled_fire_time,
                    recovering = bundle.recovering.is_some(),
                    "job fired"
                );
                let instruction = if bundle.next_fire_time.is_none() {
                    CompletedExecutionInstruction::DeleteTrigger
                } else {
                    CompletedExecutionInstruction::NoOp
                };
                if let Err(e) =
                    store.triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
                {
                    error!(trigger = %bundle.trigger.key, error = %e, "completion failed");
                }
            }
            Ok(None) => debug!(trigger = %trigger.key, "trigger no longer fireable"),
            Err(e) => {
                error!(trigger = %trigger.key, error = %e, "fire failed");
                release(store, trigger);
            }
        }
    }
    fired
}

fn release(store: &JobStore, trigger: &Trigger) {
    if let Err(e) = store.release_acquired_trigger(&trigger.key) {
        warn!(trigger = %trigger.key, error = %e, "release failed");
    }
}

/// Split an acquired batch into triggers due at `now` and those still ahead.
pub fn split_due(triggers: Vec<Trigger>, now: DateTime<Utc>) -> (Vec<Trigger>, Vec<Trigger>) {
    triggers
        .into_iter()
        .partition(|t| t.next_fire_time.map_or(true, |at| at <= now))
}

/// Acquire → wait → fire → complete until `shutdown` broadcasts `true`.
/// Each trigger of a batch fires once its own fire time is reached.
pub async fn run_scheduler(store: Arc<JobStore>, mut shutdown: watch::Receiver<bool>) {
    let node = store.config().node.clone();
    let idle_wait = Duration::milliseconds(i64::try_from(node.idle_wait_ms).unwrap_or(i64::MAX));
    let window =
        Duration::milliseconds(i64::try_from(node.batch_time_window_ms).unwrap_or(i64::MAX));
    info!(
        instance_id = %store.instance_id(),
        batch_size = node.batch_size,
        "scheduler loop started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let triggers =
            match store.acquire_next_triggers(Utc::now() + idle_wait, node.batch_size, window) {
                Ok(t) => t,
                Err(e) if e.is_transient() => {
                    debug!(code = e.code(), "acquire contended");
                    Vec::new()
                }
                Err(e) => {
                    error!(error = %e, "acquire failed");
                    Vec::new()
                }
            };

        if triggers.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(std_duration(idle_wait)) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let acquired = triggers.len();
        let mut pending = triggers;
        let mut fired = 0;
        let mut stopping = false;
        while !pending.is_empty() {
            let (due, later) = split_due(pending, Utc::now());
            pending = later;
            if !due.is_empty() {
                fired += fire_batch(&store, &due);
                continue;
            }
            let earliest = pending
                .iter()
                .filter_map(|t| t.next_fire_time)
                .min()
                .unwrap_or_else(Utc::now);
            tokio::select! {
                _ = tokio::time::sleep(std_duration(earliest - Utc::now())) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        stopping = true;
                        break;
                    }
                }
            }
        }
        if stopping {
            for trigger in &pending {
                release(&store, trigger);
            }
            break;
        }
        debug!(acquired, fired, "batch done");
    }
    info!("scheduler loop shutting down");
}

/// Periodic misfire sweep over WAITING triggers.
pub async fn run_misfire_scan(store: Arc<JobStore>, mut shutdown: watch::Receiver<bool>) {
    let every = std::time::Duration::from_millis(store.config().node.misfire_scan_interval_ms);
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match store.scan_misfires() {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "misfired triggers handled"),
                    Err(e) => error!(error = %e, "misfire scan failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn std_duration(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or_default()
}
