//! The background scheduler: a single-threaded cooperative loop that runs
//! tasks serially at their configured cadence.
//!
//! Multiple worker processes may run the same configuration; each task run
//! is claimed in the database first, so exactly one worker executes a task
//! at a time.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::context::CoreContext;
use crate::error::Result;
use crate::models::log::{claim_task, release_task};
use crate::models::BackgroundTaskRun;
use crate::tasks::{BackgroundTask, ScheduledTask};

/// Small random offset so workers started together don't tick in phase.
pub fn startup_jitter(max_seconds: u64) -> Duration {
    if max_seconds == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(rand::thread_rng().gen_range(0..=max_seconds))
}

/// Claim, log, and run one task. Infrastructure errors are caught here —
/// the task boundary — logged, and swallowed so the scheduler keeps going.
pub fn run_task_once(ctx: &CoreContext, task: &dyn BackgroundTask) -> Result<bool> {
    let claimed = ctx.with_db(|c| claim_task(c, task.name()))?;
    if !claimed {
        tracing::debug!(task = task.name(), "task claimed by another worker, skipping");
        return Ok(false);
    }

    let run = ctx.with_db(|c| BackgroundTaskRun::start(c, task.name()))?;
    let started = Instant::now();
    let outcome = task.run(ctx);
    let success = outcome.is_ok();

    if let Err(e) = &outcome {
        tracing::error!(task = task.name(), error = %e, "background task failed");
    } else {
        tracing::debug!(
            task = task.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "background task finished"
        );
    }

    ctx.with_db(|c| {
        run.finish(c, success)?;
        release_task(c, task.name())?;
        Ok(())
    })?;
    Ok(true)
}

/// Run the scheduler loop forever. Tasks are cooperative: one at a time,
/// each honouring its own soft timeout internally.
pub fn run_scheduler(ctx: &CoreContext, tasks: Vec<ScheduledTask>) -> ! {
    let mut next_run: Vec<Instant> = tasks
        .iter()
        .map(|_| Instant::now() + startup_jitter(5))
        .collect();

    tracing::info!(tasks = tasks.len(), "background scheduler started");

    loop {
        let now = Instant::now();
        for (index, scheduled) in tasks.iter().enumerate() {
            if now < next_run[index] {
                continue;
            }
            if let Err(e) = run_task_once(ctx, scheduled.task.as_ref()) {
                tracing::error!(
                    task = scheduled.task.name(),
                    error = %e,
                    "scheduler could not run task"
                );
            }
            next_run[index] = Instant::now() + scheduled.every;
        }

        let sleep_until = next_run.iter().min().copied().unwrap_or_else(|| {
            // No tasks configured; idle politely.
            Instant::now() + Duration::from_secs(60)
        });
        let pause = sleep_until
            .saturating_duration_since(Instant::now())
            .min(Duration::from_secs(60));
        std::thread::sleep(pause.max(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{shared, Database};
    use crate::encryption::CredentialKey;
    use crate::error::CoreError;

    struct Noop;
    impl BackgroundTask for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn run(&self, _ctx: &CoreContext) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;
    impl BackgroundTask for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        fn run(&self, _ctx: &CoreContext) -> Result<()> {
            Err(CoreError::Config("boom".into()))
        }
    }

    fn ctx() -> CoreContext {
        let db = shared(Database::open_in_memory().unwrap());
        let keys = CredentialKey::from_hex(&"00".repeat(32)).unwrap();
        CoreContext::new(db, keys, "site-a")
    }

    #[test]
    fn run_records_task_log_and_releases_claim() {
        let ctx = ctx();
        assert!(run_task_once(&ctx, &Noop).unwrap());

        ctx.with_db(|c| {
            let (count, success): (i64, i64) = c.query_row(
                "SELECT COUNT(*), MAX(success) FROM background_task_log WHERE task_name = 'noop'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            assert_eq!(count, 1);
            assert_eq!(success, 1);
            Ok(())
        })
        .unwrap();

        // Claim was released: a second run proceeds.
        assert!(run_task_once(&ctx, &Noop).unwrap());
    }

    #[test]
    fn failures_are_contained_at_the_task_boundary() {
        let ctx = ctx();
        // The scheduler-facing call succeeds even though the task failed.
        assert!(run_task_once(&ctx, &AlwaysFails).unwrap());

        ctx.with_db(|c| {
            let success: i64 = c.query_row(
                "SELECT success FROM background_task_log WHERE task_name = 'always_fails'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(success, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn claimed_tasks_are_skipped() {
        let ctx = ctx();
        ctx.with_db(|c| {
            assert!(claim_task(c, "noop").unwrap());
            Ok(())
        })
        .unwrap();
        assert!(!run_task_once(&ctx, &Noop).unwrap());
    }
}
