//! Cron-driven job scheduling
//!
//! A single tick task wakes once per minute, dispatches due jobs to the
//! executor without awaiting them, triggers the daily digest at the
//! configured hour and runs the daily retention sweep. The next-fire table
//! is mutated both from the tick loop and from API calls, so it is only
//! reachable through methods that take the internal lock.

pub mod executor;

use crate::db::{self, Database};
use crate::notify::Notifier;
use crate::shutdown::ShutdownCoordinator;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use zfsync_common::{Error, Result, SyncJob};

use executor::{JobExecutor, RunTrigger};

/// Parse a cron expression, accepting the standard 5-field form by
/// prepending a zero seconds field.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::BadRequest(format!("Invalid cron expression '{}': {}", expr, e)))
}

/// Next fire time for the cron expression strictly after the given instant.
pub fn next_fire_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.after(&after).next())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FireKind {
    Cron,
    Retry { attempt: i64 },
}

#[derive(Debug, Clone, Copy)]
struct NextFire {
    at: DateTime<Utc>,
    kind: FireKind,
}

/// The next-fire table, shared between the tick loop and the API facade.
pub struct ScheduleTable {
    entries: Mutex<HashMap<i64, NextFire>>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Re-arm a job after its cron expression changed. An empty expression
    /// removes the entry.
    pub async fn update_job_schedule(&self, job_id: i64, schedule: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;

        if schedule.trim().is_empty() {
            entries.remove(&job_id);
            return Ok(());
        }

        if let Some(at) = next_fire_after(schedule, Utc::now())? {
            entries.insert(
                job_id,
                NextFire {
                    at,
                    kind: FireKind::Cron,
                },
            );
        }

        Ok(())
    }

    /// Drop a job from the table entirely.
    pub async fn remove_job(&self, job_id: i64) {
        self.entries.lock().await.remove(&job_id);
    }

    /// Arm a one-shot retry; it overrides whatever was scheduled next.
    pub async fn schedule_retry(&self, job_id: i64, delay_minutes: i64, attempt: i64) {
        let at = Utc::now() + ChronoDuration::minutes(delay_minutes);
        self.entries.lock().await.insert(
            job_id,
            NextFire {
                at,
                kind: FireKind::Retry { attempt },
            },
        );
        info!(
            "Armed retry attempt {} for job {} at {}",
            attempt, job_id, at
        );
    }

    pub async fn next_fire_at(&self, job_id: i64) -> Option<DateTime<Utc>> {
        self.entries.lock().await.get(&job_id).map(|e| e.at)
    }

    /// Ensure an entry exists for a scheduled job, seeding it from
    /// `cron.next(after = last_run ?? now)` on first sight.
    async fn seed(&self, job: &SyncJob, now: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&job.id) {
            return;
        }

        match next_fire_after(&job.schedule, job.last_run.unwrap_or(now)) {
            Ok(Some(at)) => {
                entries.insert(
                    job.id,
                    NextFire {
                        at,
                        kind: FireKind::Cron,
                    },
                );
            }
            Ok(None) => warn!("Cron expression of job {} has no upcoming fire", job.id),
            Err(e) => warn!("Job {} has an invalid schedule: {}", job.id, e),
        }
    }

    /// Pop all due entries. Cron entries for jobs still scheduled are
    /// recomputed from now; one-shots and entries for jobs that lost their
    /// schedule are removed.
    async fn take_due(
        &self,
        now: DateTime<Utc>,
        cron_by_job: &HashMap<i64, String>,
    ) -> Vec<(i64, FireKind)> {
        let mut entries = self.entries.lock().await;
        let due: Vec<(i64, FireKind)> = entries
            .iter()
            .filter(|(_, fire)| now >= fire.at)
            .map(|(id, fire)| (*id, fire.kind))
            .collect();

        for (job_id, _) in &due {
            match cron_by_job
                .get(job_id)
                .and_then(|expr| next_fire_after(expr, now).ok().flatten())
            {
                Some(at) => {
                    entries.insert(
                        *job_id,
                        NextFire {
                            at,
                            kind: FireKind::Cron,
                        },
                    );
                }
                None => {
                    entries.remove(job_id);
                }
            }
        }

        due
    }

    /// Drop cron entries for jobs that are no longer scheduled. Pending
    /// retries survive; the executor re-checks job state at dispatch.
    async fn prune(&self, cron_by_job: &HashMap<i64, String>) {
        let mut entries = self.entries.lock().await;
        entries.retain(|job_id, fire| {
            matches!(fire.kind, FireKind::Retry { .. }) || cron_by_job.contains_key(job_id)
        });
    }
}

impl Default for ScheduleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The scheduler singleton owning the tick loop.
pub struct Scheduler {
    database: Arc<Database>,
    executor: Arc<JobExecutor>,
    notifier: Arc<Notifier>,
    table: Arc<ScheduleTable>,
    digest_state: Mutex<DigestState>,
}

#[derive(Default)]
struct DigestState {
    last_summary_sent: Option<DateTime<Utc>>,
    last_retention_sweep: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(
        database: Arc<Database>,
        executor: Arc<JobExecutor>,
        notifier: Arc<Notifier>,
        table: Arc<ScheduleTable>,
    ) -> Self {
        Self {
            database,
            executor,
            notifier,
            table,
            digest_state: Mutex::new(DigestState::default()),
        }
    }

    pub fn table(&self) -> Arc<ScheduleTable> {
        Arc::clone(&self.table)
    }

    /// Startup recovery: close job logs left in `started` by a previous
    /// process and mark their jobs failed.
    pub async fn recover_stale_runs(&self) -> Result<()> {
        let pool = self.database.pool();
        let stale_minutes = db::system::get_i64(pool, "stale_run_minutes", 120).await?;
        let cutoff = Utc::now() - ChronoDuration::minutes(stale_minutes);

        let swept = db::job_logs::sweep_stale(pool, cutoff).await?;
        if swept > 0 {
            warn!("Recovered {} stale run(s) from a previous process", swept);
        }

        Ok(())
    }

    /// Run the tick loop until shutdown is signalled.
    pub fn start(self: Arc<Self>, shutdown: ShutdownCoordinator) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler started");
            let mut shutdown_rx = shutdown.subscribe();

            loop {
                if let Err(e) = self.tick().await {
                    error!("Scheduler tick failed: {}", e);
                }

                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                    _ = shutdown_rx.changed() => {
                        info!("Scheduler stopped");
                        return;
                    }
                }
            }
        })
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        self.check_and_run_jobs(now).await?;
        self.check_daily_summary(now).await;
        self.check_retention(now).await;
        Ok(())
    }

    async fn check_and_run_jobs(&self, now: DateTime<Utc>) -> Result<()> {
        let scheduled = db::jobs::list_scheduled(self.database.pool()).await?;

        let cron_by_job: HashMap<i64, String> = scheduled
            .iter()
            .map(|job| (job.id, job.schedule.clone()))
            .collect();

        for job in &scheduled {
            self.table.seed(job, now).await;
        }
        self.table.prune(&cron_by_job).await;

        for (job_id, kind) in self.table.take_due(now, &cron_by_job).await {
            let (trigger, attempt) = match kind {
                FireKind::Cron => (RunTrigger::Scheduled, 1),
                FireKind::Retry { attempt } => (RunTrigger::Retry, attempt),
            };

            info!("Dispatching job {} ({:?})", job_id, kind);
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                executor.run_job(job_id, trigger, attempt).await;
            });
        }

        Ok(())
    }

    async fn check_daily_summary(&self, now: DateTime<Utc>) {
        let pool = self.database.pool();

        let enabled = db::system::get_bool(pool, "daily_summary_enabled", true)
            .await
            .unwrap_or(true);
        if !enabled {
            return;
        }

        let hour = db::system::get_i64(pool, "daily_summary_hour", 8)
            .await
            .unwrap_or(8);
        if i64::from(now.hour()) != hour {
            return;
        }

        {
            let state = self.digest_state.lock().await;
            if let Some(last) = state.last_summary_sent {
                if last.date_naive() == now.date_naive() {
                    return;
                }
            }
        }

        info!("Sending daily summary...");
        match self.notifier.send_daily_summary().await {
            Ok(sent) => {
                if sent {
                    info!("Daily summary sent");
                }
                self.digest_state.lock().await.last_summary_sent = Some(now);
            }
            Err(e) => error!("Failed to send daily summary: {}", e),
        }
    }

    async fn check_retention(&self, now: DateTime<Utc>) {
        {
            let state = self.digest_state.lock().await;
            if state.last_retention_sweep == Some(now.date_naive()) {
                return;
            }
        }

        let pool = self.database.pool();

        let log_days = db::system::get_i64(pool, "log_retention_days", 30)
            .await
            .unwrap_or(30);
        let audit_days = db::system::get_i64(pool, "audit_retention_days", 90)
            .await
            .unwrap_or(90);

        match db::job_logs::prune_older_than(pool, now - ChronoDuration::days(log_days)).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} job log(s) older than {} days", n, log_days),
            Err(e) => error!("Job log retention sweep failed: {}", e),
        }

        match db::audit::prune_older_than(pool, now - ChronoDuration::days(audit_days)).await {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} audit log(s) older than {} days", n, audit_days),
            Err(e) => error!("Audit log retention sweep failed: {}", e),
        }

        self.digest_state.lock().await.last_retention_sweep = Some(now.date_naive());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_cron_five_fields() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let next = schedule.after(&after).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 12, 5, 0).unwrap());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("99 * * * *").is_err());
    }

    #[test]
    fn test_next_fire_after_daily() {
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 3, 30, 0).unwrap();
        let next = next_fire_after("0 2 * * *", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_next_fire_strictly_in_future() {
        // R2: at tick zero the computed fire time is beyond now
        let now = Utc::now();
        let next = next_fire_after("*/5 * * * *", now).unwrap().unwrap();
        assert!(next > now);
        assert!(next <= now + ChronoDuration::minutes(5));
    }

    #[tokio::test]
    async fn test_table_update_and_remove() {
        let table = ScheduleTable::new();

        table.update_job_schedule(1, "*/5 * * * *").await.unwrap();
        assert!(table.next_fire_at(1).await.is_some());

        // Empty schedule removes the entry
        table.update_job_schedule(1, "").await.unwrap();
        assert!(table.next_fire_at(1).await.is_none());

        table.update_job_schedule(2, "0 2 * * *").await.unwrap();
        table.remove_job(2).await;
        assert!(table.next_fire_at(2).await.is_none());
    }

    #[tokio::test]
    async fn test_table_rejects_invalid_cron() {
        let table = ScheduleTable::new();
        assert!(table.update_job_schedule(1, "bogus").await.is_err());
        assert!(table.next_fire_at(1).await.is_none());
    }

    #[tokio::test]
    async fn test_take_due_recomputes_cron() {
        let table = ScheduleTable::new();
        let now = Utc::now();

        // Force an already-due entry
        table.entries.lock().await.insert(
            7,
            NextFire {
                at: now - ChronoDuration::minutes(1),
                kind: FireKind::Cron,
            },
        );

        let mut crons = HashMap::new();
        crons.insert(7i64, "*/5 * * * *".to_string());

        let due = table.take_due(now, &crons).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 7);

        // Entry was re-armed in the future
        let next = table.next_fire_at(7).await.unwrap();
        assert!(next > now);

        // A second pass finds nothing due: missed fires coalesce
        let due = table.take_due(now, &crons).await;
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_take_due_removes_one_shots() {
        let table = ScheduleTable::new();
        let now = Utc::now();

        table.schedule_retry(9, 0, 2).await;
        // No cron for job 9: retry fires once and disappears
        let due = table.take_due(now + ChronoDuration::minutes(1), &HashMap::new()).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, FireKind::Retry { attempt: 2 });
        assert!(table.next_fire_at(9).await.is_none());
    }

    #[tokio::test]
    async fn test_prune_keeps_retries() {
        let table = ScheduleTable::new();

        table.update_job_schedule(1, "*/5 * * * *").await.unwrap();
        table.schedule_retry(2, 15, 2).await;

        // Neither job is scheduled anymore
        table.prune(&HashMap::new()).await;

        assert!(table.next_fire_at(1).await.is_none());
        assert!(table.next_fire_at(2).await.is_some());
    }
}
