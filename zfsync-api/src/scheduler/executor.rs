//! End-to-end execution of a single sync job
//!
//! One run: resolve nodes, open the log row, best-effort destination
//! pre-flight, syncoid via the source node, post-replication guest
//! registration, atomic completion, notification, retry arming. Every
//! fallible stage funnels into the completion write so an open log row is
//! always closed on the way out.

use crate::db::{self, jobs::RunCompletion, Database};
use crate::notify::{JobNotification, Notifier};
use crate::proxmox::ProxmoxManager;
use crate::scheduler::ScheduleTable;
use crate::ssh::SshEndpoint;
use crate::syncoid::{SyncOptions, SyncSide, SyncoidService};
use crate::zfs::parent_dataset;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zfsync_common::{GuestKind, Node, Result, SyncJob};

/// What caused a run to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTrigger {
    Scheduled,
    Retry,
    Manual { user_id: String },
}

impl RunTrigger {
    fn is_scheduled(&self) -> bool {
        matches!(self, RunTrigger::Scheduled | RunTrigger::Retry)
    }

    fn job_type(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled | RunTrigger::Retry => "sync",
            RunTrigger::Manual { .. } => "manual",
        }
    }
}

/// Runs sync jobs end to end.
pub struct JobExecutor {
    database: Arc<Database>,
    syncoid: Arc<SyncoidService>,
    proxmox: Arc<ProxmoxManager>,
    notifier: Arc<Notifier>,
    table: Arc<ScheduleTable>,
}

impl JobExecutor {
    pub fn new(
        database: Arc<Database>,
        syncoid: Arc<SyncoidService>,
        proxmox: Arc<ProxmoxManager>,
        notifier: Arc<Notifier>,
        table: Arc<ScheduleTable>,
    ) -> Self {
        Self {
            database,
            syncoid,
            proxmox,
            notifier,
            table,
        }
    }

    /// Manual-run entry point used by the API facade. Obeys the
    /// self-concurrency gate; the caller gets only an acknowledgement,
    /// outcomes land in the job log.
    pub fn run_now(executor: &Arc<Self>, job_id: i64, user_id: String) {
        let executor = Arc::clone(executor);
        tokio::spawn(async move {
            executor
                .run_job(job_id, RunTrigger::Manual { user_id }, 1)
                .await;
        });
    }

    /// Execute one attempt of a job. Never propagates errors to the
    /// caller; failures are recorded in the job log.
    pub async fn run_job(&self, job_id: i64, trigger: RunTrigger, attempt: i64) {
        let pool = self.database.pool();

        let job = match db::jobs::get(pool, job_id).await {
            Ok(job) => job,
            Err(e) => {
                error!("Job {} not found for execution: {}", job_id, e);
                return;
            }
        };

        // Deactivated jobs keep their pending fires suppressed
        if trigger.is_scheduled() && !job.is_active {
            info!("Skipping run of deactivated job {}", job_id);
            return;
        }

        // A job is never concurrent with itself
        match db::jobs::is_running(pool, job_id).await {
            Ok(true) => {
                warn!("Job {} is already running, skipping this fire", job_id);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!("Failed to check job {} state: {}", job_id, e);
                return;
            }
        }

        let source_node = db::nodes::get(pool, job.source_node_id).await;
        let dest_node = db::nodes::get(pool, job.dest_node_id).await;

        let (source_node, dest_node) = match (source_node, dest_node) {
            (Ok(s), Ok(d)) => (s, d),
            (s, d) => {
                let missing = [s.err(), d.err()]
                    .into_iter()
                    .flatten()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                error!("Job {}: {}", job_id, missing);
                self.record_aborted_run(&job, &trigger, attempt, &missing).await;
                return;
            }
        };

        let node_label = format!("{} -> {}", source_node.name, dest_node.name);
        let dataset_label = format!("{} -> {}", job.source_dataset, job.dest_dataset);
        let triggered_by = match &trigger {
            RunTrigger::Manual { user_id } => Some(user_id.as_str()),
            _ => None,
        };

        let log_id = match db::jobs::start_run(
            pool,
            &job,
            &node_label,
            &dataset_label,
            trigger.job_type(),
            attempt,
            triggered_by,
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to open job log for job {}: {}", job_id, e);
                return;
            }
        };

        info!(
            "Executing job '{}' (id {}, attempt {}): {}",
            job.name, job.id, attempt, dataset_label
        );

        let completion = self
            .execute_stages(&job, &source_node, &dest_node)
            .await
            .unwrap_or_else(|e| RunCompletion {
                success: false,
                message: "Replication failed".to_string(),
                output: None,
                error: Some(e.to_string()),
                duration: 0,
                transferred: None,
            });

        if let Err(e) = db::jobs::complete_run(pool, job.id, log_id, &completion).await {
            error!("Failed to record completion of job {}: {}", job.id, e);
        }

        self.notify(&job, &source_node, &dest_node, &trigger, &completion)
            .await;

        if !completion.success {
            self.maybe_arm_retry(&job, attempt).await;
        }
    }

    /// Pre-flight, replication and post-actions, producing the completion
    /// row for every outcome.
    async fn execute_stages(
        &self,
        job: &SyncJob,
        source_node: &Node,
        dest_node: &Node,
    ) -> Result<RunCompletion> {
        let pool = self.database.pool();

        let source_endpoint = SshEndpoint::from(source_node);
        let dest_endpoint = SshEndpoint::from(dest_node);

        // Best-effort destination pre-flight: syncoid can usually create
        // the leaf, the parent it cannot.
        let mut notes: Vec<String> = Vec::new();
        match self
            .syncoid
            .ensure_parent_dataset(&dest_endpoint, &job.dest_dataset)
            .await
        {
            Ok(Some(note)) => notes.push(note),
            Ok(None) => {}
            Err(e) => notes.push(format!("Parent dataset pre-flight failed: {}", e)),
        }

        // The replication tool runs on the source node; the source dataset
        // is local from its perspective. A same-node job keeps the
        // destination local too.
        let source_side = SyncSide::local(&job.source_dataset);
        let dest_side = if dest_node.id == source_node.id {
            SyncSide::local(&job.dest_dataset)
        } else {
            SyncSide::remote(&dest_endpoint, &job.dest_dataset)
        };

        let options = SyncOptions {
            recursive: job.recursive,
            compress: job.compress.clone(),
            mbuffer_size: job.mbuffer_size.clone(),
            no_sync_snap: job.no_sync_snap,
            force_delete: job.force_delete,
            extra_args: job.extra_args.clone(),
        };

        let timeout_secs = db::system::get_i64(pool, "sync_timeout_seconds", 3600).await? as u64;

        let outcome = self
            .syncoid
            .run_sync(
                &source_endpoint,
                &source_side,
                &dest_side,
                &options,
                Duration::from_secs(timeout_secs),
            )
            .await;

        let mut message = if outcome.success {
            "Replication completed".to_string()
        } else {
            "Replication failed".to_string()
        };

        if outcome.success && job.register_vm {
            if let Some(vm_id) = job.vm_id {
                let note = self
                    .register_guest_after_sync(job, vm_id, &source_endpoint, &dest_endpoint)
                    .await;
                notes.push(note);
            }
        }

        for note in notes {
            message.push_str(" | ");
            message.push_str(&note);
        }

        Ok(RunCompletion {
            success: outcome.success,
            message,
            output: Some(outcome.output),
            error: if outcome.error.is_empty() {
                None
            } else {
                Some(outcome.error)
            },
            duration: outcome.duration,
            transferred: outcome.transferred,
        })
    }

    /// Bring the guest's registration over to the destination node.
    /// Failures are reported in the log message without changing the
    /// overall run status.
    async fn register_guest_after_sync(
        &self,
        job: &SyncJob,
        vm_id: u32,
        source_endpoint: &SshEndpoint,
        dest_endpoint: &SshEndpoint,
    ) -> String {
        let kind = job.vm_type.unwrap_or(GuestKind::Qemu);
        let dest_vm_id = job.dest_vm_id.unwrap_or(vm_id);

        let config = match self
            .proxmox
            .guest_config_file(source_endpoint, vm_id, kind)
            .await
        {
            Ok(config) => config,
            Err(e) => return format!("VM registration failed: could not read config ({})", e),
        };

        let dest_pool = parent_dataset(&job.dest_dataset)
            .unwrap_or(&job.dest_dataset)
            .to_string();
        let dest_zfs_pool = job.dest_storage.as_deref().map(|_| dest_pool.as_str());

        match self
            .proxmox
            .register_guest(
                dest_endpoint,
                dest_vm_id,
                kind,
                &config,
                job.source_storage.as_deref(),
                job.dest_storage.as_deref(),
                dest_zfs_pool,
            )
            .await
        {
            Ok(_) => format!("VM {} registered", dest_vm_id),
            Err(e) => format!("VM registration failed: {}", e),
        }
    }

    /// A run that could not start (missing nodes) still leaves a closed,
    /// failed log row behind.
    async fn record_aborted_run(
        &self,
        job: &SyncJob,
        trigger: &RunTrigger,
        attempt: i64,
        error_text: &str,
    ) {
        let pool = self.database.pool();
        let triggered_by = match trigger {
            RunTrigger::Manual { user_id } => Some(user_id.as_str()),
            _ => None,
        };

        let log_id = match db::jobs::start_run(
            pool,
            job,
            "",
            &format!("{} -> {}", job.source_dataset, job.dest_dataset),
            trigger.job_type(),
            attempt,
            triggered_by,
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to record aborted run of job {}: {}", job.id, e);
                return;
            }
        };

        let completion = RunCompletion {
            success: false,
            message: "Replication failed".to_string(),
            output: None,
            error: Some(error_text.to_string()),
            duration: 0,
            transferred: None,
        };

        if let Err(e) = db::jobs::complete_run(pool, job.id, log_id, &completion).await {
            error!("Failed to close aborted run of job {}: {}", job.id, e);
        }
    }

    async fn notify(
        &self,
        job: &SyncJob,
        source_node: &Node,
        dest_node: &Node,
        trigger: &RunTrigger,
        completion: &RunCompletion,
    ) {
        let notification = JobNotification {
            job_id: job.id,
            job_name: job.name.clone(),
            status: if completion.success {
                "success"
            } else {
                "failed"
            }
            .to_string(),
            source: format!("{}:{}", source_node.name, job.source_dataset),
            destination: format!("{}:{}", dest_node.name, job.dest_dataset),
            duration: Some(completion.duration),
            error: completion.error.clone(),
            details: if completion.success {
                Some(format!(
                    "Transferred: {}",
                    completion.transferred.as_deref().unwrap_or("N/A")
                ))
            } else {
                None
            },
            is_scheduled: trigger.is_scheduled(),
        };

        if let Err(e) = self.notifier.send_job_notification(&notification).await {
            warn!("Failed to send notification for job {}: {}", job.id, e);
        }
    }

    /// Arm a one-shot retry while the failure streak is below the job's
    /// retry budget.
    async fn maybe_arm_retry(&self, job: &SyncJob, attempt: i64) {
        if !job.retry_on_failure {
            return;
        }

        let fresh = match db::jobs::get(self.database.pool(), job.id).await {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to reload job {} for retry arming: {}", job.id, e);
                return;
            }
        };

        if fresh.consecutive_failures < fresh.max_retries {
            self.table
                .schedule_retry(fresh.id, fresh.retry_delay_minutes, attempt + 1)
                .await;
        } else {
            info!(
                "Job {} reached {} consecutive failure(s); next cron fire will try again",
                fresh.id, fresh.consecutive_failures
            );
        }
    }
}
