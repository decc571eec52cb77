//! Multi-channel notification dispatch
//!
//! Job events fan out to every enabled channel independently; a failing
//! channel never affects the others or the job outcome. Scheduled success
//! notifications are deduplicated per job per UTC day; failures always go
//! out. The daily digest aggregates the last 24 hours of job activity from
//! the store.

pub mod email;

use crate::db::{self, Database};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use email::EmailService;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use zfsync_common::{LogStatus, NotificationSettings, Result};

const CONFIG_CACHE_SECS: i64 = 60;
const CHANNEL_TIMEOUT_SECS: u64 = 15;

/// A job outcome handed over by the executor.
#[derive(Debug, Clone)]
pub struct JobNotification {
    pub job_id: i64,
    pub job_name: String,
    pub status: String,
    pub source: String,
    pub destination: String,
    pub duration: Option<i64>,
    pub error: Option<String>,
    pub details: Option<String>,
    pub is_scheduled: bool,
}

/// Per-job daily digest line
#[derive(Debug, serde::Serialize)]
struct JobSummary {
    id: i64,
    name: String,
    source: String,
    destination: String,
    schedule: String,
    runs_24h: usize,
    success_24h: usize,
    failed_24h: usize,
    duration_24h: i64,
    last_status: String,
    last_run: String,
    last_transferred: Option<String>,
    last_error: Option<String>,
    last_error_time: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct DigestData {
    total_jobs: usize,
    total_runs: usize,
    successful: usize,
    failed: usize,
    total_duration: i64,
    jobs: Vec<JobSummary>,
}

struct ConfigCache {
    settings: NotificationSettings,
    loaded_at: DateTime<Utc>,
}

/// Notification dispatcher singleton.
pub struct Notifier {
    database: Arc<Database>,
    http: reqwest::Client,
    config_cache: Mutex<Option<ConfigCache>>,
    /// job_id -> last successful scheduled notification
    daily_notified: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl Notifier {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            http: reqwest::Client::new(),
            config_cache: Mutex::new(None),
            daily_notified: Mutex::new(HashMap::new()),
        }
    }

    async fn load_config(&self) -> Result<NotificationSettings> {
        let now = Utc::now();

        {
            let cache = self.config_cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if (now - cached.loaded_at).num_seconds() < CONFIG_CACHE_SECS {
                    return Ok(cached.settings.clone());
                }
            }
        }

        let settings = db::notifications::get(self.database.pool()).await?;
        *self.config_cache.lock().await = Some(ConfigCache {
            settings: settings.clone(),
            loaded_at: now,
        });

        Ok(settings)
    }

    /// Decide whether this event should go out at all, applying the
    /// trigger flags and the per-job per-day success dedup.
    async fn should_send(
        &self,
        settings: &NotificationSettings,
        notification: &JobNotification,
        now: DateTime<Utc>,
    ) -> bool {
        let subscribed = match notification.status.as_str() {
            "success" => settings.notify_on_success,
            "failed" => settings.notify_on_failure,
            "warning" => settings.notify_on_warning,
            _ => false,
        };

        if !subscribed {
            debug!("Notification for status '{}' not subscribed", notification.status);
            return false;
        }

        // Failures are never deduplicated
        if !(notification.is_scheduled && notification.status == "success") {
            return true;
        }

        let mut notified = self.daily_notified.lock().await;

        if let Some(last) = notified.get(&notification.job_id) {
            if last.date_naive() == now.date_naive() {
                debug!(
                    "Success notification for job {} already sent today, skipping",
                    notification.job_id
                );
                return false;
            }
        }

        notified.insert(notification.job_id, now);

        // Entries older than two days are dead weight
        let cutoff = now - ChronoDuration::days(2);
        notified.retain(|_, last| *last >= cutoff);

        true
    }

    /// Fan a job event out to every enabled channel.
    pub async fn send_job_notification(&self, notification: &JobNotification) -> Result<()> {
        let settings = self.load_config().await?;

        if !self.should_send(&settings, notification, Utc::now()).await {
            return Ok(());
        }

        if settings.smtp_enabled {
            let (subject, body) = render_job_email(notification);
            if let Err(e) = EmailService::send(&settings, &subject, &body).await {
                error!("Email notification for job {} failed: {}", notification.job_id, e);
            }
        }

        if settings.webhook_enabled && settings.webhook_url.is_some() {
            if let Err(e) = self
                .send_webhook(
                    &settings,
                    "job_completed",
                    json!({
                        "job_name": notification.job_name,
                        "status": notification.status,
                        "source": notification.source,
                        "destination": notification.destination,
                        "duration": notification.duration,
                        "error": notification.error,
                        "details": notification.details,
                    }),
                )
                .await
            {
                error!("Webhook notification for job {} failed: {}", notification.job_id, e);
            }
        }

        if settings.telegram_enabled
            && settings.telegram_bot_token.is_some()
            && settings.telegram_chat_id.is_some()
        {
            if let Err(e) = self
                .send_telegram(&settings, &render_job_telegram(notification))
                .await
            {
                error!("Telegram notification for job {} failed: {}", notification.job_id, e);
            }
        }

        Ok(())
    }

    /// Send a test event through every enabled channel, returning
    /// per-channel results.
    pub async fn send_test(&self) -> Result<serde_json::Value> {
        // Bypass the cache so a just-saved configuration is exercised
        *self.config_cache.lock().await = None;
        let settings = self.load_config().await?;

        let mut channels = serde_json::Map::new();

        if settings.smtp_enabled {
            let result = EmailService::send(
                &settings,
                "Test notification",
                "<p>This is a test notification from zfsync.</p>",
            )
            .await;
            channels.insert("email".to_string(), channel_result(result));
        }

        if settings.webhook_enabled && settings.webhook_url.is_some() {
            let result = self
                .send_webhook(&settings, "test", json!({"message": "test notification"}))
                .await;
            channels.insert("webhook".to_string(), channel_result(result));
        }

        if settings.telegram_enabled
            && settings.telegram_bot_token.is_some()
            && settings.telegram_chat_id.is_some()
        {
            let result = self
                .send_telegram(&settings, "\u{2705} zfsync test notification")
                .await;
            channels.insert("telegram".to_string(), channel_result(result));
        }

        Ok(json!({ "channels": channels }))
    }

    /// Aggregate the last 24 hours per active job and send the digest
    /// once per enabled channel. Returns whether anything was sent.
    pub async fn send_daily_summary(&self) -> Result<bool> {
        let settings = self.load_config().await?;

        if !(settings.smtp_enabled || settings.webhook_enabled || settings.telegram_enabled) {
            debug!("No notification channel enabled, skipping daily summary");
            return Ok(false);
        }

        let digest = self.collect_digest().await?;
        if digest.total_jobs == 0 {
            info!("No sync jobs configured, daily summary not sent");
            return Ok(false);
        }

        if settings.smtp_enabled {
            let (subject, body) = render_digest_email(&digest);
            if let Err(e) = EmailService::send(&settings, &subject, &body).await {
                error!("Daily summary email failed: {}", e);
            }
        }

        if settings.webhook_enabled && settings.webhook_url.is_some() {
            let data = serde_json::to_value(&digest)
                .unwrap_or_else(|_| json!({}));
            if let Err(e) = self.send_webhook(&settings, "daily_summary", data).await {
                error!("Daily summary webhook failed: {}", e);
            }
        }

        if settings.telegram_enabled
            && settings.telegram_bot_token.is_some()
            && settings.telegram_chat_id.is_some()
        {
            if let Err(e) = self
                .send_telegram(&settings, &render_digest_telegram(&digest))
                .await
            {
                error!("Daily summary telegram failed: {}", e);
            }
        }

        Ok(true)
    }

    async fn collect_digest(&self) -> Result<DigestData> {
        let pool = self.database.pool();
        let since = Utc::now() - ChronoDuration::hours(24);

        let jobs = db::jobs::list_active(pool).await?;

        let mut summaries = Vec::with_capacity(jobs.len());
        let mut total_runs = 0;
        let mut successful = 0;
        let mut failed = 0;
        let mut total_duration = 0;

        for job in &jobs {
            let logs = db::job_logs::list_for_job_since(pool, job.id, since).await?;

            let source_node = db::nodes::get(pool, job.source_node_id).await.ok();
            let dest_node = db::nodes::get(pool, job.dest_node_id).await.ok();

            let runs = logs.len();
            let success = logs.iter().filter(|l| l.status == LogStatus::Success).count();
            let fail = logs.iter().filter(|l| l.status == LogStatus::Failed).count();
            let duration: i64 = logs.iter().filter_map(|l| l.duration).sum();

            let last_failure = logs
                .iter()
                .find(|l| l.status == LogStatus::Failed && l.error.is_some());
            let last_transferred = logs
                .iter()
                .find_map(|l| l.transferred.clone())
                .or_else(|| job.last_transferred.clone());

            summaries.push(JobSummary {
                id: job.id,
                name: job.name.clone(),
                source: format!(
                    "{}:{}",
                    source_node.map(|n| n.name).unwrap_or_else(|| "N/A".to_string()),
                    job.source_dataset
                ),
                destination: format!(
                    "{}:{}",
                    dest_node.map(|n| n.name).unwrap_or_else(|| "N/A".to_string()),
                    job.dest_dataset
                ),
                schedule: if job.schedule.is_empty() {
                    "manual".to_string()
                } else {
                    job.schedule.clone()
                },
                runs_24h: runs,
                success_24h: success,
                failed_24h: fail,
                duration_24h: duration,
                last_status: job
                    .last_status
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "never_run".to_string()),
                last_run: job
                    .last_run
                    .map(|t| t.format("%d/%m %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string()),
                last_transferred,
                last_error: last_failure
                    .and_then(|l| l.error.as_ref())
                    .map(|e| e.chars().take(200).collect()),
                last_error_time: last_failure.map(|l| l.started_at.format("%H:%M").to_string()),
            });

            total_runs += runs;
            successful += success;
            failed += fail;
            total_duration += duration;
        }

        Ok(DigestData {
            total_jobs: jobs.len(),
            total_runs,
            successful,
            failed,
            total_duration,
            jobs: summaries,
        })
    }

    async fn send_webhook(
        &self,
        settings: &NotificationSettings,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let url = settings
            .webhook_url
            .as_deref()
            .ok_or_else(|| zfsync_common::Error::BadRequest("Webhook URL not configured".to_string()))?;

        let payload = json!({
            "event": event_type,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
            "source": "zfsync",
        });

        let mut request = self
            .http
            .post(url)
            .timeout(std::time::Duration::from_secs(CHANNEL_TIMEOUT_SECS))
            .header("Content-Type", "application/json");

        if let Some(secret) = &settings.webhook_secret {
            request = request.header("X-Webhook-Secret", secret);
        }

        let response = request
            .json(&payload)
            .send()
            .await
            .map_err(|e| zfsync_common::Error::Internal(format!("Webhook request failed: {}", e)))?;

        if response.status().is_success() {
            info!("Webhook sent: {}", event_type);
            Ok(())
        } else {
            Err(zfsync_common::Error::Internal(format!(
                "Webhook returned HTTP {}",
                response.status()
            )))
        }
    }

    async fn send_telegram(&self, settings: &NotificationSettings, message: &str) -> Result<()> {
        let token = settings
            .telegram_bot_token
            .as_deref()
            .ok_or_else(|| zfsync_common::Error::BadRequest("Telegram token not configured".to_string()))?;
        let chat_id = settings
            .telegram_chat_id
            .as_deref()
            .ok_or_else(|| zfsync_common::Error::BadRequest("Telegram chat not configured".to_string()))?;

        let response = self
            .http
            .post(format!("https://api.telegram.org/bot{}/sendMessage", token))
            .timeout(std::time::Duration::from_secs(CHANNEL_TIMEOUT_SECS))
            .json(&json!({
                "chat_id": chat_id,
                "text": message,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .map_err(|e| zfsync_common::Error::Internal(format!("Telegram request failed: {}", e)))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| zfsync_common::Error::Internal(format!("Telegram response invalid: {}", e)))?;

        if body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            info!("Telegram notification sent");
            Ok(())
        } else {
            Err(zfsync_common::Error::Internal(format!(
                "Telegram error: {}",
                body.get("description").and_then(|v| v.as_str()).unwrap_or("unknown")
            )))
        }
    }
}

fn channel_result(result: Result<impl Sized>) -> serde_json::Value {
    match result {
        Ok(_) => json!({"success": true}),
        Err(e) => json!({"success": false, "message": e.to_string()}),
    }
}

fn status_emoji(status: &str) -> &'static str {
    match status {
        "success" => "\u{2705}",
        "failed" => "\u{274c}",
        "warning" => "\u{26a0}\u{fe0f}",
        _ => "\u{2139}\u{fe0f}",
    }
}

fn format_duration(total_secs: i64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

fn render_job_email(notification: &JobNotification) -> (String, String) {
    let emoji = status_emoji(&notification.status);
    let subject = format!(
        "{} Replication {} - {}",
        emoji, notification.status, notification.job_name
    );

    let duration_row = notification
        .duration
        .map(|d| format!("<tr><td><strong>Duration</strong></td><td>{}s</td></tr>", d))
        .unwrap_or_default();
    let details_row = notification
        .details
        .as_deref()
        .map(|d| format!("<tr><td><strong>Details</strong></td><td>{}</td></tr>", d))
        .unwrap_or_default();
    let error_block = notification
        .error
        .as_deref()
        .map(|e| {
            format!(
                "<h3 style=\"color: #dc3545;\">Error</h3><pre style=\"background: #f8d7da; padding: 10px; border-radius: 4px; white-space: pre-wrap;\">{}</pre>",
                e
            )
        })
        .unwrap_or_default();

    let header_color = if notification.status == "success" {
        "#28a745"
    } else {
        "#dc3545"
    };

    let body = format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: 'Segoe UI', Arial, sans-serif; margin: 0; padding: 20px; background: #f5f5f5;">
  <div style="max-width: 700px; margin: 0 auto; background: white; border-radius: 12px; overflow: hidden;">
    <div style="background: {header_color}; color: white; padding: 20px; text-align: center;">
      <h1 style="margin: 0; font-size: 20px;">{emoji} Replication {status}</h1>
    </div>
    <div style="padding: 20px;">
      <table style="width: 100%; border-collapse: collapse;">
        <tr><td style="width: 140px;"><strong>Job</strong></td><td>{job_name}</td></tr>
        <tr><td><strong>Source</strong></td><td><code>{source}</code></td></tr>
        <tr><td><strong>Destination</strong></td><td><code>{destination}</code></td></tr>
        {duration_row}
        {details_row}
      </table>
      {error_block}
    </div>
    <div style="padding: 15px; text-align: center; color: #6c757d; font-size: 12px; border-top: 1px solid #dee2e6;">
      Generated automatically by zfsync.
    </div>
  </div>
</body>
</html>"#,
        header_color = header_color,
        emoji = emoji,
        status = notification.status,
        job_name = notification.job_name,
        source = notification.source,
        destination = notification.destination,
        duration_row = duration_row,
        details_row = details_row,
        error_block = error_block,
    );

    (subject, body)
}

fn render_job_telegram(notification: &JobNotification) -> String {
    let emoji = status_emoji(&notification.status);
    let mut msg = format!(
        "{} *Replication {}*\n\n*Job:* {}\n*Source:* `{}`\n*Destination:* `{}`",
        emoji, notification.status, notification.job_name, notification.source, notification.destination
    );

    if let Some(duration) = notification.duration {
        msg.push_str(&format!("\n*Duration:* {}m {}s", duration / 60, duration % 60));
    }

    if let Some(error) = &notification.error {
        let truncated: String = error.chars().take(500).collect();
        msg.push_str(&format!("\n\n\u{274c} *Error:*\n`{}`", truncated));
    }

    msg
}

fn render_digest_email(digest: &DigestData) -> (String, String) {
    let (emoji, color, status_text) = if digest.failed > 0 {
        ("\u{274c}", "#dc3545", "Attention required")
    } else {
        ("\u{2705}", "#28a745", "All good")
    };

    let subject = format!(
        "{} Daily summary - {}/{} runs OK",
        emoji, digest.successful, digest.total_runs
    );

    let mut job_rows = String::new();
    for job in &digest.jobs {
        let row_icon = if job.failed_24h > 0 {
            "\u{274c}"
        } else if job.last_status == "success" {
            "\u{2705}"
        } else if job.last_status == "never_run" {
            "\u{23f8}\u{fe0f}"
        } else {
            "\u{26a0}\u{fe0f}"
        };

        job_rows.push_str(&format!(
            r#"<tr>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6;"><strong>{name}</strong><br><span style="font-size: 11px; color: #6c757d;">{schedule}</span></td>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6; font-size: 12px;"><code>{source}</code></td>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6; font-size: 12px;"><code>{destination}</code></td>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6; text-align: center;">{icon}<br><span style="font-size: 11px; color: #6c757d;">{last_run}</span></td>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6; text-align: center;"><span style="color: #28a745; font-weight: bold;">{ok}</span> / <span style="color: #dc3545; font-weight: bold;">{fail}</span></td>
  <td style="padding: 10px; border-bottom: 1px solid #dee2e6; text-align: center; font-size: 12px;">{duration}<br><span style="color: #6c757d;">{transferred}</span></td>
</tr>
"#,
            name = job.name,
            schedule = job.schedule,
            source = job.source,
            destination = job.destination,
            icon = row_icon,
            last_run = job.last_run,
            ok = job.success_24h,
            fail = job.failed_24h,
            duration = format_duration(job.duration_24h),
            transferred = job.last_transferred.as_deref().unwrap_or("-"),
        ));

        if let Some(error) = &job.last_error {
            job_rows.push_str(&format!(
                r#"<tr style="background: #fff5f5;"><td colspan="6" style="padding: 8px 10px; border-bottom: 2px solid #dee2e6; font-size: 11px;"><span style="color: #dc3545;">Last error ({time}):</span><code style="display: block; margin-top: 4px; padding: 6px; background: #f8d7da; border-radius: 4px; white-space: pre-wrap;">{error}</code></td></tr>
"#,
                time = job.last_error_time.as_deref().unwrap_or("N/A"),
                error = error,
            ));
        }
    }

    let body = format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: 'Segoe UI', Arial, sans-serif; margin: 0; padding: 20px; background: #f5f5f5;">
  <div style="max-width: 900px; margin: 0 auto; background: white; border-radius: 12px; overflow: hidden;">
    <div style="background: {color}; color: white; padding: 25px; text-align: center;">
      <h1 style="margin: 0 0 10px 0; font-size: 24px;">{emoji} zfsync daily summary</h1>
      <p style="margin: 0;">{status_text}</p>
    </div>
    <div style="padding: 25px;">
      <p><strong>Period:</strong> last 24 hours | <strong>Date:</strong> {date} UTC</p>
      <div style="display: flex; justify-content: space-around; margin: 20px 0; padding: 20px; background: #f8f9fa; border-radius: 8px;">
        <div style="text-align: center;"><div style="font-size: 28px; font-weight: bold;">{total_jobs}</div><div style="font-size: 11px; color: #6c757d;">JOBS</div></div>
        <div style="text-align: center;"><div style="font-size: 28px; font-weight: bold;">{total_runs}</div><div style="font-size: 11px; color: #6c757d;">RUNS</div></div>
        <div style="text-align: center;"><div style="font-size: 28px; font-weight: bold; color: #28a745;">{successful}</div><div style="font-size: 11px; color: #6c757d;">SUCCEEDED</div></div>
        <div style="text-align: center;"><div style="font-size: 28px; font-weight: bold; color: #dc3545;">{failed}</div><div style="font-size: 11px; color: #6c757d;">FAILED</div></div>
        <div style="text-align: center;"><div style="font-size: 28px; font-weight: bold;">{total_duration}</div><div style="font-size: 11px; color: #6c757d;">TOTAL TIME</div></div>
      </div>
      <table style="width: 100%; border-collapse: collapse; margin-top: 15px; font-size: 13px;">
        <thead>
          <tr style="background: #343a40; color: white;">
            <th style="padding: 10px 8px; text-align: left; font-size: 11px;">JOB</th>
            <th style="padding: 10px 8px; text-align: left; font-size: 11px;">SOURCE</th>
            <th style="padding: 10px 8px; text-align: left; font-size: 11px;">DESTINATION</th>
            <th style="padding: 10px 8px; font-size: 11px;">STATUS</th>
            <th style="padding: 10px 8px; font-size: 11px;">24H (OK/FAIL)</th>
            <th style="padding: 10px 8px; font-size: 11px;">TIME/TRANSFER</th>
          </tr>
        </thead>
        <tbody>
{job_rows}
        </tbody>
      </table>
    </div>
    <div style="padding: 20px; text-align: center; color: #6c757d; font-size: 12px; border-top: 1px solid #dee2e6;">
      This summary was generated automatically by zfsync.
    </div>
  </div>
</body>
</html>"#,
        color = color,
        emoji = emoji,
        status_text = status_text,
        date = Utc::now().format("%d/%m/%Y %H:%M"),
        total_jobs = digest.total_jobs,
        total_runs = digest.total_runs,
        successful = digest.successful,
        failed = digest.failed,
        total_duration = format_duration(digest.total_duration),
        job_rows = job_rows,
    );

    (subject, body)
}

fn render_digest_telegram(digest: &DigestData) -> String {
    let (emoji, status) = if digest.failed > 0 {
        ("\u{274c}", "Attention required")
    } else {
        ("\u{2705}", "All good")
    };

    let mut msg = format!(
        "{} *zfsync daily summary*\n\n*Status:* {}\n*Period:* last 24 hours\n\n\
         \u{1f4ca} *Overall:*\n\
         \u{2022} Jobs configured: {}\n\
         \u{2022} Runs: {}\n\
         \u{2022} \u{2705} Succeeded: {}\n\
         \u{2022} \u{274c} Failed: {}\n\
         \u{2022} \u{23f1} Total time: {}",
        emoji,
        status,
        digest.total_jobs,
        digest.total_runs,
        digest.successful,
        digest.failed,
        format_duration(digest.total_duration),
    );

    if !digest.jobs.is_empty() {
        msg.push_str("\n\n\u{1f4cb} *Jobs:*");
        for job in digest.jobs.iter().take(10) {
            let job_emoji = if job.failed_24h > 0 {
                "\u{274c}"
            } else if job.last_status == "success" {
                "\u{2705}"
            } else if job.last_status == "never_run" {
                "\u{23f8}\u{fe0f}"
            } else {
                "\u{26a0}\u{fe0f}"
            };

            msg.push_str(&format!(
                "\n\n{} *{}*\n   `{}` \u{2192} `{}`\n   24h: {}\u{2713} {}\u{2717} | Last: {}",
                job_emoji, job.name, job.source, job.destination,
                job.success_24h, job.failed_24h, job.last_run,
            ));

            if let Some(error) = &job.last_error {
                let truncated: String = error.chars().take(100).collect();
                msg.push_str(&format!("\n   \u{26a0} Error: `{}`", truncated));
            }
        }
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{create_test_db, test_job_draft, test_node_draft};
    use chrono::TimeZone;

    fn notification(job_id: i64, status: &str, is_scheduled: bool) -> JobNotification {
        JobNotification {
            job_id,
            job_name: format!("job-{}", job_id),
            status: status.to_string(),
            source: "pve1:rpool/data".to_string(),
            destination: "pve2:rpool/replica".to_string(),
            duration: Some(42),
            error: if status == "failed" {
                Some("permission denied".to_string())
            } else {
                None
            },
            details: None,
            is_scheduled,
        }
    }

    fn all_on() -> NotificationSettings {
        NotificationSettings {
            notify_on_success: true,
            notify_on_failure: true,
            notify_on_warning: true,
            ..NotificationSettings::default()
        }
    }

    #[tokio::test]
    async fn test_dedup_per_job_per_day() {
        let db = Arc::new(create_test_db().await);
        let notifier = Notifier::new(db);
        let settings = all_on();

        let day1 = Utc.with_ymd_and_hms(2026, 8, 1, 2, 0, 0).unwrap();

        // First scheduled success of the day goes out
        assert!(notifier.should_send(&settings, &notification(1, "success", true), day1).await);
        // Later successes the same day are suppressed
        let day1_later = Utc.with_ymd_and_hms(2026, 8, 1, 14, 0, 0).unwrap();
        assert!(!notifier.should_send(&settings, &notification(1, "success", true), day1_later).await);
        // A different job is tracked independently
        assert!(notifier.should_send(&settings, &notification(2, "success", true), day1_later).await);
        // Failures are never deduplicated
        assert!(notifier.should_send(&settings, &notification(1, "failed", true), day1_later).await);
        assert!(notifier.should_send(&settings, &notification(1, "failed", true), day1_later).await);
        // Next day the success notification resumes
        let day2 = Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
        assert!(notifier.should_send(&settings, &notification(1, "success", true), day2).await);
    }

    #[tokio::test]
    async fn test_manual_success_not_deduplicated() {
        let db = Arc::new(create_test_db().await);
        let notifier = Notifier::new(db);
        let settings = all_on();

        let now = Utc::now();
        assert!(notifier.should_send(&settings, &notification(1, "success", false), now).await);
        assert!(notifier.should_send(&settings, &notification(1, "success", false), now).await);
    }

    #[tokio::test]
    async fn test_trigger_flags_drop_events() {
        let db = Arc::new(create_test_db().await);
        let notifier = Notifier::new(db);

        let mut settings = all_on();
        settings.notify_on_success = false;

        let now = Utc::now();
        assert!(!notifier.should_send(&settings, &notification(1, "success", false), now).await);
        assert!(notifier.should_send(&settings, &notification(1, "failed", false), now).await);
    }

    #[tokio::test]
    async fn test_dedup_map_cleanup() {
        let db = Arc::new(create_test_db().await);
        let notifier = Notifier::new(db);
        let settings = all_on();

        let old_day = Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap();
        assert!(notifier.should_send(&settings, &notification(1, "success", true), old_day).await);

        // A much later send cleans stale entries out of the map
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 2, 0, 0).unwrap();
        assert!(notifier.should_send(&settings, &notification(2, "success", true), now).await);

        let map = notifier.daily_notified.lock().await;
        assert!(!map.contains_key(&1));
        assert!(map.contains_key(&2));
    }

    #[tokio::test]
    async fn test_digest_aggregation() {
        let db = Arc::new(create_test_db().await);
        let pool = db.pool();

        let a = db::nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = db::nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();
        let job = db::jobs::create(pool, &test_job_draft("j1", a.id, b.id)).await.unwrap();

        // One failure, one success in the last 24h
        for (success, error) in [(false, Some("dataset busy")), (true, None)] {
            let log_id = db::jobs::start_run(pool, &job, "pve1 -> pve2", "a -> b", "sync", 1, None)
                .await
                .unwrap();
            db::jobs::complete_run(
                pool,
                job.id,
                log_id,
                &db::jobs::RunCompletion {
                    success,
                    message: String::new(),
                    output: None,
                    error: error.map(|e| e.to_string()),
                    duration: 30,
                    transferred: success.then(|| "1.5GiB".to_string()),
                },
            )
            .await
            .unwrap();
        }

        let notifier = Notifier::new(Arc::clone(&db));
        let digest = notifier.collect_digest().await.unwrap();

        assert_eq!(digest.total_jobs, 1);
        assert_eq!(digest.total_runs, 2);
        assert_eq!(digest.successful, 1);
        assert_eq!(digest.failed, 1);
        assert_eq!(digest.total_duration, 60);

        let summary = &digest.jobs[0];
        assert_eq!(summary.name, "j1");
        assert_eq!(summary.source, "pve1:rpool/data/vm-100-disk-0");
        assert_eq!(summary.last_transferred.as_deref(), Some("1.5GiB"));
        assert_eq!(summary.last_error.as_deref(), Some("dataset busy"));
    }

    #[test]
    fn test_render_job_email_failure() {
        let (subject, body) = render_job_email(&notification(1, "failed", true));
        assert!(subject.contains("failed"));
        assert!(body.contains("permission denied"));
        assert!(body.contains("pve1:rpool/data"));
    }

    #[test]
    fn test_render_digest_telegram_caps_jobs() {
        let jobs = (0..15)
            .map(|i| JobSummary {
                id: i,
                name: format!("job-{}", i),
                source: "a".to_string(),
                destination: "b".to_string(),
                schedule: "* * * * *".to_string(),
                runs_24h: 1,
                success_24h: 1,
                failed_24h: 0,
                duration_24h: 10,
                last_status: "success".to_string(),
                last_run: "01/08 02:00".to_string(),
                last_transferred: None,
                last_error: None,
                last_error_time: None,
            })
            .collect();

        let digest = DigestData {
            total_jobs: 15,
            total_runs: 15,
            successful: 15,
            failed: 0,
            total_duration: 150,
            jobs,
        };

        let msg = render_digest_telegram(&digest);
        assert!(msg.contains("job-9"));
        assert!(!msg.contains("job-10"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(59), "0m");
        assert_eq!(format_duration(3600), "1h 0m");
        assert_eq!(format_duration(5400), "1h 30m");
    }
}
