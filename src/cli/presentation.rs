//! CLI presentation: text and json formatters per command family.

use crate::error::ApiError;
use crate::extract::Extracted;
use crate::jobs::{GenerationJob, JobCounts, JobId, JobPhase, JobStatus, JobView};
use crate::queue::QueueSnapshot;
use chrono::Utc;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::Serialize;

/// Queue settings plus job totals, for `genforge queue`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub queue: QueueSnapshot,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_rate_limit_retries: Option<u32>,
    pub jobs: JobCounts,
}

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

fn status_label(status: JobStatus) -> String {
    match status {
        JobStatus::Complete => status.as_str().green().to_string(),
        JobStatus::Error => status.as_str().red().to_string(),
        JobStatus::Pending => status.as_str().dimmed().to_string(),
        JobStatus::Generating | JobStatus::ContentComplete | JobStatus::ImageGenerating => {
            status.as_str().yellow().to_string()
        }
    }
}

fn short_id(id: &JobId) -> String {
    let full = id.to_string();
    full[full.len().saturating_sub(12)..].to_string()
}

fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m{}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ApiError::ConfigError(format!("Failed to render JSON: {}", e)))
}

/// Jobs as a table, oldest first.
pub fn format_job_list_text(jobs: &[GenerationJob]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Jobs")));
    if jobs.is_empty() {
        out.push_str("No jobs.\n");
        return out;
    }
    let now = Utc::now();
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Job", "Kind", "Status", "Progress", "Owner", "Time"]);
    for job in jobs {
        let time = job
            .elapsed_ms
            .unwrap_or_else(|| job.age_ms(now));
        table.add_row(vec![
            short_id(&job.id),
            job.kind.to_string(),
            status_label(job.status),
            format!("{}%", job.progress),
            job.owner_id.clone(),
            format_duration_ms(time),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out
}

pub fn format_job_detail_text(view: &JobView) -> String {
    let job = &view.job;
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Job")));
    out.push_str(&format!("  Id: {}\n", job.id));
    out.push_str(&format!("  Kind: {}\n", job.kind));
    out.push_str(&format!("  Owner: {}\n", job.owner_id));
    out.push_str(&format!("  Status: {}\n", status_label(job.status)));
    out.push_str(&format!("  Progress: {}%\n", job.progress));
    match view.phase {
        JobPhase::Queued if view.queue_position > 0 => {
            out.push_str(&format!("  Queue position: {}\n", view.queue_position));
        }
        _ => {}
    }
    out.push_str(&format!("  Started: {}\n", job.start_time.to_rfc3339()));
    if let Some(elapsed) = job.elapsed_ms {
        out.push_str(&format!("  Elapsed: {}\n", format_duration_ms(elapsed)));
    }
    if let Some(retry_of) = job.retry_of {
        out.push_str(&format!("  Retry of: {}\n", retry_of));
    }
    if let Some(message) = job.user_message() {
        out.push_str(&format!("  Problem: {}\n", message));
    }
    if let Some(error) = &job.error {
        out.push_str(&format!("  Error: {}\n", error.red()));
    }
    if let Some(content) = &job.content {
        out.push_str(&format!("  Title: {}\n", content.title()));
    }
    if let Some(asset) = &job.asset {
        out.push_str(&format!("  Illustration: {}\n", asset.uri));
    }
    if let Some(asset_error) = &job.asset_error {
        out.push_str(&format!("  Illustration skipped: {}\n", asset_error));
    }
    out
}

pub fn format_queue_report_text(report: &QueueReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Queue")));
    out.push_str(&format!(
        "  Concurrency limit: {}\n",
        report.queue.concurrency_limit
    ));
    out.push_str(&format!(
        "  Active: {}  Pending: {}\n",
        report.queue.active_count, report.queue.length
    ));
    let ceiling = report
        .max_rate_limit_retries
        .map(|n| n.to_string())
        .unwrap_or_else(|| "unbounded".to_string());
    out.push_str(&format!(
        "  Rate-limit backoff: {}ms doubling to {}ms, retries: {}\n\n",
        report.retry_base_delay_ms, report.retry_max_delay_ms, ceiling
    ));

    out.push_str(&format!("{}\n\n", format_section_heading("Jobs")));
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Status", "Count"]);
    let counts = &report.jobs;
    for (status, count) in [
        (JobStatus::Pending, counts.pending),
        (JobStatus::Generating, counts.generating),
        (JobStatus::ContentComplete, counts.content_complete),
        (JobStatus::ImageGenerating, counts.image_generating),
        (JobStatus::Complete, counts.complete),
        (JobStatus::Error, counts.error),
    ] {
        table.add_row(vec![status.as_str().to_string(), count.to_string()]);
    }
    out.push_str(&format!("{}\n", table));
    out
}

pub fn format_extraction_text(extracted: &Extracted) -> Result<String, ApiError> {
    let record = serde_json::Value::Object(extracted.record.clone());
    let step = serde_json::to_value(extracted.step)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    Ok(format!(
        "{} {}\n\n{}\n",
        "Recovered via".bold(),
        step,
        to_json(&record)?
    ))
}

pub fn format_cleanup_text(stale: &[JobId], expired: usize) -> String {
    let mut out = format!(
        "Failed {} stale job(s), removed {} expired job(s).\n",
        stale.len(),
        expired
    );
    for id in stale {
        out.push_str(&format!("  stale: {}\n", id));
    }
    out
}
