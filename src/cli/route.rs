//! CLI route: single route table and run context. Dispatches to domain services and presentation.

use crate::cli::output::map_error;
use crate::cli::parse::{Commands, ConfigCommands, JobsCommands};
use crate::cli::presentation::{
    format_cleanup_text, format_extraction_text, format_job_detail_text, format_job_list_text,
    format_queue_report_text, to_json, QueueReport,
};
use crate::config::{ConfigLoader, GenforgeConfig};
use crate::content::schema_for;
use crate::error::{ApiError, StorageError};
use crate::extract::{extract_record, extract_validated};
use crate::jobs::{
    FailureKind, GenerationJob, JobFilter, JobId, JobKind, JobOrchestrator, JobRequest,
    JobStatus, JobStore, JobView, SledSnapshotStore,
};
use crate::provider::HttpGenerationBackend;
use crate::queue::TaskQueue;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Runtime context for CLI execution: workspace and effective configuration.
pub struct RunContext {
    config: GenforgeConfig,
    workspace_root: PathBuf,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        Ok(Self::from_config(config, workspace_root))
    }

    pub fn from_config(config: GenforgeConfig, workspace_root: PathBuf) -> Self {
        Self {
            config,
            workspace_root,
        }
    }

    pub fn config(&self) -> &GenforgeConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        let started = Instant::now();
        let name = command_name(command);
        let result = self.execute_inner(command);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(command = name, elapsed_ms, "Command completed"),
            Err(e) => warn!(command = name, elapsed_ms, error = %map_error(e), "Command failed"),
        }
        result
    }

    fn execute_inner(&self, command: &Commands) -> Result<String, ApiError> {
        if !matches!(command, Commands::Config { .. } | Commands::Extract { .. }) {
            self.validate_config()?;
        }

        match command {
            Commands::Submit {
                kind,
                prompt,
                owner,
                form,
                no_asset,
                timeout,
                format,
            } => {
                let kind: JobKind = kind.parse()?;
                let mut request = JobRequest::new(kind, owner.clone(), prompt.clone());
                for field in form {
                    let (key, value) = parse_form_field(field)?;
                    request = request.with_form_field(key, value);
                }
                if *no_asset {
                    request = request.without_asset();
                }
                let job = self.run_job(move |orch| orch.submit(request), *timeout)?;
                render_job(job, format)
            }
            Commands::Jobs { command } => self.handle_jobs(command),
            Commands::Queue { format } => {
                let store = self.open_store()?;
                let queue = TaskQueue::new(self.config.queue.clone());
                let report = QueueReport {
                    queue: queue.snapshot(),
                    retry_base_delay_ms: self.config.queue.retry_base_delay_ms,
                    retry_max_delay_ms: self.config.queue.retry_max_delay_ms,
                    max_rate_limit_retries: self.config.queue.max_rate_limit_retries,
                    jobs: store.counts(),
                };
                if format == "json" {
                    to_json(&report)
                } else {
                    Ok(format_queue_report_text(&report))
                }
            }
            Commands::Extract {
                file,
                kind,
                truncated,
            } => {
                let text = std::fs::read_to_string(file).map_err(|e| {
                    ApiError::ConfigError(format!("Failed to read {}: {}", file.display(), e))
                })?;
                let extracted = match kind {
                    Some(kind) => {
                        let kind: JobKind = kind.parse()?;
                        extract_validated(&text, *truncated, &schema_for(kind))?
                    }
                    None => extract_record(&text, *truncated)?,
                };
                format_extraction_text(&extracted)
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show { format } => {
                    if format == "json" {
                        to_json(&self.config)
                    } else {
                        self.config.to_toml()
                    }
                }
                ConfigCommands::Validate => {
                    self.validate_config()?;
                    Ok("Configuration is valid.".to_string())
                }
            },
        }
    }

    fn handle_jobs(&self, command: &JobsCommands) -> Result<String, ApiError> {
        match command {
            JobsCommands::List {
                kind,
                status,
                format,
            } => {
                let filter = JobFilter {
                    kind: kind.as_deref().map(str::parse::<JobKind>).transpose()?,
                    status: status.as_deref().map(str::parse::<JobStatus>).transpose()?,
                };
                let jobs = self.open_store()?.list(&filter);
                if format == "json" {
                    to_json(&jobs)
                } else {
                    Ok(format_job_list_text(&jobs))
                }
            }
            JobsCommands::Show { id, format } => {
                let id: JobId = id.parse()?;
                let job = self
                    .open_store()?
                    .by_id(&id)
                    .ok_or(ApiError::JobNotFound(id))?;
                let view = JobView {
                    phase: job.status.phase(),
                    queue_position: 0,
                    job,
                };
                if format == "json" {
                    to_json(&view)
                } else {
                    Ok(format_job_detail_text(&view))
                }
            }
            JobsCommands::Retry { id, timeout } => {
                let id: JobId = id.parse()?;
                let job = self.run_job(move |orch| orch.retry(&id), *timeout)?;
                render_job(job, "text")
            }
            JobsCommands::Cancel { id } => {
                let id: JobId = id.parse()?;
                self.open_store()?
                    .remove(&id)
                    .map(|job| format!("Removed job {} ({})", job.id, job.status))
                    .ok_or(ApiError::JobNotFound(id))
            }
            JobsCommands::Cleanup {
                stale_after,
                retention,
            } => {
                let store = self.open_store()?;
                let stale_after = stale_after
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.jobs.stale_after());
                let retention = retention
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.config.jobs.settled_retention());
                let stale = store.cleanup_stale(stale_after);
                let expired = store.cleanup_settled(retention);
                Ok(format_cleanup_text(&stale, expired))
            }
        }
    }

    fn validate_config(&self) -> Result<(), ApiError> {
        self.config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })
    }

    fn open_store(&self) -> Result<Arc<JobStore>, ApiError> {
        let path = self.config.storage.jobs_path();
        let path = if path.is_relative() {
            self.workspace_root.join(path)
        } else {
            path
        };
        std::fs::create_dir_all(&path).map_err(|e| ApiError::from(StorageError::IoError(e)))?;
        let snapshots = Arc::new(SledSnapshotStore::open(&path)?);
        let store = JobStore::open(snapshots, self.config.jobs.restore_policy())?;
        Ok(Arc::new(store))
    }

    /// Start a job with `start`, then drive it to completion in this process.
    fn run_job<F>(&self, start: F, timeout_secs: u64) -> Result<GenerationJob, ApiError>
    where
        F: FnOnce(&Arc<JobOrchestrator>) -> Result<JobId, ApiError>,
    {
        let store = self.open_store()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| ApiError::ConfigError(format!("Failed to start runtime: {}", e)))?;

        runtime.block_on(async {
            let backend = Arc::new(HttpGenerationBackend::from_config(&self.config.endpoints)?);
            let orchestrator = JobOrchestrator::new(
                TaskQueue::new(self.config.queue.clone()),
                Arc::clone(&store),
                backend,
                self.config.jobs.clone(),
            );
            let id = start(&orchestrator)?;
            info!(job_id = %id, "Waiting for job to settle");
            match orchestrator
                .wait(&id, Duration::from_secs(timeout_secs))
                .await
            {
                Ok(job) => Ok(job),
                Err(err) => {
                    store.fail_with(&id, FailureKind::from_error(&err), err.to_string());
                    Err(err)
                }
            }
        })
    }
}

fn render_job(job: GenerationJob, format: &str) -> Result<String, ApiError> {
    let view = JobView {
        phase: job.status.phase(),
        queue_position: 0,
        job,
    };
    if format == "json" {
        to_json(&view)
    } else {
        Ok(format_job_detail_text(&view))
    }
}

/// Command name for logging (e.g. "jobs.list").
pub fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Submit { .. } => "submit",
        Commands::Jobs { command } => match command {
            JobsCommands::List { .. } => "jobs.list",
            JobsCommands::Show { .. } => "jobs.show",
            JobsCommands::Retry { .. } => "jobs.retry",
            JobsCommands::Cancel { .. } => "jobs.cancel",
            JobsCommands::Cleanup { .. } => "jobs.cleanup",
        },
        Commands::Queue { .. } => "queue",
        Commands::Extract { .. } => "extract",
        Commands::Config { command } => match command {
            ConfigCommands::Show { .. } => "config.show",
            ConfigCommands::Validate => "config.validate",
        },
    }
}

/// Split `key=value`; the value is taken as JSON when it parses, else as a string.
fn parse_form_field(field: &str) -> Result<(String, Value), ApiError> {
    let (key, raw) = field
        .split_once('=')
        .ok_or_else(|| ApiError::ConfigError(format!("Expected KEY=VALUE, got '{}'", field)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ApiError::ConfigError(format!("Empty form key in '{}'", field)));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
