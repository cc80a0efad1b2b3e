//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("queue.concurrency_limit", 3i64)?
        .set_default("queue.retry_base_delay_ms", 1000i64)?
        .set_default("queue.retry_max_delay_ms", 30_000i64)?
        .set_default("jobs.stale_after_secs", 600i64)?
        .set_default("jobs.settled_retention_secs", 86_400i64)?
        .set_default("jobs.content_timeout_secs", 60i64)?
        .set_default("jobs.asset_timeout_secs", 30i64)
}
