//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain errors to a one-line message for CLI output.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::ProviderNotConfigured(_) => format!(
            "{} (set endpoints.base_url in config/config.toml or GENFORGE__ENDPOINTS__BASE_URL)",
            e
        ),
        ApiError::JobStillActive(id) => {
            format!("Job {} has not settled yet; only settled jobs can be retried", id)
        }
        other => other.to_string(),
    }
}
