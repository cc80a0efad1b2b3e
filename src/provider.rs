//! Generation Backend
//!
//! Boundary between the job pipeline and whatever produces text and illustrations. The
//! orchestrator only sees [`GenerationBackend`]; [`HttpGenerationBackend`] talks to JSON
//! endpoints resolved per job kind through an [`EndpointTable`].

use crate::content::schema_for;
use crate::error::ApiError;
use crate::jobs::{AssetRef, GenerationJob, JobId, JobKind};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Input for the content stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRequest {
    pub job_id: JobId,
    pub kind: JobKind,
    pub prompt: String,
    pub form: BTreeMap<String, Value>,
    /// Output format instructions derived from the kind's schema.
    pub instructions: String,
}

impl ContentRequest {
    pub fn for_job(job: &GenerationJob) -> Self {
        let schema = schema_for(job.kind);
        let fields: Vec<&str> = schema
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        Self {
            job_id: job.id,
            kind: job.kind,
            prompt: job.prompt.clone(),
            form: job.form.clone(),
            instructions: format!(
                "Respond with a single JSON object describing a {} with the fields: {}.",
                job.kind,
                fields.join(", ")
            ),
        }
    }
}

/// Input for the illustration stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetRequest {
    pub job_id: JobId,
    pub kind: JobKind,
    pub prompt: String,
}

/// Raw model output for the content stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGeneration {
    pub text: String,
    /// The output was cut off by a length limit.
    pub truncated: bool,
}

impl RawGeneration {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: false,
        }
    }

    pub fn truncated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            truncated: true,
        }
    }
}

/// Something that can generate job content and illustrations.
///
/// Rate limits must be reported as [`ApiError::ProviderRateLimit`] (or an error whose message
/// contains `429`) so the task queue can retry them.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_content(&self, request: &ContentRequest) -> Result<RawGeneration, ApiError>;

    async fn generate_asset(&self, request: &AssetRequest) -> Result<AssetRef, ApiError>;

    fn name(&self) -> &str;
}

/// Endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Base URL; kinds without an override use `{base_url}/generate/{kind}` and
    /// `{base_url}/illustrate/{kind}`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Per-kind content endpoint overrides.
    #[serde(default)]
    pub content: BTreeMap<JobKind, String>,
    /// Per-kind illustration endpoint overrides.
    #[serde(default)]
    pub asset: BTreeMap<JobKind, String>,
    /// Environment variable holding the bearer token, if any.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "GENFORGE_API_KEY".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            content: BTreeMap::new(),
            asset: BTreeMap::new(),
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EndpointsConfig {
    pub fn validate(&self) -> Result<(), String> {
        let urls = self
            .base_url
            .iter()
            .chain(self.content.values())
            .chain(self.asset.values());
        for url in urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("endpoint '{}' must be an http(s) URL", url));
            }
        }
        for kind in self.asset.keys() {
            if !kind.supports_asset() {
                return Err(format!("kind '{}' does not take an illustration", kind));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err("request_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Resolved content and illustration URLs per job kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointTable {
    content: BTreeMap<JobKind, String>,
    asset: BTreeMap<JobKind, String>,
}

impl EndpointTable {
    pub fn from_config(config: &EndpointsConfig) -> Self {
        let base = config
            .base_url
            .as_deref()
            .map(|b| b.trim_end_matches('/').to_string());
        let mut table = Self::default();
        for kind in JobKind::ALL {
            let content = config
                .content
                .get(&kind)
                .cloned()
                .or_else(|| base.as_ref().map(|b| format!("{}/generate/{}", b, kind)));
            if let Some(url) = content {
                table.content.insert(kind, url);
            }
            if !kind.supports_asset() {
                continue;
            }
            let asset = config
                .asset
                .get(&kind)
                .cloned()
                .or_else(|| base.as_ref().map(|b| format!("{}/illustrate/{}", b, kind)));
            if let Some(url) = asset {
                table.asset.insert(kind, url);
            }
        }
        table
    }

    pub fn content_url(&self, kind: JobKind) -> Result<&str, ApiError> {
        self.content.get(&kind).map(String::as_str).ok_or_else(|| {
            ApiError::ProviderNotConfigured(format!("no content endpoint for {}", kind))
        })
    }

    pub fn asset_url(&self, kind: JobKind) -> Result<&str, ApiError> {
        self.asset.get(&kind).map(String::as_str).ok_or_else(|| {
            ApiError::ProviderNotConfigured(format!("no illustration endpoint for {}", kind))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    truncated: bool,
}

impl ContentResponse {
    fn into_generation(self) -> RawGeneration {
        let truncated = self.truncated
            || matches!(self.finish_reason.as_deref(), Some("length" | "max_tokens"));
        RawGeneration {
            text: self.text,
            truncated,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
    #[serde(alias = "url")]
    uri: String,
    #[serde(default)]
    content_type: Option<String>,
}

// Helper function to map HTTP errors to ApiError
fn map_http_error(error: reqwest::Error) -> ApiError {
    if let Some(status) = error.status() {
        map_status(status, &error.to_string())
    } else if error.is_timeout() {
        ApiError::ProviderRequestFailed(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ApiError::ProviderRequestFailed(format!("Connection error: {}", error))
    } else {
        ApiError::ProviderError(format!("HTTP error: {}", error))
    }
}

fn map_status(status: StatusCode, body: &str) -> ApiError {
    match status.as_u16() {
        401 | 403 => ApiError::ProviderAuthFailed(format!("Authentication failed: {}", body)),
        429 => ApiError::ProviderRateLimit(format!("Rate limit exceeded: {}", body)),
        _ => ApiError::ProviderRequestFailed(format!(
            "Request failed with status {}: {}",
            status, body
        )),
    }
}

fn build_http_client(config: &EndpointsConfig) -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .map_err(|e| ApiError::ProviderError(format!("Failed to create HTTP client: {}", e)))
}

/// JSON-over-HTTP generation backend.
pub struct HttpGenerationBackend {
    client: Client,
    endpoints: EndpointTable,
    api_key: Option<String>,
}

impl HttpGenerationBackend {
    pub fn new(endpoints: EndpointTable, config: &EndpointsConfig) -> Result<Self, ApiError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            client: build_http_client(config)?,
            endpoints,
            api_key,
        })
    }

    pub fn from_config(config: &EndpointsConfig) -> Result<Self, ApiError> {
        Self::new(EndpointTable::from_config(config), config)
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    async fn post<B, R>(&self, url: &str, body: &B) -> Result<R, ApiError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, &error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::ProviderError(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate_content(&self, request: &ContentRequest) -> Result<RawGeneration, ApiError> {
        let url = self.endpoints.content_url(request.kind)?;
        debug!(job_id = %request.job_id, kind = %request.kind, url, "Requesting content");
        let response: ContentResponse = self.post(url, request).await?;
        Ok(response.into_generation())
    }

    async fn generate_asset(&self, request: &AssetRequest) -> Result<AssetRef, ApiError> {
        let url = self.endpoints.asset_url(request.kind)?;
        debug!(job_id = %request.job_id, kind = %request.kind, url, "Requesting illustration");
        let response: AssetResponse = self.post(url, request).await?;
        Ok(AssetRef {
            uri: response.uri,
            content_type: response.content_type,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}
