//! Layered configuration loading.

use config::{ConfigError, Environment, File};
use std::path::Path;

use super::merge::merge_policy;
use super::sources::{global_file, workspace_file};
use super::GenforgeConfig;

/// Loads [`GenforgeConfig`] from defaults, files and `GENFORGE__*` environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load with the default global file location.
    pub fn load(workspace_root: &Path) -> Result<GenforgeConfig, ConfigError> {
        let global = global_file::global_config_path();
        Self::load_layers(global.as_deref(), workspace_root)
    }

    /// Load from an explicit global file (if any) and a workspace root.
    ///
    /// Later layers win: defaults, global file, `config/config.toml`,
    /// `config/{GENFORGE_ENV}.toml`, then environment variables such as
    /// `GENFORGE__QUEUE__CONCURRENCY_LIMIT=5`.
    pub fn load_layers(
        global: Option<&Path>,
        workspace_root: &Path,
    ) -> Result<GenforgeConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder, global)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        builder
            .add_source(
                Environment::with_prefix("GENFORGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Load a single file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<GenforgeConfig, ConfigError> {
        merge_policy::builder_with_defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    pub fn default() -> GenforgeConfig {
        GenforgeConfig::default()
    }
}
