use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tapecache_core::{CacheConfiguration, SubmitterConfig};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "tapecache.json";

/// Contents of `tapecache.json`. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct StoreConfig {
    #[serde(default)]
    pub(crate) base_dir: Option<PathBuf>,
    #[serde(default)]
    pub(crate) cache: CacheConfiguration,
    #[serde(default)]
    pub(crate) submitter: SubmitterConfig,
}

impl StoreConfig {
    /// Cache directory from the command line, falling back to the configuration file.
    pub(crate) fn base_dir(
        &self,
        flag: Option<PathBuf>,
    ) -> Result<PathBuf, Box<dyn std::error::Error>> {
        flag.or_else(|| self.base_dir.clone()).ok_or_else(|| {
            "no cache directory: pass --base or set base_dir in tapecache.json".into()
        })
    }
}

/// Loads the configuration. An explicit path must exist; the default file is optional.
pub(crate) fn load_store_config(
    path: Option<&Path>,
) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    match std::fs::read_to_string(&path) {
        Ok(data) => {
            let config = serde_json::from_str(&data)
                .map_err(|err| format!("invalid configuration {}: {err}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
            Ok(StoreConfig::default())
        }
        Err(err) => Err(format!("cannot read {}: {err}", path.display()).into()),
    }
}
