//! Configuration file handling
//!
//! Settings live in `config.json` inside the data directory. Missing keys
//! fall back to their defaults so older files keep loading.

use crate::error::DlsyncError;
use dlsync_types::CoreConfig;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const CONFIG_FILE: &str = "config.json";

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Load the configuration stored in `data_dir`, or defaults if there is none
pub async fn load_config(data_dir: &Path) -> Result<CoreConfig, DlsyncError> {
    let path = config_path(data_dir);

    if !path.exists() {
        return Ok(CoreConfig::with_data_dir(data_dir));
    }

    let content = fs::read_to_string(&path).await?;
    let mut config: CoreConfig = serde_json::from_str(&content)?;
    // The file always describes the directory it was read from
    config.data_dir = data_dir.to_path_buf();

    Ok(config)
}

pub async fn save_config(config: &CoreConfig) -> Result<(), DlsyncError> {
    fs::create_dir_all(&config.data_dir).await?;

    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path(&config.data_dir), content).await?;

    Ok(())
}
