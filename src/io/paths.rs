use std::path::PathBuf;

use anyhow::anyhow;
use directories::ProjectDirs;

use crate::error::Result;

/// Per-user cache directory for downloaded model artifacts.
pub fn models_cache_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("rs", "demix", "demix")
        .ok_or_else(|| anyhow!("could not determine a home directory"))?;
    Ok(dirs.cache_dir().join("models"))
}
