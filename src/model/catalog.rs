//! Registry listing: which model names can be asked for, split into
//! standalone models and bags.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::io::net::http_client;
use crate::types::ModelManifest;

/// Root of the built-in remote registry. Manifests live at
/// `{root}/{name}.json` and the listing at `{root}/index.json`.
pub const REMOTE_ROOT: &str = "https://raw.githubusercontent.com/demix-rs/models/main";

/// Names available in a registry. Listing is advisory: a listed name can
/// still fail to load later.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelList {
    /// Standalone models.
    pub single: Vec<String>,
    /// Composite models whose output averages several submodels.
    pub bag: Vec<String>,
}

impl ModelList {
    pub fn contains(&self, name: &str) -> bool {
        self.single.iter().any(|n| n == name) || self.bag.iter().any(|n| n == name)
    }

    fn sorted(mut self) -> Self {
        self.single.sort();
        self.bag.sort();
        self
    }
}

/// List the models a registry offers. `None` consults the built-in remote
/// registry; `Some(dir)` scans a local directory of manifest files and fails
/// if the path is not a directory.
pub fn list_models(repo: Option<&Path>) -> Result<ModelList> {
    match repo {
        None => list_remote(REMOTE_ROOT),
        Some(dir) => list_local(dir),
    }
}

pub(crate) fn fetch_remote_index(root: &str) -> Result<ModelList> {
    let url = format!("{root}/index.json");
    let list: ModelList = http_client().get(&url).send()?.error_for_status()?.json()?;
    Ok(list)
}

fn list_remote(root: &str) -> Result<ModelList> {
    Ok(fetch_remote_index(root)?.sorted())
}

fn list_local(dir: &Path) -> Result<ModelList> {
    if !dir.is_dir() {
        return Err(Error::RegistryDirectory(dir.to_path_buf()));
    }
    let mut list = ModelList::default();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let file = std::fs::File::open(&path)?;
        let manifest: ModelManifest = match serde_json::from_reader(file) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable manifest");
                continue;
            }
        };
        if manifest.is_bag() {
            list.bag.push(manifest.name);
        } else {
            list.single.push(manifest.name);
        }
    }
    Ok(list.sorted())
}
