//! Model resolution: turn a registry name into a runnable [`ModelHandle`],
//! downloading and checksumming ONNX artifacts as needed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use ndarray::{Array4, ArrayView3};
use once_cell::sync::OnceCell;
use ort::{
    execution_providers::ExecutionProviderDispatch,
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
    value::{Tensor, Value},
};
use tracing::{info, warn};

use crate::core::apply::{ModelHandle, SourceModel};
use crate::error::{Error, Result};
use crate::io::{crypto::verify_sha256, net::download, net::http_client, paths::models_cache_dir};
use crate::model::catalog::{fetch_remote_index, REMOTE_ROOT};
use crate::types::ModelManifest;

// CUDA: Linux and Windows only
#[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
use ort::execution_providers::CUDAExecutionProvider;
// CoreML: macOS only
#[cfg(all(feature = "coreml", target_os = "macos"))]
use ort::execution_providers::CoreMLExecutionProvider;
// DirectML: Windows only
#[cfg(all(feature = "directml", target_os = "windows"))]
use ort::execution_providers::{DirectMLExecutionProvider, ExecutionProvider};
// oneDNN: all platforms
#[cfg(feature = "onednn")]
use ort::execution_providers::OneDNNExecutionProvider;

static ORT_INIT: OnceCell<()> = OnceCell::new();

/// Resolve `name` against a registry and build a handle around it.
/// `Ok(None)` means the registry does not know the name; everything else
/// that goes wrong is an error.
pub fn load_model(name: &str, repo: Option<&Path>) -> Result<Option<ModelHandle>> {
    match repo {
        Some(dir) => load_local(name, dir),
        None => load_remote(name, REMOTE_ROOT),
    }
}

fn load_local(name: &str, dir: &Path) -> Result<Option<ModelHandle>> {
    if !dir.is_dir() {
        return Err(Error::RegistryDirectory(dir.to_path_buf()));
    }
    let manifest_path = dir.join(format!("{name}.json"));
    if !manifest_path.is_file() {
        return Ok(None);
    }
    let file = std::fs::File::open(&manifest_path)?;
    let manifest: ModelManifest = serde_json::from_reader(file)?;

    if manifest.is_bag() {
        let mut submodels: Vec<Arc<dyn SourceModel>> = Vec::with_capacity(manifest.models.len());
        for sub in &manifest.models {
            let handle =
                load_local(sub, dir)?.ok_or_else(|| Error::ModelLoad(sub.to_string()))?;
            submodels.extend(handle.submodels().iter().cloned());
        }
        return Ok(Some(ModelHandle::bag(
            manifest.name.clone(),
            submodels,
            bag_weights(&manifest),
        )?));
    }

    let artifact = manifest
        .resolve_primary_artifact()
        .map_err(Error::Manifest)?;
    // Prefer an artifact sitting next to the manifest; fall back to the
    // shared cache (downloading if needed).
    let local = dir.join(&artifact.file);
    let model_path = if local.is_file() {
        local
    } else {
        ensure_artifact(&manifest)?
    };
    let model = OnnxModel::load(&model_path, manifest)?;
    Ok(Some(ModelHandle::single(name, Arc::new(model))))
}

fn load_remote(name: &str, root: &str) -> Result<Option<ModelHandle>> {
    let index = fetch_remote_index(root)?;
    if !index.contains(name) {
        return Ok(None);
    }
    let url = format!("{root}/{name}.json");
    let manifest: ModelManifest = http_client().get(&url).send()?.error_for_status()?.json()?;

    if manifest.is_bag() {
        let mut submodels: Vec<Arc<dyn SourceModel>> = Vec::with_capacity(manifest.models.len());
        for sub in &manifest.models {
            let handle =
                load_remote(sub, root)?.ok_or_else(|| Error::ModelLoad(sub.to_string()))?;
            submodels.extend(handle.submodels().iter().cloned());
        }
        return Ok(Some(ModelHandle::bag(
            manifest.name.clone(),
            submodels,
            bag_weights(&manifest),
        )?));
    }

    let model_path = ensure_artifact(&manifest)?;
    let model = OnnxModel::load(&model_path, manifest)?;
    Ok(Some(ModelHandle::single(name, Arc::new(model))))
}

fn bag_weights(manifest: &ModelManifest) -> Option<Vec<Vec<f64>>> {
    if manifest.weights.is_empty() {
        None
    } else {
        Some(manifest.weights.clone())
    }
}

/// Make sure the manifest's primary artifact sits in the cache with a good
/// checksum, downloading it when absent or corrupt.
fn ensure_artifact(manifest: &ModelManifest) -> Result<PathBuf> {
    let artifact = manifest
        .resolve_primary_artifact()
        .map_err(Error::Manifest)?;

    let cache_dir = models_cache_dir()?;
    std::fs::create_dir_all(&cache_dir)?;
    let ext = artifact
        .file
        .rsplit('.')
        .next()
        .map(|s| format!(".{s}"))
        .unwrap_or_default();
    let file_name = format!("{}-{}{}", manifest.name, &artifact.sha256[..8], ext);
    let local_path = cache_dir.join(file_name);

    if !matches!(verify_sha256(&local_path, &artifact.sha256), Ok(true)) {
        download(http_client(), &artifact.url, &local_path)?;
        if !verify_sha256(&local_path, &artifact.sha256)? {
            return Err(Error::Checksum {
                path: local_path.display().to_string(),
            });
        }
        if artifact.size_bytes > 0 {
            let size = std::fs::metadata(&local_path).map(|m| m.len()).unwrap_or(0);
            if size != artifact.size_bytes {
                warn!(
                    path = %local_path.display(),
                    expected = artifact.size_bytes,
                    actual = size,
                    "artifact size mismatch"
                );
            }
        }
    }
    Ok(local_path)
}

#[allow(unused_mut)]
fn execution_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers: Vec<ExecutionProviderDispatch> = Vec::new();

    #[cfg(all(feature = "cuda", any(target_os = "linux", target_os = "windows")))]
    providers.push(CUDAExecutionProvider::default().build());

    #[cfg(all(feature = "coreml", target_os = "macos"))]
    providers.push(CoreMLExecutionProvider::default().build());

    #[cfg(all(feature = "directml", target_os = "windows"))]
    for device_id in 0..4 {
        let dml = DirectMLExecutionProvider::default().with_device_id(device_id);
        if let Ok(true) = dml.is_available() {
            providers.push(dml.build());
            break;
        }
    }

    #[cfg(feature = "onednn")]
    providers.push(OneDNNExecutionProvider::default().build());

    providers
}

/// A single ONNX network exposed through [`SourceModel`]. The session takes
/// `(batch, channels, frames)` float32 and returns
/// `(batch, sources, channels, frames)`.
pub struct OnnxModel {
    manifest: ModelManifest,
    session: Mutex<Session>,
}

impl OnnxModel {
    pub fn load(path: &Path, manifest: ModelManifest) -> Result<Self> {
        ORT_INIT.get_or_try_init::<_, Error>(|| {
            ort::init().commit()?;
            Ok(())
        })?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let providers = execution_providers();

        let session = if providers.is_empty() {
            SessionBuilder::new()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_intra_threads(num_threads)?
                .with_inter_threads(num_threads)?
                .with_parallel_execution(true)?
                .commit_from_file(path)?
        } else {
            let accelerated = (|| -> std::result::Result<Session, ort::Error> {
                SessionBuilder::new()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_execution_providers(providers)?
                    .with_intra_threads(num_threads)?
                    .with_inter_threads(num_threads)?
                    .commit_from_file(path)
            })();
            match accelerated {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "execution providers failed, falling back to cpu");
                    SessionBuilder::new()?
                        .with_optimization_level(GraphOptimizationLevel::Level3)?
                        .with_intra_threads(num_threads)?
                        .with_inter_threads(num_threads)?
                        .with_parallel_execution(true)?
                        .commit_from_file(path)?
                }
            }
        };
        info!(model = %manifest.name, path = %path.display(), "onnx session ready");
        Ok(Self {
            manifest,
            session: Mutex::new(session),
        })
    }
}

impl SourceModel for OnnxModel {
    fn samplerate(&self) -> u32 {
        self.manifest.sample_rate
    }

    fn audio_channels(&self) -> usize {
        self.manifest.channels
    }

    fn sources(&self) -> &[String] {
        &self.manifest.sources
    }

    fn segment(&self) -> f64 {
        if let Some(segment) = self.manifest.segment {
            return segment;
        }
        if self.manifest.window > 0 {
            return self.manifest.window as f64 / self.manifest.sample_rate as f64;
        }
        10.0
    }

    fn valid_length(&self, length: usize) -> usize {
        if self.manifest.window > 0 {
            length.max(self.manifest.window)
        } else {
            length
        }
    }

    fn forward(&self, mix: ArrayView3<'_, f32>, _device: &str) -> Result<Array4<f32>> {
        let (batch, channels, frames) = mix.dim();
        let data: Vec<f32> = mix.as_standard_layout().iter().copied().collect();
        let value: Value =
            Tensor::from_array((vec![batch, channels, frames], data))?.into_dyn();

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("onnx session poisoned"))?;

        let input_name = if self.manifest.input_name.is_empty() {
            session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .ok_or_else(|| anyhow!("model has no inputs"))?
        } else {
            self.manifest.input_name.clone()
        };
        let output_name = if self.manifest.output_name.is_empty() {
            session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| anyhow!("model has no outputs"))?
        } else {
            self.manifest.output_name.clone()
        };

        let outputs = session.run(vec![(input_name, value)])?;
        let out = outputs
            .into_iter()
            .find(|(name, _)| *name == output_name)
            .map(|(_, v)| v)
            .ok_or_else(|| anyhow!("model did not return '{output_name}'"))?;

        let (shape, data) = out.try_extract_tensor::<f32>()?;
        if shape.len() != 4 {
            return Err(anyhow!("expected rank-4 output, got shape {shape:?}").into());
        }
        let dims = (
            shape[0] as usize,
            shape[1] as usize,
            shape[2] as usize,
            shape[3] as usize,
        );
        if dims.0 != batch || dims.2 != channels || dims.3 != frames {
            return Err(anyhow!(
                "output shape {shape:?} does not match input ({batch}, _, {channels}, {frames})"
            )
            .into());
        }
        Ok(Array4::from_shape_vec(dims, data.to_vec())?)
    }
}
