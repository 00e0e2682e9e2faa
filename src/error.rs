use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Model name could not be resolved against the registry.
    #[error("failed to load model '{0}'")]
    ModelLoad(String),

    /// Every decode backend failed. The message carries one line per backend,
    /// in attempt order, so a missing tool can be told apart from a bad file.
    #[error("could not load audio:\n{0}")]
    AudioLoad(String),

    /// Output path has a suffix no encoder is registered for.
    #[error("invalid suffix for path: {0}")]
    UnsupportedFormat(String),

    /// A local registry path was supplied but is not a directory.
    #[error("{} must exist and be a directory", .0.display())]
    RegistryDirectory(PathBuf),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("checksum mismatch for {path}")]
    Checksum { path: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Ort(#[from] ort::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
