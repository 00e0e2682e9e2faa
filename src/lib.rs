mod error;
mod types;

pub mod core {
    pub mod apply;
    pub mod audio;
    pub mod encoder;
    pub mod separator;
}

pub mod model {
    pub mod catalog;
    pub mod loader;
}

pub mod io {
    pub mod crypto;
    pub mod net;
    pub mod paths;
}

// Public API
pub use crate::core::apply::{apply_model, ModelHandle, SourceModel};
pub use crate::core::audio::{convert_audio, load_audio};
pub use crate::core::encoder::{prevent_clip, save_audio, ClipMode, SaveOptions};
pub use crate::core::separator::{SeparationResult, Separator};
pub use crate::error::{Error, Result};
pub use crate::model::catalog::{list_models, ModelList};
pub use crate::model::loader::{load_model, OnnxModel};
pub use crate::types::{
    ConfigUpdate, ModelManifest, ProgressCallback, ProgressEvent, ProgressState, SeparationConfig,
};
