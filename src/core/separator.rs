//! Separation orchestrator: load audio, normalize, run the model, invert
//! the normalization and pair each output with its source name.

use std::fmt;
use std::path::Path;

use ndarray::{Array2, Axis};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::apply::{apply_model, ModelHandle};
use crate::core::audio::load_audio;
use crate::error::{Error, Result};
use crate::model::loader::load_model;
use crate::types::{ConfigUpdate, SeparationConfig};

/// Outcome of one separation call: the waveform that went in and one
/// waveform per source, ordered the way the model declares its sources.
pub struct SeparationResult {
    pub input: Array2<f32>,
    pub sources: Vec<(String, Array2<f32>)>,
}

impl fmt::Debug for SeparationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeparationResult")
            .field("input", &self.input.dim())
            .field(
                "sources",
                &self
                    .sources
                    .iter()
                    .map(|(name, wav)| (name.as_str(), wav.dim()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Owns a loaded model and the execution configuration applied to every
/// separation it performs.
///
/// Separation calls block until done. An instance is single-owner: run one
/// separation at a time per instance, and do not reconfigure it from another
/// thread while a call is in flight. Internal parallelism is controlled by
/// `jobs` in the configuration, not by sharing the instance.
pub struct Separator {
    model: ModelHandle,
    config: SeparationConfig,
}

// Hand-written: the model is a dyn trait and the config holds a callback.
impl fmt::Debug for Separator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Separator")
            .field("model", &self.model.name())
            .field("samplerate", &self.model.samplerate())
            .field("audio_channels", &self.model.audio_channels())
            .field("sources", &self.model.sources())
            .finish_non_exhaustive()
    }
}

impl Separator {
    /// Resolve `model` through the catalog and build an orchestrator around
    /// it. `repo` points at a local registry directory; `None` uses the
    /// remote one.
    pub fn new(model: &str, repo: Option<&Path>, update: ConfigUpdate) -> Result<Self> {
        let handle =
            load_model(model, repo)?.ok_or_else(|| Error::ModelLoad(model.to_string()))?;
        info!(model = handle.name(), sources = ?handle.sources(), "model loaded");
        Ok(Self::with_model(handle, update))
    }

    /// Build an orchestrator around an already-constructed model handle.
    pub fn with_model(model: ModelHandle, update: ConfigUpdate) -> Self {
        let mut config = SeparationConfig::default();
        config.update(update);
        Self { model, config }
    }

    /// Merge non-empty fields of `update` into the current configuration.
    /// No cross-field checks are made.
    pub fn update_config(&mut self, update: ConfigUpdate) {
        self.config.update(update);
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn config(&self) -> &SeparationConfig {
        &self.config
    }

    pub fn samplerate(&self) -> u32 {
        self.model.samplerate()
    }

    pub fn audio_channels(&self) -> usize {
        self.model.audio_channels()
    }

    pub fn sources(&self) -> &[String] {
        self.model.sources()
    }

    /// Separate an in-memory waveform of shape `(channels, frames)` already
    /// at the model's sample rate and channel count.
    ///
    /// The level statistics are taken from the channel-averaged signal, one
    /// mean and one standard deviation for the whole buffer. They are not
    /// per-channel: the model sees the original channel balance and only the
    /// gross level is normalized out.
    pub fn separate(&self, wav: &Array2<f32>) -> Result<SeparationResult> {
        let (_, frames) = wav.dim();
        let reference = wav.mean_axis(Axis(0)).ok_or_else(|| {
            Error::from(anyhow::anyhow!("cannot separate a zero-channel waveform"))
        })?;
        let mean = reference.mean().unwrap_or(0.0);
        let std = reference.std(1.0);
        let normalized = (wav - mean) / std;
        debug!(frames, mean, std, "normalized input");

        let mut context = self.config.callback_arg.clone();
        context.insert("audio_length".into(), Value::from(frames as u64));

        let batched = normalized.insert_axis(Axis(0));
        let out = apply_model(&self.model, &batched, &self.config, &context)?;

        let sources = self
            .model
            .sources()
            .iter()
            .enumerate()
            .map(|(k, name)| {
                let stem = out.index_axis(Axis(0), 0).index_axis(Axis(0), k).to_owned();
                (name.clone(), stem * std + mean)
            })
            .collect();
        Ok(SeparationResult {
            input: wav.clone(),
            sources,
        })
    }

    /// Load `path` at the model's rate and channel count, then separate it.
    pub fn separate_file(&self, path: &Path) -> Result<SeparationResult> {
        let wav = load_audio(path, self.model.samplerate(), self.model.audio_channels())?;
        self.separate(&wav)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use approx::assert_abs_diff_eq;
    use ndarray::{Array4, ArrayView3, Axis};

    use crate::core::apply::SourceModel;

    /// Copies the mix into each source, optionally scaled.
    struct GainModel {
        sources: Vec<String>,
        gain: f32,
    }

    impl GainModel {
        fn new(sources: &[&str], gain: f32) -> Arc<Self> {
            Arc::new(Self {
                sources: sources.iter().map(|s| s.to_string()).collect(),
                gain,
            })
        }
    }

    impl SourceModel for GainModel {
        fn samplerate(&self) -> u32 {
            44100
        }
        fn audio_channels(&self) -> usize {
            2
        }
        fn sources(&self) -> &[String] {
            &self.sources
        }
        fn segment(&self) -> f64 {
            10.0
        }
        fn forward(&self, mix: ArrayView3<'_, f32>, _device: &str) -> crate::error::Result<Array4<f32>> {
            let (batch, channels, frames) = mix.dim();
            let mut out = Array4::zeros((batch, self.sources.len(), channels, frames));
            for k in 0..self.sources.len() {
                out.slice_mut(ndarray::s![.., k, .., ..])
                    .assign(&(&mix * self.gain));
            }
            Ok(out)
        }
    }

    fn test_wav() -> Array2<f32> {
        Array2::from_shape_fn((2, 2000), |(c, t)| {
            ((t as f32 / 17.0).sin() + c as f32 * 0.25) * 0.6
        })
    }

    fn quick_config() -> ConfigUpdate {
        ConfigUpdate {
            shifts: Some(0),
            split: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn identity_model_roundtrips_through_normalization() {
        let sep = Separator::with_model(
            ModelHandle::single("id", GainModel::new(&["vocals", "other"], 1.0)),
            quick_config(),
        );
        let wav = test_wav();
        let result = sep.separate(&wav).unwrap();
        assert_eq!(result.sources.len(), 2);
        for (_, stem) in &result.sources {
            for (a, b) in stem.iter().zip(wav.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn result_carries_original_input() {
        let sep = Separator::with_model(
            ModelHandle::single("id", GainModel::new(&["vocals"], 1.0)),
            quick_config(),
        );
        let wav = test_wav();
        let result = sep.separate(&wav).unwrap();
        assert_eq!(result.input, wav);
    }

    #[test]
    fn gain_model_output_matches_manual_denormalization() {
        let gain = 3.0f32;
        let sep = Separator::with_model(
            ModelHandle::single("x3", GainModel::new(&["drums"], gain)),
            quick_config(),
        );
        let wav = test_wav();
        let result = sep.separate(&wav).unwrap();

        let reference = wav.mean_axis(Axis(0)).unwrap();
        let mean = reference.mean().unwrap();
        let std = reference.std(1.0);
        let expected = (&wav - mean) / std * gain * std + mean;
        let (_, stem) = &result.sources[0];
        for (a, b) in stem.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
    }

    #[test]
    fn sources_follow_model_declaration_order() {
        let sep = Separator::with_model(
            ModelHandle::single(
                "four",
                GainModel::new(&["drums", "bass", "other", "vocals"], 1.0),
            ),
            quick_config(),
        );
        let result = sep.separate(&test_wav()).unwrap();
        let names: Vec<&str> = result.sources.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["drums", "bass", "other", "vocals"]);
    }

    #[test]
    fn update_config_merges_partially() {
        let mut sep = Separator::with_model(
            ModelHandle::single("id", GainModel::new(&["vocals"], 1.0)),
            ConfigUpdate::default(),
        );
        sep.update_config(ConfigUpdate {
            shifts: Some(4),
            ..Default::default()
        });
        assert_eq!(sep.config().shifts, 4);
        assert_eq!(sep.config().overlap, 0.25);
    }

    #[test]
    fn separator_and_result_are_debuggable() {
        let sep = Separator::with_model(
            ModelHandle::single("id", GainModel::new(&["vocals", "other"], 1.0)),
            quick_config(),
        );
        let rendered = format!("{sep:?}");
        assert!(rendered.contains("\"id\""));
        assert!(rendered.contains("vocals"));

        let result = sep.separate(&test_wav()).unwrap();
        let rendered = format!("{result:?}");
        assert!(rendered.contains("(2, 2000)"));
        assert!(rendered.contains("other"));
    }

    #[test]
    fn unknown_model_name_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let err = Separator::new("ghost", Some(dir.path()), ConfigUpdate::default()).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(name) if name == "ghost"));
    }

    #[test]
    fn callback_context_receives_audio_length() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sep = Separator::with_model(
            ModelHandle::single("id", GainModel::new(&["vocals"], 1.0)),
            ConfigUpdate {
                shifts: Some(0),
                split: Some(false),
                callback: Some(Arc::new(move |payload| {
                    if let Some(v) = payload.get("audio_length").and_then(Value::as_u64) {
                        sink.lock().unwrap().push(v);
                    }
                })),
                ..Default::default()
            },
        );
        sep.separate(&test_wav()).unwrap();
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&v| v == 2000));
    }
}
