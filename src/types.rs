use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handler invoked at chunk boundaries during model application.
///
/// Receives a single key-value structure: the caller's `callback_arg`
/// merged with the live progress fields of [`ProgressEvent`]. Progress
/// fields win on key collision. May be called from worker threads when
/// `jobs > 0`, and invocations are not serialized.
pub type ProgressCallback = Arc<dyn Fn(Map<String, Value>) + Send + Sync>;

/// Lifecycle state of a unit of model work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    Start,
    End,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressState::Start => "start",
            ProgressState::End => "end",
        }
    }
}

/// Closed progress schema emitted around every leaf model application.
///
/// All six fields are present on every callback invocation. Offsets and
/// lengths are in sample frames, not seconds.
#[derive(Clone, Copy, Debug)]
pub struct ProgressEvent {
    /// Index of the submodel inside a bag, 0-based. 0 for single models.
    pub model_idx_in_bag: usize,
    /// Index of the current time shift, 0-based.
    pub shift_idx: usize,
    /// Offset of the current segment in sample frames.
    pub segment_offset: usize,
    pub state: ProgressState,
    /// Total length of the audio being separated, in sample frames.
    pub audio_length: usize,
    /// Number of submodels in the model.
    pub models: usize,
}

impl ProgressEvent {
    /// Merge this event into a caller-supplied context bag. Event fields
    /// overwrite context entries of the same name.
    pub fn merge_into(&self, context: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = context.clone();
        merged.insert(
            "model_idx_in_bag".into(),
            Value::from(self.model_idx_in_bag as u64),
        );
        merged.insert("shift_idx".into(), Value::from(self.shift_idx as u64));
        merged.insert(
            "segment_offset".into(),
            Value::from(self.segment_offset as u64),
        );
        merged.insert("state".into(), Value::from(self.state.as_str()));
        merged.insert("audio_length".into(), Value::from(self.audio_length as u64));
        merged.insert("models".into(), Value::from(self.models as u64));
        merged
    }
}

/// Execution parameters for a separation run.
///
/// Fields are never cross-validated: `split = false` with a `segment` set is
/// accepted and the segment is simply ignored downstream.
#[derive(Clone)]
pub struct SeparationConfig {
    /// Device identifier forwarded verbatim to the model backend.
    pub device: String,
    /// Number of random time shifts to average over. 0 disables shifting.
    pub shifts: u32,
    /// Overlap fraction between split segments, `0 <= overlap < 1`.
    pub overlap: f64,
    /// Break the input into segments instead of one whole-signal pass.
    pub split: bool,
    /// Segment length in seconds. `None` falls back to the model's own.
    pub segment: Option<f64>,
    /// Worker count for parallel chunk application. 0 means sequential.
    pub jobs: usize,
    /// Log per-chunk completion.
    pub progress: bool,
    pub callback: Option<ProgressCallback>,
    /// Caller-owned bag merged into every callback payload.
    pub callback_arg: Map<String, Value>,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            device: "cpu".into(),
            shifts: 1,
            overlap: 0.25,
            split: true,
            segment: None,
            jobs: 0,
            progress: false,
            callback: None,
            callback_arg: Map::new(),
        }
    }
}

impl SeparationConfig {
    /// Partial update: only fields the update actually carries change,
    /// everything else keeps its prior value.
    pub fn update(&mut self, update: ConfigUpdate) {
        if let Some(device) = update.device {
            self.device = device;
        }
        if let Some(shifts) = update.shifts {
            self.shifts = shifts;
        }
        if let Some(overlap) = update.overlap {
            self.overlap = overlap;
        }
        if let Some(split) = update.split {
            self.split = split;
        }
        if let Some(segment) = update.segment {
            self.segment = Some(segment);
        }
        if let Some(jobs) = update.jobs {
            self.jobs = jobs;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(callback) = update.callback {
            self.callback = Some(callback);
        }
        if let Some(callback_arg) = update.callback_arg {
            self.callback_arg = callback_arg;
        }
    }
}

/// All-optional form of [`SeparationConfig`] used at the update boundary.
#[derive(Clone, Default)]
pub struct ConfigUpdate {
    pub device: Option<String>,
    pub shifts: Option<u32>,
    pub overlap: Option<f64>,
    pub split: Option<bool>,
    pub segment: Option<f64>,
    pub jobs: Option<usize>,
    pub progress: Option<bool>,
    pub callback: Option<ProgressCallback>,
    pub callback_arg: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Artifact {
    pub file: String,
    pub sha256: String,
    #[serde(alias = "size_bytes")]
    pub size_bytes: u64,
    pub url: String,
}

/// Registry metadata describing one model, single or bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,

    #[serde(alias = "sample_rate_hz")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: usize,

    #[serde(default)]
    pub sources: Vec<String>,

    /// Fixed input window in sample frames. 0 means the model accepts any
    /// length.
    #[serde(default)]
    pub window: usize,
    /// Default segment length in seconds when splitting.
    #[serde(default)]
    pub segment: Option<f64>,

    /// Tensor names for the ONNX session. Empty falls back to positional.
    #[serde(default)]
    pub input_name: String,
    #[serde(default)]
    pub output_name: String,

    /// Submodel names; non-empty marks this manifest as a bag.
    #[serde(default)]
    pub models: Vec<String>,
    /// Per-submodel, per-source averaging weights. Empty means all ones.
    #[serde(default)]
    pub weights: Vec<Vec<f64>>,

    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub entry: String,

    // Legacy single-artifact form.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub filesize: u64,
}

fn default_channels() -> usize {
    2
}

#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub file: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub url: String,
}

impl ModelManifest {
    pub fn is_bag(&self) -> bool {
        !self.models.is_empty()
    }

    /// Pick the artifact to download: the `entry` when several are listed,
    /// the sole artifact otherwise, or the legacy url/sha256/filesize trio.
    pub fn resolve_primary_artifact(&self) -> Result<ResolvedArtifact, String> {
        if !self.artifacts.is_empty() {
            if !self.entry.is_empty() {
                if let Some(a) = self.artifacts.iter().find(|a| a.file == self.entry) {
                    return Ok(ResolvedArtifact {
                        file: a.file.clone(),
                        sha256: a.sha256.clone(),
                        size_bytes: a.size_bytes,
                        url: a.url.clone(),
                    });
                }
                return Err(format!("entry '{}' not found in artifacts[]", self.entry));
            }
            if self.artifacts.len() == 1 {
                let a = &self.artifacts[0];
                return Ok(ResolvedArtifact {
                    file: a.file.clone(),
                    sha256: a.sha256.clone(),
                    size_bytes: a.size_bytes,
                    url: a.url.clone(),
                });
            }
            return Err("multiple artifacts present but no 'entry' specified".into());
        }

        if self.url.is_empty() || self.sha256.is_empty() || self.filesize == 0 {
            return Err("manifest missing artifacts and legacy url/sha256/filesize".into());
        }
        let file = infer_filename_from_url(&self.url)
            .unwrap_or_else(|| format!("{}-{}.bin", self.name, &self.sha256[..8]));
        Ok(ResolvedArtifact {
            file,
            sha256: self.sha256.clone(),
            size_bytes: self.filesize,
            url: self.url.clone(),
        })
    }
}

fn infer_filename_from_url(url: &str) -> Option<String> {
    url.rsplit('/').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_documented_baselines() {
        let cfg = SeparationConfig::default();
        assert_eq!(cfg.device, "cpu");
        assert_eq!(cfg.shifts, 1);
        assert_eq!(cfg.overlap, 0.25);
        assert!(cfg.split);
        assert_eq!(cfg.segment, None);
        assert_eq!(cfg.jobs, 0);
        assert!(!cfg.progress);
        assert!(cfg.callback.is_none());
        assert!(cfg.callback_arg.is_empty());
    }

    #[test]
    fn partial_update_only_touches_supplied_fields() {
        let mut cfg = SeparationConfig::default();
        cfg.update(ConfigUpdate {
            overlap: Some(0.5),
            ..Default::default()
        });
        assert_eq!(cfg.overlap, 0.5);
        // everything else untouched
        assert_eq!(cfg.device, "cpu");
        assert_eq!(cfg.shifts, 1);
        assert!(cfg.split);
        assert_eq!(cfg.segment, None);
        assert_eq!(cfg.jobs, 0);
    }

    #[test]
    fn inconsistent_combinations_are_accepted() {
        let mut cfg = SeparationConfig::default();
        cfg.update(ConfigUpdate {
            split: Some(false),
            segment: Some(10.0),
            ..Default::default()
        });
        assert!(!cfg.split);
        assert_eq!(cfg.segment, Some(10.0));
    }

    #[test]
    fn progress_fields_win_on_collision() {
        let mut ctx = Map::new();
        ctx.insert("shift_idx".into(), Value::from("mine"));
        ctx.insert("track".into(), Value::from("song.wav"));
        let event = ProgressEvent {
            model_idx_in_bag: 2,
            shift_idx: 1,
            segment_offset: 44100,
            state: ProgressState::End,
            audio_length: 882000,
            models: 4,
        };
        let merged = event.merge_into(&ctx);
        assert_eq!(merged["shift_idx"], Value::from(1u64));
        assert_eq!(merged["track"], Value::from("song.wav"));
        assert_eq!(merged["state"], Value::from("end"));
        assert_eq!(merged["audio_length"], Value::from(882000u64));
        assert_eq!(merged["models"], Value::from(4u64));
    }

    #[test]
    fn manifest_entry_selects_artifact() {
        let mf = ModelManifest {
            name: "m".into(),
            version: String::new(),
            sample_rate: 44100,
            channels: 2,
            sources: vec![],
            window: 0,
            segment: None,
            input_name: String::new(),
            output_name: String::new(),
            models: vec![],
            weights: vec![],
            artifacts: vec![
                Artifact {
                    file: "a.onnx".into(),
                    sha256: "00".repeat(32),
                    size_bytes: 1,
                    url: "http://x/a.onnx".into(),
                },
                Artifact {
                    file: "b.onnx".into(),
                    sha256: "11".repeat(32),
                    size_bytes: 2,
                    url: "http://x/b.onnx".into(),
                },
            ],
            entry: "b.onnx".into(),
            url: String::new(),
            sha256: String::new(),
            filesize: 0,
        };
        let a = mf.resolve_primary_artifact().unwrap();
        assert_eq!(a.file, "b.onnx");
        assert_eq!(a.size_bytes, 2);
    }
}
