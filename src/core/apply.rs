//! Model application strategy: shift averaging, chunked split-apply with
//! overlapped reassembly, weighted bag averaging and the progress protocol.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use ndarray::{s, Array1, Array3, Array4, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::info;

use crate::{
    error::Result,
    types::{ProgressEvent, ProgressState, SeparationConfig},
};

/// A separation model as the orchestrator sees it.
///
/// Implementations must be callable from worker threads when `jobs > 0`.
pub trait SourceModel: Send + Sync {
    fn samplerate(&self) -> u32;

    fn audio_channels(&self) -> usize;

    /// Ordered source names. Output tensors map positionally onto this list.
    fn sources(&self) -> &[String];

    /// Default segment length in seconds used when splitting.
    fn segment(&self) -> f64;

    /// Smallest input length `>= length` the model can process. Inputs are
    /// zero-padded up to this before [`SourceModel::forward`].
    fn valid_length(&self, length: usize) -> usize {
        length
    }

    /// Run the model on `(batch, channels, frames)`, returning
    /// `(batch, sources, channels, frames)`. `device` is forwarded verbatim
    /// from the configuration.
    fn forward(&self, mix: ArrayView3<'_, f32>, device: &str) -> Result<Array4<f32>>;
}

/// A loaded model: a single [`SourceModel`] or a weighted bag of them.
///
/// Immutable once constructed. Sample rate, channel count and source order
/// are shared by every submodel.
#[derive(Clone)]
pub struct ModelHandle {
    name: String,
    samplerate: u32,
    audio_channels: usize,
    sources: Vec<String>,
    submodels: Vec<Arc<dyn SourceModel>>,
    weights: Vec<Vec<f64>>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("samplerate", &self.samplerate)
            .field("audio_channels", &self.audio_channels)
            .field("sources", &self.sources)
            .field("submodels", &self.submodels.len())
            .field("weights", &self.weights)
            .finish()
    }
}

impl ModelHandle {
    pub fn single(name: impl Into<String>, model: Arc<dyn SourceModel>) -> Self {
        let sources = model.sources().to_vec();
        let weights = vec![vec![1.0; sources.len()]];
        Self {
            name: name.into(),
            samplerate: model.samplerate(),
            audio_channels: model.audio_channels(),
            sources,
            submodels: vec![model],
            weights,
        }
    }

    /// Compose submodels into a bag whose outputs are averaged with
    /// per-source weights. `None` weighs every submodel equally.
    pub fn bag(
        name: impl Into<String>,
        models: Vec<Arc<dyn SourceModel>>,
        weights: Option<Vec<Vec<f64>>>,
    ) -> Result<Self> {
        let first = models
            .first()
            .ok_or_else(|| anyhow!("a bag needs at least one submodel"))?
            .clone();
        let sources = first.sources().to_vec();
        for m in &models[1..] {
            if m.samplerate() != first.samplerate()
                || m.audio_channels() != first.audio_channels()
                || m.sources() != sources.as_slice()
            {
                return Err(anyhow!("submodels of a bag must agree on rate, channels and sources").into());
            }
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != models.len() || w.iter().any(|ws| ws.len() != sources.len()) {
                    return Err(anyhow!(
                        "weights must be one list per submodel with one entry per source"
                    )
                    .into());
                }
                w
            }
            None => vec![vec![1.0; sources.len()]; models.len()],
        };
        Ok(Self {
            name: name.into(),
            samplerate: first.samplerate(),
            audio_channels: first.audio_channels(),
            sources,
            submodels: models,
            weights,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn audio_channels(&self) -> usize {
        self.audio_channels
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn submodels(&self) -> &[Arc<dyn SourceModel>] {
        &self.submodels
    }

    pub fn weights(&self) -> &[Vec<f64>] {
        &self.weights
    }
}

/// A window into the last axis of a tensor that can be zero-padded on
/// demand instead of materializing every chunk.
pub(crate) struct TensorChunk<'a> {
    tensor: &'a Array3<f32>,
    offset: usize,
    length: usize,
}

impl<'a> TensorChunk<'a> {
    pub fn new(tensor: &'a Array3<f32>) -> Self {
        let length = tensor.len_of(Axis(2));
        Self {
            tensor,
            offset: 0,
            length,
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// `(batch, channels, frames)` of the window itself.
    pub fn dim(&self) -> (usize, usize, usize) {
        let (batch, channels, _) = self.tensor.dim();
        (batch, channels, self.length)
    }

    /// Narrow to `length` frames starting at `offset` (relative to this
    /// chunk). The result is clamped to the chunk's end.
    pub fn sub(&self, offset: usize, length: usize) -> TensorChunk<'a> {
        debug_assert!(offset < self.length);
        TensorChunk {
            tensor: self.tensor,
            offset: self.offset + offset,
            length: length.min(self.length - offset),
        }
    }

    /// Materialize `target_length` frames centered on this chunk, reading
    /// neighboring frames from the underlying tensor where they exist and
    /// zero-filling past its edges.
    pub fn padded(&self, target_length: usize) -> Array3<f32> {
        debug_assert!(target_length >= self.length);
        let delta = target_length - self.length;
        let total = self.tensor.len_of(Axis(2));
        let start = self.offset as isize - (delta / 2) as isize;
        let end = start + target_length as isize;
        let correct_start = start.max(0) as usize;
        let correct_end = end.min(total as isize) as usize;
        let pad_left = (correct_start as isize - start) as usize;

        let (batch, channels, _) = self.tensor.dim();
        let mut out = Array3::zeros((batch, channels, target_length));
        let copied = correct_end - correct_start;
        out.slice_mut(s![.., .., pad_left..pad_left + copied])
            .assign(&self.tensor.slice(s![.., .., correct_start..correct_end]));
        out
    }
}

/// Trim the last axis down to `reference` frames, removing equally from
/// both ends.
pub(crate) fn center_trim(tensor: &Array4<f32>, reference: usize) -> Result<Array4<f32>> {
    let length = tensor.len_of(Axis(3));
    if length < reference {
        return Err(anyhow!("tensor of length {length} cannot be trimmed to {reference}").into());
    }
    let delta = length - reference;
    Ok(tensor
        .slice(s![.., .., .., delta / 2..delta / 2 + reference])
        .to_owned())
}

/// Apply a model to a batched mix under the given execution configuration.
///
/// `mix` is `(batch, channels, frames)`, already normalized by the caller;
/// the result is `(batch, sources, channels, frames)` with the same frame
/// count. `callback_arg` is the caller's context bag; the contract expects
/// it to be pre-seeded with `audio_length`. One `start` and one matching
/// `end` event fire per leaf unit of work.
pub fn apply_model(
    model: &ModelHandle,
    mix: &Array3<f32>,
    config: &SeparationConfig,
    callback_arg: &Map<String, Value>,
) -> Result<Array4<f32>> {
    let (batch, channels, length) = mix.dim();
    if length == 0 {
        return Err(anyhow!("empty audio").into());
    }
    let n_sources = model.sources().len();
    let event = ProgressEvent {
        model_idx_in_bag: 0,
        shift_idx: 0,
        segment_offset: 0,
        state: ProgressState::Start,
        audio_length: length,
        models: model.submodels().len(),
    };

    let mut estimates = Array4::<f32>::zeros((batch, n_sources, channels, length));
    let mut totals = vec![0f64; n_sources];
    for (idx, sub) in model.submodels().iter().enumerate() {
        let mut ev = event;
        ev.model_idx_in_bag = idx;
        let chunk = TensorChunk::new(mix);
        let mut out = apply_shifts(sub.as_ref(), &chunk, config, callback_arg, ev)?;
        for (k, &w) in model.weights()[idx].iter().enumerate() {
            out.slice_mut(s![.., k, .., ..]).mapv_inplace(|x| x * w as f32);
            totals[k] += w;
        }
        estimates += &out;
    }
    for (k, &total) in totals.iter().enumerate() {
        estimates
            .slice_mut(s![.., k, .., ..])
            .mapv_inplace(|x| x / total as f32);
    }
    Ok(estimates)
}

/// Shift branch: average `shifts` randomly time-shifted applications, each
/// shift inverted on its output. Shifts go up to half a second.
fn apply_shifts(
    model: &dyn SourceModel,
    chunk: &TensorChunk<'_>,
    config: &SeparationConfig,
    callback_arg: &Map<String, Value>,
    event: ProgressEvent,
) -> Result<Array4<f32>> {
    if config.shifts == 0 {
        return apply_split(model, chunk, config, callback_arg, event);
    }

    let length = chunk.length();
    let max_shift = (0.5 * model.samplerate() as f64) as usize;
    let padded = chunk.padded(length + 2 * max_shift);
    let padded_chunk = TensorChunk::new(&padded);

    let mut rng = rand::thread_rng();
    let mut out: Option<Array4<f32>> = None;
    for shift_idx in 0..config.shifts {
        let offset = rng.gen_range(0..=max_shift);
        let shifted = padded_chunk.sub(offset, length + max_shift - offset);
        let mut ev = event;
        ev.shift_idx = shift_idx as usize;
        let res = apply_split(model, &shifted, config, callback_arg, ev)?;
        let unshifted = res
            .slice(s![.., .., .., max_shift - offset..max_shift - offset + length])
            .to_owned();
        out = Some(match out {
            None => unshifted,
            Some(mut acc) => {
                acc += &unshifted;
                acc
            }
        });
    }
    let mut out = out.ok_or_else(|| anyhow!("shift averaging produced no output"))?;
    out /= config.shifts as f32;
    Ok(out)
}

/// Split branch: chunk the signal into overlapping segments, apply each
/// and overlap-add under a triangle weight so boundaries stay artifact-free.
fn apply_split(
    model: &dyn SourceModel,
    chunk: &TensorChunk<'_>,
    config: &SeparationConfig,
    callback_arg: &Map<String, Value>,
    event: ProgressEvent,
) -> Result<Array4<f32>> {
    if !config.split {
        return apply_direct(model, chunk, config, callback_arg, event);
    }

    let length = chunk.length();
    let segment_secs = config.segment.unwrap_or_else(|| model.segment());
    let segment_length = (model.samplerate() as f64 * segment_secs) as usize;
    if segment_length == 0 {
        return Err(anyhow!("segment of {segment_secs}s is empty at this sample rate").into());
    }
    let stride = ((1.0 - config.overlap) * segment_length as f64) as usize;
    let stride = stride.max(1);
    let weight = segment_weight(segment_length);
    let offsets: Vec<usize> = (0..length).step_by(stride).collect();
    let total_chunks = offsets.len();

    let run_chunk = |(i, offset): (usize, usize)| -> Result<(usize, Array4<f32>)> {
        let sub = chunk.sub(offset, segment_length);
        let mut ev = event;
        ev.segment_offset = offset;
        let out = apply_direct(model, &sub, config, callback_arg, ev)?;
        if config.progress {
            info!(chunk = i + 1, total = total_chunks, offset, "separated chunk");
        }
        Ok((offset, out))
    };

    let results: Vec<(usize, Array4<f32>)> = if config.jobs > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.jobs)
            .build()
            .map_err(anyhow::Error::from)?;
        pool.install(|| {
            offsets
                .par_iter()
                .copied()
                .enumerate()
                .map(run_chunk)
                .collect::<Result<Vec<_>>>()
        })?
    } else {
        offsets
            .iter()
            .copied()
            .enumerate()
            .map(run_chunk)
            .collect::<Result<Vec<_>>>()?
    };

    let (batch, channels, _) = chunk.dim();
    let n_sources = model.sources().len();
    let mut out = Array4::<f32>::zeros((batch, n_sources, channels, length));
    let mut sum_weight = Array1::<f32>::zeros(length);
    for (offset, chunk_out) in results {
        let chunk_length = chunk_out.len_of(Axis(3));
        let scaled = &chunk_out * &weight.slice(s![..chunk_length]);
        let mut dst = out.slice_mut(s![.., .., .., offset..offset + chunk_length]);
        dst += &scaled;
        let mut wdst = sum_weight.slice_mut(s![offset..offset + chunk_length]);
        wdst += &weight.slice(s![..chunk_length]);
    }
    out /= &sum_weight;
    Ok(out)
}

/// Leaf: pad to the model's valid length, run it once, trim back. This is
/// the unit of work the progress protocol brackets with start/end.
fn apply_direct(
    model: &dyn SourceModel,
    chunk: &TensorChunk<'_>,
    config: &SeparationConfig,
    callback_arg: &Map<String, Value>,
    event: ProgressEvent,
) -> Result<Array4<f32>> {
    let length = chunk.length();
    let valid = model.valid_length(length).max(length);
    let padded = chunk.padded(valid);
    emit(config, callback_arg, event, ProgressState::Start);
    let out = model.forward(padded.view(), &config.device)?;
    emit(config, callback_arg, event, ProgressState::End);
    center_trim(&out, length)
}

fn emit(
    config: &SeparationConfig,
    callback_arg: &Map<String, Value>,
    mut event: ProgressEvent,
    state: ProgressState,
) {
    if let Some(cb) = &config.callback {
        event.state = state;
        cb(event.merge_into(callback_arg));
    }
}

/// Triangle window, rising over the first half and falling over the
/// second, normalized to peak 1. Keeps the overlap-add partition smooth.
fn segment_weight(segment_length: usize) -> Array1<f32> {
    let half = segment_length / 2;
    let mut w = Vec::with_capacity(segment_length);
    for i in 1..=half {
        w.push(i as f32);
    }
    for i in (1..=segment_length - half).rev() {
        w.push(i as f32);
    }
    let max = w.iter().cloned().fold(f32::MIN, f32::max);
    Array1::from(w) / max
}
