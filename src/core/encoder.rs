//! Stem encoding: clip prevention followed by extension-driven dispatch to
//! WAV (hound), FLAC (libFLAC) or MP3 (LAME).

use std::mem::MaybeUninit;
use std::path::Path;
use std::str::FromStr;

use anyhow::anyhow;
use flac_bound::{FlacEncoder, WriteWrapper};
use mp3lame_encoder::{Builder, FlushNoGap, InterleavedPcm};
use ndarray::Array2;
use tracing::debug;

use crate::error::{Error, Result};

/// Strategy applied to a waveform before encoding so integer formats do not
/// wrap around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClipMode {
    /// Divide the whole buffer by its peak when the peak exceeds 1. Keeps
    /// relative dynamics, changes loudness.
    #[default]
    Rescale,
    /// Hard-limit every sample to [-1, 1].
    Clamp,
    /// Soft-saturate outliers with tanh.
    Tanh,
    /// Leave the buffer untouched; the encoder may clip.
    None,
}

impl FromStr for ClipMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rescale" => Ok(ClipMode::Rescale),
            "clamp" => Ok(ClipMode::Clamp),
            "tanh" => Ok(ClipMode::Tanh),
            "none" => Ok(ClipMode::None),
            other => Err(anyhow!("unknown clip mode '{other}'").into()),
        }
    }
}

/// Encoding parameters for [`save_audio`].
#[derive(Clone, Copy, Debug)]
pub struct SaveOptions {
    /// MP3 bitrate in kbps.
    pub bitrate: u32,
    pub clip: ClipMode,
    /// Bit depth for WAV and FLAC output: 16, 24 or 32.
    pub bits_per_sample: u16,
    /// Write WAV as 32-bit float, overriding `bits_per_sample`. Ignored for
    /// other formats.
    pub as_float: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            bitrate: 320,
            clip: ClipMode::Rescale,
            bits_per_sample: 16,
            as_float: false,
        }
    }
}

/// Apply a clipping-prevention strategy. Always runs before encoding.
pub fn prevent_clip(wav: &Array2<f32>, mode: ClipMode) -> Array2<f32> {
    match mode {
        ClipMode::Rescale => {
            let peak = wav.iter().fold(0f32, |m, &x| m.max(x.abs()));
            if peak > 1.0 {
                wav / peak
            } else {
                wav.clone()
            }
        }
        ClipMode::Clamp => wav.mapv(|x| x.clamp(-1.0, 1.0)),
        ClipMode::Tanh => wav.mapv(f32::tanh),
        ClipMode::None => wav.clone(),
    }
}

/// Persist a waveform, choosing the codec from the destination suffix
/// (case-insensitive): `.mp3`, `.wav` or `.flac`. Anything else fails with
/// [`Error::UnsupportedFormat`].
pub fn save_audio(wav: &Array2<f32>, path: &Path, samplerate: u32, opts: &SaveOptions) -> Result<()> {
    let wav = prevent_clip(wav, opts.clip);
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match suffix.as_str() {
        "mp3" => encode_mp3(&wav, path, samplerate, opts.bitrate),
        "wav" => {
            // The float override is the one place a requested bit depth is
            // silently replaced.
            let (bits, float) = if opts.as_float {
                (32, true)
            } else {
                (opts.bits_per_sample, false)
            };
            encode_wav(&wav, path, samplerate, bits, float)
        }
        "flac" => encode_flac(&wav, path, samplerate, opts.bits_per_sample),
        _ => Err(Error::UnsupportedFormat(format!(".{suffix}"))),
    }
}

fn encode_wav(wav: &Array2<f32>, path: &Path, samplerate: u32, bits: u16, float: bool) -> Result<()> {
    let (channels, frames) = wav.dim();
    let spec = hound::WavSpec {
        channels: channels as u16,
        sample_rate: samplerate,
        bits_per_sample: bits,
        sample_format: if float {
            hound::SampleFormat::Float
        } else {
            hound::SampleFormat::Int
        },
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for t in 0..frames {
        for c in 0..channels {
            let x = wav[[c, t]];
            if float {
                writer.write_sample(x)?;
            } else {
                match bits {
                    16 => writer.write_sample((x.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?,
                    24 | 32 => {
                        let max = ((1i64 << (bits - 1)) - 1) as f32;
                        writer.write_sample((x.clamp(-1.0, 1.0) * max) as i32)?;
                    }
                    other => return Err(anyhow!("unsupported wav bit depth {other}").into()),
                }
            }
        }
    }
    writer.finalize()?;
    debug!(path = %path.display(), bits, float, "wrote wav");
    Ok(())
}

fn encode_flac(wav: &Array2<f32>, path: &Path, samplerate: u32, bits: u16) -> Result<()> {
    if !matches!(bits, 16 | 24) {
        return Err(anyhow!("flac supports 16 or 24 bits per sample, got {bits}").into());
    }
    let (channels, frames) = wav.dim();
    let scale = ((1i64 << (bits - 1)) - 1) as f32;
    let mut interleaved: Vec<i32> = Vec::with_capacity(frames * channels);
    for t in 0..frames {
        for c in 0..channels {
            interleaved.push((wav[[c, t]].clamp(-1.0, 1.0) * scale) as i32);
        }
    }

    let mut file = std::fs::File::create(path)?;
    let mut sink = WriteWrapper(&mut file);
    let mut encoder = FlacEncoder::new()
        .ok_or_else(|| anyhow!("could not allocate FLAC encoder"))?
        .channels(channels as u32)
        .bits_per_sample(bits as u32)
        .sample_rate(samplerate)
        .compression_level(5)
        .init_write(&mut sink)
        .map_err(|e| anyhow!("FLAC encoder init failed: {e:?}"))?;
    encoder
        .process_interleaved(&interleaved, frames as u32)
        .map_err(|_| anyhow!("FLAC encoding failed"))?;
    if encoder.finish().is_err() {
        return Err(anyhow!("FLAC finalize failed").into());
    }
    debug!(path = %path.display(), bits, "wrote flac");
    Ok(())
}

fn encode_mp3(wav: &Array2<f32>, path: &Path, samplerate: u32, bitrate: u32) -> Result<()> {
    let (channels, frames) = wav.dim();
    if channels == 0 || channels > 2 {
        return Err(anyhow!("mp3 supports 1 or 2 channels, got {channels}").into());
    }

    let mut builder = Builder::new().ok_or_else(|| anyhow!("could not allocate LAME encoder"))?;
    builder
        .set_sample_rate(samplerate)
        .map_err(|e| anyhow!("invalid mp3 sample rate: {e:?}"))?;
    builder
        .set_num_channels(channels as u8)
        .map_err(|e| anyhow!("invalid mp3 channel count: {e:?}"))?;
    builder
        .set_brate(nearest_bitrate(bitrate))
        .map_err(|e| anyhow!("invalid mp3 bitrate: {e:?}"))?;
    builder
        .set_quality(mp3lame_encoder::Quality::Best)
        .map_err(|e| anyhow!("failed to set mp3 quality: {e:?}"))?;
    let mut encoder = builder
        .build()
        .map_err(|e| anyhow!("failed to build mp3 encoder: {e:?}"))?;

    let mut interleaved: Vec<i16> = Vec::with_capacity(frames * channels);
    for t in 0..frames {
        for c in 0..channels {
            interleaved.push((wav[[c, t]].clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
        }
    }

    // LAME worst case: 1.25x the sample count plus 7200 bytes.
    let max_size = (frames as f64 * 1.25) as usize + 7200;
    let mut buffer: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); max_size];
    let encoded = encoder
        .encode(InterleavedPcm(&interleaved), &mut buffer)
        .map_err(|e| anyhow!("mp3 encoding failed: {e:?}"))?;
    let flushed = encoder
        .flush::<FlushNoGap>(&mut buffer[encoded..])
        .map_err(|e| anyhow!("mp3 flush failed: {e:?}"))?;
    let total = encoded + flushed;

    // The encoder initialized buffer[..total].
    let bytes: Vec<u8> = buffer[..total]
        .iter()
        .map(|b| unsafe { b.assume_init() })
        .collect();
    std::fs::write(path, &bytes)?;
    debug!(path = %path.display(), bitrate, bytes = total, "wrote mp3");
    Ok(())
}

fn nearest_bitrate(kbps: u32) -> mp3lame_encoder::Bitrate {
    use mp3lame_encoder::Bitrate;
    match kbps {
        0..=96 => Bitrate::Kbps96,
        97..=112 => Bitrate::Kbps112,
        113..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=224 => Bitrate::Kbps224,
        225..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}
