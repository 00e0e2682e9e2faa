//! Audio loading: an ordered chain of decode backends with aggregated
//! diagnostics, plus sample-rate / channel-layout conversion.

use std::path::Path;

use anyhow::anyhow;
use ndarray::{s, Array2, Axis};
use rubato::{FftFixedInOut, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Frames per rubato processing block.
const RESAMPLE_CHUNK: usize = 1024;

/// Decode `path` into a planar `(channels, samples)` buffer at the target
/// sample rate and channel count.
///
/// Backends are tried in order: symphonia (containers and lossy codecs,
/// converts to the target format itself), then hound (plain WAV, followed by
/// an explicit conversion step). Per-backend failures are recorded rather
/// than propagated; only when every backend has failed does the call return
/// [`Error::AudioLoad`] carrying one labeled line per attempt.
pub fn load_audio(path: &Path, samplerate: u32, channels: usize) -> Result<Array2<f32>> {
    let mut errors: Vec<(&'static str, String)> = Vec::new();

    match decode_symphonia(path, samplerate, channels) {
        Ok(wav) => {
            debug!(path = %path.display(), backend = "symphonia", "decoded audio");
            return Ok(wav);
        }
        Err(err) => errors.push(("symphonia", err.to_string())),
    }

    match decode_wav(path) {
        Ok((wav, native_rate)) => {
            debug!(path = %path.display(), backend = "hound", "decoded audio");
            return convert_audio(wav, native_rate, samplerate, channels);
        }
        Err(err) => errors.push(("hound", err.to_string())),
    }

    Err(Error::AudioLoad(
        errors
            .iter()
            .map(|(backend, error)| {
                format!("When trying to load using {backend}, got the following error: {error}")
            })
            .collect::<Vec<_>>()
            .join("\n"),
    ))
}

/// Primary backend: symphonia probe + decode, then conversion to the target
/// rate and layout.
fn decode_symphonia(path: &Path, samplerate: u32, channels: usize) -> Result<Array2<f32>> {
    let file = std::fs::File::open(path).map_err(anyhow::Error::from)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| anyhow!("failed to probe format: {e}"))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("no audio tracks found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let (native_rate, native_channels) = declared_format(&codec_params)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("failed to create decoder: {e}"))?;

    let mut interleaved: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(anyhow!("failed to read packet: {e}").into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                trace!("skipping corrupted frame: {e}");
                continue;
            }
            Err(e) => return Err(anyhow!("decode error: {e}").into()),
        };
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buf.samples());
    }

    if interleaved.is_empty() {
        return Err(anyhow!("stream decoded to zero frames").into());
    }
    let wav = planar_from_interleaved(&interleaved, native_channels);
    convert_audio(wav, native_rate, samplerate, channels)
}

/// A stream that does not declare its rate or layout cannot be converted
/// reliably; fail into the aggregated diagnostic instead of guessing.
fn declared_format(params: &symphonia::core::codecs::CodecParameters) -> Result<(u32, usize)> {
    let rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("stream does not declare a sample rate"))?;
    let channels = params
        .channels
        .map(|c| c.count())
        .ok_or_else(|| anyhow!("stream does not declare a channel layout"))?;
    Ok((rate, channels))
}

/// Secondary backend: plain WAV via hound, returned at its native rate.
fn decode_wav(path: &Path) -> Result<(Array2<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };
    if interleaved.is_empty() {
        return Err(anyhow!("wav file holds zero frames").into());
    }
    let wav = planar_from_interleaved(&interleaved, spec.channels as usize);
    Ok((wav, spec.sample_rate))
}

fn planar_from_interleaved(samples: &[f32], channels: usize) -> Array2<f32> {
    let frames = samples.len() / channels;
    Array2::from_shape_fn((channels, frames), |(c, t)| samples[t * channels + c])
}

/// Remix channels then resample to the requested format.
///
/// Channel rules: identity when counts match; mean-downmix to mono;
/// duplicate a mono source up to any count; drop trailing channels when the
/// source has more than requested. A multi-channel source cannot be expanded.
pub fn convert_audio(
    wav: Array2<f32>,
    from_samplerate: u32,
    to_samplerate: u32,
    channels: usize,
) -> Result<Array2<f32>> {
    let wav = convert_channels(wav, channels)?;
    if from_samplerate == to_samplerate {
        return Ok(wav);
    }
    resample(&wav, from_samplerate, to_samplerate)
}

fn convert_channels(wav: Array2<f32>, channels: usize) -> Result<Array2<f32>> {
    let src = wav.len_of(Axis(0));
    if src == channels {
        Ok(wav)
    } else if channels == 1 {
        let mono = wav
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("audio buffer has no channels"))?;
        Ok(mono.insert_axis(Axis(0)))
    } else if src == 1 {
        let frames = wav.len_of(Axis(1));
        let mut out = Array2::zeros((channels, frames));
        for c in 0..channels {
            out.slice_mut(s![c, ..]).assign(&wav.slice(s![0, ..]));
        }
        Ok(out)
    } else if src >= channels {
        Ok(wav.slice(s![..channels, ..]).to_owned())
    } else {
        Err(anyhow!("the audio file has {src} channels but is not mono, cannot expand to {channels}").into())
    }
}

/// FFT resampler over fixed-size blocks, zero-padding the tail block and
/// trimming the output back to the exact expected frame count.
fn resample(wav: &Array2<f32>, from_rate: u32, to_rate: u32) -> Result<Array2<f32>> {
    let (channels, frames) = wav.dim();
    let mut resampler = FftFixedInOut::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        RESAMPLE_CHUNK,
        channels,
    )
    .map_err(anyhow::Error::from)?;

    let input_frames = resampler.input_frames_next();
    let ratio = to_rate as f64 / from_rate as f64;
    let target_frames = (frames as f64 * ratio).ceil() as usize;

    let mut out: Vec<Vec<f32>> = vec![Vec::with_capacity(target_frames + input_frames); channels];
    let mut pos = 0;
    while pos < frames {
        let end = (pos + input_frames).min(frames);
        let block: Vec<Vec<f32>> = (0..channels)
            .map(|c| {
                let mut v = wav.slice(s![c, pos..end]).to_vec();
                v.resize(input_frames, 0.0);
                v
            })
            .collect();
        let resampled = resampler
            .process(&block, None)
            .map_err(anyhow::Error::from)?;
        for (c, channel) in resampled.into_iter().enumerate() {
            out[c].extend(channel);
        }
        pos += input_frames;
    }

    let mut result = Array2::zeros((channels, target_frames));
    for (c, channel) in out.iter_mut().enumerate() {
        channel.resize(target_frames, 0.0);
        result
            .slice_mut(s![c, ..])
            .assign(&ndarray::ArrayView1::from(&channel[..]));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f32::consts::TAU;

    fn sine(channels: usize, frames: usize, rate: u32) -> Array2<f32> {
        Array2::from_shape_fn((channels, frames), |(c, t)| {
            (TAU * 440.0 * t as f32 / rate as f32).sin() * 0.5 / (c + 1) as f32
        })
    }

    fn write_wav_f32(path: &Path, wav: &Array2<f32>, rate: u32) {
        let (channels, frames) = wav.dim();
        let spec = hound::WavSpec {
            channels: channels as u16,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for t in 0..frames {
            for c in 0..channels {
                writer.write_sample(wav[[c, t]]).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn planar_conversion_deinterleaves() {
        let interleaved = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let planar = planar_from_interleaved(&interleaved, 2);
        assert_eq!(planar.slice(s![0, ..]).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(planar.slice(s![1, ..]).to_vec(), vec![-1.0, -2.0, -3.0]);
    }

    #[test]
    fn channels_downmix_to_mono_by_mean() {
        let wav = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let mono = convert_channels(wav, 1).unwrap();
        assert_eq!(mono.dim(), (1, 2));
        assert_abs_diff_eq!(mono[[0, 0]], 0.5);
        assert_abs_diff_eq!(mono[[0, 1]], 0.5);
    }

    #[test]
    fn mono_expands_by_duplication() {
        let wav = Array2::from_shape_vec((1, 3), vec![0.1, 0.2, 0.3]).unwrap();
        let stereo = convert_channels(wav, 2).unwrap();
        assert_eq!(stereo.dim(), (2, 3));
        assert_abs_diff_eq!(stereo[[0, 1]], stereo[[1, 1]]);
    }

    #[test]
    fn extra_channels_are_dropped() {
        let wav = Array2::zeros((4, 5));
        let stereo = convert_channels(wav, 2).unwrap();
        assert_eq!(stereo.dim(), (2, 5));
    }

    #[test]
    fn multichannel_cannot_expand() {
        let wav = Array2::zeros((2, 5));
        assert!(convert_channels(wav, 4).is_err());
    }

    #[test]
    fn resample_halves_frame_count() {
        let wav = sine(2, 4000, 8000);
        let out = resample(&wav, 8000, 4000).unwrap();
        assert_eq!(out.dim(), (2, 2000));
    }

    #[test]
    fn load_roundtrips_wav_at_native_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let wav = sine(2, 4410, 44100);
        write_wav_f32(&path, &wav, 44100);

        let loaded = load_audio(&path, 44100, 2).unwrap();
        assert_eq!(loaded.dim(), wav.dim());
        for (a, b) in loaded.iter().zip(wav.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn load_remixes_to_requested_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let wav = sine(1, 2000, 44100);
        write_wav_f32(&path, &wav, 44100);

        let loaded = load_audio(&path, 44100, 2).unwrap();
        assert_eq!(loaded.len_of(Axis(0)), 2);
    }

    #[test]
    fn undeclared_stream_format_is_rejected() {
        use symphonia::core::codecs::CodecParameters;

        let err = declared_format(&CodecParameters::new()).unwrap_err();
        assert!(err.to_string().contains("sample rate"));

        let mut params = CodecParameters::new();
        params.with_sample_rate(22050);
        let err = declared_format(&params).unwrap_err();
        assert!(err.to_string().contains("channel layout"));
    }

    #[test]
    fn load_failure_aggregates_backend_errors_in_order() {
        let err = load_audio(Path::new("/nonexistent/never.xyz"), 44100, 2).unwrap_err();
        let msg = err.to_string();
        let symphonia_at = msg.find("symphonia").expect("symphonia labeled");
        let hound_at = msg.find("hound").expect("hound labeled");
        assert!(symphonia_at < hound_at, "attempt order preserved");
        assert_eq!(msg.lines().count(), 3); // header + one line per backend
    }
}
