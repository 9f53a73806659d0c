//! Upload format validation and audio decoding.
//!
//! Workers decode stored uploads to 16 kHz mono PCM (`f32`). Raw PCM
//! containers are read in-process; compressed containers go through an
//! external `ffmpeg` invocation.

use std::fs;
use std::io::{Cursor, ErrorKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::process::{Command, Stdio};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use crate::error::AppError;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Declared input rates accepted for in-process decoding.
const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;

/// Container formats accepted by the HTTP surface.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AudioFormat {
    Wav,
    Webm,
}

impl AudioFormat {
    /// Parses a bare format name such as `"wav"`, case-insensitively.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(Self::Wav),
            "webm" => Ok(Self::Webm),
            _ => Err(AppError::invalid_request(
                "audio_format must be 'wav' or 'webm'",
                Some("invalid_audio_format"),
            )),
        }
    }

    /// Infers the format from an uploaded filename's extension.
    pub fn from_filename(filename: &str) -> Result<Self, AppError> {
        let lowered = filename.trim().to_ascii_lowercase();
        if lowered.ends_with(".wav") {
            Ok(Self::Wav)
        } else if lowered.ends_with(".webm") {
            Ok(Self::Webm)
        } else {
            Err(AppError::invalid_request(
                "Invalid file format. Only .wav or .webm supported.",
                Some("invalid_file_format"),
            ))
        }
    }

    /// Infers the format from a raw body content type, defaulting to WAV.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.to_ascii_lowercase().contains("audio/webm") {
            Self::Webm
        } else {
            Self::Wav
        }
    }

    /// File suffix used for the stored upload.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Wav => ".wav",
            Self::Webm => ".webm",
        }
    }
}

/// Decodes a stored upload, choosing the decoder from its extension.
pub fn load_audio(path: &Path, ffmpeg_bin: &str) -> Result<Vec<f32>, AppError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let samples = match extension.as_str() {
        "wav" => {
            let bytes = fs::read(path).map_err(|err| {
                decode_error(format!("failed to read {}: {err}", path.display()))
            })?;
            // symphonia panics on some malformed headers.
            catch_unwind(AssertUnwindSafe(|| decode_pcm_container(&bytes, &extension)))
                .map_err(|_| decode_error("malformed audio stream"))??
        }
        _ => decode_with_ffmpeg(path, ffmpeg_bin)?,
    };

    if samples.is_empty() {
        return Err(decode_error("decoded audio is empty"));
    }
    Ok(samples)
}

fn decode_error(message: impl std::fmt::Display) -> AppError {
    AppError::engine(format!("audio decode failed: {message}"))
}

/// Pipes a compressed file through `ffmpeg` into raw little-endian `f32`.
fn decode_with_ffmpeg(path: &Path, ffmpeg_bin: &str) -> Result<Vec<f32>, AppError> {
    let output = Command::new(ffmpeg_bin)
        .args(["-hide_banner", "-loglevel", "error", "-i"])
        .arg(path)
        .args(["-f", "f32le", "-ac", "1", "-ar"])
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("pipe:1")
        .stdin(Stdio::null())
        .output()
        .map_err(|err| decode_error(format!("failed to run {ffmpeg_bin}: {err}")))?;

    if !output.status.success() {
        return Err(decode_error(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(output
        .stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Decodes an in-memory PCM container into normalized 16 kHz mono samples.
fn decode_pcm_container(bytes: &[u8], extension_hint: &str) -> Result<Vec<f32>, AppError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(extension_hint);

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| decode_error(format!("failed to open media file: {err}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| decode_error("no audio track found"))?;

    if track.codec_params.codec == CODEC_TYPE_NULL {
        return Err(decode_error("missing codec information"));
    }

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| decode_error(format!("unsupported codec: {err}")))?;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);
    check_sample_rate(sample_rate)?;
    let track_id = track.id;
    let mut mono = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(decode_error(format!("failed reading stream: {err}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => return Err(decode_error(format!("failed to decode packet: {err}"))),
        };

        sample_rate = decoded.spec().rate;
        check_sample_rate(sample_rate)?;
        let channels = decoded.spec().channels.count();

        let mut sample_buffer =
            SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buffer.copy_interleaved_ref(decoded);
        let samples = sample_buffer.samples();

        if channels <= 1 {
            mono.extend_from_slice(samples);
            continue;
        }

        // Downmix by averaging channels.
        for frame in samples.chunks(channels) {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }

    let normalized = mono
        .into_iter()
        .map(|s| s.clamp(-1.0, 1.0))
        .collect::<Vec<_>>();

    Ok(if sample_rate == TARGET_SAMPLE_RATE {
        normalized
    } else {
        resample_linear(&normalized, sample_rate, TARGET_SAMPLE_RATE)
    })
}

fn check_sample_rate(rate: u32) -> Result<(), AppError> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        Ok(())
    } else {
        Err(decode_error(format!(
            "unsupported sample rate {rate} Hz (expected {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE})"
        )))
    }
}

/// Resamples a mono signal from `src_rate` to `dst_rate` via linear interpolation.
fn resample_linear(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || input.len() < 2 {
        return input.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((input.len() as f64) / ratio).round().max(1.0) as usize;

    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let idx = src_pos.floor() as usize;
            let frac = (src_pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Builds a 16-bit PCM mono WAV file in memory.
#[cfg(test)]
pub(crate) fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
