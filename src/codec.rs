//! Frame conversions between float samples, PCM16 bytes, and transport text.
//!
//! - Capture path: f32 block → PCM16-LE → base64 transport frame
//! - Playback path: base64 transport frame → PCM16-LE → f32 samples
//!
//! Everything here is pure and stateless; device rates and block sizes are
//! fixed by the constants below.

use crate::error::AudioError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Microphone capture rate in Hz.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Remote audio playback rate in Hz.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture block (256 ms at 16 kHz).
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;

/// One encoded audio frame as it travels over the remote channel:
/// base64 text plus a `audio/pcm;rate=<hz>` mime tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFrame {
    pub data: String,
    pub mime_type: String,
}

/// Mime tag for raw PCM16 at the given rate.
pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Parse the rate out of a `audio/pcm;rate=<hz>` tag.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    let rest = mime.strip_prefix("audio/pcm")?;
    rest.split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .next()?
        .parse()
        .ok()
}

/// Map one float sample onto the PCM16 grid.
///
/// Clamped to [-1.0, 1.0] and scaled asymmetrically (negative × 32768,
/// non-negative × 32767) so both full-scale endpoints map onto
/// representable i16 values, then truncated. The single source of truth
/// for this mapping; device backends use it too so rendered samples match
/// the transport bytes exactly.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled as i16
}

/// Convert float samples to little-endian PCM16 bytes.
pub fn encode_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

/// Convert little-endian PCM16 bytes back to float samples in [-1.0, 1.0).
///
/// An odd byte count means a torn frame and is rejected rather than
/// silently truncated.
pub fn decode_from_pcm16(bytes: &[u8]) -> Result<Vec<f32>, AudioError> {
    if bytes.len() % 2 != 0 {
        return Err(AudioError::unknown(format!(
            "PCM16 frame has odd length {}",
            bytes.len()
        )));
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let v = i16::from_le_bytes([pair[0], pair[1]]);
        out.push(v as f32 / 32768.0);
    }
    Ok(out)
}

/// Wrap PCM16 bytes into a transport frame tagged with the given rate.
pub fn to_transport(pcm: &[u8], rate: u32) -> TransportFrame {
    TransportFrame {
        data: STANDARD.encode(pcm),
        mime_type: pcm_mime(rate),
    }
}

/// Unwrap a transport frame back to PCM16 bytes.
///
/// Decoding is strict: wrong alphabet or padding is an error, never a
/// truncated result.
pub fn from_transport(frame: &TransportFrame) -> Result<Vec<u8>, AudioError> {
    STANDARD
        .decode(&frame.data)
        .map_err(|e| AudioError::unknown(format!("invalid base64 payload: {}", e)))
}
