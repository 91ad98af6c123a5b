//! SpeexDSP-backed microphone conditioning and sample-rate conversion.
//!
//! Two seams the ALSA collaborators drive: [`CaptureChain`] turns raw card
//! periods into transport-rate samples (denoise and AGC per the advisory
//! input flags, then resampling), [`RateConverter`] adapts remote audio to
//! whatever rate the playback card actually granted.

use std::ffi::{c_int, c_void};

use super::device::InputConfig;

/// Suppression strength when the noise-suppression flag is set.
const NOISE_SUPPRESS_DB: c_int = -25;
/// AGC target for speech headed to the remote model.
const AGC_TARGET_LEVEL: f32 = 24000.0;

// ======================== FFI declarations ========================

/// Opaque SpeexPreprocessState
#[repr(C)]
struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque SpeexResamplerState
#[repr(C)]
struct SpeexResamplerState {
    _private: [u8; 0],
}

const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
}

// ======================== Capture chain ========================

/// Per-session microphone conditioning: the cleanup stages the advisory
/// [`InputConfig`] flags asked for, then conversion from the card's rate to
/// the transport rate. Built for one period size; feed it whole periods
/// from the card it was sized for.
pub struct CaptureChain {
    cleanup: Option<Cleanup>,
    converter: Option<RateConverter>,
}

impl CaptureChain {
    pub fn new(
        period_size: usize,
        card_rate: u32,
        target_rate: u32,
        config: &InputConfig,
    ) -> anyhow::Result<Self> {
        let cleanup = if config.noise_suppression || config.auto_gain {
            Some(Cleanup::new(period_size, card_rate, config)?)
        } else {
            None
        };
        let converter = if card_rate != target_rate {
            Some(RateConverter::new(card_rate, target_rate)?)
        } else {
            None
        };
        Ok(Self { cleanup, converter })
    }

    /// Clean one card period in place and return it at the target rate.
    /// The returned slice is valid until the next call.
    pub fn process<'a>(&'a mut self, period: &'a mut [i16]) -> anyhow::Result<&'a [i16]> {
        if let Some(cleanup) = self.cleanup.as_mut() {
            cleanup.run(period);
        }
        match self.converter.as_mut() {
            Some(conv) => conv.convert(period),
            None => Ok(period),
        }
    }
}

/// Denoise/AGC pass over one period of 16-bit mono PCM.
struct Cleanup {
    state: *mut SpeexPreprocessState,
}

// The state never leaves the capture thread once handed over.
unsafe impl Send for Cleanup {}

impl Cleanup {
    fn new(frame_size: usize, sample_rate: u32, config: &InputConfig) -> anyhow::Result<Self> {
        let state =
            unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        let mut cleanup = Self { state };
        if config.noise_suppression {
            cleanup.ctl_int(SPEEX_PREPROCESS_SET_DENOISE, 1);
            cleanup.ctl_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, NOISE_SUPPRESS_DB);
        }
        if config.auto_gain {
            cleanup.ctl_int(SPEEX_PREPROCESS_SET_AGC, 1);
            cleanup.ctl_f32(SPEEX_PREPROCESS_SET_AGC_LEVEL, AGC_TARGET_LEVEL);
        }
        Ok(cleanup)
    }

    fn ctl_int(&mut self, request: c_int, value: c_int) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }

    fn ctl_f32(&mut self, request: c_int, value: f32) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut f32 as *mut c_void);
        }
    }

    fn run(&mut self, period: &mut [i16]) {
        unsafe {
            speex_preprocess_run(self.state, period.as_mut_ptr());
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Rate conversion ========================

/// Mono sample-rate conversion with an owned output buffer. Every call
/// consumes the whole input block: a short write grows the buffer and
/// feeds the remainder back in, so no samples are silently dropped.
pub struct RateConverter {
    state: *mut SpeexResamplerState,
    in_rate: u32,
    out_rate: u32,
    out: Vec<i16>,
}

unsafe impl Send for RateConverter {}

impl RateConverter {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(1, in_rate, out_rate, SPEEX_RESAMPLER_QUALITY_DEFAULT, &mut err)
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self {
            state,
            in_rate,
            out_rate,
            out: Vec::new(),
        })
    }

    /// Convert one mono block. The returned slice is valid until the next
    /// call.
    pub fn convert(&mut self, input: &[i16]) -> anyhow::Result<&[i16]> {
        let estimate = input.len() * self.out_rate as usize / self.in_rate as usize + 16;
        self.out.resize(estimate, 0);

        let mut taken = 0usize;
        let mut filled = 0usize;
        while taken < input.len() {
            if filled == self.out.len() {
                self.out.resize(self.out.len() + estimate, 0);
            }
            let mut in_len = (input.len() - taken) as u32;
            let mut out_len = (self.out.len() - filled) as u32;
            let err = unsafe {
                speex_resampler_process_int(
                    self.state,
                    0,
                    input[taken..].as_ptr(),
                    &mut in_len,
                    self.out[filled..].as_mut_ptr(),
                    &mut out_len,
                )
            };
            if err != RESAMPLER_ERR_SUCCESS {
                anyhow::bail!("Speex resampler error: {}", err);
            }
            if in_len == 0 && out_len == 0 {
                anyhow::bail!("Speex resampler made no progress");
            }
            taken += in_len as usize;
            filled += out_len as usize;
        }
        Ok(&self.out[..filled])
    }
}

impl Drop for RateConverter {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
