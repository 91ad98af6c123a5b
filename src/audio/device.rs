//! Device collaborator contracts for the capture and playback pipelines.
//!
//! The pipelines never touch a sound card directly; they talk to these
//! traits. Production implementations live in the `alsa` module (feature
//! `alsa-io`), tests substitute in-memory fakes.

use crate::error::AudioError;

/// One block of mono float samples in [-1.0, 1.0].
pub type SampleBlock = Vec<f32>;

/// Requested input-device processing. All flags are advisory: a device may
/// honor any subset, and `request_access` must not fail because one is
/// unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl InputConfig {
    /// The full processing chain, asked for first.
    pub fn preferred() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }

    /// Bare capture, the single fallback when `preferred` is rejected.
    pub fn minimal() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain: false,
        }
    }
}

/// An input device that can grant capture sessions.
pub trait InputDevice: Send + Sync {
    /// Acquire the device. Blocks until granted or failed; failures are
    /// classified (`DeviceNotFound`, `PermissionDenied`,
    /// `UnsupportedEnvironment`).
    fn request_access(
        &self,
        config: &InputConfig,
    ) -> Result<Box<dyn InputHandle>, AudioError>;
}

/// A live capture session. `pull` blocks at the device's own pace.
pub trait InputHandle: Send {
    /// Produce the next block of samples at the capture rate. An empty
    /// block means nothing was available yet and produces no frame. An
    /// error ends the session; the caller decides how to surface it.
    fn pull(&mut self) -> Result<SampleBlock, AudioError>;

    /// Relinquish the device. The handle is gone afterwards.
    fn release(self: Box<Self>);
}

impl std::fmt::Debug for dyn InputHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InputHandle")
    }
}

/// An output device that can grant playback sessions.
pub trait OutputDevice: Send + Sync {
    /// Open a playback session rendering at `sample_rate` Hz.
    fn open(&self, sample_rate: u32) -> Result<Box<dyn OutputHandle>, AudioError>;
}

/// A live playback session with a monotonic stream clock.
pub trait OutputHandle: Send {
    /// Current position of the device clock, in seconds since open.
    fn clock_now(&self) -> f64;

    /// Render `samples` starting at clock time `at` (seconds). Scheduling
    /// in the past is the device's problem to start as soon as it can.
    fn schedule(&mut self, samples: Vec<f32>, at: f64) -> Result<(), AudioError>;

    /// Discard everything scheduled but not yet rendered.
    fn flush(&mut self);

    /// Relinquish the device, discarding pending output.
    fn release(self: Box<Self>);
}
