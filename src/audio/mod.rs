//! Audio device contracts and their ALSA implementation.
//!
//! The session core talks to microphones and speakers only through the
//! traits in [`device`]; the ALSA side (plus SpeexDSP cleanup and
//! resampling) is compiled in with the `alsa-io` feature so the core
//! stays buildable on machines without the system libraries.

mod device;

pub use device::{InputConfig, InputDevice, InputHandle, OutputDevice, OutputHandle, SampleBlock};

#[cfg(feature = "alsa-io")]
mod alsa;
#[cfg(feature = "alsa-io")]
mod speex;

#[cfg(feature = "alsa-io")]
pub use alsa::{AlsaInput, AlsaOutput};
