//! docutalk - document-grounded real-time voice conversation core
//!
//! A microphone pipeline encodes fixed-size PCM16 blocks for a remote
//! conversational model; the model's audio answers are scheduled gapless
//! on the speaker clock. One controller owns the whole lifecycle:
//! device acquisition, channel setup, mute, interruption, teardown.
//!
//! The core is transport-real but device-agnostic: microphones, speakers
//! and the remote channel sit behind traits, with ALSA and Gemini Live
//! implementations included.

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod live_link;
pub mod playback;
pub mod profile;
pub mod protocol;
pub mod session;

pub use codec::TransportFrame;
pub use error::AudioError;
pub use session::{SessionController, SessionIntent, SessionNotice, SessionState};
