use thiserror::Error;

/// Classified errors surfaced by the audio pipelines and the remote channel.
///
/// Collaborators normalize platform-specific failures into one of these
/// kinds at the point of occurrence; everything above the device layer
/// branches on the kind, not on platform details.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// No usable device is present (unplugged, missing, or vanished).
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    /// The platform refused access to the device.
    #[error("audio device access denied: {0}")]
    PermissionDenied(String),

    /// The host cannot satisfy the required capture/playback configuration.
    #[error("unsupported audio environment: {0}")]
    UnsupportedEnvironment(String),

    /// The remote conversational channel failed to open, or dropped.
    #[error("channel failure: {0}")]
    ChannelFailure(String),

    /// Anything that does not fit the classes above.
    #[error("{0}")]
    Unknown(String),
}

impl AudioError {
    /// True when a fresh connect attempt could plausibly succeed without
    /// the user changing anything on the host.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AudioError::ChannelFailure(_) | AudioError::Unknown(_)
        )
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        AudioError::Unknown(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        AudioError::ChannelFailure(msg.into())
    }
}
