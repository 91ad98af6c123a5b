//! Build-time configuration.
//!
//! Everything here is baked in from `config.toml` by the build script;
//! protocol-fixed numbers (block size, sample rates) live next to the
//! codec instead. The Live API credential is deliberately absent: the
//! binary takes it from its own environment, the library never reads one.

/// Values baked in from `config.toml` at compile time.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    /// BidiGenerateContent WebSocket endpoint.
    pub live_url: &'static str,
    pub model: &'static str,
    pub default_voice: &'static str,

    /// ALSA PCM names for the two directions.
    pub capture_device: &'static str,
    pub playback_device: &'static str,
}

impl Config {
    pub fn new() -> Self {
        Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),
            live_url: env!("LIVE_URL"),
            model: env!("LIVE_MODEL"),
            default_voice: env!("DEFAULT_VOICE"),
            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
