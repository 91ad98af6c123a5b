use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    live: Live,
    devices: Devices,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Live {
    url: String,
    model: String,
    default_voice: String,
}

#[derive(Deserialize)]
struct Devices {
    capture: String,
    playback: String,
}

// Read config.toml at compile time and bake the values into the binary.
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    println!("cargo:rustc-env=LIVE_URL={}", config.live.url);
    println!("cargo:rustc-env=LIVE_MODEL={}", config.live.model);
    println!("cargo:rustc-env=DEFAULT_VOICE={}", config.live.default_voice);

    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.devices.capture);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.devices.playback);

    // libspeexdsp is only linked for the ALSA build.
    if std::env::var("CARGO_FEATURE_ALSA_IO").is_ok() {
        pkg_config::Config::new()
            .probe("speexdsp")
            .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
    }
}
