//! Server settings: JSON file plus `SWITCHBOARD_*` environment overrides.

use std::path::{Path, PathBuf};

use switchboard_core::Config;
use tracing::warn;

/// Config file location: `SWITCHBOARD_CONFIG` or `switchboard.json` in the
/// working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("SWITCHBOARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("switchboard.json"))
}

/// Load a config file over the defaults, apply environment overrides, and
/// clamp out-of-range values. A missing or unreadable file is not fatal.
pub fn load_config(path: &Path) -> Config {
    let mut config = match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<Config>(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "config file is invalid ({e}), using defaults");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    };
    apply_env_overrides(&mut config);
    config.normalize();
    config
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(host) = std::env::var("SWITCHBOARD_HOST") {
        config.audio.host = host;
    }
    if let Some(port) = env_parse::<u16>("SWITCHBOARD_PORT") {
        config.audio.port = port;
    }
    if let Ok(endpoint) = std::env::var("SWITCHBOARD_STT_ENDPOINT") {
        config.stt.endpoint = endpoint;
    }
    if let Ok(endpoint) = std::env::var("SWITCHBOARD_LLM_ENDPOINT") {
        config.llm.endpoint = endpoint;
    }
    if let Ok(model) = std::env::var("SWITCHBOARD_LLM_MODEL") {
        config.llm.model = model;
    }
    if let Ok(endpoint) = std::env::var("SWITCHBOARD_TTS_ENDPOINT") {
        config.tts.endpoint = endpoint;
    }
    if let Ok(voice) = std::env::var("SWITCHBOARD_TTS_VOICE") {
        config.tts.voice = voice;
    }
    if let Ok(path) = std::env::var("SWITCHBOARD_VAD_MODEL") {
        config.vad.model_path = Some(PathBuf::from(path));
    }
    if let Some(threshold) = env_parse::<f32>("SWITCHBOARD_VAD_THRESHOLD") {
        config.vad.threshold = threshold;
    }
    if let Some(sounds) = std::env::var_os("SWITCHBOARD_SOUNDS_DIR") {
        config.audio.sounds_dir = Some(PathBuf::from(sounds));
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw = %raw, "ignoring unparseable environment override");
            None
        }
    })
}
