// Configuration for the narration client

use std::time::Duration;

use tts_core::{AudioFormat, DEFAULT_SAMPLE_RATE};

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub server_url: String,
    pub sample_rate: u32,
    pub early_release_secs: f64,
    pub decode_timeout_ms: u64,
    pub ready_fallback_ms: u64,
    pub play_retry_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8085".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            early_release_secs: 3.0,
            decode_timeout_ms: 5_000,
            ready_fallback_ms: 500,
            play_retry_ms: 200,
        }
    }
}

impl PlaybackConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let server_url = std::env::var("NARRATION_SERVER_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.server_url);

        let sample_rate = std::env::var("SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|rate: &u32| *rate > 0)
            .unwrap_or(defaults.sample_rate);

        let early_release_secs = std::env::var("EARLY_RELEASE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs: &f64| secs.is_finite() && *secs >= 0.0)
            .unwrap_or(defaults.early_release_secs);

        let decode_timeout_ms = std::env::var("DECODE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.decode_timeout_ms);

        let ready_fallback_ms = std::env::var("READY_FALLBACK_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.ready_fallback_ms);

        let play_retry_ms = std::env::var("PLAY_RETRY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.play_retry_ms);

        Self {
            server_url,
            sample_rate,
            early_release_secs,
            decode_timeout_ms,
            ready_fallback_ms,
            play_retry_ms,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::mono_f32(self.sample_rate)
    }

    pub fn early_release_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.early_release_secs).unwrap_or_default()
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn ready_fallback(&self) -> Duration {
        Duration::from_millis(self.ready_fallback_ms)
    }

    pub fn play_retry(&self) -> Duration {
        Duration::from_millis(self.play_retry_ms)
    }
}
