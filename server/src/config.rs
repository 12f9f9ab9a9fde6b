// Configuration for the narration server

use std::time::Duration;

use tts_core::{AudioFormat, EncoderConfig, TailPolicy, DEFAULT_FLUSH_AFTER, DEFAULT_SAMPLE_RATE};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub sample_rate: u32,
    pub flush_secs: f64,
    pub carry_partial_samples: bool,
    pub engine_url: Option<String>,
    pub engine_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            flush_secs: DEFAULT_FLUSH_AFTER.as_secs_f64(),
            carry_partial_samples: false,
            engine_url: None,
            engine_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port);

        let rate_limit_per_minute = std::env::var("RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_limit_per_minute);

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.request_timeout_secs);

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        let sample_rate = std::env::var("SAMPLE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|rate: &u32| *rate > 0)
            .unwrap_or(defaults.sample_rate);

        let flush_secs = std::env::var("FLUSH_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs: &f64| secs.is_finite() && *secs > 0.0)
            .unwrap_or(defaults.flush_secs);

        let carry_partial_samples = std::env::var("CARRY_PARTIAL_SAMPLES")
            .ok()
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.carry_partial_samples);

        let engine_url = std::env::var("TTS_ENGINE_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let engine_timeout_secs = std::env::var("ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.engine_timeout_secs);

        Self {
            port,
            rate_limit_per_minute,
            request_timeout_secs,
            cors_allowed_origins,
            sample_rate,
            flush_secs,
            carry_partial_samples,
            engine_url,
            engine_timeout_secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::mono_f32(self.sample_rate)
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            format: self.format(),
            flush_after: Duration::try_from_secs_f64(self.flush_secs).unwrap_or(DEFAULT_FLUSH_AFTER),
            tail_policy: if self.carry_partial_samples {
                TailPolicy::Carry
            } else {
                TailPolicy::Truncate
            },
        }
    }
}
