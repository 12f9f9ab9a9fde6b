//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use server::config::ServerConfig;
use server::engine::{PcmByteStream, SpeechEngine, SynthesisRequest};
use server::{build_router, AppState};
use tts_core::StreamRecord;

/// Engine that replays a fixed script of PCM buffers and failures.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    pieces: Vec<Result<Vec<u8>, String>>,
    refuse: Option<String>,
}

impl ScriptedEngine {
    /// `pcm` delivered in buffers of `piece_samples` samples.
    pub fn speaking(pcm: &[f32], piece_samples: usize) -> Self {
        Self {
            pieces: pcm
                .chunks(piece_samples.max(1))
                .map(|piece| Ok(pcm_bytes(piece)))
                .collect(),
            refuse: None,
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            pieces: Vec::new(),
            refuse: Some(reason.to_string()),
        }
    }

    /// Append a failure after the buffers delivered so far.
    pub fn then_fail(mut self, reason: &str) -> Self {
        self.pieces.push(Err(reason.to_string()));
        self
    }
}

#[async_trait]
impl SpeechEngine for ScriptedEngine {
    async fn synthesize(&self, _request: &SynthesisRequest) -> anyhow::Result<PcmByteStream> {
        if let Some(reason) = &self.refuse {
            anyhow::bail!("{reason}");
        }
        let pieces = self.pieces.clone();
        Ok(futures_util::stream::iter(pieces)
            .map(|piece| piece.map(Bytes::from).map_err(|e| anyhow::anyhow!(e)))
            .boxed())
    }
}

pub fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Deterministic, non-silent test signal.
pub fn tone(samples: usize) -> Vec<f32> {
    (0..samples).map(|i| ((i % 100) as f32 / 100.0) - 0.5).collect()
}

pub fn test_config(sample_rate: u32, flush_secs: f64) -> ServerConfig {
    ServerConfig {
        sample_rate,
        flush_secs,
        rate_limit_per_minute: 600,
        ..ServerConfig::default()
    }
}

/// Create a test app instance backed by `engine`.
pub fn create_test_app(engine: ScriptedEngine, config: ServerConfig) -> (Router, AppState) {
    let state = AppState::new(Arc::new(engine), config);
    let app = build_router(state.clone()).expect("router builds");
    (app, state)
}

/// Parse an NDJSON response body into records.
pub fn parse_records(body: &[u8]) -> Vec<StreamRecord> {
    let text = std::str::from_utf8(body).expect("body is UTF-8");
    assert!(text.is_empty() || text.ends_with('\n'), "body must end with a newline");
    text.lines()
        .map(|line| StreamRecord::parse_line(line).expect("every line is a valid record"))
        .collect()
}
