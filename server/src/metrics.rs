// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use tts_core::StreamRecord;

/// Number of recent time-to-first-chunk samples kept for percentiles
const LATENCY_WINDOW: usize = 1000;

/// Rolling window of latency samples
#[derive(Debug, Clone, Default)]
pub struct LatencySamples {
    total_ms: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
    samples: Arc<Mutex<Vec<u64>>>,
}

impl LatencySamples {
    pub fn record(&self, latency_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.samples.lock() {
            samples.push(latency_ms);
            if samples.len() > LATENCY_WINDOW {
                samples.remove(0);
            }
        }
    }

    pub fn avg_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    pub fn percentile(&self, p: u8) -> u64 {
        if let Ok(samples) = self.samples.lock() {
            if samples.is_empty() {
                return 0;
            }
            let mut sorted = samples.clone();
            sorted.sort_unstable();
            let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
            sorted[index]
        } else {
            0
        }
    }
}

/// Counters for the narration stream endpoint
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub streams_started: Arc<AtomicU64>,
    pub streams_completed: Arc<AtomicU64>,
    pub empty_streams: Arc<AtomicU64>,
    pub engine_errors: Arc<AtomicU64>,
    pub chunks_emitted: Arc<AtomicU64>,
    pub samples_emitted: Arc<AtomicU64>,
    pub time_to_first_chunk: LatencySamples,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_error(&self) {
        self.engine_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Follow one stream's records as they are sent.
    pub fn track(&self, started: Instant) -> StreamTracker {
        self.record_stream_started();
        StreamTracker {
            metrics: self.clone(),
            started,
            chunks: 0,
            samples: 0,
        }
    }

    pub fn snapshot(&self) -> StreamingMetricsResponse {
        StreamingMetricsResponse {
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_completed: self.streams_completed.load(Ordering::Relaxed),
            empty_streams: self.empty_streams.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            chunks_emitted: self.chunks_emitted.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            time_to_first_chunk_avg_ms: self.time_to_first_chunk.avg_ms(),
            time_to_first_chunk_p50_ms: self.time_to_first_chunk.percentile(50),
            time_to_first_chunk_p95_ms: self.time_to_first_chunk.percentile(95),
            time_to_first_chunk_p99_ms: self.time_to_first_chunk.percentile(99),
        }
    }
}

/// Per-stream view over [`StreamMetrics`].
#[derive(Debug)]
pub struct StreamTracker {
    metrics: StreamMetrics,
    started: Instant,
    chunks: u64,
    samples: u64,
}

impl StreamTracker {
    pub fn observe(&mut self, record: &StreamRecord) {
        match record {
            StreamRecord::Chunk(chunk) => {
                if self.chunks == 0 {
                    let ms = self.started.elapsed().as_millis() as u64;
                    self.metrics.time_to_first_chunk.record(ms);
                }
                self.chunks += 1;
                self.samples += u64::from(chunk.samples);
                self.metrics.chunks_emitted.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .samples_emitted
                    .fetch_add(u64::from(chunk.samples), Ordering::Relaxed);
            }
            StreamRecord::End => {
                if self.chunks == 0 {
                    self.metrics.empty_streams.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics.streams_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    chunks = self.chunks,
                    samples = self.samples,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "narration stream complete"
                );
            }
        }
    }
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub streaming: StreamingMetricsResponse,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StreamingMetricsResponse {
    pub streams_started: u64,
    pub streams_completed: u64,
    pub empty_streams: u64,
    pub engine_errors: u64,
    pub chunks_emitted: u64,
    pub samples_emitted: u64,
    pub time_to_first_chunk_avg_ms: f64,
    pub time_to_first_chunk_p50_ms: u64,
    pub time_to_first_chunk_p95_ms: u64,
    pub time_to_first_chunk_p99_ms: u64,
}
