//! Speech engine seam.
//!
//! The server does not synthesize audio itself. An engine turns text into a
//! live stream of raw little-endian f32 mono PCM at the requested rate; the
//! stream's buffers may split samples at any byte boundary.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::debug;

pub type PcmByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: Option<String>,
    pub sample_rate: u32,
}

#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Start synthesizing. An error here means no audio was produced at all.
    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<PcmByteStream>;
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    sample_rate: u32,
    format: &'static str,
}

/// Engine reached over HTTP; the response body is the PCM stream.
///
/// `timeout` bounds connecting, getting the response headers, and each
/// silent gap between body reads. The body as a whole has no deadline.
#[derive(Debug, Clone)]
pub struct HttpSpeechEngine {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSpeechEngine {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("building speech engine HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
            timeout,
        })
    }
}

/// Fails the stream when no buffer arrives within `idle`.
fn with_idle_timeout(body: PcmByteStream, idle: Duration) -> PcmByteStream {
    futures_util::stream::unfold(Some(body), move |state| async move {
        let Some(mut body) = state else {
            return None;
        };
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(item)) => Some((item, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(anyhow::anyhow!("speech engine stalled for {:?}", idle)),
                None,
            )),
        }
    })
    .boxed()
}

#[async_trait]
impl SpeechEngine for HttpSpeechEngine {
    async fn synthesize(&self, request: &SynthesisRequest) -> anyhow::Result<PcmByteStream> {
        debug!(url = %self.url, chars = request.text.chars().count(), "requesting synthesis");
        let send = self
            .http
            .post(&self.url)
            .json(&EngineRequest {
                text: &request.text,
                voice: request.voice.as_deref(),
                sample_rate: request.sample_rate,
                format: "f32le",
            })
            .send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| anyhow::anyhow!("speech engine at {} did not respond within {:?}", self.url, self.timeout))?
            .with_context(|| format!("speech engine at {} unreachable", self.url))?
            .error_for_status()
            .context("speech engine rejected the request")?;

        let body = response.bytes_stream().map_err(anyhow::Error::from).boxed();
        Ok(with_idle_timeout(body, self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_request_shape() {
        let body = serde_json::to_value(EngineRequest {
            text: "hi",
            voice: Some("en"),
            sample_rate: 24_000,
            format: "f32le",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({"text": "hi", "voice": "en", "sample_rate": 24000, "format": "f32le"})
        );
    }

    #[tokio::test]
    async fn test_idle_body_fails_once_and_ends() {
        let stalled: PcmByteStream = futures_util::stream::once(async { Ok(Bytes::from_static(&[0u8; 4])) })
            .chain(futures_util::stream::pending())
            .boxed();
        let items: Vec<_> = with_idle_timeout(stalled, Duration::from_millis(50)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().len(), 4);
        assert!(items[1].as_ref().unwrap_err().to_string().contains("stalled"));
    }

    #[tokio::test]
    async fn test_unreachable_engine_fails_before_streaming() {
        let engine = HttpSpeechEngine::new("http://127.0.0.1:9/synthesize", Duration::from_secs(2)).unwrap();
        let request = SynthesisRequest {
            text: "hello".to_string(),
            voice: None,
            sample_rate: 24_000,
        };
        assert!(engine.synthesize(&request).await.is_err());
    }
}
