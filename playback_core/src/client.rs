use serde::Serialize;
use tracing::{debug, info};

use crate::config::PlaybackConfig;
use crate::error::{NarrationError, TransportError};
use crate::session::{spawn_narration, NarrationHandle};
use crate::sink::AudioSink;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Serialize)]
struct NarrateRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
}

/// Requests narrations from the server and plays them as they stream in.
#[derive(Debug, Clone)]
pub struct NarrationClient {
    http: reqwest::Client,
    config: PlaybackConfig,
}

impl NarrationClient {
    pub fn new(config: PlaybackConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    /// Open a narration stream and start consuming it into `sink`.
    ///
    /// Returns once the response headers arrive; a failure to connect or a
    /// non-success status is a hard transport error.
    pub async fn narrate<K: AudioSink>(
        &self,
        text: &str,
        voice: Option<&str>,
        sink: K,
    ) -> Result<NarrationHandle, NarrationError> {
        let url = format!("{}/narrate", self.config.server_url.trim_end_matches('/'));
        debug!(%url, chars = text.chars().count(), "requesting narration");

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, NDJSON_CONTENT_TYPE)
            .json(&NarrateRequest { text, voice })
            .send()
            .await
            .map_err(TransportError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::new(format!("server returned {status}: {body}")).into());
        }

        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let handle = spawn_narration(Box::pin(response.bytes_stream()), sink, &self.config);
        info!(session = %handle.id, %request_id, "narration stream opened");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_omits_missing_voice() {
        let body = serde_json::to_value(NarrateRequest {
            text: "hello",
            voice: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "text": "hello" }));

        let body = serde_json::to_value(NarrateRequest {
            text: "hello",
            voice: Some("en_US"),
        })
        .unwrap();
        assert_eq!(body["voice"], "en_US");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let client = NarrationClient::new(PlaybackConfig {
            server_url: "http://127.0.0.1:9".to_string(),
            ..PlaybackConfig::default()
        })
        .unwrap();

        let err = client
            .narrate("hello", None, crate::sink::ClockSink::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NarrationError::Transport(_)));
    }
}
