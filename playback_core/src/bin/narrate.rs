use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use playback_core::{
    AudioSink, ClockSink, DecodedAudio, NarrationClient, NarrationEvent, PlaybackConfig,
    PlaybackRejected, UnitEvents,
};
use tts_core::wav;

/// Stream a narration from the server and play it while it is still arriving.
#[derive(Debug, Parser)]
#[command(name = "narrate", version)]
struct Args {
    /// Text to narrate. Read from stdin when omitted.
    text: Option<String>,

    #[arg(long)]
    voice: Option<String>,

    /// Server base URL, e.g. http://127.0.0.1:8085
    #[arg(long, env = "NARRATION_SERVER_URL")]
    server: Option<String>,

    /// Also write everything that played to a WAV file.
    #[arg(long)]
    out: Option<PathBuf>,
}

type Recording = Arc<Mutex<BTreeMap<usize, Arc<DecodedAudio>>>>;

/// Plays through a clock sink and keeps a copy of every unit it was given.
struct RecordingSink {
    inner: ClockSink,
    recording: Recording,
}

impl AudioSink for RecordingSink {
    fn play(
        &mut self,
        index: usize,
        audio: Arc<DecodedAudio>,
        events: UnitEvents,
    ) -> Result<(), PlaybackRejected> {
        if let Ok(mut recording) = self.recording.lock() {
            recording.insert(index, Arc::clone(&audio));
        }
        self.inner.play(index, audio, events)
    }

    fn pause(&mut self, index: usize) {
        self.inner.pause(index);
    }

    fn release(&mut self, index: usize) {
        self.inner.release(index);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();
    let args = Args::parse();

    let text = match args.text {
        Some(text) => text,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading text from stdin")?;
            text
        }
    };

    let mut config = PlaybackConfig::from_env();
    if let Some(server) = args.server {
        config.server_url = server;
    }
    let format = config.format();

    let recording = Recording::default();
    let sink = RecordingSink {
        inner: ClockSink::new(),
        recording: Arc::clone(&recording),
    };

    let client = NarrationClient::new(config)?;
    let started = Instant::now();
    let mut handle = client.narrate(&text, args.voice.as_deref(), sink).await?;

    let mut awaiting_first_audio = true;
    loop {
        tokio::select! {
            release = &mut handle.first_audio, if awaiting_first_audio => {
                awaiting_first_audio = false;
                if let Ok(release) = release {
                    info!(
                        after_ms = started.elapsed().as_millis() as u64,
                        buffered_secs = release.cumulative.as_secs_f64(),
                        "first audio ready, starting playback"
                    );
                    handle.play();
                }
            }
            event = handle.events.recv() => match event {
                Some(NarrationEvent::StreamComplete { units, explicit_end }) => {
                    info!(units, explicit_end, after_ms = started.elapsed().as_millis() as u64, "narration fully received");
                }
                Some(NarrationEvent::DecodeFailed { index, reason }) => warn!(index, %reason, "skipping chunk"),
                Some(NarrationEvent::PlaybackFailed { index, reason }) => warn!(index, %reason, "chunk failed to play"),
                Some(NarrationEvent::NarrationFinished) => info!("narration finished"),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping narration");
                handle.abort();
            }
        }
    }

    match handle.wait().await {
        Ok(report) => info!(?report, "done"),
        Err(e) => {
            error!(error = %e, "narration failed");
            return Err(e.into());
        }
    }

    if let Some(path) = args.out {
        let parts: Vec<Arc<DecodedAudio>> = match recording.lock() {
            Ok(recording) => recording.values().cloned().collect(),
            Err(_) => anyhow::bail!("recording lock poisoned"),
        };
        let audio = DecodedAudio::concat(parts.iter().map(|a| a.as_ref()), format);
        std::fs::write(&path, wav::encode_wav(&audio.samples, audio.format))
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), secs = audio.duration().as_secs_f64(), "wrote narration");
    }

    Ok(())
}
