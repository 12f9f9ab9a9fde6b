//! Output seam between the session and whatever actually renders audio.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::decoder::DecodedAudio;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEventKind {
    Ended,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkEvent {
    pub index: usize,
    pub kind: SinkEventKind,
}

/// Terminal-event notifier for one unit, handed to the sink on `play`.
#[derive(Debug, Clone)]
pub struct UnitEvents {
    index: usize,
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl UnitEvents {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<SinkEvent>) -> Self {
        Self { index, tx }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Playback reached the end of the unit.
    pub fn ended(&self) {
        self.send(SinkEventKind::Ended);
    }

    pub fn error(&self, reason: impl Into<String>) {
        self.send(SinkEventKind::Error(reason.into()));
    }

    fn send(&self, kind: SinkEventKind) {
        // The session may already be gone; nothing is waiting then.
        let _ = self.tx.send(SinkEvent {
            index: self.index,
            kind,
        });
    }
}

/// Starting playback was refused (device busy, autoplay policy, ...).
#[derive(Debug, Clone, Error)]
#[error("playback rejected: {0}")]
pub struct PlaybackRejected(pub String);

/// Something that can play decoded units.
///
/// Implementations must report exactly one terminal event (`ended` or
/// `error`) per successful `play`, unless the unit is paused first.
pub trait AudioSink: Send + 'static {
    fn play(
        &mut self,
        index: usize,
        audio: Arc<DecodedAudio>,
        events: UnitEvents,
    ) -> Result<(), PlaybackRejected>;

    fn pause(&mut self, index: usize);

    /// Drop any resources held for the unit. Must tolerate repeated calls.
    fn release(&mut self, index: usize);
}

/// Shared record of the order in which units were started.
pub type PlayLog = Arc<Mutex<Vec<usize>>>;

/// Reference sink that "plays" each unit by waiting for its duration on
/// the tokio clock, then reports it ended.
#[derive(Debug, Default)]
pub struct ClockSink {
    playing: HashMap<usize, JoinHandle<()>>,
    log: PlayLog,
}

impl ClockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play_log(&self) -> PlayLog {
        Arc::clone(&self.log)
    }
}

impl AudioSink for ClockSink {
    fn play(
        &mut self,
        index: usize,
        audio: Arc<DecodedAudio>,
        events: UnitEvents,
    ) -> Result<(), PlaybackRejected> {
        if let Some((busy, _)) = self.playing.iter().find(|(_, task)| !task.is_finished()) {
            warn!(index, busy = *busy, "starting a unit while another is still playing");
        }
        let duration = audio.duration();
        match self.log.lock() {
            Ok(mut log) => log.push(index),
            Err(_) => return Err(PlaybackRejected("play log poisoned".to_string())),
        }
        debug!(index, secs = duration.as_secs_f64(), "clock sink playing");

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            events.ended();
        });
        if let Some(previous) = self.playing.insert(index, task) {
            previous.abort();
        }
        Ok(())
    }

    fn pause(&mut self, index: usize) {
        if let Some(task) = self.playing.remove(&index) {
            task.abort();
        }
    }

    fn release(&mut self, index: usize) {
        self.pause(index);
    }
}
