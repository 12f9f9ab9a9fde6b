//! One narration, end to end on the client.
//!
//! Everything for a session runs on a single task: body reads, decode
//! completions, sink notifications, fallback timers and UI commands are
//! all funneled through one `select!` loop, so the stream state has exactly
//! one owner and events are handled strictly one at a time.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tts_core::{AudioFormat, ChunkRecord};
use uuid::Uuid;

use crate::chainer::{ChainAction, ChainTiming, PlaybackChainer};
use crate::config::PlaybackConfig;
use crate::consumer::{ConsumerEvent, StreamConsumer};
use crate::decoder::{ChunkDecoder, DecodedAudio, PlayableUnit};
use crate::error::{DecodeError, MalformedRecordError, NarrationError, PlaybackError, TransportError};
use crate::gate::{EarlyRelease, EarlyReleaseGate, PendingRelease};
use crate::sink::{AudioSink, PlaybackRejected, SinkEvent, SinkEventKind, UnitEvents};

/// Progress notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationEvent {
    UnitQueued { index: usize },
    UnitReady { index: usize },
    DecodeFailed { index: usize, reason: String },
    MalformedRecord { line: usize, reason: String },
    OutOfSequence { index: usize, expected: usize },
    TransportInterrupted { reason: String },
    StreamComplete { units: usize, explicit_end: bool },
    Started { index: usize },
    PlaybackFailed { index: usize, reason: String },
    NarrationFinished,
}

/// Delivered once the whole narration has arrived and been chained.
#[derive(Debug, Clone)]
pub struct ChainSummary {
    pub units: usize,
    pub head: Option<usize>,
    pub final_index: Option<usize>,
    pub duration: Duration,
    /// Whether the stream ended with an explicit end marker.
    pub explicit_end: bool,
    /// Set when the transport failed after some audio had arrived.
    pub interrupted: Option<TransportError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrationReport {
    pub units: usize,
    pub decode_failures: usize,
    pub playback_failures: usize,
    /// Unparseable lines plus chunks skipped for a repeated or lower index.
    pub malformed_lines: usize,
    pub early_release_fired: bool,
    pub finished_playing: bool,
}

/// Per-stream state, created at stream start and dropped at teardown.
#[derive(Debug, Default)]
pub struct StreamState {
    pub units: BTreeMap<usize, PlayableUnit>,
    pub cumulative_audio: Duration,
    pub first_release_fired: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Play,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    ReadyCheck(usize),
    PlayRetry(usize),
}

/// Caller's side of a running narration.
pub struct NarrationHandle {
    pub id: Uuid,
    /// Resolves once enough audio has arrived to start listening. Closes
    /// without a value only if the narration produced no audio.
    pub first_audio: oneshot::Receiver<EarlyRelease>,
    pub chain_ready: oneshot::Receiver<Result<ChainSummary, NarrationError>>,
    pub events: mpsc::UnboundedReceiver<NarrationEvent>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<NarrationReport, NarrationError>>>,
    outcome: Option<Result<NarrationReport, NarrationError>>,
}

impl NarrationHandle {
    /// Start playback at the head of the chain. The session never autoplays.
    pub fn play(&self) {
        let _ = self.commands.send(Command::Play);
    }

    /// Stop everything: pause and release every unit, drop the in-flight read.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the session to end (finished playing, aborted, or failed).
    pub async fn wait(&mut self) -> Result<NarrationReport, NarrationError> {
        if let Some(task) = self.task.as_mut() {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(session = %self.id, "narration task failed: {join_err}");
                    Err(NarrationError::Aborted)
                }
            };
            self.task = None;
            self.outcome = Some(outcome);
        }
        self.outcome.clone().unwrap_or(Err(NarrationError::Aborted))
    }
}

impl Drop for NarrationHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Start consuming `body` on a new task and play it through `sink`.
pub fn spawn_narration<S, B, E, K>(body: S, sink: K, config: &PlaybackConfig) -> NarrationHandle
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
    K: AudioSink,
{
    let id = Uuid::new_v4();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (first_audio_tx, first_audio_rx) = oneshot::channel();
    let (chain_ready_tx, chain_ready_rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let format = config.format();
    let session = Session {
        id,
        format,
        sink,
        decoder: ChunkDecoder::new(format, config.decode_timeout()),
        chainer: PlaybackChainer::new(ChainTiming {
            ready_fallback: config.ready_fallback(),
            play_retry: config.play_retry(),
        }),
        gate: EarlyReleaseGate::new(format, config.early_release_threshold()),
        state: StreamState::default(),
        decodes: JoinSet::new(),
        releases: JoinSet::new(),
        timers: JoinSet::new(),
        sink_tx,
        events: events_tx,
        first_audio: Some(first_audio_tx),
        chain_ready: Some(chain_ready_tx),
        next_expected: 0,
        report: NarrationReport::default(),
    };

    info!(session = %id, "narration session started");
    let task = tokio::spawn(run(
        StreamConsumer::new(body),
        session,
        commands_rx,
        sink_rx,
        cancel.clone(),
    ));

    NarrationHandle {
        id,
        first_audio: first_audio_rx,
        chain_ready: chain_ready_rx,
        events: events_rx,
        commands: commands_tx,
        cancel,
        task: Some(task),
        outcome: None,
    }
}

async fn run<S, B, E, K>(
    mut consumer: StreamConsumer<S>,
    mut session: Session<K>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut sink_rx: mpsc::UnboundedReceiver<SinkEvent>,
    cancel: CancellationToken,
) -> Result<NarrationReport, NarrationError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    K: AudioSink,
{
    let mut stream_done = false;
    let mut commands_open = true;

    let outcome = loop {
        if stream_done && session.chainer.is_finished() {
            break Ok(());
        }
        // Nobody is left to start playback.
        if stream_done && !commands_open && !session.chainer.has_started() {
            debug!(session = %session.id, "handle dropped before playback started");
            break Ok(());
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break Err(NarrationError::Aborted),

            command = commands.recv(), if commands_open => match command {
                Some(Command::Play) => session.on_play_requested(),
                None => commands_open = false,
            },

            Some(event) = sink_rx.recv() => session.on_sink_event(event),

            Some(timer) = session.timers.join_next(), if !session.timers.is_empty() => {
                session.on_timer(timer)
            }

            Some(release) = session.releases.join_next(), if !session.releases.is_empty() => {
                session.on_release_assembled(release)
            }

            Some(decoded) = session.decodes.join_next(), if !session.decodes.is_empty() => {
                session.on_decoded(decoded)
            }

            event = consumer.next_event(), if !stream_done => match event {
                Ok(Some(ConsumerEvent::Chunk(record))) => session.on_chunk(record),
                Ok(Some(ConsumerEvent::Malformed(e))) => session.on_malformed(e),
                Ok(None) => {
                    stream_done = true;
                    if let Err(e) = session.on_complete(consumer.saw_end_marker(), None) {
                        break Err(e);
                    }
                }
                Err(e) => {
                    stream_done = true;
                    if let Err(e) = session.on_transport_error(e) {
                        break Err(e);
                    }
                }
            },
        }
    };

    session.report.malformed_lines += consumer.malformed_lines();
    drop(consumer);
    session.teardown();

    match outcome {
        Ok(()) => {
            info!(session = %session.id, report = ?session.report, "narration session ended");
            Ok(session.report)
        }
        Err(e) => {
            session.fail(e.clone());
            warn!(session = %session.id, error = %e, "narration session ended early");
            Err(e)
        }
    }
}

struct Session<K> {
    id: Uuid,
    format: AudioFormat,
    sink: K,
    decoder: ChunkDecoder,
    chainer: PlaybackChainer,
    gate: EarlyReleaseGate,
    state: StreamState,
    decodes: JoinSet<(usize, Result<DecodedAudio, DecodeError>)>,
    releases: JoinSet<EarlyRelease>,
    timers: JoinSet<Timer>,
    sink_tx: mpsc::UnboundedSender<SinkEvent>,
    events: mpsc::UnboundedSender<NarrationEvent>,
    first_audio: Option<oneshot::Sender<EarlyRelease>>,
    chain_ready: Option<oneshot::Sender<Result<ChainSummary, NarrationError>>>,
    next_expected: usize,
    report: NarrationReport,
}

impl<K: AudioSink> Session<K> {
    fn emit(&self, event: NarrationEvent) {
        let _ = self.events.send(event);
    }

    fn on_chunk(&mut self, record: ChunkRecord) {
        let index = record.index as usize;
        if index < self.next_expected {
            warn!(session = %self.id, index, expected = self.next_expected, "skipping out-of-sequence chunk");
            self.report.malformed_lines += 1;
            self.emit(NarrationEvent::OutOfSequence {
                index,
                expected: self.next_expected,
            });
            return;
        }
        if index > self.next_expected {
            warn!(session = %self.id, index, expected = self.next_expected, "gap in chunk indices");
        }
        self.next_expected = index + 1;

        self.state.units.insert(index, PlayableUnit::pending(index));
        self.state.cumulative_audio += self.format.duration_of(record.samples as usize);
        self.report.units += 1;
        debug!(session = %self.id, index, samples = record.samples, "chunk received");
        self.emit(NarrationEvent::UnitQueued { index });

        if let Some(pending) = self.gate.observe(&record) {
            self.release_first_audio(pending);
        }

        let decoder = self.decoder.clone();
        self.decodes
            .spawn(async move { (index, decoder.decode(record).await) });

        let actions = self.chainer.push_unit(index);
        self.apply(actions);
    }

    fn on_malformed(&mut self, e: MalformedRecordError) {
        self.emit(NarrationEvent::MalformedRecord {
            line: e.line,
            reason: e.reason,
        });
    }

    fn on_complete(
        &mut self,
        explicit_end: bool,
        interrupted: Option<TransportError>,
    ) -> Result<(), NarrationError> {
        self.state.complete = true;
        if self.state.units.is_empty() {
            warn!(session = %self.id, "stream completed without any audio");
            return Err(NarrationError::EmptyStream);
        }

        if let Some(pending) = self.gate.finalize() {
            self.release_first_audio(pending);
        }

        let actions = self.chainer.complete();
        let summary = ChainSummary {
            units: self.state.units.len(),
            head: self.state.units.keys().next().copied(),
            final_index: self.chainer.final_index(),
            duration: self.state.cumulative_audio,
            explicit_end,
            interrupted,
        };
        info!(
            session = %self.id,
            units = summary.units,
            secs = summary.duration.as_secs_f64(),
            explicit_end,
            "narration fully received and chained"
        );
        self.emit(NarrationEvent::StreamComplete {
            units: summary.units,
            explicit_end,
        });
        if let Some(tx) = self.chain_ready.take() {
            let _ = tx.send(Ok(summary));
        }

        self.apply(actions);
        Ok(())
    }

    fn on_transport_error(&mut self, e: TransportError) -> Result<(), NarrationError> {
        if self.state.units.is_empty() {
            error!(session = %self.id, error = %e, "transport failed before any audio arrived");
            return Err(NarrationError::Transport(e));
        }
        warn!(
            session = %self.id,
            error = %e,
            units = self.state.units.len(),
            "transport failed mid-stream, keeping received audio"
        );
        self.emit(NarrationEvent::TransportInterrupted {
            reason: e.message.clone(),
        });
        self.on_complete(false, Some(e))
    }

    fn on_decoded(&mut self, done: Result<(usize, Result<DecodedAudio, DecodeError>), JoinError>) {
        let (index, result) = match done {
            Ok(done) => done,
            Err(join_err) => {
                if !join_err.is_cancelled() {
                    error!(session = %self.id, "decode task failed: {join_err}");
                }
                return;
            }
        };

        match result {
            Ok(audio) => {
                if let Some(unit) = self.state.units.get_mut(&index) {
                    unit.attach(Arc::new(audio));
                }
                self.emit(NarrationEvent::UnitReady { index });
                let actions = self.chainer.mark_ready(index);
                self.apply(actions);
            }
            Err(e) => {
                error!(session = %self.id, index, error = %e, "chunk could not be decoded, chaining around it");
                if let Some(unit) = self.state.units.get_mut(&index) {
                    unit.mark_failed();
                }
                self.report.decode_failures += 1;
                self.emit(NarrationEvent::DecodeFailed {
                    index,
                    reason: e.to_string(),
                });
                let actions = self.chainer.mark_failed(index);
                self.apply(actions);
            }
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) {
        let index = event.index;
        match event.kind {
            SinkEventKind::Ended => {
                debug!(session = %self.id, index, "unit ended");
                self.release_unit(index);
                let actions = self.chainer.on_ended(index);
                self.apply(actions);
            }
            SinkEventKind::Error(reason) => {
                error!(session = %self.id, index, reason = %reason, "unit failed during playback");
                self.release_unit(index);
                let actions = self.chainer.on_unit_error(index, &reason);
                self.apply(actions);
            }
        }
    }

    fn on_timer(&mut self, timer: Result<Timer, JoinError>) {
        let actions = match timer {
            Ok(Timer::ReadyCheck(index)) => self.chainer.on_ready_check(index),
            Ok(Timer::PlayRetry(index)) => self.chainer.on_play_retry(index),
            Err(_) => return,
        };
        self.apply(actions);
    }

    fn on_play_requested(&mut self) {
        info!(session = %self.id, "playback requested");
        let actions = self.chainer.start();
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<ChainAction>) {
        for action in actions {
            match action {
                ChainAction::Play(index) => self.start_unit(index),
                ChainAction::AwaitReady { index, fallback } => {
                    debug!(session = %self.id, index, "next unit not ready yet");
                    self.schedule(Timer::ReadyCheck(index), fallback);
                }
                ChainAction::RetryPlay { index, after } => {
                    self.schedule(Timer::PlayRetry(index), after);
                }
                ChainAction::PlaybackFailed { index, reason } => {
                    let failure = PlaybackError { index, reason };
                    error!(session = %self.id, error = %failure, "playback error, continuing with the next unit");
                    self.report.playback_failures += 1;
                    self.release_unit(index);
                    self.emit(NarrationEvent::PlaybackFailed {
                        index,
                        reason: failure.reason,
                    });
                }
                ChainAction::NarrationFinished => {
                    info!(session = %self.id, "narration finished playing");
                    self.report.finished_playing = true;
                    self.emit(NarrationEvent::NarrationFinished);
                }
            }
        }
    }

    fn start_unit(&mut self, index: usize) {
        let audio = self.state.units.get(&index).and_then(PlayableUnit::audio);
        let result = match audio {
            Some(audio) => self
                .sink
                .play(index, audio, UnitEvents::new(index, self.sink_tx.clone())),
            None => Err(PlaybackRejected("unit has no audio".to_string())),
        };

        match result {
            Ok(()) => {
                debug!(session = %self.id, index, "unit started");
                self.emit(NarrationEvent::Started { index });
            }
            Err(rejected) => {
                warn!(session = %self.id, index, reason = %rejected, "play rejected");
                let actions = self.chainer.on_play_rejected(index, &rejected.0);
                self.apply(actions);
            }
        }
    }

    fn schedule(&mut self, timer: Timer, after: Duration) {
        self.timers.spawn(async move {
            tokio::time::sleep(after).await;
            timer
        });
    }

    fn release_unit(&mut self, index: usize) {
        if let Some(unit) = self.state.units.get_mut(&index) {
            if unit.release() {
                self.sink.release(index);
            }
        }
    }

    fn release_first_audio(&mut self, pending: PendingRelease) {
        self.state.first_release_fired = true;
        self.report.early_release_fired = true;
        self.releases.spawn_blocking(move || pending.assemble());
    }

    fn on_release_assembled(&mut self, done: Result<EarlyRelease, JoinError>) {
        match done {
            Ok(release) => {
                if let Some(tx) = self.first_audio.take() {
                    let _ = tx.send(release);
                }
            }
            Err(join_err) => {
                if !join_err.is_cancelled() {
                    error!(session = %self.id, "assembling first audio failed: {join_err}");
                }
            }
        }
    }

    fn fail(&mut self, e: NarrationError) {
        if let Some(tx) = self.chain_ready.take() {
            let _ = tx.send(Err(e));
        }
    }

    fn teardown(&mut self) {
        self.decodes.abort_all();
        self.releases.abort_all();
        self.timers.abort_all();
        for (index, unit) in self.state.units.iter_mut() {
            if unit.release() {
                self.sink.pause(*index);
                self.sink.release(*index);
            }
        }
        debug!(session = %self.id, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::stream;
    use tts_core::{wav, StreamRecord};

    use super::*;
    use crate::sink::ClockSink;

    const RATE: u32 = 1_000;

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            server_url: String::new(),
            sample_rate: RATE,
            early_release_secs: 0.05,
            decode_timeout_ms: 5_000,
            ready_fallback_ms: 20,
            play_retry_ms: 10,
        }
    }

    fn chunk_line(index: u32, samples: usize) -> String {
        let pcm = vec![index as f32 * 0.1; samples];
        StreamRecord::Chunk(ChunkRecord {
            index,
            data: wav::encode_wav_base64(&pcm, AudioFormat::mono_f32(RATE)),
            samples: samples as u32,
        })
        .to_line()
    }

    fn body(lines: Vec<String>) -> impl Stream<Item = Result<Vec<u8>, String>> + Unpin + Send {
        stream::iter(lines.into_iter().map(|l| Ok(l.into_bytes())).collect::<Vec<_>>())
    }

    #[derive(Default)]
    struct Script {
        started: Vec<usize>,
        notifiers: HashMap<usize, UnitEvents>,
        paused: Vec<usize>,
        released: Vec<usize>,
        reject_next: usize,
    }

    /// Sink driven by the test: units end only when the test says so.
    #[derive(Clone, Default)]
    struct ScriptedSink(Arc<Mutex<Script>>);

    impl ScriptedSink {
        fn finish(&self, index: usize) {
            let script = self.0.lock().unwrap();
            script.notifiers[&index].ended();
        }

        fn started(&self) -> Vec<usize> {
            self.0.lock().unwrap().started.clone()
        }

        fn released(&self) -> Vec<usize> {
            self.0.lock().unwrap().released.clone()
        }
    }

    impl AudioSink for ScriptedSink {
        fn play(
            &mut self,
            index: usize,
            _audio: Arc<DecodedAudio>,
            events: UnitEvents,
        ) -> Result<(), PlaybackRejected> {
            let mut script = self.0.lock().unwrap();
            if script.reject_next > 0 {
                script.reject_next -= 1;
                return Err(PlaybackRejected("device busy".to_string()));
            }
            script.started.push(index);
            script.notifiers.insert(index, events);
            Ok(())
        }

        fn pause(&mut self, index: usize) {
            self.0.lock().unwrap().paused.push(index);
        }

        fn release(&mut self, index: usize) {
            self.0.lock().unwrap().released.push(index);
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<NarrationEvent>,
        wanted: NarrationEvent,
    ) -> Vec<NarrationEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}, saw {seen:?}"))
                .expect("session closed its event stream");
            let done = event == wanted;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped_and_chain_plays_in_order() {
        let sink = ScriptedSink::default();
        let lines = vec![
            chunk_line(0, 40),
            "{\"index\": 7, \"oops\"\n".to_string(),
            chunk_line(1, 40),
            StreamRecord::End.to_line(),
        ];
        let mut handle = spawn_narration(body(lines), sink.clone(), &config());

        let summary = (&mut handle.chain_ready).await.unwrap().unwrap();
        assert_eq!(summary.units, 2);
        assert!(summary.explicit_end);
        assert_eq!(summary.final_index, Some(1));

        handle.play();
        wait_for(&mut handle.events, NarrationEvent::Started { index: 0 }).await;
        sink.finish(0);
        wait_for(&mut handle.events, NarrationEvent::Started { index: 1 }).await;
        sink.finish(1);
        wait_for(&mut handle.events, NarrationEvent::NarrationFinished).await;

        let report = handle.wait().await.unwrap();
        assert_eq!(sink.started(), vec![0, 1]);
        assert_eq!(report.units, 2);
        assert_eq!(report.malformed_lines, 1);
        assert!(report.finished_playing);
        assert_eq!(sink.released(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_close_without_end_marker_leaves_usable_chain() {
        let sink = ClockSink::new();
        let log = sink.play_log();
        let lines = vec![chunk_line(0, 30), chunk_line(1, 30)];
        let mut handle = spawn_narration(body(lines), sink, &config());

        let summary = (&mut handle.chain_ready).await.unwrap().unwrap();
        assert_eq!(summary.units, 2);
        assert!(!summary.explicit_end);

        handle.play();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(report.finished_playing);
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_empty_stream_is_terminal() {
        let mut handle = spawn_narration(
            body(vec![StreamRecord::End.to_line()]),
            ScriptedSink::default(),
            &config(),
        );

        let ready = (&mut handle.chain_ready).await.unwrap();
        assert!(matches!(ready, Err(NarrationError::EmptyStream)));
        // Never blocks: the first-audio channel closes.
        assert!((&mut handle.first_audio).await.is_err());
        assert!(matches!(handle.wait().await, Err(NarrationError::EmptyStream)));
    }

    #[tokio::test]
    async fn test_transport_failure_before_audio_is_hard_error() {
        let reads = stream::iter(vec![Err::<Vec<u8>, _>("connection refused".to_string())]);
        let mut handle = spawn_narration(reads, ScriptedSink::default(), &config());

        assert!(matches!(
            handle.wait().await,
            Err(NarrationError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_mid_stream_keeps_audio() {
        let reads = stream::iter(vec![
            Ok(chunk_line(0, 30).into_bytes()),
            Err("connection reset".to_string()),
        ]);
        let sink = ClockSink::new();
        let log = sink.play_log();
        let mut handle = spawn_narration(reads, sink, &config());

        let summary = (&mut handle.chain_ready).await.unwrap().unwrap();
        assert_eq!(summary.units, 1);
        assert!(summary.interrupted.is_some());

        handle.play();
        let report = handle.wait().await.unwrap();
        assert!(report.finished_playing);
        assert_eq!(*log.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_first_audio_arrives_before_completion() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Vec<u8>, String>>();
        let mut handle = spawn_narration(rx, ScriptedSink::default(), &config());

        // 60 ms of audio crosses the 50 ms threshold.
        tx.unbounded_send(Ok(chunk_line(0, 60).into_bytes())).unwrap();
        let release = tokio::time::timeout(Duration::from_secs(5), &mut handle.first_audio)
            .await
            .unwrap()
            .unwrap();
        assert!(!release.at_completion);
        assert_eq!(release.audio.samples.len(), 60);
        assert!(handle.chain_ready.try_recv().is_err());

        tx.unbounded_send(Ok(StreamRecord::End.to_line().into_bytes())).unwrap();
        let summary = (&mut handle.chain_ready).await.unwrap().unwrap();
        assert_eq!(summary.units, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_short_narration_releases_at_completion() {
        let lines = vec![chunk_line(0, 20), StreamRecord::End.to_line()];
        let mut handle = spawn_narration(body(lines), ScriptedSink::default(), &config());

        let release = (&mut handle.first_audio).await.unwrap();
        assert!(release.at_completion);
        assert_eq!(release.audio.samples.len(), 20);
    }

    #[tokio::test]
    async fn test_abort_pauses_and_releases_everything() {
        let sink = ScriptedSink::default();
        let lines = vec![chunk_line(0, 40), chunk_line(1, 40), StreamRecord::End.to_line()];
        let mut handle = spawn_narration(body(lines), sink.clone(), &config());

        (&mut handle.chain_ready).await.unwrap().unwrap();
        handle.play();
        wait_for(&mut handle.events, NarrationEvent::Started { index: 0 }).await;

        handle.abort();
        assert!(matches!(handle.wait().await, Err(NarrationError::Aborted)));

        let script = sink.0.lock().unwrap();
        assert!(script.paused.contains(&0));
        let mut released = script.released.clone();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_rejected_play_is_retried() {
        let sink = ScriptedSink::default();
        sink.0.lock().unwrap().reject_next = 1;
        let lines = vec![chunk_line(0, 40), StreamRecord::End.to_line()];
        let mut handle = spawn_narration(body(lines), sink.clone(), &config());

        (&mut handle.chain_ready).await.unwrap().unwrap();
        handle.play();
        wait_for(&mut handle.events, NarrationEvent::Started { index: 0 }).await;
        assert_eq!(sink.started(), vec![0]);
        sink.finish(0);

        let report = handle.wait().await.unwrap();
        assert_eq!(report.playback_failures, 0);
        assert!(report.finished_playing);
    }

    #[tokio::test]
    async fn test_undecodable_chunk_is_chained_around() {
        let sink = ScriptedSink::default();
        let broken = StreamRecord::Chunk(ChunkRecord {
            index: 1,
            data: "not base64!".to_string(),
            samples: 40,
        })
        .to_line();
        let lines = vec![
            chunk_line(0, 40),
            broken,
            chunk_line(2, 40),
            StreamRecord::End.to_line(),
        ];
        let mut handle = spawn_narration(body(lines), sink.clone(), &config());

        (&mut handle.chain_ready).await.unwrap().unwrap();
        handle.play();
        wait_for(&mut handle.events, NarrationEvent::Started { index: 0 }).await;
        sink.finish(0);
        wait_for(&mut handle.events, NarrationEvent::Started { index: 2 }).await;
        sink.finish(2);

        let report = handle.wait().await.unwrap();
        assert_eq!(sink.started(), vec![0, 2]);
        assert_eq!(report.decode_failures, 1);
        assert!(report.finished_playing);
    }

    #[tokio::test]
    async fn test_repeated_index_is_skipped() {
        let sink = ClockSink::new();
        let log = sink.play_log();
        let lines = vec![
            chunk_line(0, 20),
            chunk_line(0, 20),
            chunk_line(1, 20),
            StreamRecord::End.to_line(),
        ];
        let mut handle = spawn_narration(body(lines), sink, &config());

        let seen = wait_for(
            &mut handle.events,
            NarrationEvent::StreamComplete { units: 2, explicit_end: true },
        )
        .await;
        assert!(seen.contains(&NarrationEvent::OutOfSequence { index: 0, expected: 1 }));

        handle.play();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.units, 2);
        assert_eq!(report.malformed_lines, 1);
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
    }
}
