//! Gapless, strictly ordered playback across units that become ready
//! asynchronously.
//!
//! The chainer is a pure state machine: callers feed it what happened
//! (unit arrived, decoded, ended, play rejected, timer fired) and execute
//! the [`ChainAction`]s it returns. Each unit owns exactly one "ended"
//! handler slot; linking always detaches the previous handler first, so
//! re-linking never accumulates handlers.
//!
//! Links are built incrementally while the stream is arriving, and once
//! more, unconditionally, when it completes. Decode completion order can
//! differ from index order, so only the final pass is relied on for
//! correctness.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Received, still decoding.
    Pending,
    Ready,
    /// Decode failed; the chain routes around it.
    Failed,
    Playing,
    Ended,
}

/// State of a unit's single "ended" handler slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    Linked { next: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainAction {
    /// Start playback of this unit now.
    Play(usize),
    /// The target is not decoded yet; re-check after `fallback` in case the
    /// readiness notification is missed.
    AwaitReady { index: usize, fallback: Duration },
    /// Playback was rejected once; try again after `after`.
    RetryPlay { index: usize, after: Duration },
    /// Playback failed for good; the chain has moved on.
    PlaybackFailed { index: usize, reason: String },
    /// The final unit finished playing.
    NarrationFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTiming {
    pub ready_fallback: Duration,
    pub play_retry: Duration,
}

impl Default for ChainTiming {
    fn default() -> Self {
        Self {
            ready_fallback: Duration::from_millis(500),
            play_retry: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    /// `start` was requested before any unit existed.
    HeadRequested,
    Waiting(usize),
    /// Playback was rejected once; only the retry timer may start it.
    Retrying(usize),
    Playing(usize),
    /// The unit ended and its successor has not arrived yet.
    Stalled(usize),
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct EndedHandler {
    next: usize,
}

#[derive(Debug)]
struct UnitSlot {
    state: UnitState,
    on_ended: Option<EndedHandler>,
    play_attempts: u8,
    is_final: bool,
}

impl UnitSlot {
    fn new() -> Self {
        Self {
            state: UnitState::Pending,
            on_ended: None,
            play_attempts: 0,
            is_final: false,
        }
    }
}

#[derive(Debug)]
pub struct PlaybackChainer {
    timing: ChainTiming,
    slots: BTreeMap<usize, UnitSlot>,
    cursor: Cursor,
    complete: bool,
    final_index: Option<usize>,
}

impl PlaybackChainer {
    pub fn new(timing: ChainTiming) -> Self {
        Self {
            timing,
            slots: BTreeMap::new(),
            cursor: Cursor::NotStarted,
            complete: false,
            final_index: None,
        }
    }

    /// Register a newly received unit and link its predecessor to it.
    pub fn push_unit(&mut self, index: usize) -> Vec<ChainAction> {
        if self.slots.contains_key(&index) {
            warn!(index, "unit already registered");
            return Vec::new();
        }
        if self.complete {
            warn!(index, "unit arrived after the chain was completed");
            return Vec::new();
        }

        let prev = self.slots.range(..index).next_back().map(|(k, _)| *k);
        self.slots.insert(index, UnitSlot::new());
        if let Some(prev) = prev {
            self.link(prev, index);
        }

        match self.cursor {
            Cursor::HeadRequested if prev.is_none() => self.try_start(index),
            Cursor::Stalled(ended) if prev == Some(ended) => self.try_start(index),
            _ => Vec::new(),
        }
    }

    /// Point `from`'s ended handler at `to`, detaching any existing handler first.
    pub fn link(&mut self, from: usize, to: usize) {
        let Some(slot) = self.slots.get_mut(&from) else {
            warn!(from, to, "cannot link an unknown unit");
            return;
        };
        if let Some(stale) = slot.on_ended.take() {
            trace!(from, previous = stale.next, "detached ended handler");
        }
        slot.on_ended = Some(EndedHandler { next: to });
        trace!(from, to, "linked");
    }

    /// Re-establish every `i -> i+1` link from scratch. Idempotent.
    pub fn relink_all(&mut self) {
        let keys: Vec<usize> = self.slots.keys().copied().collect();
        for pair in keys.windows(2) {
            self.link(pair[0], pair[1]);
        }
        if let Some(last) = keys.last() {
            if let Some(slot) = self.slots.get_mut(last) {
                slot.on_ended = None;
            }
        }
        debug!(units = keys.len(), "chain relinked");
    }

    /// The stream finished arriving: run the authoritative re-link pass and
    /// mark the last unit as final.
    pub fn complete(&mut self) -> Vec<ChainAction> {
        if self.complete {
            return Vec::new();
        }
        self.complete = true;
        self.relink_all();

        self.final_index = self.slots.keys().next_back().copied();
        if let Some(last) = self.final_index {
            if let Some(slot) = self.slots.get_mut(&last) {
                slot.is_final = true;
            }
        }

        match self.cursor {
            Cursor::Stalled(ended) => self.advance_from(ended),
            _ => Vec::new(),
        }
    }

    /// Begin playback at the head of the chain. Only the first call has an effect.
    pub fn start(&mut self) -> Vec<ChainAction> {
        if self.cursor != Cursor::NotStarted {
            debug!(cursor = ?self.cursor, "chain already started");
            return Vec::new();
        }
        match self.slots.keys().next().copied() {
            Some(head) => self.try_start(head),
            None => {
                self.cursor = Cursor::HeadRequested;
                Vec::new()
            }
        }
    }

    pub fn mark_ready(&mut self, index: usize) -> Vec<ChainAction> {
        let Some(slot) = self.slots.get_mut(&index) else {
            return Vec::new();
        };
        if slot.state == UnitState::Pending {
            slot.state = UnitState::Ready;
        }
        if self.cursor == Cursor::Waiting(index) {
            return self.try_start(index);
        }
        Vec::new()
    }

    pub fn mark_failed(&mut self, index: usize) -> Vec<ChainAction> {
        let Some(slot) = self.slots.get_mut(&index) else {
            return Vec::new();
        };
        if slot.state == UnitState::Pending {
            slot.state = UnitState::Failed;
        }
        if self.cursor == Cursor::Waiting(index) {
            return self.advance_from(index);
        }
        Vec::new()
    }

    /// Natural end of a unit's playback.
    pub fn on_ended(&mut self, index: usize) -> Vec<ChainAction> {
        if self.cursor != Cursor::Playing(index) {
            debug!(index, cursor = ?self.cursor, "ignoring ended event for a unit that is not playing");
            return Vec::new();
        }
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.state = UnitState::Ended;
        }
        self.advance_from(index)
    }

    /// The sink reported an error while the unit was playing.
    pub fn on_unit_error(&mut self, index: usize, reason: &str) -> Vec<ChainAction> {
        if self.cursor != Cursor::Playing(index) {
            return Vec::new();
        }
        if let Some(slot) = self.slots.get_mut(&index) {
            slot.state = UnitState::Ended;
        }
        let mut actions = vec![ChainAction::PlaybackFailed {
            index,
            reason: reason.to_string(),
        }];
        actions.extend(self.advance_from(index));
        actions
    }

    /// Starting playback was rejected. The first rejection schedules one
    /// retry; the second reports the failure and moves on.
    pub fn on_play_rejected(&mut self, index: usize, reason: &str) -> Vec<ChainAction> {
        if self.cursor != Cursor::Playing(index) {
            return Vec::new();
        }
        let Some(slot) = self.slots.get_mut(&index) else {
            return Vec::new();
        };
        slot.play_attempts += 1;

        if slot.play_attempts < 2 {
            slot.state = UnitState::Ready;
            self.cursor = Cursor::Retrying(index);
            return vec![ChainAction::RetryPlay {
                index,
                after: self.timing.play_retry,
            }];
        }

        slot.state = UnitState::Ended;
        let mut actions = vec![ChainAction::PlaybackFailed {
            index,
            reason: reason.to_string(),
        }];
        actions.extend(self.advance_from(index));
        actions
    }

    /// Fallback timer for a unit that was not ready when its turn came.
    pub fn on_ready_check(&mut self, index: usize) -> Vec<ChainAction> {
        if self.cursor != Cursor::Waiting(index) {
            return Vec::new();
        }
        self.try_start(index)
    }

    pub fn on_play_retry(&mut self, index: usize) -> Vec<ChainAction> {
        if self.cursor != Cursor::Retrying(index) {
            return Vec::new();
        }
        self.try_start(index)
    }

    pub fn state(&self, index: usize) -> Option<UnitState> {
        self.slots.get(&index).map(|slot| slot.state)
    }

    pub fn link_state(&self, index: usize) -> LinkState {
        match self.slots.get(&index).and_then(|slot| slot.on_ended) {
            Some(handler) => LinkState::Linked { next: handler.next },
            None => LinkState::Unlinked,
        }
    }

    /// Number of ended handlers attached to a unit (0 or 1).
    pub fn handler_count(&self, index: usize) -> usize {
        self.slots
            .get(&index)
            .map_or(0, |slot| usize::from(slot.on_ended.is_some()))
    }

    pub fn is_final(&self, index: usize) -> bool {
        self.slots.get(&index).is_some_and(|slot| slot.is_final)
    }

    pub fn final_index(&self) -> Option<usize> {
        self.final_index
    }

    /// Order in which `on_ended` would walk the chain from its head.
    pub fn play_order(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut current = self.slots.keys().next().copied();
        while let Some(index) = current {
            if order.contains(&index) {
                break;
            }
            order.push(index);
            current = self.slots.get(&index).and_then(|s| s.on_ended).map(|h| h.next);
        }
        order
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_started(&self) -> bool {
        self.cursor != Cursor::NotStarted
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.cursor, Cursor::Playing(_))
    }

    pub fn is_finished(&self) -> bool {
        self.cursor == Cursor::Finished
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn try_start(&mut self, index: usize) -> Vec<ChainAction> {
        let Some(slot) = self.slots.get_mut(&index) else {
            return Vec::new();
        };
        match slot.state {
            UnitState::Ready => {
                slot.state = UnitState::Playing;
                self.cursor = Cursor::Playing(index);
                vec![ChainAction::Play(index)]
            }
            UnitState::Pending => {
                self.cursor = Cursor::Waiting(index);
                vec![ChainAction::AwaitReady {
                    index,
                    fallback: self.timing.ready_fallback,
                }]
            }
            UnitState::Failed => {
                debug!(index, "skipping undecodable unit");
                self.advance_from(index)
            }
            UnitState::Playing | UnitState::Ended => Vec::new(),
        }
    }

    fn advance_from(&mut self, index: usize) -> Vec<ChainAction> {
        let next = self
            .slots
            .get(&index)
            .and_then(|slot| slot.on_ended)
            .map(|handler| handler.next);

        if let Some(next) = next {
            return self.try_start(next);
        }
        if self.complete {
            self.cursor = Cursor::Finished;
            debug!(last = index, "narration finished playing");
            return vec![ChainAction::NarrationFinished];
        }
        self.cursor = Cursor::Stalled(index);
        trace!(index, "waiting for the next unit to arrive");
        Vec::new()
    }
}

impl Default for PlaybackChainer {
    fn default() -> Self {
        Self::new(ChainTiming::default())
    }
}
