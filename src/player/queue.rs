//! Play queue management.
//!
//! Every structural mutation keeps the current position on the same logical
//! track: an index before the touched span is unaffected, an index after it
//! shifts by the span length, and the moved or removed element itself is
//! handled explicitly. Shuffle history indices are remapped the same way.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use super::state::{EnqueueAction, RepeatMode, ShuffleMode};
use crate::model::TrackId;

/// Maximum number of shuffle history entries kept for "previous".
pub const MAX_HISTORY: usize = 100;

/// The play queue with current position tracking.
#[derive(Debug, Clone, Default)]
pub struct PlayQueue {
    tracks: Vec<TrackId>,
    /// Current position (`None` iff the queue is empty or not started)
    position: Option<usize>,
    shuffle: ShuffleMode,
    repeat: RepeatMode,
    /// Recently visited positions, oldest first (shuffle only)
    history: VecDeque<usize>,
    shuffler: Shuffler,
}

/// Result of [`PlayQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Index of the first inserted track
    pub inserted_at: usize,
    /// The current track changed and must be opened and played
    pub open_current: bool,
}

/// Result of a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoveOutcome {
    pub removed: usize,
    /// The current track was among the removed entries
    pub current_removed: bool,
}

/// Serialized form of the queue, persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSnapshot {
    pub tracks: Vec<TrackId>,
    pub position: Option<usize>,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
    pub history: Vec<usize>,
    /// Playback offset within the current track
    pub seek_position_ms: u64,
}

/// Random index source that avoids returning the same value twice in a row.
///
/// The value compared is the slot within whatever candidate list the caller
/// passes, not the track it maps to. Picks are therefore not exactly uniform:
/// the slot drawn last time is never drawn again, even when the list has
/// changed underneath it.
#[derive(Debug, Clone, Default)]
struct Shuffler {
    previous: Option<usize>,
}

impl Shuffler {
    fn pick(&mut self, interval: usize) -> usize {
        let mut rng = rand::rng();
        let mut value = rng.random_range(0..interval);
        while interval > 1 && Some(value) == self.previous {
            value = rng.random_range(0..interval);
        }
        self.previous = Some(value);
        value
    }
}

impl PlayQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from a snapshot, discarding out-of-range indices.
    pub fn from_snapshot(snapshot: &QueueSnapshot) -> Self {
        let len = snapshot.tracks.len();
        let position = match snapshot.position {
            _ if len == 0 => None,
            Some(p) => Some(p.min(len - 1)),
            None => None,
        };
        let history = snapshot
            .history
            .iter()
            .copied()
            .filter(|&i| i < len)
            .rev()
            .take(MAX_HISTORY)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        Self {
            tracks: snapshot.tracks.clone(),
            position,
            shuffle: snapshot.shuffle,
            repeat: snapshot.repeat,
            history,
            shuffler: Shuffler::default(),
        }
    }

    /// Capture the queue for persistence.
    pub fn snapshot(&self, seek_position_ms: u64) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            position: self.position,
            shuffle: self.shuffle,
            repeat: self.repeat,
            history: self.history.iter().copied().collect(),
            seek_position_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks(&self) -> &[TrackId] {
        &self.tracks
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Id of the current track.
    pub fn current(&self) -> Option<TrackId> {
        self.position.and_then(|p| self.tracks.get(p).copied())
    }

    pub fn history(&self) -> impl Iterator<Item = usize> + '_ {
        self.history.iter().copied()
    }

    pub fn shuffle(&self) -> ShuffleMode {
        self.shuffle
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    /// Set shuffle mode. Returns false when the mode was already set.
    pub fn set_shuffle(&mut self, mode: ShuffleMode) -> bool {
        if self.shuffle == mode {
            return false;
        }
        self.shuffle = mode;
        if mode == ShuffleMode::Off {
            self.history.clear();
        }
        true
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    /// Jump to an index. Out-of-range indices are ignored.
    pub fn set_position(&mut self, index: usize) -> bool {
        if index < self.tracks.len() {
            self.position = Some(index);
            true
        } else {
            false
        }
    }

    /// Insert tracks according to `action`. Existing entries are never dropped.
    pub fn enqueue(&mut self, ids: &[TrackId], action: EnqueueAction) -> EnqueueOutcome {
        let len = self.tracks.len();

        if action == EnqueueAction::Next
            && let Some(p) = self.position
            && p + 1 < len
        {
            let at = p + 1;
            self.tracks.splice(at..at, ids.iter().copied());
            for h in self.history.iter_mut() {
                if *h >= at {
                    *h += ids.len();
                }
            }
            return EnqueueOutcome {
                inserted_at: at,
                open_current: false,
            };
        }

        self.tracks.extend_from_slice(ids);
        if ids.is_empty() {
            return EnqueueOutcome {
                inserted_at: len,
                open_current: false,
            };
        }

        if action == EnqueueAction::Now {
            self.position = Some(len);
            return EnqueueOutcome {
                inserted_at: len,
                open_current: true,
            };
        }

        let open_current = self.position.is_none();
        if open_current {
            self.position = Some(0);
        }
        EnqueueOutcome {
            inserted_at: len,
            open_current,
        }
    }

    /// Replace the queue when `ids` differs element-wise, then jump to
    /// `position` or to a random index when `None`. Clears history.
    ///
    /// Returns true when the track list was replaced.
    pub fn open(&mut self, ids: &[TrackId], position: Option<usize>) -> bool {
        let replaced = self.tracks != ids;
        if replaced {
            self.tracks = ids.to_vec();
        }
        self.history.clear();

        let len = self.tracks.len();
        self.position = if len == 0 {
            None
        } else {
            Some(match position {
                Some(p) => p.min(len - 1),
                None => self.shuffler.pick(len),
            })
        };
        replaced
    }

    /// Remove the inclusive range `first..=last`, clamped to the queue.
    pub fn remove_range(&mut self, first: usize, last: usize) -> RemoveOutcome {
        let len = self.tracks.len();
        if last < first || first >= len {
            return RemoveOutcome::default();
        }
        let last = last.min(len - 1);
        let count = last - first + 1;

        let mut current_removed = false;
        if let Some(p) = self.position {
            if (first..=last).contains(&p) {
                current_removed = true;
            } else if p > last {
                self.position = Some(p - count);
            }
        }

        self.tracks.drain(first..=last);
        self.history.retain(|h| !(first..=last).contains(h));
        for h in self.history.iter_mut() {
            if *h > last {
                *h -= count;
            }
        }

        if current_removed {
            self.position = if self.tracks.is_empty() {
                None
            } else {
                Some(first.min(self.tracks.len() - 1))
            };
        }

        RemoveOutcome {
            removed: count,
            current_removed,
        }
    }

    /// Remove every occurrence of `id`.
    pub fn remove_id(&mut self, id: TrackId) -> RemoveOutcome {
        let mut outcome = RemoveOutcome::default();
        let mut i = 0;
        while i < self.tracks.len() {
            if self.tracks[i] == id {
                let step = self.remove_range(i, i);
                outcome.removed += step.removed;
                outcome.current_removed |= step.current_removed;
            } else {
                i += 1;
            }
        }
        outcome
    }

    /// Drop every entry whose id is not in `resolvable`.
    pub fn retain_resolvable(&mut self, resolvable: &HashSet<TrackId>) -> RemoveOutcome {
        let missing: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|id| !resolvable.contains(id))
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut outcome = RemoveOutcome::default();
        for id in missing {
            let step = self.remove_id(id);
            outcome.removed += step.removed;
            outcome.current_removed |= step.current_removed;
        }
        outcome
    }

    /// Relocate one element, shifting the ones in between by one slot.
    /// Both indices are clamped to the last element.
    pub fn move_item(&mut self, from: usize, to: usize) -> bool {
        let len = self.tracks.len();
        if len == 0 {
            return false;
        }
        let from = from.min(len - 1);
        let to = to.min(len - 1);
        if from == to {
            return false;
        }

        let item = self.tracks.remove(from);
        self.tracks.insert(to, item);

        self.position = self.position.map(|p| moved_index(p, from, to));
        for h in self.history.iter_mut() {
            *h = moved_index(*h, from, to);
        }
        true
    }

    /// Choose the next position and move the cursor there.
    ///
    /// Returns `None` at the end of the queue. With [`RepeatMode::Current`]
    /// a non-forced call stays on the current track. Under shuffle the
    /// current position is recorded in history first and the pick is
    /// uniform among positions not in history.
    pub fn next_position(&mut self, force: bool) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        if self.repeat == RepeatMode::Current
            && !force
            && let Some(p) = self.position
        {
            return Some(p);
        }

        let next = if self.shuffle == ShuffleMode::On {
            if let Some(p) = self.position {
                self.push_history(p);
            }
            let mut unplayed: Vec<usize> = (0..len).filter(|i| !self.history.contains(i)).collect();
            if unplayed.is_empty() {
                if self.repeat == RepeatMode::All || force {
                    unplayed = (0..len).collect();
                } else {
                    return None;
                }
            }
            unplayed[self.shuffler.pick(unplayed.len())]
        } else {
            match self.position {
                None => 0,
                Some(p) if p + 1 >= len => {
                    if self.repeat == RepeatMode::All || force {
                        0
                    } else {
                        return None;
                    }
                }
                Some(p) => p + 1,
            }
        };

        self.position = Some(next);
        Some(next)
    }

    /// Position the next call to [`next_position`](Self::next_position)
    /// would choose, when that choice is deterministic.
    pub fn peek_next(&self) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 || self.shuffle == ShuffleMode::On {
            return None;
        }
        match (self.position, self.repeat) {
            (Some(p), RepeatMode::Current) => Some(p),
            (None, _) => Some(0),
            (Some(p), RepeatMode::All) => Some((p + 1) % len),
            (Some(p), RepeatMode::Off) => (p + 1 < len).then_some(p + 1),
        }
    }

    /// Step back. Under shuffle this pops history (no-op when empty);
    /// otherwise it decrements, wrapping to the last index.
    pub fn previous(&mut self) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        let prev = if self.shuffle == ShuffleMode::On {
            self.history.pop_back()?
        } else {
            match self.position {
                Some(p) if p > 0 => p - 1,
                _ => len - 1,
            }
        };
        self.position = Some(prev);
        Some(prev)
    }

    fn push_history(&mut self, index: usize) {
        self.history.push_back(index);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

/// Where index `i` ends up after moving the element at `from` to `to`.
fn moved_index(i: usize, from: usize, to: usize) -> usize {
    if i == from {
        to
    } else if from < to && i > from && i <= to {
        i - 1
    } else if to < from && i >= to && i < from {
        i + 1
    } else {
        i
    }
}
