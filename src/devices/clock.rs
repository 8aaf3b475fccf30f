//! Per-process stamp clock for last-writer-wins ordering

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Write timestamp, ordered by milliseconds and then by writing peer
///
/// The peer component makes equal-millisecond writes from different
/// processes compare deterministically everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub millis: i64,
    pub peer: PeerId,
}

impl Stamp {
    #[must_use]
    pub fn new(millis: i64, peer: &str) -> Self {
        Self {
            millis,
            peer: PeerId::new(peer),
        }
    }

    /// Stamp older than anything a clock produces
    #[must_use]
    pub fn epoch() -> Self {
        Self::new(0, "")
    }

    #[must_use]
    pub fn is_epoch(&self) -> bool {
        *self == Self::epoch()
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.millis, self.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClockSource {
    Wall,
    Logical,
}

/// Monotonic stamp source
///
/// Never goes backwards, and jumps forward past every remote stamp it
/// observes so local writes always supersede what has been seen.
#[derive(Debug, Clone)]
pub struct Clock {
    peer: PeerId,
    last: i64,
    source: ClockSource,
}

impl Clock {
    /// Clock driven by wall time
    #[must_use]
    pub const fn system(peer: PeerId) -> Self {
        Self {
            peer,
            last: 0,
            source: ClockSource::Wall,
        }
    }

    /// Clock that only counts; deterministic stamps for tests and replays
    #[must_use]
    pub const fn logical(peer: PeerId) -> Self {
        Self {
            peer,
            last: 0,
            source: ClockSource::Logical,
        }
    }

    #[must_use]
    pub const fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Produce the next stamp
    pub fn tick(&mut self) -> Stamp {
        let next = match self.source {
            ClockSource::Wall => chrono::Utc::now()
                .timestamp_millis()
                .max(self.last.saturating_add(1)),
            ClockSource::Logical => self.last.saturating_add(1),
        };
        self.last = next;
        Stamp {
            millis: next,
            peer: self.peer.clone(),
        }
    }

    /// Advance past a stamp seen from elsewhere
    pub fn observe(&mut self, stamp: &Stamp) {
        self.last = self.last.max(stamp.millis);
    }
}
