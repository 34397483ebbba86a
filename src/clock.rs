//! Time sources for switching decisions and stream timestamps
//!
//! Everything that gates on elapsed time (face-check throttle, switch
//! hysteresis) asks a [`Clock`] instead of calling `Instant::now()` directly,
//! so tests can drive time by hand.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time capability
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock backed by `Instant::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: std::sync::Arc<Mutex<Instant>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: std::sync::Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

#[cfg(test)]
impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// A presentation time paired with the host instant it was produced at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingEvent {
    pub stream_time: Duration,
    pub host_time: Instant,
}

/// Stream clock for the output device
///
/// Maps host instants onto the stream's presentation timeline. The producer
/// anchors it whenever it (re)starts so the next sample's presentation time
/// lines up with that instant, and posts a timing event for every sample.
/// Consumers use it to see how far behind real time a sample is.
#[derive(Debug)]
pub struct StreamClock {
    anchor: Mutex<Option<Instant>>,
    last_event: Mutex<Option<TimingEvent>>,
    events_posted: Mutex<u64>,
}

impl StreamClock {
    /// Create a stream clock whose time zero is `anchor`
    #[cfg(test)]
    pub fn anchored_at(anchor: Instant) -> Self {
        let clock = Self::unanchored();
        *clock.anchor.lock() = Some(anchor);
        clock
    }

    /// Clock with no anchor; host instants cannot be mapped to stream time
    pub fn unanchored() -> Self {
        Self {
            anchor: Mutex::new(None),
            last_event: Mutex::new(None),
            events_posted: Mutex::new(0),
        }
    }

    /// Line `stream_time` up with `host_time`
    ///
    /// Returns `false` and leaves the clock unchanged when `host_time` is too
    /// early to hold that much stream time.
    pub fn anchor(&self, stream_time: Duration, host_time: Instant) -> bool {
        match host_time.checked_sub(stream_time) {
            Some(zero) => {
                *self.anchor.lock() = Some(zero);
                true
            }
            None => false,
        }
    }

    /// Convert a host instant into stream time
    ///
    /// Instants before the anchor saturate to zero. Returns `None` when the
    /// clock was never anchored.
    pub fn to_stream_time(&self, at: Instant) -> Option<Duration> {
        self.anchor.lock().map(|anchor| at.saturating_duration_since(anchor))
    }

    /// How far `at` is past the presentation time `stream_time`
    pub fn lag_behind(&self, stream_time: Duration, at: Instant) -> Option<Duration> {
        self.to_stream_time(at).map(|now| now.saturating_sub(stream_time))
    }

    /// Record that `stream_time` was presented at `host_time`
    pub fn post_timing_event(&self, stream_time: Duration, host_time: Instant) {
        *self.last_event.lock() = Some(TimingEvent {
            stream_time,
            host_time,
        });
        *self.events_posted.lock() += 1;
    }

    pub fn last_event(&self) -> Option<TimingEvent> {
        *self.last_event.lock()
    }

    pub fn events_posted(&self) -> u64 {
        *self.events_posted.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - t0, Duration::from_millis(1500));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn test_stream_time_relative_to_anchor() {
        let clock = ManualClock::new();
        let stream = StreamClock::anchored_at(clock.now());
        clock.advance(Duration::from_millis(250));
        assert_eq!(
            stream.to_stream_time(clock.now()),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_stream_time_saturates_before_anchor() {
        let clock = ManualClock::new();
        let early = clock.now();
        clock.advance(Duration::from_secs(1));
        let stream = StreamClock::anchored_at(clock.now());
        assert_eq!(stream.to_stream_time(early), Some(Duration::ZERO));
    }

    #[test]
    fn test_unanchored_clock_still_records_events() {
        let stream = StreamClock::unanchored();
        let now = Instant::now();
        assert!(stream.to_stream_time(now).is_none());

        stream.post_timing_event(Duration::from_millis(16), now);
        assert_eq!(stream.events_posted(), 1);
        assert_eq!(
            stream.last_event().map(|e| e.stream_time),
            Some(Duration::from_millis(16))
        );
    }

    #[test]
    fn test_anchor_lines_up_stream_time() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(10));
        let stream = StreamClock::unanchored();

        assert!(stream.anchor(Duration::from_secs(2), clock.now()));
        assert_eq!(stream.to_stream_time(clock.now()), Some(Duration::from_secs(2)));

        clock.advance(Duration::from_millis(40));
        assert_eq!(
            stream.lag_behind(Duration::from_secs(2), clock.now()),
            Some(Duration::from_millis(40))
        );
        // Samples ahead of the clock are not late
        assert_eq!(
            stream.lag_behind(Duration::from_secs(3), clock.now()),
            Some(Duration::ZERO)
        );
    }
}
