use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

/// Rational timestamp: `value / timescale` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamTime {
    pub value: i64,
    pub timescale: i32,
}

impl StreamTime {
    pub const fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    pub fn as_duration(&self) -> Duration {
        if self.timescale <= 0 || self.value <= 0 {
            return Duration::ZERO;
        }
        let scale = self.timescale as u128;
        let nanos = self.value as u128 * 1_000_000_000 / scale;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Time base of the output stream
///
/// One frame is `frame_ticks` ticks of a `frame_rate * 100` timescale, so
/// every timestamp is an exact integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    timescale: i32,
    frame_ticks: i64,
}

impl TimeBase {
    pub fn for_frame_rate(frame_rate: u32) -> Self {
        let frame_rate = frame_rate.max(1) as i64;
        Self {
            timescale: (frame_rate * 100).min(i32::MAX as i64) as i32,
            frame_ticks: 100,
        }
    }

    pub fn frame_duration(&self) -> StreamTime {
        StreamTime::new(self.frame_ticks, self.timescale)
    }

    /// Timing for the sample carrying `sequence_number`
    pub fn timing_for(&self, sequence_number: u64) -> SampleTiming {
        let timestamp = StreamTime::new(
            self.frame_ticks.saturating_mul(sequence_number.min(i64::MAX as u64) as i64),
            self.timescale,
        );
        SampleTiming {
            duration: self.frame_duration(),
            presentation: timestamp,
            decode: timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub duration: StreamTime,
    pub presentation: StreamTime,
    pub decode: StreamTime,
}

/// One frame handed to the output queue
#[derive(Debug, Clone)]
pub struct OutgoingSample {
    pub sequence_number: u64,
    pub timing: SampleTiming,
    pub payload: Arc<RgbImage>,

    /// Payload is the synthesized stand-in, not a camera frame
    pub placeholder: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_base_at_60fps() {
        let base = TimeBase::for_frame_rate(60);
        let duration = base.frame_duration();
        assert_eq!(duration, StreamTime::new(100, 6000));

        let timing = base.timing_for(3);
        assert_eq!(timing.presentation, StreamTime::new(300, 6000));
        assert_eq!(timing.presentation, timing.decode);
        assert_eq!(timing.duration, duration);
        assert_eq!(timing.presentation.as_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_first_sample_starts_at_zero() {
        let timing = TimeBase::for_frame_rate(30).timing_for(0);
        assert_eq!(timing.presentation.value, 0);
        assert_eq!(timing.presentation.as_duration(), Duration::ZERO);
    }

    #[test]
    fn test_zero_frame_rate_is_clamped() {
        let base = TimeBase::for_frame_rate(0);
        assert_eq!(base.frame_duration().as_duration(), Duration::from_secs(1));
    }
}
