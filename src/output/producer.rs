use super::queue::{EnqueueError, OutputQueue};
use super::sample::{OutgoingSample, TimeBase};
use crate::clock::{Clock, StreamClock};
use crate::selector::ActiveCameraSelector;
use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Output stream shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Enqueued,
    Dropped,
}

/// Counters since the producer was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub ticks: u64,
    pub enqueued: u64,
    pub dropped: u64,
    pub placeholders: u64,
}

/// Fixed-rate timer that turns the active camera into a sample stream
///
/// Ticks are independent of capture timing: every tick emits the best frame
/// available (or a placeholder) with the next sequence number, whether or not
/// any camera delivered something new.
pub struct FrameProducer {
    core: Option<ProducerCore>,
    handle: Option<JoinHandle<ProducerCore>>,
    running: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    stream_clock: Arc<StreamClock>,
}

struct ProducerCore {
    selector: Arc<ActiveCameraSelector>,
    queue: Arc<OutputQueue>,
    time_base: TimeBase,
    placeholder: Arc<RgbImage>,
    sequence_number: u64,
    stream_clock: Arc<StreamClock>,
    stats: ProducerStats,
    stats_every: u64,
}

impl FrameProducer {
    pub fn new(
        config: ProducerConfig,
        selector: Arc<ActiveCameraSelector>,
        queue: Arc<OutputQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stream_clock = Arc::new(StreamClock::unanchored());
        let core = ProducerCore {
            selector,
            queue,
            time_base: TimeBase::for_frame_rate(config.frame_rate),
            placeholder: Arc::new(placeholder_frame(config.width, config.height)),
            sequence_number: 0,
            stream_clock: Arc::clone(&stream_clock),
            stats: ProducerStats::default(),
            stats_every: config.frame_rate.max(1) as u64 * 5,
        };

        Self {
            core: Some(core),
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
            clock,
            stream_clock,
        }
    }

    /// Start the timer thread
    ///
    /// A restart continues the sequence where the last run stopped. Every
    /// start re-anchors the stream clock so the next sample is due now.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            bail!("Frame producer already running");
        }
        let Some(mut core) = self.core.take() else {
            bail!("Frame producer state was lost");
        };

        let next_presentation = core.time_base.timing_for(core.sequence_number).presentation;
        if !self.stream_clock.anchor(next_presentation.as_duration(), self.clock.now()) {
            tracing::warn!("Could not anchor stream clock; sample lag will not be tracked");
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let clock = Arc::clone(&self.clock);
        let period = core.time_base.frame_duration().as_duration();

        tracing::info!(
            "Starting frame producer at {:.1} fps from sequence {}",
            1.0 / period.as_secs_f64(),
            core.sequence_number
        );

        let handle = thread::Builder::new()
            .name("frame-producer".into())
            .spawn(move || {
                run_timer(&mut core, clock.as_ref(), period, &running);
                core
            })
            .context("Failed to spawn frame producer thread")?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Suspend the timer; queued samples stay where they are
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };

        match handle.join() {
            Ok(core) => {
                tracing::info!("Frame producer stopped at sequence {}", core.sequence_number);
                self.core = Some(core);
            }
            Err(_) => tracing::error!("Frame producer thread panicked"),
        }
    }

    /// Clock relating sample presentation times to host time
    pub fn stream_clock(&self) -> Arc<StreamClock> {
        Arc::clone(&self.stream_clock)
    }

    /// Sequence number of the next sample, when stopped
    pub fn next_sequence_number(&self) -> Option<u64> {
        self.core.as_ref().map(|core| core.sequence_number)
    }

    /// Counters from the last run, when stopped
    pub fn stats(&self) -> Option<ProducerStats> {
        self.core.as_ref().map(|core| core.stats)
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ProducerCore {
    /// Manufacture and enqueue one sample
    ///
    /// The sequence number advances on every tick, dropped or not, so
    /// timestamps keep tracking wall-clock time.
    fn tick(&mut self, now: Instant) -> TickOutcome {
        let (payload, placeholder) = match self.selector.current_frame() {
            Some(frame) => (frame, false),
            None => (Arc::clone(&self.placeholder), true),
        };

        let sequence_number = self.sequence_number;
        let timing = self.time_base.timing_for(sequence_number);
        self.stream_clock
            .post_timing_event(timing.presentation.as_duration(), now);

        let sample = OutgoingSample {
            sequence_number,
            timing,
            payload,
            placeholder,
        };

        let outcome = match self.queue.enqueue(sample) {
            Ok(handle) => {
                self.queue.notify_altered(&handle);
                self.stats.enqueued += 1;
                TickOutcome::Enqueued
            }
            Err(EnqueueError::Full { capacity }) => {
                tracing::warn!("Output queue is full ({}), dropping sample {}", capacity, sequence_number);
                self.stats.dropped += 1;
                TickOutcome::Dropped
            }
        };

        self.sequence_number += 1;
        self.stats.ticks += 1;
        if placeholder {
            self.stats.placeholders += 1;
        }
        if self.stats.ticks % self.stats_every == 0 {
            tracing::info!(
                "Sample {}: enqueued={}, dropped={}, placeholders={}, queued={}/{}",
                sequence_number,
                self.stats.enqueued,
                self.stats.dropped,
                self.stats.placeholders,
                self.queue.len(),
                self.queue.capacity()
            );
        }

        outcome
    }
}

fn run_timer(core: &mut ProducerCore, clock: &dyn Clock, period: Duration, running: &AtomicBool) {
    let mut deadline = Instant::now() + period;

    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now < deadline {
            thread::sleep(deadline - now);
            continue;
        }

        core.tick(clock.now());
        deadline += period;

        // Coalesce missed ticks instead of bursting to catch up
        let now = Instant::now();
        if now > deadline + period {
            tracing::debug!("Frame producer fell behind by {:?}", now - deadline);
            deadline = now + period;
        }
    }
}

/// Mid-grey frame shown until any camera delivers
fn placeholder_frame(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width.max(1), height.max(1), Rgb([64, 64, 64]))
}
