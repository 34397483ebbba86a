//! Capture session: cameras in, one steady stream out
//!
//! Each camera gets its own capture thread. Frames refresh the selector and,
//! when a face check is due, go to the detection worker. The frame producer
//! runs on its own timer and never waits on either.

use crate::capture::CaptureDevice;
use crate::clock::{Clock, StreamClock};
use crate::detection::{DetectionWorker, FaceDetector, SpawnError};
use crate::output::{FrameProducer, OutputQueue, ProducerConfig};
use crate::selector::{ActiveCameraSelector, SelectorConfig, SourceId};
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Pause after a failed capture before trying again
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already running")]
    AlreadyRunning,

    #[error(transparent)]
    Start(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub selector: SelectorConfig,
    pub producer: ProducerConfig,
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            producer: ProducerConfig::default(),
            queue_capacity: 30,
        }
    }
}

pub struct Session {
    devices: Vec<(SourceId, Arc<dyn CaptureDevice>)>,
    selector: Arc<ActiveCameraSelector>,
    queue: Arc<OutputQueue>,
    producer: FrameProducer,
    detector: Option<Box<dyn FaceDetector>>,
    detection: Option<Arc<DetectionWorker>>,
    capture_threads: Vec<JoinHandle<()>>,
    capturing: Arc<AtomicBool>,
    running: bool,
}

impl Session {
    /// Build a session over `devices`
    ///
    /// Without a detector the session never switches and simply forwards the
    /// first camera.
    pub fn new(
        devices: Vec<Arc<dyn CaptureDevice>>,
        detector: Option<Box<dyn FaceDetector>>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let selector = Arc::new(ActiveCameraSelector::new(
            devices.iter().map(|d| d.name().to_string()),
            config.selector,
            Arc::clone(&clock),
        ));
        let devices = selector.source_ids().into_iter().zip(devices).collect();
        let queue = Arc::new(OutputQueue::new(config.queue_capacity));
        let producer = FrameProducer::new(config.producer, Arc::clone(&selector), Arc::clone(&queue), clock);

        Self {
            devices,
            selector,
            queue,
            producer,
            detector,
            detection: None,
            capture_threads: Vec::new(),
            capturing: Arc::new(AtomicBool::new(false)),
            running: false,
        }
    }

    /// Queue the consumer reads from and registers its notification on
    pub fn queue(&self) -> Arc<OutputQueue> {
        Arc::clone(&self.queue)
    }

    pub fn selector(&self) -> Arc<ActiveCameraSelector> {
        Arc::clone(&self.selector)
    }

    /// Clock relating sample presentation times to host time
    pub fn stream_clock(&self) -> Arc<StreamClock> {
        self.producer.stream_clock()
    }

    /// Begin capture on every camera and start the frame timer
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.running {
            return Err(SessionError::AlreadyRunning);
        }
        if self.devices.is_empty() {
            tracing::warn!("No cameras; streaming placeholder frames only");
        }

        if let Some(detector) = self.detector.take() {
            match DetectionWorker::spawn(detector, Arc::clone(&self.selector), self.devices.len()) {
                Ok(worker) => self.detection = Some(Arc::new(worker)),
                Err(SpawnError { detector, source }) => {
                    self.detector = Some(detector);
                    let err = anyhow::Error::new(source).context("Failed to spawn face detection thread");
                    return Err(err.into());
                }
            }
        } else {
            tracing::info!("No face detector; camera switching disabled");
        }

        self.selector.bootstrap();
        self.capturing.store(true, Ordering::Release);

        for (id, device) in self.devices.clone() {
            let spawned = spawn_capture(
                id,
                device,
                Arc::clone(&self.selector),
                self.detection.clone(),
                Arc::clone(&self.capturing),
            );
            match spawned {
                Ok(handle) => self.capture_threads.push(handle),
                Err(e) => {
                    self.halt();
                    return Err(e.into());
                }
            }
        }

        if let Err(e) = self.producer.start() {
            self.halt();
            return Err(e.into());
        }

        self.running = true;
        tracing::info!("Session started with {} camera(s)", self.devices.len());
        Ok(())
    }

    /// Stop capture and the frame timer
    ///
    /// Returns once no capture thread can deliver another frame. Samples
    /// already queued stay available to the consumer.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.halt();
        self.running = false;

        if let (Some(stats), Some(next)) = (self.producer.stats(), self.producer.next_sequence_number()) {
            let stream_time = self.stream_clock().last_event().map(|e| e.stream_time).unwrap_or_default();
            tracing::info!(
                "Session stopped at sample {} ({:?} of stream): enqueued={}, dropped={}, placeholders={}",
                next,
                stream_time,
                stats.enqueued,
                stats.dropped,
                stats.placeholders
            );
        }
    }

    fn halt(&mut self) {
        self.capturing.store(false, Ordering::Release);
        for handle in self.capture_threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
        }

        // Capture threads held the only other references
        if let Some(worker) = self.detection.take() {
            match Arc::try_unwrap(worker) {
                Ok(worker) => self.detector = worker.stop(),
                Err(_) => tracing::error!("Face detection worker still shared after capture stopped"),
            }
        }

        self.producer.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_capture(
    id: SourceId,
    device: Arc<dyn CaptureDevice>,
    selector: Arc<ActiveCameraSelector>,
    detection: Option<Arc<DetectionWorker>>,
    capturing: Arc<AtomicBool>,
) -> anyhow::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("capture-{}", id.index()))
        .spawn(move || {
            let mut source = match device.open() {
                Ok(source) => source,
                Err(e) => {
                    tracing::error!("{} ('{}') unavailable: {:#}", id, device.name(), e);
                    return;
                }
            };
            let (width, height) = source.resolution();
            tracing::info!("Capturing {} ('{}') at {}x{}", id, device.name(), width, height);

            while capturing.load(Ordering::Acquire) {
                let frame = match source.capture_frame() {
                    Ok(frame) => Arc::new(frame),
                    Err(e) => {
                        tracing::warn!("{} capture failed: {:#}", id, e);
                        thread::sleep(CAPTURE_RETRY_DELAY);
                        continue;
                    }
                };

                // Stop may have been requested while this frame was in flight
                if !capturing.load(Ordering::Acquire) {
                    break;
                }

                selector.on_capture(id, Arc::clone(&frame));
                if let Some(worker) = &detection {
                    if selector.begin_face_check(id) && !worker.submit(id, frame) {
                        selector.cancel_face_check(id);
                    }
                }
            }

            tracing::debug!("Capture thread for {} exiting", id);
        })
        .context("Failed to spawn capture thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSource;
    use crate::clock::SystemClock;
    use crate::detection::FaceObservation;
    use anyhow::{bail, Result};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Camera producing solid frames of one colour at roughly `fps`
    struct FakeDevice {
        name: String,
        shade: u8,
        fps: u64,
        frames: Arc<AtomicUsize>,
        fail_open: bool,
    }

    impl FakeDevice {
        fn new(name: &str, shade: u8, fps: u64) -> Self {
            Self {
                name: name.to_string(),
                shade,
                fps,
                frames: Arc::new(AtomicUsize::new(0)),
                fail_open: false,
            }
        }
    }

    struct FakeSource {
        shade: u8,
        period: Duration,
        frames: Arc<AtomicUsize>,
    }

    impl CaptureSource for FakeSource {
        fn capture_frame(&mut self) -> Result<RgbImage> {
            thread::sleep(self.period);
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(RgbImage::from_pixel(8, 8, Rgb([self.shade; 3])))
        }

        fn resolution(&self) -> (u32, u32) {
            (8, 8)
        }
    }

    impl CaptureDevice for FakeDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self) -> Result<Box<dyn CaptureSource>> {
            if self.fail_open {
                bail!("device busy");
            }
            Ok(Box::new(FakeSource {
                shade: self.shade,
                period: Duration::from_millis(1000 / self.fps),
                frames: Arc::clone(&self.frames),
            }))
        }
    }

    /// Sees a face only on frames brighter than `threshold`
    struct BrightnessDetector {
        threshold: u8,
    }

    impl FaceDetector for BrightnessDetector {
        fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceObservation>> {
            let shade = frame.get_pixel(0, 0)[0];
            if shade > self.threshold {
                Ok(vec![FaceObservation::new(true, true, shade as f32 / 255.0)])
            } else {
                Ok(Vec::new())
            }
        }

        fn name(&self) -> &'static str {
            "brightness"
        }
    }

    fn config(frame_rate: u32) -> SessionConfig {
        SessionConfig {
            selector: SelectorConfig {
                face_check_interval: Duration::from_millis(20),
                switch_hysteresis: Duration::from_millis(100),
            },
            producer: ProducerConfig {
                width: 8,
                height: 8,
                frame_rate,
            },
            queue_capacity: 30,
        }
    }

    fn drain(queue: &OutputQueue) -> Vec<Arc<crate::output::OutgoingSample>> {
        std::iter::from_fn(|| queue.dequeue()).collect()
    }

    #[test]
    fn test_no_cameras_still_streams_placeholders() {
        let mut session = Session::new(Vec::new(), None, config(100), Arc::new(SystemClock));
        let queue = session.queue();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        queue.set_altered_proc(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.start().unwrap();
        thread::sleep(Duration::from_millis(150));
        session.stop();

        let samples = drain(&queue);
        assert!(samples.len() >= 5);
        assert!(samples.iter().all(|s| s.placeholder));
        assert!(samples.iter().enumerate().all(|(i, s)| s.sequence_number == i as u64));
        assert_eq!(notified.load(Ordering::SeqCst), samples.len());
    }

    #[test]
    fn test_unconsumed_queue_caps_at_capacity() {
        let mut session = Session::new(Vec::new(), None, config(200), Arc::new(SystemClock));
        let queue = session.queue();

        session.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !queue.is_full() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        session.stop();

        assert_eq!(queue.len(), 30);
        let stats = session.producer.stats().unwrap();
        assert!(stats.dropped > 0);
        assert_eq!(stats.enqueued, 30);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut session = Session::new(Vec::new(), None, config(60), Arc::new(SystemClock));
        session.start().unwrap();
        assert!(matches!(session.start(), Err(SessionError::AlreadyRunning)));
        session.stop();
        assert!(!session.running);
    }

    #[test]
    fn test_switches_to_camera_with_a_face() {
        let dark = FakeDevice::new("dark", 10, 50);
        let bright = FakeDevice::new("bright", 230, 50);
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![Arc::new(dark), Arc::new(bright)];
        let detector = BrightnessDetector { threshold: 128 };

        let mut session = Session::new(devices, Some(Box::new(detector)), config(100), Arc::new(SystemClock));
        let selector = session.selector();
        let ids = selector.source_ids();

        session.start().unwrap();
        assert_eq!(selector.active_source(), Some(ids[0]));

        let deadline = Instant::now() + Duration::from_secs(3);
        while selector.active_source() != Some(ids[1]) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        // Let the producer pick up the new camera
        thread::sleep(Duration::from_millis(50));
        session.stop();

        assert_eq!(selector.active_source(), Some(ids[1]));
        let last = drain(&session.queue()).pop().unwrap();
        assert_eq!(last.payload.get_pixel(0, 0)[0], 230);
    }

    #[test]
    fn test_no_capture_after_stop() {
        let device = FakeDevice::new("cam", 100, 200);
        let frames = Arc::clone(&device.frames);
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![Arc::new(device)];
        let mut session = Session::new(devices, None, config(60), Arc::new(SystemClock));

        session.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        session.stop();

        let after_stop = frames.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(frames.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_failed_device_does_not_stop_stream() {
        let mut broken = FakeDevice::new("broken", 200, 50);
        broken.fail_open = true;
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![Arc::new(broken)];
        let mut session = Session::new(devices, None, config(100), Arc::new(SystemClock));
        let queue = session.queue();

        session.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        session.stop();

        let samples = drain(&queue);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.placeholder));
    }

    #[test]
    fn test_restart_keeps_detector_and_sequence() {
        let devices: Vec<Arc<dyn CaptureDevice>> = vec![Arc::new(FakeDevice::new("cam", 200, 100))];
        let detector = BrightnessDetector { threshold: 128 };
        let mut session = Session::new(devices, Some(Box::new(detector)), config(100), Arc::new(SystemClock));
        let queue = session.queue();

        session.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        session.stop();
        assert!(session.detector.is_some());
        let first_run = drain(&queue);
        assert!(!first_run.is_empty());

        session.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        session.stop();
        let second_run = drain(&queue);
        assert_eq!(
            second_run.first().map(|s| s.sequence_number),
            Some(first_run.len() as u64)
        );
    }
}
