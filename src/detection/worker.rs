use super::types::FaceDetector;
use crate::selector::{ActiveCameraSelector, SourceId};
use image::RgbImage;
use std::fmt;
use std::io;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

struct FaceCheckRequest {
    source: SourceId,
    frame: Arc<RgbImage>,
}

/// The worker thread could not be started
///
/// Carries the detector back so the caller can try again later.
#[derive(Error)]
#[error("Failed to spawn face detection thread: {source}")]
pub struct SpawnError {
    pub detector: Box<dyn FaceDetector>,
    #[source]
    pub source: io::Error,
}

impl fmt::Debug for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("detector", &self.detector.name())
            .field("source", &self.source)
            .finish()
    }
}

/// Runs face detection off the capture threads
///
/// Capture threads submit frames without blocking; results are reported back
/// to the selector as each detection completes. A failed detection counts as
/// finding no faces.
pub struct DetectionWorker {
    requests: Option<SyncSender<FaceCheckRequest>>,
    handle: Option<JoinHandle<Option<Box<dyn FaceDetector>>>>,
}

impl DetectionWorker {
    /// Start a worker thread owning `detector`
    ///
    /// `backlog` bounds how many frames may wait for detection; submissions
    /// beyond it are refused.
    pub fn spawn(
        detector: Box<dyn FaceDetector>,
        selector: Arc<ActiveCameraSelector>,
        backlog: usize,
    ) -> Result<Self, SpawnError> {
        Self::spawn_with(thread::Builder::new(), detector, selector, backlog)
    }

    fn spawn_with(
        builder: thread::Builder,
        detector: Box<dyn FaceDetector>,
        selector: Arc<ActiveCameraSelector>,
        backlog: usize,
    ) -> Result<Self, SpawnError> {
        let (tx, rx) = mpsc::sync_channel(backlog.max(1));
        // The detector only moves to the thread once it is running
        let (handoff_tx, handoff_rx) = mpsc::sync_channel::<Box<dyn FaceDetector>>(1);

        let spawned = builder.name("face-detect".into()).spawn(move || {
            let mut detector = handoff_rx.recv().ok()?;
            run(detector.as_mut(), &selector, rx);
            Some(detector)
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => return Err(SpawnError { detector, source }),
        };

        tracing::info!("Starting face detection worker ({})", detector.name());
        if let Err(mpsc::SendError(detector)) = handoff_tx.send(detector) {
            let _ = handle.join();
            return Err(SpawnError {
                detector,
                source: io::Error::other("face detection thread exited before start"),
            });
        }

        Ok(Self {
            requests: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a frame for detection; `false` if the backlog is full or the worker is gone
    pub fn submit(&self, source: SourceId, frame: Arc<RgbImage>) -> bool {
        let Some(requests) = &self.requests else {
            return false;
        };

        match requests.try_send(FaceCheckRequest { source, frame }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Face detection backlog full, skipping {}", source);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!("Face detection worker has exited");
                false
            }
        }
    }

    /// Finish queued checks, stop the thread and hand back the detector
    pub fn stop(mut self) -> Option<Box<dyn FaceDetector>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Box<dyn FaceDetector>> {
        self.requests.take();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(detector) => detector,
            Err(_) => {
                tracing::error!("Face detection thread panicked");
                None
            }
        }
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(detector: &mut dyn FaceDetector, selector: &ActiveCameraSelector, requests: Receiver<FaceCheckRequest>) {
    for request in requests {
        let observations = match detector.detect(&request.frame) {
            Ok(observations) => observations,
            Err(e) => {
                tracing::warn!("Face detection failed for {}: {:#}", request.source, e);
                Vec::new()
            }
        };

        let outcome = selector.complete_face_check(request.source, &observations);
        tracing::debug!(
            "Face check {}: {} face(s), {:?}",
            request.source,
            observations.len(),
            outcome
        );
    }
}
