use super::source::{CameraSource, SourceId};
use super::SelectorConfig;
use crate::clock::Clock;
use crate::detection::FaceObservation;
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Registry of every camera plus the switching algorithm
///
/// All state lives behind a single lock. Capture threads, detection
/// completions and the frame producer each take it for one short critical
/// section, so the scan-then-flip of a promotion can never interleave with
/// another promotion and at most one source is ever active.
pub struct ActiveCameraSelector {
    registry: Mutex<Registry>,
    config: SelectorConfig,
    clock: Arc<dyn Clock>,
}

struct Registry {
    sources: Vec<CameraSource>,
    last_good_frame: Option<Arc<RgbImage>>,
    last_switch: Option<Switch>,
}

/// A source's standing at the moment it was ranked
#[derive(Debug, Clone, Copy)]
struct Contender {
    index: usize,
    confidence: f32,
    since: Option<Instant>,
}

impl Contender {
    /// Higher confidence wins; equal confidence goes to the lower index
    fn outranks(&self, index: usize, confidence: f32) -> bool {
        self.confidence > confidence || (self.confidence == confidence && self.index < index)
    }
}

/// The most recent promotion and the source it displaced
#[derive(Debug, Clone, Copy)]
struct Switch {
    at: Instant,
    winner: usize,
    displaced: Option<Contender>,
}

/// Why a face check did or did not change the active source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceCheckOutcome {
    /// Nothing was found; eye state was cleared
    NoFace,
    /// A face was found but not with both eyes visible
    NotFacing,
    /// Already the active source
    AlreadyActive,
    /// An active source has higher confidence, or wins the tie
    Outranked,
    /// The active source switched too recently
    Hysteresis,
    /// This source is now the active one
    Promoted,
    /// The handle does not belong to this registry
    UnknownSource,
}

impl ActiveCameraSelector {
    /// Create a registry with one inactive source per name, in order
    pub fn new<I, S>(names: I, config: SelectorConfig, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sources = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| CameraSource::new(SourceId(index), name))
            .collect();

        Self {
            registry: Mutex::new(Registry {
                sources,
                last_good_frame: None,
                last_switch: None,
            }),
            config,
            clock,
        }
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        self.registry.lock().sources.iter().map(|s| s.id()).collect()
    }

    /// Force the first source active if nothing is active yet
    ///
    /// Called at session start so the producer has a candidate from time zero.
    pub fn bootstrap(&self) -> Option<SourceId> {
        let now = self.clock.now();
        let mut registry = self.registry.lock();

        if let Some(active) = registry.active_index() {
            return Some(registry.sources[active].id());
        }

        let first = registry.sources.first_mut()?;
        first.make_active(now);
        tracing::info!("Camera '{}' ({}) is active", first.name(), first.id());
        Some(first.id())
    }

    /// Record a freshly captured frame
    pub fn on_capture(&self, id: SourceId, frame: Arc<RgbImage>) {
        let mut registry = self.registry.lock();
        let Some(source) = registry.sources.get_mut(id.0) else {
            tracing::warn!("Frame from unknown {}", id);
            return;
        };

        let active = source.is_active();
        source.set_last_image(Arc::clone(&frame));
        if active {
            registry.last_good_frame = Some(frame);
        }
    }

    /// Claim the next face check for a source if one is due
    ///
    /// Returns `true` when the caller should run detection and report back
    /// through [`complete_face_check`](Self::complete_face_check) (or
    /// [`cancel_face_check`](Self::cancel_face_check) if it could not be
    /// submitted). A source with a check in flight is never claimed twice.
    pub fn begin_face_check(&self, id: SourceId) -> bool {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        let Some(source) = registry.sources.get_mut(id.0) else {
            return false;
        };

        if source.face_check_pending() {
            return false;
        }
        let due = match source.last_face_check_at() {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.face_check_interval,
        };
        if due {
            source.claim_face_check(now);
        }
        due
    }

    /// Release a claimed face check that never ran
    pub fn cancel_face_check(&self, id: SourceId) {
        if let Some(source) = self.registry.lock().sources.get_mut(id.0) {
            source.release_face_check();
        }
    }

    /// Apply a finished face check and run the promotion check
    ///
    /// `observations` is ordered best first. This is the only path that can
    /// change which source is active after bootstrap.
    pub fn complete_face_check(&self, id: SourceId, observations: &[FaceObservation]) -> FaceCheckOutcome {
        let now = self.clock.now();
        let mut registry = self.registry.lock();
        let Some(source) = registry.sources.get_mut(id.0) else {
            tracing::warn!("Face check result for unknown {}", id);
            return FaceCheckOutcome::UnknownSource;
        };

        // A result that was never claimed counts as claimed just now
        let claimed_at = source.release_face_check().unwrap_or(now);
        let best = observations.first();
        source.record_face_check(now, best);
        tracing::debug!(
            "Face check on {}: left_eye={}, right_eye={}, confidence={:.2}",
            id,
            source.has_left_eye(),
            source.has_right_eye(),
            source.confidence()
        );
        if best.is_none() {
            return FaceCheckOutcome::NoFace;
        }
        if !source.is_facing() {
            return FaceCheckOutcome::NotFacing;
        }

        registry.evaluate_promotion(id.0, claimed_at, now, &self.config)
    }

    /// Frame the producer should emit right now
    ///
    /// The active source's latest image, else the last frame any active
    /// source delivered, else `None`.
    pub fn current_frame(&self) -> Option<Arc<RgbImage>> {
        let registry = self.registry.lock();
        registry
            .active_index()
            .and_then(|i| registry.sources[i].last_image().cloned())
            .or_else(|| registry.last_good_frame.clone())
    }

    pub fn active_source(&self) -> Option<SourceId> {
        let registry = self.registry.lock();
        registry.active_index().map(|i| registry.sources[i].id())
    }

    /// Consistent copy of every source's state
    pub fn snapshot(&self) -> Vec<CameraSource> {
        self.registry.lock().sources.clone()
    }
}

impl Registry {
    fn active_index(&self) -> Option<usize> {
        self.sources.iter().position(|s| s.is_active())
    }

    /// Promote `candidate` if it outranks the holder and hysteresis allows
    ///
    /// Ranking is by confidence, with equal confidence going to the lower
    /// `SourceId`. A check that was already in flight when the last switch
    /// happened is ranked as if it had arrived first: it must outrank both the
    /// new holder and the source that switch displaced, and hysteresis is
    /// measured from the displaced source. So checks completing together pick
    /// the same winner whatever order they land in.
    fn evaluate_promotion(
        &mut self,
        candidate: usize,
        claimed_at: Instant,
        now: Instant,
        config: &SelectorConfig,
    ) -> FaceCheckOutcome {
        let challenger = &self.sources[candidate];
        if challenger.is_active() {
            return FaceCheckOutcome::AlreadyActive;
        }
        let challenger_id = challenger.id();
        let confidence = challenger.confidence();

        let holder = self.active_index().map(|index| Contender {
            index,
            confidence: self.sources[index].confidence(),
            since: self.sources[index].became_active_at(),
        });
        let contested = self
            .last_switch
            .filter(|switch| holder.map(|h| h.index) == Some(switch.winner) && switch.at >= claimed_at);

        let mut rivals: Vec<Contender> = holder.into_iter().collect();
        let mut held_since = holder.and_then(|h| h.since);
        if let Some(switch) = contested {
            held_since = None;
            if let Some(displaced) = switch.displaced.filter(|d| d.index != candidate) {
                held_since = displaced.since;
                rivals.push(displaced);
            }
        }

        if rivals.iter().any(|rival| rival.outranks(candidate, confidence)) {
            return FaceCheckOutcome::Outranked;
        }
        if let Some(since) = held_since {
            let held_for = now.saturating_duration_since(since);
            if held_for < config.switch_hysteresis {
                tracing::debug!(
                    "Holding switch to {}: active camera switched {:?} ago",
                    challenger_id,
                    held_for
                );
                return FaceCheckOutcome::Hysteresis;
            }
        }

        let displaced = match contested {
            Some(switch) => switch.displaced,
            None => holder,
        };
        // Winning back the slot just lost restores the original tenure
        let became_active_at = displaced
            .filter(|d| d.index == candidate)
            .and_then(|d| d.since)
            .unwrap_or(now);

        for source in &mut self.sources {
            if source.id() == challenger_id {
                source.make_active(became_active_at);
                tracing::info!(
                    "Switching to camera '{}' ({}), confidence {:.2}",
                    source.name(),
                    source.id(),
                    confidence
                );
            } else {
                source.make_inactive();
            }
        }
        self.last_switch = Some(Switch {
            at: now,
            winner: candidate,
            displaced,
        });
        FaceCheckOutcome::Promoted
    }
}
