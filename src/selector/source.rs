use crate::detection::FaceObservation;
use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Stable handle for one physical input, never reused within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub(crate) usize);

impl SourceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// One physical camera as seen by the selector
///
/// Only the selector mutates these; callers get clones through
/// [`ActiveCameraSelector::snapshot`](super::ActiveCameraSelector::snapshot).
#[derive(Debug, Clone)]
pub struct CameraSource {
    id: SourceId,
    name: String,
    last_image: Option<Arc<RgbImage>>,
    active: bool,
    became_active_at: Option<Instant>,
    last_face_check_at: Option<Instant>,
    face_check_claimed_at: Option<Instant>,
    has_left_eye: bool,
    has_right_eye: bool,
    confidence: f32,
}

impl CameraSource {
    pub(crate) fn new(id: SourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            last_image: None,
            active: false,
            became_active_at: None,
            last_face_check_at: None,
            face_check_claimed_at: None,
            has_left_eye: false,
            has_right_eye: false,
            confidence: 0.0,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_image(&self) -> Option<&Arc<RgbImage>> {
        self.last_image.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn became_active_at(&self) -> Option<Instant> {
        self.became_active_at
    }

    pub fn last_face_check_at(&self) -> Option<Instant> {
        self.last_face_check_at
    }

    pub fn has_left_eye(&self) -> bool {
        self.has_left_eye
    }

    pub fn has_right_eye(&self) -> bool {
        self.has_right_eye
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Both eyes seen on the last face check
    pub fn is_facing(&self) -> bool {
        self.has_left_eye && self.has_right_eye
    }

    pub(crate) fn set_last_image(&mut self, image: Arc<RgbImage>) {
        self.last_image = Some(image);
    }

    pub(crate) fn make_active(&mut self, now: Instant) {
        self.active = true;
        self.became_active_at = Some(now);
    }

    pub(crate) fn make_inactive(&mut self) {
        self.active = false;
        self.became_active_at = None;
    }

    pub(crate) fn face_check_pending(&self) -> bool {
        self.face_check_claimed_at.is_some()
    }

    /// Mark a face check as in flight from `now`
    pub(crate) fn claim_face_check(&mut self, now: Instant) {
        self.face_check_claimed_at = Some(now);
    }

    /// Clear the in-flight check, returning when it was claimed
    pub(crate) fn release_face_check(&mut self) -> Option<Instant> {
        self.face_check_claimed_at.take()
    }

    /// Store the result of a finished face check
    ///
    /// `None` means nothing was found and clears any previous result.
    pub(crate) fn record_face_check(&mut self, now: Instant, best: Option<&FaceObservation>) {
        self.last_face_check_at = Some(now);
        match best {
            Some(face) => {
                self.has_left_eye = face.left_eye_visible();
                self.has_right_eye = face.right_eye_visible();
                self.confidence = face.confidence();
            }
            None => {
                self.has_left_eye = false;
                self.has_right_eye = false;
                self.confidence = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_source_is_inactive() {
        let source = CameraSource::new(SourceId(3), "desk");
        assert!(!source.is_active());
        assert!(source.became_active_at().is_none());
        assert!(source.last_image().is_none());
        assert_eq!(source.confidence(), 0.0);
        assert_eq!(source.id().to_string(), "source#3");
    }

    #[test]
    fn test_activation_timestamps() {
        let mut source = CameraSource::new(SourceId(0), "desk");
        let now = Instant::now();

        source.make_active(now);
        assert!(source.is_active());
        assert_eq!(source.became_active_at(), Some(now));

        source.make_inactive();
        assert!(!source.is_active());
        assert!(source.became_active_at().is_none());
    }

    #[test]
    fn test_empty_face_check_resets_state() {
        let mut source = CameraSource::new(SourceId(0), "desk");
        let now = Instant::now();
        source.record_face_check(now, Some(&FaceObservation::new(true, true, 0.9)));
        assert!(source.is_facing());

        let later = now + Duration::from_millis(600);
        source.record_face_check(later, None);
        assert!(!source.has_left_eye());
        assert!(!source.has_right_eye());
        assert_eq!(source.confidence(), 0.0);
        assert_eq!(source.last_face_check_at(), Some(later));
    }
}
