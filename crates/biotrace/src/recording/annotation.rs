//! Time-localized labels on a recording.

use smallvec::SmallVec;

use crate::unique_id::UniqueId;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AnnotationClass {
    Activation,
    Comment,
    Event,
    Technical,
    Trigger,
    Answer,
    Example,
    Question,
}

/// An RGBA override for rendering one annotation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AnnotationColor {
    pub rgb: [u8; 3],
    pub opacity: f32,
}

/// A label over a span of the recording, global or scoped to specific channels.
///
/// Created by the reader (embedded events) or by the UI; destroyed only by explicit removal.
/// Times are data time (interruptions excluded).
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub id: UniqueId,
    pub author: Option<String>,
    pub class: AnnotationClass,
    /// Smaller is lower priority.
    pub priority: u32,
    /// Start in seconds of data time.
    pub start: f64,
    /// Zero for instantaneous marks.
    pub duration: f64,
    /// Source channel indices this applies to; empty means the whole recording.
    pub channels: SmallVec<[usize; 2]>,
    pub label: String,
    pub text: String,
    pub color: Option<AnnotationColor>,
    pub visible: Option<bool>,
}

impl Annotation {
    pub fn new(class: AnnotationClass, start: f64, duration: f64, label: impl Into<String>) -> Self {
        debug_assert!(duration >= 0.0);
        Annotation {
            id: UniqueId::new(),
            author: None,
            class,
            priority: 0,
            start,
            duration,
            channels: SmallVec::new(),
            label: label.into(),
            text: String::new(),
            color: None,
            visible: None,
        }
    }

    /// The warning marker the reader attaches over a chunk it had to skip.
    pub fn technical_warning(start: f64, duration: f64, text: impl Into<String>) -> Self {
        let mut a = Annotation::new(AnnotationClass::Technical, start, duration, "warning");
        a.text = text.into();
        a
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    pub fn is_global(&self) -> bool {
        self.channels.is_empty()
    }

    /// Does this annotation intersect the data-time range `[start, end)`?
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start < end && (self.end() > start || self.duration == 0.0 && self.start >= start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_annotation_overlaps_its_instant() {
        let a = Annotation::new(AnnotationClass::Event, 5.0, 0.0, "spike");
        assert!(a.overlaps(4.0, 6.0));
        assert!(a.overlaps(5.0, 6.0));
        assert!(!a.overlaps(6.0, 7.0));
    }

    #[test]
    fn spanning_annotation_overlap() {
        let a = Annotation::new(AnnotationClass::Activation, 2.0, 3.0, "hv");
        assert!(a.overlaps(0.0, 2.5));
        assert!(a.overlaps(4.0, 10.0));
        assert!(!a.overlaps(5.0, 10.0));
        assert!(!a.overlaps(0.0, 2.0));
    }
}
