//! Captured note events.
//!
//! A note event is one note-on with its measured sustain. Note-offs are never
//! stored on their own; they only fill in the duration of the note-on they close.

use serde::{Deserialize, Serialize};

/// Kind tag of a stored event. Only note-ons are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    NoteOn,
}

/// One captured performance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// MIDI note number (0-127). 60 = Middle C (C4).
    pub note_number: u8,

    /// Attack intensity in 0.0-1.0.
    pub velocity_on: f32,

    /// Milliseconds since the take started.
    pub onset_ms: u64,

    /// Measured sustain in milliseconds; 0 while the note is still held.
    pub duration_ms: u64,

    /// Always [`EventKind::NoteOn`]; serialized as `"noteon"`.
    #[serde(default)]
    pub kind: EventKind,
}

impl NoteEvent {
    /// Creates an open (not yet released) note event.
    pub fn new(note_number: u8, velocity_on: f32, onset_ms: u64) -> Self {
        Self {
            note_number,
            velocity_on,
            onset_ms,
            duration_ms: 0,
            kind: EventKind::NoteOn,
        }
    }

    /// Creates a closed note event with a known duration.
    pub fn with_duration(
        note_number: u8,
        velocity_on: f32,
        onset_ms: u64,
        duration_ms: u64,
    ) -> Self {
        Self {
            duration_ms,
            ..Self::new(note_number, velocity_on, onset_ms)
        }
    }

    /// Returns the release time (onset + duration).
    pub fn end_ms(&self) -> u64 {
        self.onset_ms.saturating_add(self.duration_ms)
    }

    /// A note is terminated once its note-off has been matched.
    ///
    /// Unterminated notes are skipped by the encoder and the renderer.
    pub fn is_terminated(&self) -> bool {
        self.duration_ms > 0
    }

    /// Maps the float velocity onto the 0-127 MIDI range.
    ///
    /// A result of zero falls back to 64 so an encoded note is never silent.
    pub fn midi_velocity(&self) -> u8 {
        let v = self.velocity_on;
        let scaled = if v.is_finite() {
            (v.clamp(0.0, 1.0) * 127.0).round() as u8
        } else {
            0
        };
        if scaled == 0 {
            64
        } else {
            scaled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_is_open() {
        let event = NoteEvent::new(60, 0.8, 120);
        assert_eq!(event.duration_ms, 0);
        assert!(!event.is_terminated());
        assert_eq!(event.kind, EventKind::NoteOn);
    }

    #[test]
    fn test_end_ms() {
        let event = NoteEvent::with_duration(60, 0.8, 250, 500);
        assert_eq!(event.end_ms(), 750);
        assert!(event.is_terminated());
    }

    #[test]
    fn test_midi_velocity_mapping() {
        assert_eq!(NoteEvent::new(60, 0.8, 0).midi_velocity(), 102);
        assert_eq!(NoteEvent::new(60, 1.0, 0).midi_velocity(), 127);
        assert_eq!(NoteEvent::new(60, 1.7, 0).midi_velocity(), 127);
    }

    #[test]
    fn test_midi_velocity_fallback() {
        assert_eq!(NoteEvent::new(60, 0.0, 0).midi_velocity(), 64);
        assert_eq!(NoteEvent::new(60, 0.001, 0).midi_velocity(), 64);
        assert_eq!(NoteEvent::new(60, f32::NAN, 0).midi_velocity(), 64);
        assert_eq!(NoteEvent::new(60, -0.5, 0).midi_velocity(), 64);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&NoteEvent::new(60, 0.5, 0)).unwrap();
        assert!(json.contains("\"kind\":\"noteon\""));
    }
}
