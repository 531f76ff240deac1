//! Event buffer that turns timed note-on/note-off pairs into note events.

use crate::midi::NoteEvent;

/// Append-only buffer of captured note events.
///
/// Note-ons append an open event. A note-off closes the most recent open
/// event of the same pitch, so a retriggered pitch closes in LIFO order.
/// Note-offs with nothing to close are logged and ignored.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    events: Vec<NoteEvent>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an open event for `note`.
    pub fn note_on(&mut self, note: u8, velocity: f32, at_ms: u64) {
        self.events.push(NoteEvent::new(note, velocity, at_ms));
    }

    /// Closes the most recent open event for `note`.
    ///
    /// Returns false for an orphan note-off.
    pub fn note_off(&mut self, note: u8, at_ms: u64) -> bool {
        let open = self
            .events
            .iter_mut()
            .rev()
            .find(|e| e.note_number == note && e.duration_ms == 0);

        match open {
            Some(event) => {
                event.duration_ms = at_ms.saturating_sub(event.onset_ms);
                true
            }
            None => {
                tracing::warn!(note, at_ms, "orphan note-off ignored");
                false
            }
        }
    }

    pub fn events(&self) -> &[NoteEvent] {
        &self.events
    }

    /// Events still waiting for their note-off.
    pub fn open_count(&self) -> usize {
        self.events.iter().filter(|e| !e.is_terminated()).count()
    }

    pub fn into_events(self) -> Vec<NoteEvent> {
        self.events
    }
}
