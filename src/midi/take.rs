//! A take: one complete captured performance.
//!
//! Takes are append-only while capture runs and immutable once capture stops.
//! They serialize to JSON so a take can be replayed or re-rendered later.

use super::{NoteEvent, TAIL_MS};
use crate::audio::Patch;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Unique identifier for a take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TakeId(Uuid);

impl TakeId {
    /// Generates a new random take ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TakeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TakeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One captured performance as an ordered sequence of note events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Take {
    /// Unique identifier for this take.
    pub id: TakeId,

    /// Display name; also the stem of exported file names.
    pub name: String,

    /// Instrument timbre used for monitoring, playback and rendering.
    pub patch: Patch,

    /// Set when capture was cut short by the input device disappearing.
    #[serde(default)]
    pub interrupted: bool,

    /// Events in capture order.
    events: Vec<NoteEvent>,
}

impl Take {
    /// Creates an empty take.
    pub fn new(name: &str, patch: Patch) -> Self {
        Self {
            id: TakeId::new(),
            name: name.to_string(),
            patch,
            interrupted: false,
            events: Vec::new(),
        }
    }

    /// Creates a take from already-captured events.
    pub fn from_events(name: &str, patch: Patch, events: Vec<NoteEvent>) -> Self {
        Self {
            events,
            ..Self::new(name, patch)
        }
    }

    /// Returns the events in capture order.
    pub fn events(&self) -> &[NoteEvent] {
        &self.events
    }

    /// Returns the number of events, terminated or not.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the events ordered by onset.
    ///
    /// The sort is stable, so events with equal onsets keep capture order.
    pub fn sorted_events(&self) -> Vec<NoteEvent> {
        let mut events = self.events.clone();
        events.sort_by_key(|e| e.onset_ms);
        events
    }

    /// Returns the events that have a matched note-off.
    pub fn terminated_events(&self) -> impl Iterator<Item = &NoteEvent> {
        self.events.iter().filter(|e| e.is_terminated())
    }

    /// Returns the end of the last note, plus the release/reverb tail.
    pub fn total_duration_ms(&self) -> u64 {
        self.events.iter().map(NoteEvent::end_ms).max().unwrap_or(0) + TAIL_MS
    }

    /// File name for the encoded Standard MIDI File.
    pub fn midi_filename(&self) -> String {
        format!("{}.mid", self.file_stem())
    }

    /// File name for the rendered audio.
    pub fn wav_filename(&self) -> String {
        format!("{}.wav", self.file_stem())
    }

    /// File name for the JSON snapshot.
    pub fn json_filename(&self) -> String {
        format!("{}.json", self.file_stem())
    }

    /// Derives a filesystem-safe stem from the take name.
    fn file_stem(&self) -> String {
        let stem = self
            .name
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == ' ')
            .collect::<String>()
            .replace(' ', "_");

        if stem.is_empty() {
            "take".to_string()
        } else {
            stem
        }
    }

    /// Serializes the take to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a take from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Saves the take to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Loads a take from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
