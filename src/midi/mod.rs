//! MIDI data structures for captured takes.
//!
//! This module provides the note-event and take types, Standard MIDI File
//! encoding of a take, and import of externally supplied MIDI files.

mod event;
mod midi_export;
mod midi_import;
mod take;

pub use event::{EventKind, NoteEvent};
pub use midi_export::{encode, SmfOptions};
pub use midi_import::import_events;
pub use take::{Take, TakeId};

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Flat spellings accepted by [`name_to_note`], mapped to their pitch class.
const FLAT_NAMES: [(&str, u8); 7] = [
    ("Cb", 11),
    ("Db", 1),
    ("Eb", 3),
    ("Fb", 4),
    ("Gb", 6),
    ("Ab", 8),
    ("Bb", 10),
];

/// Ticks per quarter note written into encoded takes.
pub const TICKS_PER_QUARTER: u16 = 960;

/// Fixed tempo used to lay recorded milliseconds onto the tick grid.
pub const RECORDING_BPM: f64 = 500.0;

/// Extra time appended after the last note for release and reverb decay.
pub const TAIL_MS: u64 = 3000;

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Examples
///
/// ```
/// use miditake::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = (note / 12) as i8 - 1; // MIDI octave convention
    let note_index = (note % 12) as usize;
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

/// Converts a note name like "C4", "F#5" or "Bb3" to a MIDI note number.
///
/// Returns `None` when the name is malformed or falls outside 0-127.
pub fn name_to_note(name: &str) -> Option<u8> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    // Find where the octave number starts
    let octave_start = name.chars().position(|c| c.is_ascii_digit() || c == '-')?;

    let note_part = &name[..octave_start];
    let octave_part = &name[octave_start..];

    let pitch_class = NOTE_NAMES
        .iter()
        .position(|&n| n.eq_ignore_ascii_case(note_part))
        .map(|i| i as i16)
        .or_else(|| {
            FLAT_NAMES
                .iter()
                .find(|(n, _)| *n == note_part || n.eq_ignore_ascii_case(note_part))
                .map(|(_, pc)| *pc as i16)
        })?;
    let octave: i16 = octave_part.parse().ok()?;

    // Cb belongs to the octave above its spelling
    let octave = if note_part.eq_ignore_ascii_case("cb") {
        octave - 1
    } else {
        octave
    };

    // MIDI note = (octave + 1) * 12 + pitch class
    let midi_note = (octave + 1) * 12 + pitch_class;
    if (0..=127).contains(&midi_note) {
        Some(midi_note as u8)
    } else {
        None
    }
}

/// Converts a MIDI note number to its equal-tempered frequency (A4 = 440 Hz).
pub fn note_to_frequency(note: u8) -> f32 {
    440.0 * 2f32.powf((note as f32 - 69.0) / 12.0)
}

/// Converts milliseconds to ticks at the given resolution and tempo.
///
/// `ticks = round(ms / 1000 * ticks_per_quarter * bpm / 60)`
pub fn ms_to_ticks(ms: u64, ticks_per_quarter: u16, bpm: f64) -> u64 {
    let ticks = ms as f64 / 1000.0 * ticks_per_quarter as f64 * bpm / 60.0;
    ticks.round() as u64
}

/// Converts ticks back to milliseconds given microseconds per quarter note.
pub fn ticks_to_ms(ticks: u64, ticks_per_quarter: u16, micros_per_quarter: u32) -> f64 {
    ticks as f64 * micros_per_quarter as f64 / ticks_per_quarter as f64 / 1000.0
}

/// Microseconds per quarter note for a tempo in BPM.
pub fn bpm_to_micros_per_quarter(bpm: f64) -> u32 {
    (60_000_000.0 / bpm).round() as u32
}
