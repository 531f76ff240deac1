//! Standard MIDI File (SMF) encoding of captured takes.
//!
//! Produces a byte-exact, reproducible file for any event sequence.
//!
//! # Format Details
//!
//! Encodes as SMF Format 1 with exactly two tracks:
//! - Track 0: Tempo and 4/4 time signature meta events
//! - Track 1: Track name, then one note-on and one note-off per terminated note
//!
//! Unterminated notes (duration 0) are dropped. When a note-on and a note-off
//! fall on the same tick, the note-off is written first; events of the same
//! kind at the same tick keep the onset order of their source notes.

use super::{
    bpm_to_micros_per_quarter, ms_to_ticks, NoteEvent, RECORDING_BPM, TICKS_PER_QUARTER,
};
use crate::error::{Error, Result};

/// Largest value a MIDI variable-length quantity can hold (four bytes).
const VLQ_MAX: u32 = 0x0FFF_FFFF;

/// All notes are written on the first MIDI channel.
const CHANNEL: u8 = 0;

/// Encoding parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SmfOptions {
    /// Division written into the header (ticks per quarter note).
    pub ticks_per_quarter: u16,
    /// Tempo used to convert milliseconds to ticks.
    pub bpm: f64,
    /// Text of the note track's name meta-event.
    pub track_name: String,
}

impl Default for SmfOptions {
    fn default() -> Self {
        Self {
            ticks_per_quarter: TICKS_PER_QUARTER,
            bpm: RECORDING_BPM,
            track_name: "Recording".to_string(),
        }
    }
}

/// Writes a variable-length quantity (VLQ) used for delta times in MIDI.
///
/// VLQ encodes values using 7 bits per byte, with the MSB indicating
/// whether more bytes follow (1 = more bytes, 0 = last byte).
fn write_vlq(value: u32, buffer: &mut Vec<u8>) -> Result<()> {
    if value > VLQ_MAX {
        return Err(Error::EncodeFailure(format!(
            "value {value} exceeds the variable-length quantity range"
        )));
    }

    if value == 0 {
        buffer.push(0);
        return Ok(());
    }

    let mut temp = value;
    let mut bytes = Vec::with_capacity(4);

    while temp > 0 {
        bytes.push((temp & 0x7F) as u8);
        temp >>= 7;
    }

    // Write bytes in reverse order with continuation bits
    for (i, &byte) in bytes.iter().rev().enumerate() {
        if i < bytes.len() - 1 {
            buffer.push(byte | 0x80); // Set continuation bit
        } else {
            buffer.push(byte); // Last byte, no continuation
        }
    }
    Ok(())
}

/// MIDI events that can appear in an encoded take.
#[derive(Debug, Clone, PartialEq)]
enum MidiEvent {
    NoteOn { pitch: u8, velocity: u8 },
    NoteOff { pitch: u8 },
    /// Set tempo: microseconds per quarter note
    SetTempo { microseconds_per_beat: u32 },
    /// Time signature: numerator, denominator as a power of 2
    TimeSignature { numerator: u8, denominator_power: u8 },
    TrackName { name: String },
    EndOfTrack,
}

/// An event positioned on the absolute tick grid.
struct TimedEvent {
    tick: u64,
    event: MidiEvent,
    /// Tie-break at equal ticks (lower = first).
    priority: u8,
}

/// Note-offs sort ahead of note-ons that share their tick.
const PRIORITY_NOTE_OFF: u8 = 0;
const PRIORITY_NOTE_ON: u8 = 1;

/// Writes a single MIDI event to the buffer (without delta time).
fn write_event(event: &MidiEvent, buffer: &mut Vec<u8>) -> Result<()> {
    match event {
        MidiEvent::NoteOn { pitch, velocity } => {
            buffer.push(0x90 | CHANNEL);
            buffer.push(pitch & 0x7F);
            buffer.push(velocity & 0x7F);
        }
        MidiEvent::NoteOff { pitch } => {
            buffer.push(0x80 | CHANNEL);
            buffer.push(pitch & 0x7F);
            buffer.push(0);
        }
        MidiEvent::SetTempo {
            microseconds_per_beat,
        } => {
            // Meta event: FF 51 03 tt tt tt
            buffer.extend_from_slice(&[0xFF, 0x51, 0x03]);
            buffer.push((microseconds_per_beat >> 16) as u8);
            buffer.push((microseconds_per_beat >> 8) as u8);
            buffer.push(*microseconds_per_beat as u8);
        }
        MidiEvent::TimeSignature {
            numerator,
            denominator_power,
        } => {
            // Meta event: FF 58 04 nn dd cc bb
            // cc = MIDI clocks per metronome click, bb = 32nd notes per quarter
            buffer.extend_from_slice(&[0xFF, 0x58, 0x04]);
            buffer.push(*numerator);
            buffer.push(*denominator_power);
            buffer.push(24);
            buffer.push(8);
        }
        MidiEvent::TrackName { name } => {
            // Meta event: FF 03 len text
            buffer.extend_from_slice(&[0xFF, 0x03]);
            let name_bytes = name.as_bytes();
            write_vlq(name_bytes.len() as u32, buffer)?;
            buffer.extend_from_slice(name_bytes);
        }
        MidiEvent::EndOfTrack => {
            // Meta event: FF 2F 00
            buffer.extend_from_slice(&[0xFF, 0x2F, 0x00]);
        }
    }
    Ok(())
}

/// Builds delta-time encoded track data from events already in output order.
fn build_track_data(events: &[TimedEvent]) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut last_tick = 0u64;

    for timed_event in events {
        let delta = timed_event.tick.saturating_sub(last_tick);
        let delta = u32::try_from(delta).map_err(|_| {
            Error::EncodeFailure(format!("delta time {delta} does not fit in 32 bits"))
        })?;
        write_vlq(delta, &mut buffer)?;
        write_event(&timed_event.event, &mut buffer)?;
        last_tick = timed_event.tick;
    }

    Ok(buffer)
}

/// Appends an `MTrk` chunk to the output.
fn write_track_chunk(out: &mut Vec<u8>, track_data: &[u8]) -> Result<()> {
    let length = u32::try_from(track_data.len())
        .map_err(|_| Error::EncodeFailure("track chunk exceeds 4 GiB".to_string()))?;
    out.extend_from_slice(b"MTrk");
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(track_data);
    Ok(())
}

/// Derives the note-track events for the terminated notes, sorted for output.
///
/// Pitches above 127 are dropped rather than written as another key.
fn note_track_events(events: &[NoteEvent], options: &SmfOptions) -> Vec<TimedEvent> {
    let mut notes: Vec<&NoteEvent> = events
        .iter()
        .filter(|e| e.is_terminated())
        .filter(|e| {
            if e.note_number > 127 {
                tracing::warn!(
                    note = e.note_number,
                    onset_ms = e.onset_ms,
                    "skipping note outside the MIDI range"
                );
                return false;
            }
            true
        })
        .collect();
    notes.sort_by_key(|e| e.onset_ms);

    let mut timed = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let on_tick = ms_to_ticks(note.onset_ms, options.ticks_per_quarter, options.bpm);
        let off_tick = ms_to_ticks(note.end_ms(), options.ticks_per_quarter, options.bpm)
            // A sub-tick note still needs its off after its on
            .max(on_tick + 1);

        timed.push(TimedEvent {
            tick: on_tick,
            event: MidiEvent::NoteOn {
                pitch: note.note_number,
                velocity: note.midi_velocity(),
            },
            priority: PRIORITY_NOTE_ON,
        });
        timed.push(TimedEvent {
            tick: off_tick,
            event: MidiEvent::NoteOff {
                pitch: note.note_number,
            },
            priority: PRIORITY_NOTE_OFF,
        });
    }

    // Stable: equal (tick, priority) keeps derivation order
    timed.sort_by_key(|e| (e.tick, e.priority));
    timed
}

/// Encodes note events as a Format 1 Standard MIDI File.
///
/// Only notes with a non-zero duration are written. Encoding the same events
/// with the same options always produces identical bytes.
///
/// # Errors
///
/// Returns [`Error::EncodeFailure`] if a tick offset exceeds what a MIDI
/// variable-length quantity can express, or if the options are unusable.
pub fn encode(events: &[NoteEvent], options: &SmfOptions) -> Result<Vec<u8>> {
    if options.ticks_per_quarter == 0 || options.ticks_per_quarter > 0x7FFF {
        return Err(Error::EncodeFailure(format!(
            "ticks per quarter {} is outside 1..=32767",
            options.ticks_per_quarter
        )));
    }
    if !(options.bpm.is_finite() && options.bpm > 0.0) {
        return Err(Error::EncodeFailure(format!("invalid tempo {}", options.bpm)));
    }

    let mut out = Vec::new();

    // Header chunk (MThd)
    out.extend_from_slice(b"MThd");
    out.extend_from_slice(&6u32.to_be_bytes()); // Header length (always 6)
    out.extend_from_slice(&1u16.to_be_bytes()); // Format 1
    out.extend_from_slice(&2u16.to_be_bytes()); // Tempo track + note track
    out.extend_from_slice(&options.ticks_per_quarter.to_be_bytes());

    // Track 0: tempo and time signature
    let tempo_track = [
        TimedEvent {
            tick: 0,
            event: MidiEvent::SetTempo {
                microseconds_per_beat: bpm_to_micros_per_quarter(options.bpm),
            },
            priority: 0,
        },
        TimedEvent {
            tick: 0,
            event: MidiEvent::TimeSignature {
                numerator: 4,
                denominator_power: 2,
            },
            priority: 0,
        },
        TimedEvent {
            tick: 0,
            event: MidiEvent::EndOfTrack,
            priority: 0,
        },
    ];
    write_track_chunk(&mut out, &build_track_data(&tempo_track)?)?;

    // Track 1: notes
    let mut note_track = vec![TimedEvent {
        tick: 0,
        event: MidiEvent::TrackName {
            name: options.track_name.clone(),
        },
        priority: 0,
    }];
    let notes = note_track_events(events, options);
    let last_tick = notes.last().map(|e| e.tick).unwrap_or(0);
    note_track.extend(notes);
    note_track.push(TimedEvent {
        tick: last_tick,
        event: MidiEvent::EndOfTrack,
        priority: 0,
    });
    write_track_chunk(&mut out, &build_track_data(&note_track)?)?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::import_events;
    use midly::num::{u15, u24};
    use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

    fn vlq(value: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        write_vlq(value, &mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_vlq_encoding() {
        // Single byte values (0-127)
        assert_eq!(vlq(0), vec![0x00]);
        assert_eq!(vlq(0x40), vec![0x40]);
        assert_eq!(vlq(0x7F), vec![0x7F]);

        // Two byte values (128-16383)
        assert_eq!(vlq(0x80), vec![0x81, 0x00]);
        assert_eq!(vlq(0x2000), vec![0xC0, 0x00]);
        assert_eq!(vlq(0x3FFF), vec![0xFF, 0x7F]);

        // Three and four byte values
        assert_eq!(vlq(0x4000), vec![0x81, 0x80, 0x00]);
        assert_eq!(vlq(0x1F_FFFF), vec![0xFF, 0xFF, 0x7F]);
        assert_eq!(vlq(0x20_0000), vec![0x81, 0x80, 0x80, 0x00]);
        assert_eq!(vlq(0x0FFF_FFFF), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_vlq_overflow_is_encode_failure() {
        let mut buffer = Vec::new();
        let err = write_vlq(0x1000_0000, &mut buffer).unwrap_err();
        assert!(matches!(err, Error::EncodeFailure(_)));
    }

    #[test]
    fn test_single_note_exact_bytes() {
        // C4, velocity 0.8, held 500 ms
        let events = vec![NoteEvent::with_duration(60, 0.8, 0, 500)];
        let bytes = encode(&events, &SmfOptions::default()).unwrap();

        let mut expected = Vec::new();
        // Header: format 1, 2 tracks, 960 ticks per quarter
        expected.extend_from_slice(b"MThd");
        expected.extend_from_slice(&[0, 0, 0, 6, 0, 1, 0, 2, 0x03, 0xC0]);
        // Tempo track: 120000 us/quarter (500 BPM), 4/4, end of track
        expected.extend_from_slice(b"MTrk");
        expected.extend_from_slice(&[0, 0, 0, 19]);
        expected.extend_from_slice(&[0x00, 0xFF, 0x51, 0x03, 0x01, 0xD4, 0xC0]);
        expected.extend_from_slice(&[0x00, 0xFF, 0x58, 0x04, 0x04, 0x02, 0x18, 0x08]);
        expected.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        // Note track: name, on, off 4000 ticks later, end of track
        expected.extend_from_slice(b"MTrk");
        expected.extend_from_slice(&[0, 0, 0, 26]);
        expected.extend_from_slice(&[0x00, 0xFF, 0x03, 0x09]);
        expected.extend_from_slice(b"Recording");
        expected.extend_from_slice(&[0x00, 0x90, 60, 102]);
        expected.extend_from_slice(&[0x9F, 0x20, 0x80, 60, 0x00]);
        expected.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_unterminated_notes_are_dropped() {
        let events = vec![
            NoteEvent::with_duration(60, 0.8, 0, 500),
            NoteEvent::new(62, 0.8, 100),
        ];
        let with_open = encode(&events, &SmfOptions::default()).unwrap();
        let without = encode(&events[..1], &SmfOptions::default()).unwrap();
        assert_eq!(with_open, without);
    }

    #[test]
    fn test_out_of_range_pitch_is_dropped() {
        let events = vec![
            NoteEvent::with_duration(200, 0.8, 0, 500),
            NoteEvent::with_duration(60, 0.8, 100, 500),
        ];
        let bytes = encode(&events, &SmfOptions::default()).unwrap();
        let expected = encode(&events[1..], &SmfOptions::default()).unwrap();
        assert_eq!(bytes, expected);

        let imported = import_events(&bytes).unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].note_number, 60);
    }

    #[test]
    fn test_empty_take_still_valid() {
        let bytes = encode(&[], &SmfOptions::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.tracks.len(), 2);
        assert_eq!(smf.tracks[1].len(), 2); // name + end of track
    }

    #[test]
    fn test_encoding_is_idempotent() {
        let events = vec![
            NoteEvent::with_duration(60, 0.8, 0, 500),
            NoteEvent::with_duration(64, 0.6, 250, 500),
            NoteEvent::with_duration(67, 0.4, 250, 125),
        ];
        let first = encode(&events, &SmfOptions::default()).unwrap();
        let second = encode(&events, &SmfOptions::default()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_note_off_precedes_note_on_at_same_tick() {
        // First note ends exactly where the second starts
        let events = vec![
            NoteEvent::with_duration(60, 0.8, 0, 100),
            NoteEvent::with_duration(62, 0.8, 100, 100),
        ];
        let bytes = encode(&events, &SmfOptions::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let kinds: Vec<(u32, &str, u8)> = smf.tracks[1]
            .iter()
            .filter_map(|e| match e.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOn { key, .. },
                    ..
                } => Some((e.delta.as_int(), "on", key.as_int())),
                TrackEventKind::Midi {
                    message: MidiMessage::NoteOff { key, .. },
                    ..
                } => Some((e.delta.as_int(), "off", key.as_int())),
                _ => None,
            })
            .collect();

        assert_eq!(
            kinds,
            vec![(0, "on", 60), (800, "off", 60), (0, "on", 62), (800, "off", 62)]
        );
    }

    #[test]
    fn test_header_and_meta_parse() {
        let events = vec![NoteEvent::with_duration(60, 0.8, 0, 500)];
        let bytes = encode(&events, &SmfOptions::default()).unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        assert_eq!(smf.header.format, midly::Format::Parallel);
        assert_eq!(smf.header.timing, Timing::Metrical(u15::new(960)));
        assert!(smf.tracks[0]
            .iter()
            .any(|e| e.kind == TrackEventKind::Meta(MetaMessage::Tempo(u24::new(120_000)))));
        assert!(smf.tracks[0]
            .iter()
            .any(|e| e.kind == TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8))));
        assert!(smf.tracks[1]
            .iter()
            .any(|e| e.kind == TrackEventKind::Meta(MetaMessage::TrackName(&b"Recording"[..]))));
    }

    #[test]
    fn test_round_trip_through_parser() {
        let events = vec![
            NoteEvent::with_duration(60, 0.8, 0, 500),
            NoteEvent::with_duration(64, 0.5, 250, 500),
            NoteEvent::with_duration(67, 0.9, 1234, 77),
            NoteEvent::with_duration(60, 0.3, 2000, 1),
            NoteEvent::new(72, 0.9, 2500),
        ];
        let bytes = encode(&events, &SmfOptions::default()).unwrap();
        let mut decoded = import_events(&bytes).unwrap();
        decoded.sort_by_key(|e| (e.onset_ms, e.note_number));

        let expected: Vec<&NoteEvent> = events.iter().filter(|e| e.is_terminated()).collect();
        assert_eq!(decoded.len(), expected.len());

        // One tick at 960 PPQ / 500 BPM is 0.125 ms
        for (got, want) in decoded.iter().zip(expected) {
            assert_eq!(got.note_number, want.note_number);
            assert!(got.onset_ms.abs_diff(want.onset_ms) <= 1);
            assert!(got.duration_ms.abs_diff(want.duration_ms) <= 1);
        }
    }

    #[test]
    fn test_long_names_use_vlq_length() {
        let options = SmfOptions {
            track_name: "x".repeat(200),
            ..SmfOptions::default()
        };
        let bytes = encode(&[], &options).unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        match smf.tracks[1][0].kind {
            TrackEventKind::Meta(MetaMessage::TrackName(name)) => assert_eq!(name.len(), 200),
            ref other => panic!("unexpected first event {other:?}"),
        }
    }

    #[test]
    fn test_invalid_options() {
        let options = SmfOptions {
            ticks_per_quarter: 0,
            ..SmfOptions::default()
        };
        assert!(matches!(encode(&[], &options), Err(Error::EncodeFailure(_))));

        let options = SmfOptions {
            bpm: 0.0,
            ..SmfOptions::default()
        };
        assert!(matches!(encode(&[], &options), Err(Error::EncodeFailure(_))));
    }
}
