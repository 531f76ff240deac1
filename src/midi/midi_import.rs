//! Standard MIDI File (SMF) import.
//!
//! Reads externally supplied .mid files into note events so they can be
//! rendered like a captured take. Supports SMF Format 0 and Format 1.
//!
//! # Limitations
//!
//! - Only note on/off events become notes; all channels are merged
//! - Tempo changes are honored from any track (tempo map is global)
//! - Notes still held at the end of the file are kept with duration 0

use super::{ticks_to_ms, NoteEvent};
use crate::error::{Error, Result};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;

/// Tempo assumed until the first tempo meta event (120 BPM).
const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;

/// A note-on/note-off occurrence on the absolute tick grid.
#[derive(Debug, Clone, Copy)]
enum RawEvent {
    On { channel: u8, key: u8, vel: u8 },
    Off { channel: u8, key: u8 },
}

/// Maps absolute ticks to milliseconds through a tempo map.
struct TempoMap {
    ticks_per_quarter: u16,
    /// (tick, microseconds per quarter) sorted by tick
    changes: Vec<(u64, u32)>,
}

impl TempoMap {
    fn new(ticks_per_quarter: u16, mut changes: Vec<(u64, u32)>) -> Self {
        changes.sort_by_key(|(tick, _)| *tick);
        Self {
            ticks_per_quarter,
            changes,
        }
    }

    /// Integrates the tempo segments up to `tick`.
    fn to_ms(&self, tick: u64) -> f64 {
        let mut ms = 0.0;
        let mut seg_start = 0u64;
        let mut tempo = DEFAULT_MICROS_PER_QUARTER;

        for &(change_tick, micros) in &self.changes {
            if change_tick >= tick {
                break;
            }
            ms += self.segment_ms(change_tick - seg_start, tempo);
            seg_start = change_tick;
            tempo = micros;
        }

        ms + self.segment_ms(tick - seg_start, tempo)
    }

    fn segment_ms(&self, ticks: u64, micros_per_quarter: u32) -> f64 {
        ticks_to_ms(ticks, self.ticks_per_quarter, micros_per_quarter)
    }
}

/// Parses a Standard MIDI File into note events with millisecond timing.
///
/// Note-offs close the most recent open note of the same channel and pitch,
/// the same rule capture uses. Velocity maps to `vel / 127`.
///
/// # Errors
///
/// Returns [`Error::MidiParse`] if the bytes are not a valid SMF or use
/// SMPTE timecode division.
pub fn import_events(data: &[u8]) -> Result<Vec<NoteEvent>> {
    let smf = Smf::parse(data).map_err(|e| Error::MidiParse(e.to_string()))?;

    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(_, _) => {
            return Err(Error::MidiParse(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if ticks_per_quarter == 0 {
        return Err(Error::MidiParse("division of zero ticks per quarter".to_string()));
    }

    let mut tempo_changes = Vec::new();
    let mut raw: Vec<(u64, RawEvent)> = Vec::new();

    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(micros)) => {
                    tempo_changes.push((tick, micros.as_int()));
                }
                TrackEventKind::Midi { channel, message } => {
                    let channel = channel.as_int();
                    match message {
                        // Note on with velocity 0 is a note off
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => raw.push((
                            tick,
                            RawEvent::On {
                                channel,
                                key: key.as_int(),
                                vel: vel.as_int(),
                            },
                        )),
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            raw.push((
                                tick,
                                RawEvent::Off {
                                    channel,
                                    key: key.as_int(),
                                },
                            ))
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    let tempo_map = TempoMap::new(ticks_per_quarter, tempo_changes);

    // Stable, so same-tick events keep their file order
    raw.sort_by_key(|(tick, _)| *tick);

    let mut events: Vec<NoteEvent> = Vec::new();
    // (channel, key) -> stack of indices into `events` still open
    let mut open: HashMap<(u8, u8), Vec<usize>> = HashMap::new();

    for (tick, event) in raw {
        let ms = tempo_map.to_ms(tick);
        match event {
            RawEvent::On { channel, key, vel } => {
                open.entry((channel, key)).or_default().push(events.len());
                events.push(NoteEvent::new(key, vel as f32 / 127.0, ms.round() as u64));
            }
            RawEvent::Off { channel, key } => {
                let Some(index) = open.get_mut(&(channel, key)).and_then(Vec::pop) else {
                    tracing::warn!(key, channel, "ignoring note-off without note-on");
                    continue;
                };
                let onset = events[index].onset_ms;
                let duration = (ms.round() as u64).saturating_sub(onset);
                // A note shorter than a millisecond still counts as played
                events[index].duration_ms = duration.max(1);
            }
        }
    }

    events.sort_by_key(|e| e.onset_ms);
    Ok(events)
}
