//! Raw MIDI input parsing.

/// Status nibbles of the channel messages capture cares about.
const NOTE_OFF: u8 = 0x80;
const NOTE_ON: u8 = 0x90;

/// A parsed input message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note On: channel (0-15), note (0-127), velocity (1-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note Off: channel (0-15), note (0-127), release velocity (0-127)
    NoteOff { channel: u8, note: u8, velocity: u8 },
    /// Any other channel or system message
    Other,
}

impl MidiMessage {
    /// Parse raw MIDI bytes into a MidiMessage.
    ///
    /// Returns `None` for empty or truncated input.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let &status = data.first()?;
        if status < 0x80 {
            // Data byte without status; running status is not supported
            return None;
        }

        let channel = status & 0x0F;
        match status & 0xF0 {
            NOTE_OFF | NOTE_ON if data.len() < 3 => None,
            NOTE_OFF => Some(MidiMessage::NoteOff {
                channel,
                note: data[1] & 0x7F,
                velocity: data[2] & 0x7F,
            }),
            NOTE_ON => {
                let note = data[1] & 0x7F;
                let velocity = data[2] & 0x7F;
                // Note On with velocity 0 is equivalent to Note Off
                if velocity == 0 {
                    Some(MidiMessage::NoteOff {
                        channel,
                        note,
                        velocity: 0,
                    })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note,
                        velocity,
                    })
                }
            }
            _ => Some(MidiMessage::Other),
        }
    }
}
