//! Real-time capture of note events from a MIDI input.
//!
//! A [`CaptureSession`] timestamps incoming note messages relative to the
//! moment capture started, forwards them to an optional live monitor, and
//! produces a [`crate::midi::Take`] when stopped.

mod message;
mod recorder;
mod session;

pub use message::MidiMessage;
pub use recorder::Recorder;
pub use session::{list_inputs, CaptureInput, CaptureSession, InputDevice};
