//! miditake - real-time MIDI take capture and rendering.
//!
//! This library captures note events from a MIDI controller with live
//! monitoring, encodes takes as Standard MIDI Files, and renders them offline
//! to 16-bit PCM WAV.

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod midi;
pub mod storage;

// Re-export commonly used types
pub use audio::{render, Engine, Patch, Playback, RenderOptions, RenderedAudio};
pub use capture::{list_inputs, CaptureSession};
pub use config::Settings;
pub use error::{Error, Result};
pub use midi::{encode, NoteEvent, SmfOptions, Take};
