//! Error types shared by every stage of the take pipeline.

use thiserror::Error;

/// Errors surfaced by capture, synthesis, encoding, rendering and storage.
///
/// None of these are process-fatal; each carries a readable cause that can be
/// shown to the user as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// No MIDI input is available, or the selected one is missing.
    #[error("MIDI input unavailable: {0}")]
    DeviceUnavailable(String),

    /// A render was requested for a take with nothing schedulable in it.
    #[error("no renderable notes: the take is empty or every note was unschedulable")]
    NoRenderableNotes,

    /// The synthesis graph failed, including after the fallback graph.
    #[error("render failed: {0}")]
    RenderFailure(String),

    /// Encoding a well-formed take should never fail; this is a bug report.
    #[error("encode failed: {0}")]
    EncodeFailure(String),

    /// A long-running operation was cancelled by its owner.
    #[error("operation cancelled")]
    Cancelled,

    /// A pitch name such as "C#4" could not be parsed or is out of range.
    #[error("invalid pitch: {0}")]
    InvalidPitch(String),

    /// The live engine was used after `dispose()`.
    #[error("synthesis engine has been disposed")]
    EngineDisposed,

    /// The audio output device could not be opened.
    #[error("audio output error: {0}")]
    AudioOutput(String),

    /// An externally supplied MIDI file could not be read.
    #[error("MIDI parse error: {0}")]
    MidiParse(String),

    /// The file storage collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// A take or settings document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
