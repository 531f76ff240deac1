//! Synthesis, playback and offline rendering.
//!
//! This module provides:
//! - Instrument patches shared by live and offline synthesis
//! - A live engine for monitoring and take playback through rodio
//! - Offline rendering of note events to PCM audio
//! - 16-bit PCM WAV encoding

pub mod effects;
pub mod engine;
mod patch;
pub mod playback;
pub mod render;
pub mod synth;
pub mod voice;
pub mod wav;

pub use engine::{Engine, EngineHandle, NoteSink, SAMPLE_RATE};
pub use patch::{
    EffectParams, EnvelopeParams, ModulationParams, OscLayer, Patch, PatchParams, Waveform,
};
pub use playback::Playback;
pub use render::{
    render, render_batch, render_midi, render_with_cancel, CancelToken, RenderJob, RenderOptions,
    RenderRequest, RenderedAudio,
};
