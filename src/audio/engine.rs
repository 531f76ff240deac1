//! Live synthesis engine for monitoring and take playback.
//!
//! Provides an explicitly owned engine that plays notes in real time through
//! rodio. Callers on other threads drive it through an [`EngineHandle`],
//! which only pushes commands onto a channel and never waits for the audio
//! thread.

use super::patch::Patch;
use super::synth::Synth;
use crate::error::{Error, Result};
use crate::midi::name_to_note;
use crossbeam_channel::{Receiver, Sender};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sample rate for live output (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Audio buffer size for low-latency playback.
/// Smaller = lower latency but higher CPU usage.
const BUFFER_SIZE: usize = 256;

/// Anything that can sound notes: the live engine, or a test double.
pub trait NoteSink: Send + Sync {
    /// Starts `note` at `velocity` (0.0-1.0).
    fn note_on(&self, note: u8, velocity: f32);
    fn note_off(&self, note: u8);
    /// Hard stop of every sounding note.
    fn all_notes_off(&self);
}

/// Commands queued for the audio thread.
#[derive(Debug, Clone, Copy, PartialEq)]
enum VoiceCommand {
    Attack { note: u8, velocity: f32 },
    Release { note: u8 },
    ReleaseAll,
}

/// The synthesizer plus its pending command queue.
///
/// Commands are applied at the start of every block so the sender side
/// never contends on the lock.
struct LiveGraph {
    synth: Synth,
    commands: Receiver<VoiceCommand>,
}

impl LiveGraph {
    fn apply_pending(&mut self) {
        for command in self.commands.try_iter() {
            match command {
                VoiceCommand::Attack { note, velocity } => {
                    // One sounding voice per pitch
                    self.synth.release(note);
                    if let Err(e) = self.synth.attack(note, velocity) {
                        tracing::warn!(note, error = %e, "live attack dropped");
                    }
                }
                VoiceCommand::Release { note } => self.synth.release(note),
                VoiceCommand::ReleaseAll => self.synth.release_all(),
            }
        }
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        self.apply_pending();
        self.synth.render(left, right);
    }
}

/// Audio source that generates samples from the live graph.
/// Implements rodio's Source trait for playback.
struct SynthSource {
    graph: Arc<Mutex<LiveGraph>>,
    sample_rate: u32,
    /// Left channel buffer.
    left_buf: Vec<f32>,
    /// Right channel buffer.
    right_buf: Vec<f32>,
    /// Current position in the buffer.
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl SynthSource {
    fn new(graph: Arc<Mutex<LiveGraph>>, sample_rate: u32) -> Self {
        Self {
            graph,
            sample_rate,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }
}

impl Iterator for SynthSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            if let Ok(mut graph) = self.graph.lock() {
                graph.render(&mut self.left_buf, &mut self.right_buf);
            } else {
                // A poisoned graph plays silence rather than taking the stream down
                self.left_buf.fill(0.0);
                self.right_buf.fill(0.0);
            }
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for SynthSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2 // Stereo
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// Keeps the rodio stream alive for as long as the engine is.
struct AudioOutput {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

/// Cloneable, non-blocking control surface of an [`Engine`].
///
/// Handles outlive nothing: once the engine is disposed, every method is a
/// no-op and [`EngineHandle::attack`] reports [`Error::EngineDisposed`].
#[derive(Clone)]
pub struct EngineHandle {
    commands: Sender<VoiceCommand>,
    disposed: Arc<AtomicBool>,
}

impl EngineHandle {
    fn send(&self, command: VoiceCommand) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::EngineDisposed);
        }
        self.commands.send(command).map_err(|_| Error::EngineDisposed)
    }

    /// Queues an attack by MIDI note number.
    pub fn attack(&self, note: u8, velocity: f32) -> Result<()> {
        if note > 127 {
            return Err(Error::InvalidPitch(format!("note number {note} is above 127")));
        }
        let velocity = if velocity.is_finite() {
            velocity.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.send(VoiceCommand::Attack { note, velocity })
    }

    pub fn release(&self, note: u8) -> Result<()> {
        self.send(VoiceCommand::Release { note })
    }

    pub fn release_all(&self) -> Result<()> {
        self.send(VoiceCommand::ReleaseAll)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl NoteSink for EngineHandle {
    fn note_on(&self, note: u8, velocity: f32) {
        if let Err(e) = self.attack(note, velocity) {
            tracing::debug!(note, error = %e, "monitor note-on dropped");
        }
    }

    fn note_off(&self, note: u8) {
        let _ = self.release(note);
    }

    fn all_notes_off(&self) {
        let _ = self.release_all();
    }
}

/// A polyphonic live instrument with one patch.
///
/// The engine is explicitly owned; create one per recording or playback
/// flow and call [`Engine::dispose`] (or drop it) when done.
pub struct Engine {
    patch: Patch,
    graph: Arc<Mutex<LiveGraph>>,
    handle: EngineHandle,
    output: Option<AudioOutput>,
}

impl Engine {
    /// Creates an engine playing through the default audio output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AudioOutput`] if no output device can be opened, or
    /// [`Error::RenderFailure`] if the patch graph cannot be built.
    pub fn new(patch: Patch) -> Result<Self> {
        let mut engine = Self::detached(patch, SAMPLE_RATE)?;

        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| Error::AudioOutput(e.to_string()))?;

        let source = SynthSource::new(Arc::clone(&engine.graph), SAMPLE_RATE);
        stream_handle
            .play_raw(source)
            .map_err(|e| Error::AudioOutput(e.to_string()))?;

        engine.output = Some(AudioOutput {
            _stream: stream,
            _stream_handle: stream_handle,
        });
        tracing::info!(%patch, "live engine started");
        Ok(engine)
    }

    /// Creates an engine with no output device; audio is pulled with
    /// [`Engine::pull`].
    pub fn detached(patch: Patch, sample_rate: u32) -> Result<Self> {
        let synth = Synth::new(patch.params(), sample_rate)?;
        let (tx, rx) = crossbeam_channel::unbounded();

        Ok(Self {
            patch,
            graph: Arc::new(Mutex::new(LiveGraph {
                synth,
                commands: rx,
            })),
            handle: EngineHandle {
                commands: tx,
                disposed: Arc::new(AtomicBool::new(false)),
            },
            output: None,
        })
    }

    pub fn patch(&self) -> Patch {
        self.patch
    }

    /// Returns a handle for other threads.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Starts a note by pitch name, e.g. "C4" or "F#3".
    pub fn attack(&self, pitch: &str, velocity: f32) -> Result<()> {
        let note = name_to_note(pitch).ok_or_else(|| Error::InvalidPitch(pitch.to_string()))?;
        self.handle.attack(note, velocity)
    }

    /// Releases a note by pitch name.
    pub fn release(&self, pitch: &str) -> Result<()> {
        let note = name_to_note(pitch).ok_or_else(|| Error::InvalidPitch(pitch.to_string()))?;
        self.handle.release(note)
    }

    /// Cuts every sounding voice immediately.
    pub fn release_all(&self) -> Result<()> {
        self.handle.release_all()
    }

    /// Renders the next block into `left` and `right`.
    ///
    /// Only meaningful for detached engines; with a device attached the
    /// output stream is pulling from the same graph.
    pub fn pull(&self, left: &mut [f32], right: &mut [f32]) {
        match self.graph.lock() {
            Ok(mut graph) => graph.render(left, right),
            Err(_) => {
                left.fill(0.0);
                right.fill(0.0);
            }
        }
    }

    /// Number of voices currently producing sound.
    pub fn active_voices(&self) -> usize {
        self.graph
            .lock()
            .map(|graph| graph.synth.active_voices())
            .unwrap_or(0)
    }

    /// Tears down voices and the output stream; the engine cannot be reused.
    pub fn dispose(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.handle.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut graph) = self.graph.lock() {
            graph.synth.release_all();
        }
        // Dropping the stream stops the device callback
        self.output = None;
        tracing::info!(patch = %self.patch, "live engine disposed");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull_peak(engine: &Engine, frames: usize) -> f32 {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        engine.pull(&mut left, &mut right);
        left.iter()
            .chain(right.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn test_attack_by_name_sounds() {
        let engine = Engine::detached(Patch::Piano, SAMPLE_RATE).unwrap();
        engine.attack("C4", 0.8).unwrap();
        assert!(pull_peak(&engine, 1024) > 0.01);
        assert_eq!(engine.active_voices(), 1);
    }

    #[test]
    fn test_invalid_pitch() {
        let engine = Engine::detached(Patch::Synth, SAMPLE_RATE).unwrap();
        assert!(matches!(engine.attack("H2", 0.5), Err(Error::InvalidPitch(_))));
        assert!(matches!(engine.release("C#"), Err(Error::InvalidPitch(_))));
    }

    #[test]
    fn test_polyphony_and_retrigger() {
        let engine = Engine::detached(Patch::Piano, SAMPLE_RATE).unwrap();
        engine.attack("C4", 0.8).unwrap();
        engine.attack("E4", 0.8).unwrap();
        engine.attack("G4", 0.8).unwrap();
        pull_peak(&engine, 256);
        assert_eq!(engine.active_voices(), 3);

        // A repeated pitch releases the old voice instead of stacking
        engine.attack("C4", 0.8).unwrap();
        pull_peak(&engine, 256);
        // The released C4 is still ringing out alongside its replacement
        assert_eq!(engine.active_voices(), 4);
    }

    #[test]
    fn test_release_all_is_hard_stop() {
        let engine = Engine::detached(Patch::Synth, SAMPLE_RATE).unwrap();
        engine.attack("A3", 1.0).unwrap();
        engine.attack("C4", 1.0).unwrap();
        assert!(pull_peak(&engine, 2048) > 0.0);

        engine.release_all().unwrap();
        assert_eq!(pull_peak(&engine, 256), 0.0);
        assert_eq!(engine.active_voices(), 0);
    }

    #[test]
    fn test_handle_after_dispose() {
        let engine = Engine::detached(Patch::Piano, SAMPLE_RATE).unwrap();
        let handle = engine.handle();
        handle.attack(60, 0.5).unwrap();
        engine.dispose();

        assert!(handle.is_disposed());
        assert!(matches!(handle.attack(60, 0.5), Err(Error::EngineDisposed)));
        // Sink calls are silent no-ops
        handle.note_on(60, 0.5);
        handle.all_notes_off();
    }

    #[test]
    fn test_handle_from_other_thread() {
        let engine = Engine::detached(Patch::Piano, SAMPLE_RATE).unwrap();
        let handle = engine.handle();
        std::thread::spawn(move || {
            handle.note_on(62, 0.7);
        })
        .join()
        .unwrap();
        assert!(pull_peak(&engine, 512) > 0.0);
    }
}
