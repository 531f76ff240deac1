//! Offline rendering of note events to PCM audio.
//!
//! Renders a take (or an imported MIDI file) through a synthesis graph built
//! fresh for every call. The render runs as fast as the CPU allows and never
//! touches the live engine.

use super::patch::{Patch, PatchParams};
use super::synth::Synth;
use super::voice::VoiceId;
use crate::error::{Error, Result};
use crate::midi::{import_events, NoteEvent};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Buffer size for rendering chunks.
/// Larger buffers are more efficient but use more memory.
const RENDER_BUFFER_SIZE: usize = 4096;

/// Output format of an offline render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo).
    pub channels: u16,
    /// Silence allowance after the last release, for reverb and decay.
    pub tail_seconds: f64,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            tail_seconds: 3.0,
        }
    }
}

/// A finished render: one sample buffer per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAudio {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl RenderedAudio {
    /// Wraps planar channel buffers. All channels must be the same length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncodeFailure`] if there are no channels or their
    /// lengths differ.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Err(Error::EncodeFailure("audio has no channels".to_string()));
        };
        if channels.iter().any(|c| c.len() != first.len()) {
            return Err(Error::EncodeFailure(
                "channel buffers have different lengths".to_string(),
            ));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// A buffer of silence, mostly useful for tests and placeholders.
    pub fn silent(sample_rate: u32, channels: u16, frames: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channels.max(1) as usize],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / self.sample_rate.max(1) as f64
    }

    /// One channel's samples, or `None` if out of range.
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Samples interleaved frame by frame (L, R, L, R, ...).
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for channel in &self.channels {
                out.push(channel[i]);
            }
        }
        out
    }
}

/// Shared flag that asks a running render to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A note placed on the sample timeline.
#[derive(Debug, Clone, Copy)]
struct ScheduledNote {
    note: u8,
    velocity: f32,
    start_frame: u64,
    end_frame: u64,
}

fn ms_to_frames(ms: u64, sample_rate: u32) -> u64 {
    ms * sample_rate as u64 / 1000
}

/// Total output length: last release plus the tail, rounded up to a frame.
fn total_frames(max_end_ms: u64, options: &RenderOptions) -> u64 {
    let sr = options.sample_rate as u64;
    let body = (max_end_ms * sr).div_ceil(1000);
    let tail = (options.tail_seconds.max(0.0) * sr as f64).round() as u64;
    body + tail
}

/// Places every terminated event on the timeline, dropping the ones that
/// cannot be played.
fn schedule(events: &[NoteEvent], sample_rate: u32) -> Vec<ScheduledNote> {
    let mut scheduled = Vec::with_capacity(events.len());
    for event in events.iter().filter(|e| e.is_terminated()) {
        if event.note_number > 127 {
            tracing::warn!(
                note = event.note_number,
                onset_ms = event.onset_ms,
                "skipping note outside the MIDI range"
            );
            continue;
        }
        if !event.velocity_on.is_finite() {
            tracing::warn!(
                note = event.note_number,
                onset_ms = event.onset_ms,
                "skipping note with unusable velocity"
            );
            continue;
        }
        scheduled.push(ScheduledNote {
            note: event.note_number,
            velocity: event.velocity_on.clamp(0.0, 1.0),
            start_frame: ms_to_frames(event.onset_ms, sample_rate),
            end_frame: ms_to_frames(event.end_ms(), sample_rate),
        });
    }
    scheduled
}

/// How a graph is wired for one render attempt.
struct GraphSpec {
    params: PatchParams,
    channels: u16,
    /// Only one voice at a time; a new attack cuts the previous note.
    monophonic: bool,
}

/// Renders the schedule through one freshly built graph.
fn render_graph(
    notes: &[ScheduledNote],
    spec: &GraphSpec,
    sample_rate: u32,
    frames: u64,
    cancel: &CancelToken,
) -> Result<RenderedAudio> {
    if !(1..=2).contains(&spec.channels) {
        return Err(Error::RenderFailure(format!(
            "{} output channels requested; the graph renders mono or stereo",
            spec.channels
        )));
    }
    if sample_rate == 0 {
        return Err(Error::RenderFailure("sample rate of 0 Hz".to_string()));
    }
    let mut synth = Synth::new(spec.params.clone(), sample_rate)?;

    // (frame, is_on, note index); offs sort before ons at the same frame
    let mut cues: Vec<(u64, bool, usize)> = Vec::with_capacity(notes.len() * 2);
    for (i, note) in notes.iter().enumerate() {
        cues.push((note.start_frame, true, i));
        cues.push((note.end_frame, false, i));
    }
    cues.sort_by_key(|&(frame, is_on, _)| (frame, is_on));

    let mut voices: Vec<Option<VoiceId>> = vec![None; notes.len()];
    let mut left_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut right_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut out: Vec<Vec<f32>> = vec![Vec::new(); spec.channels as usize];

    let mut current = 0u64;
    let mut cue_idx = 0usize;

    while current < frames {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Fire every cue due at or before this position
        while cue_idx < cues.len() && cues[cue_idx].0 <= current {
            let (_, is_on, i) = cues[cue_idx];
            if is_on {
                if spec.monophonic {
                    synth.release_all();
                }
                match synth.attack(notes[i].note, notes[i].velocity) {
                    Ok(id) => voices[i] = Some(id),
                    Err(e) => {
                        tracing::warn!(note = notes[i].note, error = %e, "note dropped from render")
                    }
                }
            } else if let Some(id) = voices[i].take() {
                synth.release_voice(id);
            }
            cue_idx += 1;
        }

        // Render up to the next cue or the end of the buffer, whichever is first
        let next_cue = cues.get(cue_idx).map_or(frames, |c| c.0);
        let chunk = (frames - current)
            .min(next_cue - current)
            .min(RENDER_BUFFER_SIZE as u64) as usize;

        synth.render(&mut left_buf[..chunk], &mut right_buf[..chunk]);

        let block = left_buf[..chunk].iter().zip(&right_buf[..chunk]);
        if block.clone().any(|(l, r)| !l.is_finite() || !r.is_finite()) {
            return Err(Error::RenderFailure(format!(
                "graph produced non-finite samples at frame {current}"
            )));
        }

        if spec.channels == 1 {
            out[0].extend(block.map(|(l, r)| (l + r) * 0.5));
        } else {
            out[0].extend_from_slice(&left_buf[..chunk]);
            out[1].extend_from_slice(&right_buf[..chunk]);
        }

        current += chunk as u64;
    }

    RenderedAudio::new(sample_rate, out)
}

/// Renders events offline with the given patch.
///
/// Only notes with a duration are scheduled; notes that cannot be played
/// are logged and skipped. Output length is the last release plus
/// `options.tail_seconds`.
///
/// # Errors
///
/// - [`Error::NoRenderableNotes`] if nothing could be scheduled
/// - [`Error::RenderFailure`] if both the full graph and the minimal
///   fallback graph failed
pub fn render(
    events: &[NoteEvent],
    patch: Patch,
    options: &RenderOptions,
) -> Result<RenderedAudio> {
    render_with_cancel(events, patch, options, &CancelToken::new())
}

/// Like [`render`], checking `cancel` between blocks.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] once the token is cancelled; the graph is
/// dropped before returning.
pub fn render_with_cancel(
    events: &[NoteEvent],
    patch: Patch,
    options: &RenderOptions,
    cancel: &CancelToken,
) -> Result<RenderedAudio> {
    let notes = schedule(events, options.sample_rate);
    if notes.is_empty() {
        return Err(Error::NoRenderableNotes);
    }

    let max_end_ms = events
        .iter()
        .filter(|e| e.is_terminated())
        .map(NoteEvent::end_ms)
        .max()
        .unwrap_or(0);
    let frames = total_frames(max_end_ms, options);

    let started = Instant::now();
    tracing::info!(%patch, notes = notes.len(), frames, "offline render started");

    let params = patch.params();
    let full = GraphSpec {
        channels: options.channels,
        monophonic: false,
        params: params.clone(),
    };

    let audio = match render_graph(&notes, &full, options.sample_rate, frames, cancel) {
        Ok(audio) => audio,
        Err(Error::RenderFailure(primary)) => {
            tracing::warn!(error = %primary, "render failed, retrying with the minimal graph");
            let minimal = GraphSpec {
                params: params.minimal(),
                channels: 1,
                monophonic: true,
            };
            match render_graph(&notes, &minimal, options.sample_rate, frames, cancel) {
                Ok(audio) => audio,
                Err(Error::RenderFailure(fallback)) => {
                    return Err(Error::RenderFailure(format!(
                        "{primary}; minimal fallback also failed: {fallback}"
                    )))
                }
                Err(e) => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };

    tracing::info!(
        frames = audio.frames(),
        channels = audio.channel_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "offline render finished"
    );
    Ok(audio)
}

/// Parses a Standard MIDI File and renders it like a captured take.
///
/// # Errors
///
/// Returns [`Error::MidiParse`] for unreadable files, plus every error
/// [`render`] can return.
pub fn render_midi(data: &[u8], patch: Patch, options: &RenderOptions) -> Result<RenderedAudio> {
    let events = import_events(data)?;
    render(&events, patch, options)
}

/// A render running on its own thread.
pub struct RenderJob {
    cancel: CancelToken,
    thread: JoinHandle<Result<RenderedAudio>>,
}

impl RenderJob {
    /// Starts rendering `events` in the background.
    pub fn spawn(events: Vec<NoteEvent>, patch: Patch, options: RenderOptions) -> Self {
        let cancel = CancelToken::new();
        let thread = {
            let cancel = cancel.clone();
            std::thread::spawn(move || render_with_cancel(&events, patch, &options, &cancel))
        };
        Self { cancel, thread }
    }

    /// Asks the render to stop at the next block boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the render to complete.
    pub fn wait(self) -> Result<RenderedAudio> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(Error::RenderFailure("render thread panicked".to_string())))
    }
}

/// One independent render in a batch.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub events: Vec<NoteEvent>,
    pub patch: Patch,
    pub options: RenderOptions,
}

/// Renders several requests in parallel, each through its own graph.
///
/// Results come back in request order.
pub fn render_batch(requests: &[RenderRequest]) -> Vec<Result<RenderedAudio>> {
    requests
        .par_iter()
        .map(|req| render(&req.events, req.patch, &req.options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{encode, SmfOptions};

    fn scenario_c() -> Vec<NoteEvent> {
        vec![
            NoteEvent::with_duration(60, 0.8, 0, 500),
            NoteEvent::with_duration(64, 0.8, 250, 500),
        ]
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn test_empty_take_has_nothing_to_render() {
        let err = render(&[], Patch::Piano, &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NoRenderableNotes));
    }

    #[test]
    fn test_zero_duration_note_is_not_renderable() {
        let events = vec![NoteEvent::new(60, 0.8, 0)];
        let err = render(&events, Patch::Piano, &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NoRenderableNotes));
    }

    #[test]
    fn test_all_unschedulable_is_not_renderable() {
        let events = vec![
            NoteEvent::with_duration(200, 0.8, 0, 100),
            NoteEvent::with_duration(60, f32::NAN, 0, 100),
        ];
        let err = render(&events, Patch::Synth, &RenderOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NoRenderableNotes));
    }

    #[test]
    fn test_two_note_take_length_and_overlap() {
        let audio = render(&scenario_c(), Patch::Piano, &RenderOptions::default()).unwrap();

        // (0.75 s + 3 s tail) at 44.1 kHz
        assert_eq!(audio.frames(), 165_375);
        assert_eq!(audio.channel_count(), 2);
        assert_eq!(audio.sample_rate(), 44_100);
        assert!((audio.duration_seconds() - 3.75).abs() < 1e-9);

        let overlap = 11_025..22_050;
        let left = &audio.channel(0).unwrap()[overlap.clone()];
        let right = &audio.channel(1).unwrap()[overlap];
        assert!(peak(left) > 0.01);
        assert!(peak(right) > 0.01);
        assert!(audio.interleaved().iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_bad_note_is_skipped_not_fatal() {
        let mut events = scenario_c();
        events.push(NoteEvent::with_duration(250, 0.5, 100, 100));
        let audio = render(&events, Patch::Piano, &RenderOptions::default()).unwrap();
        assert_eq!(audio.frames(), 165_375);
    }

    #[test]
    fn test_render_is_deterministic() {
        let options = RenderOptions {
            tail_seconds: 0.1,
            ..RenderOptions::default()
        };
        let a = render(&scenario_c(), Patch::Synth, &options).unwrap();
        let b = render(&scenario_c(), Patch::Synth, &options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsupported_layout_falls_back_to_mono() {
        let options = RenderOptions {
            channels: 4,
            tail_seconds: 0.5,
            ..RenderOptions::default()
        };
        let audio = render(&scenario_c(), Patch::Synth, &options).unwrap();
        assert_eq!(audio.channel_count(), 1);
        assert!(peak(audio.channel(0).unwrap()) > 0.01);
    }

    #[test]
    fn test_fallback_exhausted_reports_both_causes() {
        let options = RenderOptions {
            sample_rate: 0,
            ..RenderOptions::default()
        };
        match render(&scenario_c(), Patch::Piano, &options) {
            Err(Error::RenderFailure(detail)) => assert!(detail.contains("fallback")),
            other => panic!("expected RenderFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let options = RenderOptions::default();
        let err = render_with_cancel(&scenario_c(), Patch::Piano, &options, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_job_can_be_cancelled() {
        // A minute of sustained notes takes far longer than the cancel below
        let events: Vec<NoteEvent> = (0..60)
            .map(|i| NoteEvent::with_duration(48 + (i % 24) as u8, 0.7, i * 1000, 1000))
            .collect();
        let job = RenderJob::spawn(events, Patch::Synth, RenderOptions::default());
        job.cancel();
        assert!(matches!(job.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_job_completes() {
        let options = RenderOptions {
            tail_seconds: 0.0,
            ..RenderOptions::default()
        };
        let job = RenderJob::spawn(scenario_c(), Patch::Piano, options);
        let audio = job.wait().unwrap();
        assert_eq!(audio.frames(), 33_075);
    }

    #[test]
    fn test_batch_keeps_order() {
        let options = RenderOptions {
            tail_seconds: 0.0,
            ..RenderOptions::default()
        };
        let requests = vec![
            RenderRequest {
                events: scenario_c(),
                patch: Patch::Piano,
                options,
            },
            RenderRequest {
                events: Vec::new(),
                patch: Patch::Synth,
                options,
            },
            RenderRequest {
                events: vec![NoteEvent::with_duration(72, 0.5, 0, 1000)],
                patch: Patch::Synth,
                options,
            },
        ];
        let results = render_batch(&requests);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().frames(), 33_075);
        assert!(matches!(results[1], Err(Error::NoRenderableNotes)));
        assert_eq!(results[2].as_ref().unwrap().frames(), 44_100);
    }

    #[test]
    fn test_render_midi_file() {
        let bytes = encode(&scenario_c(), &SmfOptions::default()).unwrap();
        let audio = render_midi(&bytes, Patch::Piano, &RenderOptions::default()).unwrap();
        // Tick rounding moves the last release by at most a millisecond
        let expected = 165_375i64;
        assert!((audio.frames() as i64 - expected).abs() <= 45);
    }

    #[test]
    fn test_interleaving() {
        let audio = RenderedAudio::new(8_000, vec![vec![0.1, 0.2], vec![-0.1, -0.2]]).unwrap();
        assert_eq!(audio.interleaved(), vec![0.1, -0.1, 0.2, -0.2]);
        assert!(RenderedAudio::new(8_000, vec![vec![0.0], vec![]]).is_err());
    }
}
