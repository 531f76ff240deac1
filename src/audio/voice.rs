//! Per-note synthesis state: oscillators, envelopes and amplitude modulation.
//!
//! A voice is owned by exactly one synthesizer and lives until its release
//! stage finishes or the synthesizer kills it.

use super::patch::{EnvelopeParams, PatchParams, Waveform};
use crate::midi::note_to_frequency;
use std::f32::consts::{FRAC_PI_4, TAU};

/// Identifies a voice within one synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// Band-limiting correction for the discontinuities of saw and square waves.
fn poly_blep(t: f32, dt: f32) -> f32 {
    if t < dt {
        let x = t / dt;
        x + x - x * x - 1.0
    } else if t > 1.0 - dt {
        let x = (t - 1.0) / dt;
        x * x + x + x + 1.0
    } else {
        0.0
    }
}

/// A phase-accumulating oscillator.
#[derive(Debug, Clone)]
pub struct Oscillator {
    waveform: Waveform,
    phase: f32,
    increment: f32,
}

impl Oscillator {
    pub fn new(waveform: Waveform, frequency: f32, sample_rate: f32) -> Self {
        Self {
            waveform,
            phase: 0.0,
            // Cap below Nyquist so the blep window stays valid
            increment: (frequency / sample_rate).clamp(0.0, 0.49),
        }
    }

    /// Returns the next sample in -1.0..=1.0.
    pub fn next_sample(&mut self) -> f32 {
        let t = self.phase;
        let dt = self.increment;
        let sample = match self.waveform {
            Waveform::Sine => (TAU * t).sin(),
            Waveform::Triangle => 1.0 - 4.0 * (t - 0.5).abs(),
            Waveform::Sawtooth => 2.0 * t - 1.0 - poly_blep(t, dt),
            Waveform::Square => {
                let naive = if t < 0.5 { 1.0 } else { -1.0 };
                naive + poly_blep(t, dt) - poly_blep((t + 0.5).fract(), dt)
            }
        };

        self.phase += dt;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        sample
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Attack,
    Decay,
    Sustain,
    Release,
    Idle,
}

/// Linear ADSR envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    params: EnvelopeParams,
    sample_rate: f32,
    stage: Stage,
    level: f32,
    release_step: f32,
}

impl Envelope {
    /// Creates an envelope already in its attack stage.
    pub fn triggered(params: EnvelopeParams, sample_rate: f32) -> Self {
        let mut env = Self {
            params,
            sample_rate,
            stage: Stage::Attack,
            level: 0.0,
            release_step: 0.0,
        };
        if params.attack <= 0.0 {
            env.level = 1.0;
            env.stage = Stage::Decay;
        }
        env
    }

    fn step_for(&self, seconds: f32, span: f32) -> f32 {
        span / (seconds * self.sample_rate).max(1.0)
    }

    /// Advances one sample and returns the new level.
    pub fn next_level(&mut self) -> f32 {
        let sustain = self.params.sustain.clamp(0.0, 1.0);
        match self.stage {
            Stage::Attack => {
                self.level += self.step_for(self.params.attack, 1.0);
                if self.level >= 1.0 {
                    self.level = 1.0;
                    self.stage = Stage::Decay;
                }
            }
            Stage::Decay => {
                if self.params.decay <= 0.0 {
                    self.level = sustain;
                    self.stage = Stage::Sustain;
                } else {
                    self.level -= self.step_for(self.params.decay, 1.0 - sustain);
                    if self.level <= sustain {
                        self.level = sustain;
                        self.stage = Stage::Sustain;
                    }
                }
            }
            Stage::Sustain => self.level = sustain,
            Stage::Release => {
                self.level -= self.release_step;
                if self.level <= 0.0 {
                    self.level = 0.0;
                    self.stage = Stage::Idle;
                }
            }
            Stage::Idle => self.level = 0.0,
        }
        self.level
    }

    /// Starts the release stage from the current level.
    pub fn release(&mut self) {
        if self.stage == Stage::Idle || self.stage == Stage::Release {
            return;
        }
        if self.params.release <= 0.0 || self.level <= 0.0 {
            self.kill();
        } else {
            self.release_step = self.step_for(self.params.release, self.level);
            self.stage = Stage::Release;
        }
    }

    /// Silences the envelope immediately.
    pub fn kill(&mut self) {
        self.level = 0.0;
        self.stage = Stage::Idle;
    }

    pub fn is_releasing(&self) -> bool {
        self.stage == Stage::Release
    }

    pub fn is_idle(&self) -> bool {
        self.stage == Stage::Idle
    }
}

/// One oscillator layer with its precomputed stereo gains.
#[derive(Debug, Clone)]
struct Layer {
    osc: Oscillator,
    gain_left: f32,
    gain_right: f32,
}

/// Amplitude modulator state.
#[derive(Debug, Clone)]
struct Modulator {
    osc: Oscillator,
    depth: f32,
    envelope: Envelope,
}

/// Constant-power pan law; `pan` in -1.0..=1.0.
fn pan_gains(pan: f32) -> (f32, f32) {
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * FRAC_PI_4;
    (angle.cos(), angle.sin())
}

/// One sounding note.
#[derive(Debug, Clone)]
pub struct Voice {
    id: VoiceId,
    note: u8,
    layers: Vec<Layer>,
    envelope: Envelope,
    modulator: Option<Modulator>,
    amplitude: f32,
}

impl Voice {
    /// Starts a voice for `note` at `velocity` (0.0-1.0).
    pub fn start(
        id: VoiceId,
        note: u8,
        velocity: f32,
        params: &PatchParams,
        sample_rate: f32,
    ) -> Self {
        let frequency = note_to_frequency(note);
        let note_pan = params.pitch_pan * (note as f32 - 64.0) / 64.0;

        let layers = params
            .layers
            .iter()
            .map(|layer| {
                let detuned = frequency * 2f32.powf(layer.detune_cents / 1200.0);
                let (gain_left, gain_right) = pan_gains(layer.pan + note_pan);
                Layer {
                    osc: Oscillator::new(layer.waveform, detuned, sample_rate),
                    gain_left: gain_left * layer.gain,
                    gain_right: gain_right * layer.gain,
                }
            })
            .collect();

        let modulator = params.modulation.map(|m| Modulator {
            osc: Oscillator::new(Waveform::Sine, frequency * m.ratio, sample_rate),
            depth: m.depth.clamp(0.0, 1.0),
            envelope: Envelope::triggered(m.envelope, sample_rate),
        });

        Self {
            id,
            note,
            layers,
            envelope: Envelope::triggered(params.envelope, sample_rate),
            modulator,
            amplitude: velocity.clamp(0.0, 1.0) * params.gain,
        }
    }

    pub fn id(&self) -> VoiceId {
        self.id
    }

    pub fn note(&self) -> u8 {
        self.note
    }

    /// True while the note is held (not yet released or killed).
    pub fn is_held(&self) -> bool {
        !self.envelope.is_releasing() && !self.envelope.is_idle()
    }

    /// True once the release has finished.
    pub fn is_finished(&self) -> bool {
        self.envelope.is_idle()
    }

    pub fn release(&mut self) {
        self.envelope.release();
        if let Some(modulator) = self.modulator.as_mut() {
            modulator.envelope.release();
        }
    }

    pub fn kill(&mut self) {
        self.envelope.kill();
    }

    /// Renders one stereo frame.
    pub fn next_frame(&mut self) -> (f32, f32) {
        let mut amp = self.envelope.next_level() * self.amplitude;

        if let Some(modulator) = self.modulator.as_mut() {
            let depth = modulator.depth * modulator.envelope.next_level();
            let wave = 0.5 - 0.5 * modulator.osc.next_sample();
            amp *= 1.0 - depth * wave;
        }

        let mut left = 0.0;
        let mut right = 0.0;
        for layer in &mut self.layers {
            let s = layer.osc.next_sample();
            left += s * layer.gain_left;
            right += s * layer.gain_right;
        }
        (left * amp, right * amp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Patch;

    const SR: f32 = 44_100.0;

    #[test]
    fn test_oscillators_stay_in_range() {
        for waveform in [Waveform::Sine, Waveform::Triangle, Waveform::Sawtooth, Waveform::Square] {
            let mut osc = Oscillator::new(waveform, 440.0, SR);
            for _ in 0..10_000 {
                let s = osc.next_sample();
                assert!((-1.5..=1.5).contains(&s), "{waveform:?} produced {s}");
            }
        }
    }

    #[test]
    fn test_envelope_stages() {
        let params = EnvelopeParams {
            attack: 0.01,
            decay: 0.01,
            sustain: 0.5,
            release: 0.01,
        };
        let mut env = Envelope::triggered(params, 1000.0);

        // 10 samples of attack reach full level
        let mut level = 0.0;
        for _ in 0..10 {
            level = env.next_level();
        }
        assert!((level - 1.0).abs() < 1e-4);

        // Decay settles on sustain
        for _ in 0..20 {
            level = env.next_level();
        }
        assert!((level - 0.5).abs() < 1e-4);

        env.release();
        assert!(env.is_releasing());
        for _ in 0..20 {
            env.next_level();
        }
        assert!(env.is_idle());
    }

    #[test]
    fn test_kill_is_immediate() {
        let mut voice = Voice::start(VoiceId(1), 60, 1.0, &Patch::Piano.params(), SR);
        for _ in 0..500 {
            voice.next_frame();
        }
        voice.kill();
        assert!(voice.is_finished());
        assert_eq!(voice.next_frame(), (0.0, 0.0));
    }

    #[test]
    fn test_voice_sounds_then_releases() {
        let params = Patch::Synth.params();
        let mut voice = Voice::start(VoiceId(7), 64, 0.8, &params, SR);
        let peak = (0..4410)
            .map(|_| voice.next_frame())
            .fold(0.0f32, |acc, (l, r)| acc.max(l.abs()).max(r.abs()));
        assert!(peak > 0.01);
        assert!(voice.is_held());

        voice.release();
        assert!(!voice.is_held());
        let release_frames = (params.release_seconds() * SR) as usize + 10;
        for _ in 0..release_frames {
            voice.next_frame();
        }
        assert!(voice.is_finished());
    }

    #[test]
    fn test_pan_law() {
        let (l, r) = pan_gains(0.0);
        assert!((l - r).abs() < 1e-6);
        let (l, r) = pan_gains(-1.0);
        assert!(l > 0.99 && r < 1e-6);
    }
}
