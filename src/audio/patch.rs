//! Instrument patches.
//!
//! A patch only decides timbre: oscillator layers, amplitude envelope,
//! optional amplitude modulation, and the effect chain. Both the live engine
//! and the offline renderer build their graphs from the same definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Selectable instrument timbre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Patch {
    /// Fast attack, long decay, triangle-rich tone with reverb and EQ.
    #[default]
    Piano,
    /// Detuned sawtooth stack with phaser, ping-pong delay and AM.
    Synth,
}

impl Patch {
    pub const ALL: [Patch; 2] = [Patch::Piano, Patch::Synth];

    /// Lowercase name used in settings files and on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            Patch::Piano => "piano",
            Patch::Synth => "synth",
        }
    }

    /// Returns the full parameter set for this patch.
    pub fn params(&self) -> PatchParams {
        match self {
            Patch::Piano => PatchParams {
                layers: vec![
                    OscLayer::new(Waveform::Triangle, 0.0, 0.0, 0.8),
                    // Octave partial brightens the triangle
                    OscLayer::new(Waveform::Sine, 1200.0, 0.0, 0.15),
                    OscLayer::new(Waveform::Sine, 1902.0, 0.0, 0.05),
                ],
                envelope: EnvelopeParams {
                    attack: 0.005,
                    decay: 2.5,
                    sustain: 0.15,
                    release: 2.8,
                },
                modulation: None,
                pitch_pan: 0.35,
                gain: 0.3,
                effects: vec![
                    EffectParams::Eq3 {
                        low_gain_db: 2.0,
                        mid_gain_db: 0.0,
                        high_gain_db: -3.0,
                        low_freq: 250.0,
                        high_freq: 2500.0,
                    },
                    EffectParams::Reverb {
                        room_size: 0.55,
                        damping: 0.4,
                        wet: 0.18,
                    },
                ],
            },
            Patch::Synth => PatchParams {
                layers: vec![
                    OscLayer::new(Waveform::Sawtooth, -12.0, -0.6, 0.34),
                    OscLayer::new(Waveform::Sawtooth, 0.0, 0.0, 0.34),
                    OscLayer::new(Waveform::Sawtooth, 12.0, 0.6, 0.34),
                ],
                envelope: EnvelopeParams {
                    attack: 0.02,
                    decay: 0.3,
                    sustain: 0.6,
                    release: 0.8,
                },
                modulation: Some(ModulationParams {
                    ratio: 0.5,
                    depth: 0.5,
                    envelope: EnvelopeParams {
                        attack: 0.5,
                        decay: 0.0,
                        sustain: 1.0,
                        release: 0.5,
                    },
                }),
                pitch_pan: 0.0,
                gain: 0.22,
                effects: vec![
                    EffectParams::Phaser {
                        rate_hz: 0.5,
                        depth: 0.7,
                        base_freq: 350.0,
                        octaves: 3.0,
                        stages: 4,
                        feedback: 0.3,
                        wet: 0.5,
                    },
                    EffectParams::PingPongDelay {
                        time: 0.25,
                        feedback: 0.35,
                        wet: 0.25,
                    },
                ],
            },
        }
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Patch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piano" => Ok(Patch::Piano),
            "synth" => Ok(Patch::Synth),
            other => Err(format!("unknown patch '{other}' (expected piano or synth)")),
        }
    }
}

/// Basic oscillator shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Sawtooth,
    Square,
}

/// One oscillator in a voice's stack.
#[derive(Debug, Clone, PartialEq)]
pub struct OscLayer {
    pub waveform: Waveform,
    /// Pitch offset from the note, in cents.
    pub detune_cents: f32,
    /// Stereo position, -1.0 (left) to 1.0 (right).
    pub pan: f32,
    pub gain: f32,
}

impl OscLayer {
    pub fn new(waveform: Waveform, detune_cents: f32, pan: f32, gain: f32) -> Self {
        Self {
            waveform,
            detune_cents,
            pan,
            gain,
        }
    }
}

/// ADSR times in seconds; sustain is a level in 0.0-1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

/// Amplitude modulation with its own envelope on the modulation depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulationParams {
    /// Modulator frequency as a multiple of the note frequency.
    pub ratio: f32,
    /// Peak modulation depth, 0.0-1.0.
    pub depth: f32,
    pub envelope: EnvelopeParams,
}

/// Effect definitions, in chain order.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectParams {
    Eq3 {
        low_gain_db: f32,
        mid_gain_db: f32,
        high_gain_db: f32,
        low_freq: f32,
        high_freq: f32,
    },
    Reverb {
        room_size: f32,
        damping: f32,
        wet: f32,
    },
    Phaser {
        rate_hz: f32,
        depth: f32,
        base_freq: f32,
        octaves: f32,
        stages: usize,
        feedback: f32,
        wet: f32,
    },
    PingPongDelay {
        time: f32,
        feedback: f32,
        wet: f32,
    },
}

/// Full timbre definition of a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchParams {
    pub layers: Vec<OscLayer>,
    pub envelope: EnvelopeParams,
    pub modulation: Option<ModulationParams>,
    /// How far low and high notes spread across the stereo field.
    pub pitch_pan: f32,
    /// Per-voice output gain before the master stage.
    pub gain: f32,
    pub effects: Vec<EffectParams>,
}

impl PatchParams {
    /// Longest time a released voice keeps sounding.
    pub fn release_seconds(&self) -> f32 {
        let amp = self.envelope.release;
        let modulation = self.modulation.map(|m| m.envelope.release).unwrap_or(0.0);
        amp.max(modulation)
    }

    /// The bare-bones variant used when the full graph cannot render:
    /// only the first oscillator layer and the envelope, no effects.
    pub fn minimal(&self) -> PatchParams {
        let layer = self
            .layers
            .first()
            .map(|l| OscLayer::new(l.waveform, 0.0, 0.0, 1.0))
            .unwrap_or_else(|| OscLayer::new(Waveform::Sine, 0.0, 0.0, 1.0));
        PatchParams {
            layers: vec![layer],
            envelope: self.envelope,
            modulation: None,
            pitch_pan: 0.0,
            gain: self.gain,
            effects: Vec::new(),
        }
    }
}
