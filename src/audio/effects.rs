//! Stereo effects used by the patch effect chains.
//!
//! Each effect processes one stereo frame at a time. Chains are built fresh
//! for every engine or render so no effect state is ever shared.

use super::patch::EffectParams;
use std::f32::consts::{PI, TAU};

/// Sample-rate range the effect delay lines and filters are tuned for.
pub const SUPPORTED_SAMPLE_RATES: std::ops::RangeInclusive<u32> = 8_000..=192_000;

/// A stereo frame processor.
pub trait Effect: Send {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32);
}

fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// One-pole low-pass used for band splitting.
#[derive(Debug, Clone, Default)]
struct OnePole {
    coeff: f32,
    state: f32,
}

impl OnePole {
    fn new(cutoff: f32, sample_rate: f32) -> Self {
        Self {
            coeff: (-TAU * cutoff / sample_rate).exp(),
            state: 0.0,
        }
    }

    fn process(&mut self, x: f32) -> f32 {
        self.state = (1.0 - self.coeff) * x + self.coeff * self.state;
        self.state
    }
}

/// Three-band equalizer split at two crossover frequencies.
pub struct Eq3 {
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
    /// [left, right] low-band splitters
    low: [OnePole; 2],
    /// [left, right] high-band splitters
    high: [OnePole; 2],
}

impl Eq3 {
    pub fn new(
        low_gain_db: f32,
        mid_gain_db: f32,
        high_gain_db: f32,
        low_freq: f32,
        high_freq: f32,
        sample_rate: f32,
    ) -> Self {
        Self {
            low_gain: db_to_gain(low_gain_db),
            mid_gain: db_to_gain(mid_gain_db),
            high_gain: db_to_gain(high_gain_db),
            low: [OnePole::new(low_freq, sample_rate), OnePole::new(low_freq, sample_rate)],
            high: [OnePole::new(high_freq, sample_rate), OnePole::new(high_freq, sample_rate)],
        }
    }

    fn band(&mut self, channel: usize, x: f32) -> f32 {
        let low = self.low[channel].process(x);
        let high = x - self.high[channel].process(x);
        let mid = x - low - high;
        low * self.low_gain + mid * self.mid_gain + high * self.high_gain
    }
}

impl Effect for Eq3 {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        (self.band(0, left), self.band(1, right))
    }
}

/// Feedback comb filter with damping in the loop.
struct Comb {
    buffer: Vec<f32>,
    index: usize,
    feedback: f32,
    damp: f32,
    store: f32,
}

impl Comb {
    fn new(len: usize, feedback: f32, damp: f32) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
            feedback,
            damp,
            store: 0.0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.index];
        self.store = output * (1.0 - self.damp) + self.store * self.damp;
        self.buffer[self.index] = input + self.store * self.feedback;
        self.index = (self.index + 1) % self.buffer.len();
        output
    }
}

/// Schroeder all-pass diffuser.
struct AllPass {
    buffer: Vec<f32>,
    index: usize,
}

impl AllPass {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
        }
    }

    fn process(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.index];
        self.buffer[self.index] = input + buffered * 0.5;
        self.index = (self.index + 1) % self.buffer.len();
        buffered - input
    }
}

/// Comb and all-pass tunings at 44.1 kHz.
const COMB_TUNING: [usize; 4] = [1116, 1188, 1277, 1356];
const ALLPASS_TUNING: [usize; 2] = [556, 441];
const STEREO_SPREAD: usize = 23;

/// Small Freeverb-style room.
pub struct Reverb {
    combs: [Vec<Comb>; 2],
    allpasses: [Vec<AllPass>; 2],
    wet: f32,
}

impl Reverb {
    pub fn new(room_size: f32, damping: f32, wet: f32, sample_rate: f32) -> Self {
        let scale = sample_rate / 44_100.0;
        let feedback = room_size.clamp(0.0, 1.0) * 0.28 + 0.7;
        let damp = damping.clamp(0.0, 1.0) * 0.4;
        let scaled = |len: usize| ((len as f32) * scale).round() as usize;

        let build = |spread: usize| {
            let combs = COMB_TUNING
                .iter()
                .map(|&len| Comb::new(scaled(len + spread), feedback, damp))
                .collect();
            let allpasses = ALLPASS_TUNING
                .iter()
                .map(|&len| AllPass::new(scaled(len + spread)))
                .collect();
            (combs, allpasses)
        };
        let (combs_l, allpasses_l) = build(0);
        let (combs_r, allpasses_r) = build(STEREO_SPREAD);

        Self {
            combs: [combs_l, combs_r],
            allpasses: [allpasses_l, allpasses_r],
            wet: wet.clamp(0.0, 1.0),
        }
    }

    fn channel(&mut self, channel: usize, input: f32) -> f32 {
        let mut out: f32 = self.combs[channel].iter_mut().map(|c| c.process(input)).sum();
        for allpass in &mut self.allpasses[channel] {
            out = allpass.process(out);
        }
        out
    }
}

impl Effect for Reverb {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let input = (left + right) * 0.015;
        let wet_l = self.channel(0, input);
        let wet_r = self.channel(1, input);
        (
            left * (1.0 - self.wet) + wet_l * self.wet * 2.0,
            right * (1.0 - self.wet) + wet_r * self.wet * 2.0,
        )
    }
}

/// First-order all-pass stage with a modulated coefficient.
#[derive(Debug, Clone, Default)]
struct PhaseStage {
    x1: f32,
    y1: f32,
}

impl PhaseStage {
    fn process(&mut self, x: f32, coeff: f32) -> f32 {
        let y = coeff * x + self.x1 - coeff * self.y1;
        self.x1 = x;
        self.y1 = y;
        y
    }
}

/// LFO-swept all-pass phaser; the right channel's LFO runs a quarter turn ahead.
pub struct Phaser {
    sample_rate: f32,
    lfo_phase: f32,
    lfo_increment: f32,
    depth: f32,
    base_freq: f32,
    octaves: f32,
    feedback: f32,
    wet: f32,
    stages: [Vec<PhaseStage>; 2],
    last: [f32; 2],
}

impl Phaser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate_hz: f32,
        depth: f32,
        base_freq: f32,
        octaves: f32,
        stages: usize,
        feedback: f32,
        wet: f32,
        sample_rate: f32,
    ) -> Self {
        let stages = stages.max(1);
        Self {
            sample_rate,
            lfo_phase: 0.0,
            lfo_increment: rate_hz / sample_rate,
            depth: depth.clamp(0.0, 1.0),
            base_freq,
            octaves,
            feedback: feedback.clamp(0.0, 0.95),
            wet: wet.clamp(0.0, 1.0),
            stages: [vec![PhaseStage::default(); stages], vec![PhaseStage::default(); stages]],
            last: [0.0; 2],
        }
    }

    fn coefficient(&self, lfo: f32) -> f32 {
        let sweep = 0.5 + 0.5 * lfo;
        let freq = self.base_freq * 2f32.powf(self.octaves * self.depth * sweep);
        // Keep the sweep below Nyquist
        let freq = freq.min(self.sample_rate * 0.45);
        let t = (PI * freq / self.sample_rate).tan();
        (1.0 - t) / (1.0 + t)
    }

    fn channel(&mut self, channel: usize, x: f32, coeff: f32) -> f32 {
        let mut y = x + self.last[channel] * self.feedback;
        for stage in &mut self.stages[channel] {
            y = stage.process(y, coeff);
        }
        self.last[channel] = y;
        x * (1.0 - self.wet) + y * self.wet
    }
}

impl Effect for Phaser {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let coeff_l = self.coefficient((TAU * self.lfo_phase).sin());
        let coeff_r = self.coefficient((TAU * (self.lfo_phase + 0.25)).sin());
        self.lfo_phase = (self.lfo_phase + self.lfo_increment).fract();
        (self.channel(0, left, coeff_l), self.channel(1, right, coeff_r))
    }
}

/// Delay whose repeats alternate between the left and right channels.
pub struct PingPongDelay {
    left: Vec<f32>,
    right: Vec<f32>,
    index: usize,
    feedback: f32,
    wet: f32,
}

impl PingPongDelay {
    pub fn new(time: f32, feedback: f32, wet: f32, sample_rate: f32) -> Self {
        let len = ((time * sample_rate).round() as usize).max(1);
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            index: 0,
            feedback: feedback.clamp(0.0, 0.95),
            wet: wet.clamp(0.0, 1.0),
        }
    }
}

impl Effect for PingPongDelay {
    fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        let delayed_l = self.left[self.index];
        let delayed_r = self.right[self.index];

        // Input enters on the left; each repeat crosses to the other side
        self.left[self.index] = (left + right) * 0.5 + delayed_r * self.feedback;
        self.right[self.index] = delayed_l * self.feedback;
        self.index = (self.index + 1) % self.left.len();

        (
            left * (1.0 - self.wet) + delayed_l * self.wet,
            right * (1.0 - self.wet) + delayed_r * self.wet,
        )
    }
}

/// An ordered list of effects applied to every frame.
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
}

impl EffectChain {
    /// Builds a fresh chain for the given definitions.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the sample rate is outside
    /// [`SUPPORTED_SAMPLE_RATES`] or a filter frequency is above Nyquist.
    pub fn build(params: &[EffectParams], sample_rate: u32) -> Result<Self, String> {
        if params.is_empty() {
            return Ok(Self::default());
        }
        if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(format!(
                "sample rate {sample_rate} Hz is outside the effect graph's supported range"
            ));
        }

        let sr = sample_rate as f32;
        let nyquist = sr / 2.0;
        let mut effects: Vec<Box<dyn Effect>> = Vec::with_capacity(params.len());

        for p in params {
            let effect: Box<dyn Effect> = match *p {
                EffectParams::Eq3 {
                    low_gain_db,
                    mid_gain_db,
                    high_gain_db,
                    low_freq,
                    high_freq,
                } => {
                    if !(low_freq > 0.0 && low_freq < high_freq && high_freq < nyquist) {
                        return Err(format!(
                            "EQ crossovers {low_freq}/{high_freq} Hz invalid at {sample_rate} Hz"
                        ));
                    }
                    Box::new(Eq3::new(
                        low_gain_db,
                        mid_gain_db,
                        high_gain_db,
                        low_freq,
                        high_freq,
                        sr,
                    ))
                }
                EffectParams::Reverb {
                    room_size,
                    damping,
                    wet,
                } => Box::new(Reverb::new(room_size, damping, wet, sr)),
                EffectParams::Phaser {
                    rate_hz,
                    depth,
                    base_freq,
                    octaves,
                    stages,
                    feedback,
                    wet,
                } => {
                    if base_freq <= 0.0 || base_freq >= nyquist {
                        return Err(format!("phaser base frequency {base_freq} Hz is invalid"));
                    }
                    Box::new(Phaser::new(
                        rate_hz, depth, base_freq, octaves, stages, feedback, wet, sr,
                    ))
                }
                EffectParams::PingPongDelay {
                    time,
                    feedback,
                    wet,
                } => {
                    if !(time > 0.0 && time <= 2.0) {
                        return Err(format!("delay time {time} s is outside 0-2 s"));
                    }
                    Box::new(PingPongDelay::new(time, feedback, wet, sr))
                }
            };
            effects.push(effect);
        }

        Ok(Self { effects })
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Runs one frame through every effect in order.
    pub fn process(&mut self, left: f32, right: f32) -> (f32, f32) {
        self.effects
            .iter_mut()
            .fold((left, right), |(l, r), effect| effect.process(l, r))
    }
}
