//! Polyphonic synthesizer shared by the live engine and the offline renderer.
//!
//! Each engine or render owns its own `Synth`; nothing here is global.

use super::effects::EffectChain;
use super::patch::PatchParams;
use super::voice::{Voice, VoiceId};
use crate::error::{Error, Result};

/// Voices allowed to sound at once before the oldest is stolen.
pub const MAX_VOICES: usize = 32;

/// Output gain applied before the soft clipper.
const MASTER_GAIN: f32 = 0.9;

/// A set of voices summed into a stereo bus, then through the patch effects.
pub struct Synth {
    params: PatchParams,
    sample_rate: u32,
    voices: Vec<Voice>,
    next_id: u64,
    effects: EffectChain,
}

impl Synth {
    /// Builds a synthesizer and its effect chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RenderFailure`] if the effect chain cannot be built
    /// at this sample rate.
    pub fn new(params: PatchParams, sample_rate: u32) -> Result<Self> {
        let effects =
            EffectChain::build(&params.effects, sample_rate).map_err(Error::RenderFailure)?;
        Ok(Self {
            params,
            sample_rate,
            voices: Vec::with_capacity(MAX_VOICES),
            next_id: 0,
            effects,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of voices still producing sound.
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_finished()).count()
    }

    /// Starts a new voice and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPitch`] for notes above 127 and
    /// [`Error::RenderFailure`] for a non-finite velocity.
    pub fn attack(&mut self, note: u8, velocity: f32) -> Result<VoiceId> {
        if note > 127 {
            return Err(Error::InvalidPitch(format!("note number {note} is above 127")));
        }
        if !velocity.is_finite() {
            return Err(Error::RenderFailure(format!(
                "velocity {velocity} for note {note} is not a number"
            )));
        }

        if self.voices.len() >= MAX_VOICES {
            self.steal_voice();
        }

        let id = VoiceId(self.next_id);
        self.next_id += 1;
        self.voices.push(Voice::start(
            id,
            note,
            velocity,
            &self.params,
            self.sample_rate as f32,
        ));
        Ok(id)
    }

    /// Drops the oldest releasing voice, or the oldest voice if none is releasing.
    fn steal_voice(&mut self) {
        let victim = self
            .voices
            .iter()
            .position(|v| !v.is_held())
            .unwrap_or(0);
        let stolen = self.voices.remove(victim);
        tracing::debug!(note = stolen.note(), "voice stolen");
    }

    /// Releases every held voice playing `note`.
    pub fn release(&mut self, note: u8) {
        for voice in self.voices.iter_mut().filter(|v| v.note() == note && v.is_held()) {
            voice.release();
        }
    }

    /// Releases one specific voice.
    pub fn release_voice(&mut self, id: VoiceId) {
        if let Some(voice) = self.voices.iter_mut().find(|v| v.id() == id) {
            voice.release();
        }
    }

    /// Silences everything at once, effect tails included.
    pub fn release_all(&mut self) {
        for voice in &mut self.voices {
            voice.kill();
        }
        self.voices.clear();
        self.effects =
            EffectChain::build(&self.params.effects, self.sample_rate).unwrap_or_default();
    }

    /// Renders one block into the two channel buffers.
    ///
    /// The buffers are overwritten; if their lengths differ the shorter wins.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let mut sum_l = 0.0;
            let mut sum_r = 0.0;
            for voice in &mut self.voices {
                let (vl, vr) = voice.next_frame();
                sum_l += vl;
                sum_r += vr;
            }

            let (el, er) = self.effects.process(sum_l, sum_r);
            *l = soft_clip(el * MASTER_GAIN);
            *r = soft_clip(er * MASTER_GAIN);
        }

        self.voices.retain(|v| !v.is_finished());
    }
}

/// Smooth saturation that never leaves -1.0..=1.0.
fn soft_clip(x: f32) -> f32 {
    x.tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Patch;

    const SR: u32 = 44_100;

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    #[test]
    fn test_silent_when_idle() {
        let mut synth = Synth::new(Patch::Piano.params(), SR).unwrap();
        let mut left = vec![1.0; 256];
        let mut right = vec![1.0; 256];
        synth.render(&mut left, &mut right);
        assert_eq!(peak(&left), 0.0);
        assert_eq!(peak(&right), 0.0);
    }

    #[test]
    fn test_chord_does_not_clip() {
        for patch in Patch::ALL {
            let mut synth = Synth::new(patch.params(), SR).unwrap();
            for note in [48, 52, 55, 60, 64, 67, 72, 76] {
                synth.attack(note, 1.0).unwrap();
            }
            assert_eq!(synth.active_voices(), 8);

            let mut left = vec![0.0; 4096];
            let mut right = vec![0.0; 4096];
            synth.render(&mut left, &mut right);
            assert!(peak(&left) > 0.05, "{patch} chord is silent");
            assert!(peak(&left) < 1.0 && peak(&right) < 1.0);
        }
    }

    #[test]
    fn test_release_by_note() {
        let mut synth = Synth::new(Patch::Synth.params(), SR).unwrap();
        synth.attack(60, 0.8).unwrap();
        synth.attack(64, 0.8).unwrap();
        synth.release(60);

        let frames = ((Patch::Synth.params().release_seconds() + 0.1) * SR as f32) as usize;
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        synth.render(&mut left, &mut right);
        assert_eq!(synth.active_voices(), 1);
    }

    #[test]
    fn test_release_voice_leaves_same_pitch_alone() {
        let mut synth = Synth::new(Patch::Synth.params().minimal(), SR).unwrap();
        let first = synth.attack(60, 0.8).unwrap();
        synth.attack(60, 0.8).unwrap();
        synth.release_voice(first);

        let mut left = vec![0.0; SR as usize * 2];
        let mut right = vec![0.0; SR as usize * 2];
        synth.render(&mut left, &mut right);
        assert_eq!(synth.active_voices(), 1);
    }

    #[test]
    fn test_release_all_is_immediate() {
        let mut synth = Synth::new(Patch::Piano.params(), SR).unwrap();
        synth.attack(60, 1.0).unwrap();
        let mut left = vec![0.0; 1024];
        let mut right = vec![0.0; 1024];
        synth.render(&mut left, &mut right);
        assert!(peak(&left) > 0.0);

        synth.release_all();
        assert_eq!(synth.active_voices(), 0);
        synth.render(&mut left, &mut right);
        assert_eq!(peak(&left), 0.0);
        assert_eq!(peak(&right), 0.0);
    }

    #[test]
    fn test_voice_stealing_caps_polyphony() {
        let mut synth = Synth::new(Patch::Piano.params(), SR).unwrap();
        for i in 0..(MAX_VOICES + 8) {
            synth.attack(20 + i as u8, 0.5).unwrap();
        }
        assert_eq!(synth.active_voices(), MAX_VOICES);
    }

    #[test]
    fn test_attack_rejects_bad_input() {
        let mut synth = Synth::new(Patch::Piano.params(), SR).unwrap();
        assert!(matches!(synth.attack(128, 0.5), Err(Error::InvalidPitch(_))));
        assert!(matches!(synth.attack(60, f32::NAN), Err(Error::RenderFailure(_))));
        assert_eq!(synth.active_voices(), 0);
    }

    #[test]
    fn test_unsupported_rate_fails_to_build() {
        assert!(matches!(
            Synth::new(Patch::Piano.params(), 1_000),
            Err(Error::RenderFailure(_))
        ));
        // Without effects there is nothing rate-dependent to reject
        assert!(Synth::new(Patch::Piano.params().minimal(), 1_000).is_ok());
    }
}
