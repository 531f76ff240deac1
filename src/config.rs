//! Application settings.
//!
//! Settings live in an optional JSON file. Missing files and missing keys
//! both fall back to the defaults below.

use crate::audio::{Patch, RenderOptions};
use crate::error::Result;
use crate::midi::{SmfOptions, RECORDING_BPM, TAIL_MS, TICKS_PER_QUARTER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// User-tunable settings for capture, encoding and rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tempo used to place recorded milliseconds on the tick grid.
    pub recording_bpm: f64,
    pub ticks_per_quarter: u16,
    pub sample_rate: u32,
    pub channels: u16,
    /// Silence rendered after the last note for release and reverb.
    pub tail_seconds: f64,
    pub patch: Patch,
    /// Directory the file store writes into.
    pub output_dir: PathBuf,
    /// How often capture checks that its input device still exists.
    pub device_poll_ms: u64,
    /// Name of the note track in encoded MIDI files.
    pub track_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recording_bpm: RECORDING_BPM,
            ticks_per_quarter: TICKS_PER_QUARTER,
            sample_rate: 44_100,
            channels: 2,
            tail_seconds: TAIL_MS as f64 / 1000.0,
            patch: Patch::default(),
            output_dir: PathBuf::from("output"),
            device_poll_ms: 500,
            track_name: "Recording".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Writes the settings as pretty JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Options for the Standard MIDI File encoder.
    pub fn smf_options(&self) -> SmfOptions {
        SmfOptions {
            ticks_per_quarter: self.ticks_per_quarter,
            bpm: self.recording_bpm,
            track_name: self.track_name.clone(),
        }
    }

    /// Options for the offline renderer.
    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            sample_rate: self.sample_rate,
            channels: self.channels,
            tail_seconds: self.tail_seconds,
        }
    }
}
