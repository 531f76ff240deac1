//! File storage for encoded takes.
//!
//! Where artifacts end up is somebody else's concern; the pipeline only hands
//! over bytes, a file name, a content type and an addressing key (a folder or
//! project identifier). [`DirStore`] is the filesystem implementation.

use crate::audio::{wav, RenderedAudio};
use crate::error::{Error, Result};
use crate::midi::{encode, SmfOptions, Take};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONTENT_TYPE_MIDI: &str = "audio/midi";
pub const CONTENT_TYPE_WAV: &str = "audio/wav";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Descriptor of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    /// Where the store put it; opaque to callers.
    pub location: String,
}

/// Accepts binary artifacts for safekeeping.
pub trait FileStore {
    fn store(
        &self,
        key: &str,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredFile>;
}

/// Stores files under `<root>/<key>/<filename>`.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Rejects names that would escape the store directory.
fn check_component(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\'])
        || value.contains('\0');
    if bad {
        return Err(Error::Storage(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid {what} '{value}'"),
        )));
    }
    Ok(())
}

impl FileStore for DirStore {
    fn store(
        &self,
        key: &str,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<StoredFile> {
        check_component("key", key)?;
        check_component("file name", filename)?;

        let dir = self.root.join(key);
        fs::create_dir_all(&dir)?;
        let path = dir.join(filename);
        fs::write(&path, bytes)?;

        tracing::info!(path = %path.display(), content_type, size = bytes.len(), "stored file");
        Ok(StoredFile {
            key: key.to_string(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            size: bytes.len(),
            location: path.display().to_string(),
        })
    }
}

/// Encodes a take as a Standard MIDI File and stores it as `<name>.mid`.
pub fn store_take_midi(
    store: &dyn FileStore,
    key: &str,
    take: &Take,
    options: &SmfOptions,
) -> Result<StoredFile> {
    let bytes = encode(&take.sorted_events(), options)?;
    store.store(key, &take.midi_filename(), CONTENT_TYPE_MIDI, &bytes)
}

/// Encodes rendered audio as WAV and stores it as `<name>.wav`.
pub fn store_take_wav(
    store: &dyn FileStore,
    key: &str,
    take: &Take,
    audio: &RenderedAudio,
) -> Result<StoredFile> {
    let bytes = wav::encode(audio)?;
    store.store(key, &take.wav_filename(), CONTENT_TYPE_WAV, &bytes)
}

/// Stores the take itself as JSON so it can be replayed or re-rendered.
pub fn store_take_json(store: &dyn FileStore, key: &str, take: &Take) -> Result<StoredFile> {
    let json = take.to_json()?;
    store.store(key, &take.json_filename(), CONTENT_TYPE_JSON, json.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Patch;
    use crate::midi::{import_events, NoteEvent};
    use tempfile::tempdir;

    fn take() -> Take {
        Take::from_events(
            "Evening Sketch",
            Patch::Synth,
            vec![
                NoteEvent::with_duration(60, 0.8, 0, 500),
                NoteEvent::with_duration(64, 0.6, 250, 500),
            ],
        )
    }

    #[test]
    fn test_dir_store_layout() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let stored = store.store("project-1", "a.bin", "application/octet-stream", b"abc").unwrap();

        assert_eq!(stored.size, 3);
        assert_eq!(fs::read(dir.path().join("project-1").join("a.bin")).unwrap(), b"abc");
    }

    #[test]
    fn test_rejects_path_escapes() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path());
        assert!(store.store("..", "a.mid", CONTENT_TYPE_MIDI, b"").is_err());
        assert!(store.store("ok", "../a.mid", CONTENT_TYPE_MIDI, b"").is_err());
        assert!(store.store("", "a.mid", CONTENT_TYPE_MIDI, b"").is_err());
    }

    #[test]
    fn test_store_take_artifacts() {
        let dir = tempdir().unwrap();
        let store = DirStore::new(dir.path());
        let take = take();

        let midi = store_take_midi(&store, "folder", &take, &SmfOptions::default()).unwrap();
        assert_eq!(midi.filename, "Evening_Sketch.mid");
        assert_eq!(midi.content_type, CONTENT_TYPE_MIDI);
        let bytes = fs::read(dir.path().join("folder").join("Evening_Sketch.mid")).unwrap();
        assert_eq!(import_events(&bytes).unwrap().len(), 2);

        let json = store_take_json(&store, "folder", &take).unwrap();
        let loaded = Take::load_from_file(dir.path().join("folder").join(&json.filename)).unwrap();
        assert_eq!(loaded, take);

        let audio = RenderedAudio::silent(44_100, 1, 100);
        let wav = store_take_wav(&store, "folder", &take, &audio).unwrap();
        assert_eq!(wav.filename, "Evening_Sketch.wav");
        assert_eq!(wav.size, 44 + 200);
    }
}
