//! 16-bit PCM WAV encoding.

use super::render::RenderedAudio;
use crate::error::{Error, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Size of the canonical PCM header (RIFF, fmt and data chunk headers).
pub const WAV_HEADER_LEN: usize = 44;

/// Converts a float sample to 16-bit PCM.
///
/// Clamps to -1.0..=1.0, then scales negatives by 0x8000 and everything
/// else by 0x7FFF, truncating toward zero.
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encodes rendered audio as a canonical 16-bit PCM WAV file.
///
/// Channels are interleaved frame by frame. The output is always
/// `44 + frames * channels * 2` bytes.
///
/// # Errors
///
/// Returns [`Error::EncodeFailure`] for layouts the canonical header cannot
/// describe (more than two channels, or a zero sample rate).
pub fn encode(audio: &RenderedAudio) -> Result<Vec<u8>> {
    let channels = audio.channel_count();
    if !(1..=2).contains(&channels) {
        return Err(Error::EncodeFailure(format!(
            "{channels} channels cannot be written with a canonical PCM header"
        )));
    }
    if audio.sample_rate() == 0 {
        return Err(Error::EncodeFailure("sample rate of 0 Hz".to_string()));
    }

    let spec = WavSpec {
        channels,
        sample_rate: audio.sample_rate(),
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let data_len = audio.frames() * channels as usize * 2;
    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + data_len));
    {
        let mut writer = WavWriter::new(&mut cursor, spec).map_err(encode_error)?;
        for sample in audio.interleaved() {
            writer.write_sample(quantize(sample)).map_err(encode_error)?;
        }
        writer.finalize().map_err(encode_error)?;
    }

    Ok(cursor.into_inner())
}

fn encode_error(e: hound::Error) -> Error {
    Error::EncodeFailure(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    fn u16_at(bytes: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(bytes[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn test_one_second_of_mono_silence() {
        let audio = RenderedAudio::silent(44_100, 1, 44_100);
        let bytes = encode(&audio).unwrap();

        assert_eq!(bytes.len(), 44 + 44_100 * 2);
        assert!(bytes[44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_fields() {
        let audio = RenderedAudio::silent(22_050, 2, 1000);
        let bytes = encode(&audio).unwrap();
        let data_size = 1000 * 2 * 2;

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32_at(&bytes, 4), 36 + data_size);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(u32_at(&bytes, 16), 16);
        assert_eq!(u16_at(&bytes, 20), 1); // PCM
        assert_eq!(u16_at(&bytes, 22), 2);
        assert_eq!(u32_at(&bytes, 24), 22_050);
        assert_eq!(u32_at(&bytes, 28), 22_050 * 4);
        assert_eq!(u16_at(&bytes, 32), 4);
        assert_eq!(u16_at(&bytes, 34), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(u32_at(&bytes, 40), data_size);
        assert_eq!(bytes.len(), 44 + data_size as usize);
    }

    #[test]
    fn test_quantization() {
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(-1.0), -32768);
        assert_eq!(quantize(0.5), 16383);
        assert_eq!(quantize(-0.5), -16384);
        assert_eq!(quantize(3.0), 32767);
        assert_eq!(quantize(-3.0), -32768);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_stereo_is_interleaved() {
        let audio = RenderedAudio::new(8_000, vec![vec![1.0, 0.5], vec![-1.0, -0.5]]).unwrap();
        let bytes = encode(&audio).unwrap();

        let mut reader = WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![32767, -32768, 16383, -16384]);
    }

    #[test]
    fn test_encoding_is_reproducible() {
        let wave: Vec<f32> = (0..500).map(|i| (i as f32 * 0.01).sin()).collect();
        let audio = RenderedAudio::new(44_100, vec![wave]).unwrap();
        assert_eq!(encode(&audio).unwrap(), encode(&audio).unwrap());
    }

    #[test]
    fn test_rejects_surround() {
        let audio = RenderedAudio::silent(44_100, 4, 10);
        assert!(matches!(encode(&audio), Err(Error::EncodeFailure(_))));
    }
}
