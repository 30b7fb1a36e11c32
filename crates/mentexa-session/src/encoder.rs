//! Chunk encoding: captured samples and frames into transport-safe text payloads.
//!
//! Audio slices become 16-bit mono WAV, then standard base64. Video frames are
//! downsampled to a small fixed size and JPEG-encoded into a `data:` URL. The
//! video path is lossy.

use crate::error::SessionResult;
use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::io::Cursor;

const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Output size and quality of encoded video stills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub width: u32,
    pub height: u32,
    /// JPEG quality factor, 1–100.
    pub quality: u8,
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            quality: 60,
        }
    }
}

/// Encode mono f32 PCM (-1.0..1.0) as a base64 WAV payload.
pub fn encode_audio(samples: &[f32], sample_rate: u32) -> SessionResult<String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut wav = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut wav), spec)?;
        for &s in samples {
            let clamped = s.clamp(-1.0, 1.0);
            writer.write_sample((clamped * i16::MAX as f32).round() as i16)?;
        }
        writer.finalize()?;
    }

    Ok(general_purpose::STANDARD.encode(&wav))
}

/// Downsample `image` to `spec` and encode it as a JPEG data URL.
pub fn encode_frame(image: &DynamicImage, spec: &FrameSpec) -> SessionResult<String> {
    let small = image
        .resize_exact(spec.width, spec.height, FilterType::Triangle)
        .to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, spec.quality).encode_image(&small)?;

    Ok(format!(
        "{}{}",
        JPEG_DATA_URL_PREFIX,
        general_purpose::STANDARD.encode(&jpeg)
    ))
}

/// True when an encoded payload is large enough to be worth sending.
pub fn exceeds_threshold(payload: &str, min_len: usize) -> bool {
    payload.len() > min_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn empty_slice_is_header_only_and_below_default_threshold() {
        let payload = encode_audio(&[], 16000).unwrap();
        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert!(!exceeds_threshold(&payload, 100));
    }

    #[test]
    fn one_second_of_audio_clears_threshold() {
        let samples = vec![0.25f32; 16000];
        let payload = encode_audio(&samples, 16000).unwrap();
        assert!(exceeds_threshold(&payload, 100));

        let bytes = general_purpose::STANDARD.decode(&payload).unwrap();
        let reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 16000);
    }

    #[test]
    fn frames_are_downsampled_jpeg_data_urls() {
        let big = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([200, 30, 30])));
        let url = encode_frame(&big, &FrameSpec::default()).unwrap();
        assert!(url.starts_with(JPEG_DATA_URL_PREFIX));

        let jpeg = general_purpose::STANDARD
            .decode(&url[JPEG_DATA_URL_PREFIX.len()..])
            .unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!exceeds_threshold(&"a".repeat(100), 100));
        assert!(exceeds_threshold(&"a".repeat(101), 100));
    }
}
