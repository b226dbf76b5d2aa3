//! Minimal RIFF/WAVE codec for mono 16 kHz PCM16 signals.
//!
//! Decoding walks the sub-chunk list generically, so metadata chunks such as
//! `LIST` or `fact` are skipped. Only integer PCM with 16 bits per sample, one
//! channel and a 16 kHz rate is accepted; nothing is resampled or mixed down.
//! Encoding always writes the canonical 44-byte header.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::WavError;
use crate::{Block, BLOCK_SIZE, SAMPLE_RATE};

/// Size of the canonical header, also the smallest file that can decode.
pub const HEADER_LEN: usize = 44;

const RIFF_TAG: &[u8; 4] = b"RIFF";
const WAVE_TAG: &[u8; 4] = b"WAVE";
const FMT_TAG: &[u8; 4] = b"fmt ";
const DATA_TAG: &[u8; 4] = b"data";

const PCM_FORMAT_TAG: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const CHANNELS: u16 = 1;
const BYTES_PER_SAMPLE: usize = 2;
const FMT_CHUNK_LEN: u32 = 16;

/// A mono 16 kHz sequence of signed 16-bit samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmSignal {
    samples: Vec<i16>,
}

impl PcmSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty signal able to hold `blocks` blocks without reallocating.
    pub fn with_block_capacity(blocks: usize) -> Self {
        Self {
            samples: Vec::with_capacity(blocks * BLOCK_SIZE),
        }
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    pub fn channels(&self) -> u16 {
        CHANNELS
    }

    /// Number of whole blocks in the signal.
    pub fn block_count(&self) -> usize {
        self.samples.len() / BLOCK_SIZE
    }

    /// Iterates over the whole blocks in time order. Trailing samples that do
    /// not fill a block are not yielded.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.samples
            .chunks_exact(BLOCK_SIZE)
            .filter_map(|chunk| chunk.first_chunk::<BLOCK_SIZE>())
    }

    pub fn push_block(&mut self, block: &Block) {
        self.samples.extend_from_slice(block);
    }
}

impl From<Vec<i16>> for PcmSignal {
    fn from(samples: Vec<i16>) -> Self {
        Self::from_samples(samples)
    }
}

/// Reads and decodes the WAV file at `path`.
pub fn decode(path: impl AsRef<Path>) -> Result<PcmSignal, WavError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| WavError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let signal = decode_bytes(&bytes)?;
    debug!(path = %path.display(), samples = signal.len(), "decoded wav");
    Ok(signal)
}

/// Decodes an in-memory WAV container.
pub fn decode_bytes(bytes: &[u8]) -> Result<PcmSignal, WavError> {
    if bytes.len() < HEADER_LEN {
        return Err(WavError::TooSmall {
            len: bytes.len(),
            min: HEADER_LEN,
        });
    }
    if &bytes[0..4] != RIFF_TAG {
        return Err(WavError::MissingRiffTag);
    }
    if &bytes[8..12] != WAVE_TAG {
        return Err(WavError::MissingWaveTag);
    }

    let mut format: Option<FormatChunk> = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let tag = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4) as usize;
        let start = pos + 8;

        if tag == FMT_TAG {
            format = Some(FormatChunk::parse(&bytes[start..], size)?);
        } else if tag == DATA_TAG {
            let format = format.ok_or(WavError::MissingFormatChunk)?;
            format.validate()?;

            let available = bytes.len() - start;
            if size > available {
                warn!(
                    declared = size,
                    available, "data chunk runs past end of file, clamping"
                );
            }
            let payload = &bytes[start..start + size.min(available)];
            let samples = payload
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            return Ok(PcmSignal::from_samples(samples));
        }

        pos = start.saturating_add(size);
    }

    Err(WavError::MissingDataChunk)
}

/// Encodes `signal` and writes it to `path`, replacing any existing file.
pub fn encode(path: impl AsRef<Path>, signal: &PcmSignal) -> Result<(), WavError> {
    let path = path.as_ref();
    let bytes = encode_bytes(signal)?;
    fs::write(path, bytes).map_err(|source| WavError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), samples = signal.len(), "wrote wav");
    Ok(())
}

/// Encodes `signal` into a canonical 44-byte-header PCM16 container.
pub fn encode_bytes(signal: &PcmSignal) -> Result<Vec<u8>, WavError> {
    let data_len = signal.len() * BYTES_PER_SAMPLE;
    let data_bytes = u32::try_from(data_len)
        .ok()
        .filter(|bytes| bytes.checked_add(36).is_some())
        .ok_or(WavError::TooLong { bytes: data_len })?;

    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = SAMPLE_RATE * u32::from(block_align);

    let mut out = Vec::with_capacity(HEADER_LEN + data_len);
    out.extend_from_slice(RIFF_TAG);
    out.extend_from_slice(&(36 + data_bytes).to_le_bytes());
    out.extend_from_slice(WAVE_TAG);

    out.extend_from_slice(FMT_TAG);
    out.extend_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
    out.extend_from_slice(&PCM_FORMAT_TAG.to_le_bytes());
    out.extend_from_slice(&CHANNELS.to_le_bytes());
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    out.extend_from_slice(DATA_TAG);
    out.extend_from_slice(&data_bytes.to_le_bytes());
    for sample in signal.samples() {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Ok(out)
}

/// The fields of a `fmt ` chunk the comparator cares about.
#[derive(Debug, Clone, Copy)]
struct FormatChunk {
    format_tag: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

impl FormatChunk {
    fn parse(payload: &[u8], size: usize) -> Result<Self, WavError> {
        if size < FMT_CHUNK_LEN as usize || payload.len() < FMT_CHUNK_LEN as usize {
            return Err(WavError::TruncatedFormatChunk {
                size: size.min(payload.len()),
            });
        }
        let chunk = Self {
            format_tag: read_u16(payload, 0),
            channels: read_u16(payload, 2),
            sample_rate: read_u32(payload, 4),
            bits_per_sample: read_u16(payload, 14),
        };
        if chunk.format_tag != PCM_FORMAT_TAG || chunk.bits_per_sample != BITS_PER_SAMPLE {
            return Err(WavError::UnsupportedFormat {
                format_tag: chunk.format_tag,
                bits_per_sample: chunk.bits_per_sample,
            });
        }
        Ok(chunk)
    }

    fn validate(&self) -> Result<(), WavError> {
        if self.sample_rate != SAMPLE_RATE {
            return Err(WavError::SampleRateMismatch {
                expected: SAMPLE_RATE,
                actual: self.sample_rate,
            });
        }
        if self.channels != CHANNELS {
            return Err(WavError::ChannelCountMismatch {
                expected: CHANNELS,
                actual: self.channels,
            });
        }
        Ok(())
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Builds a container by hand so that individual header fields can be corrupted.
    fn container(format_tag: u16, channels: u16, rate: u32, bits: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_tag.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * u32::from(channels) * u32::from(bits) / 8).to_le_bytes());
        out.extend_from_slice(&(channels * bits / 8).to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn encode_writes_canonical_header() {
        let signal = PcmSignal::from_samples(vec![1, -2, 3]);
        let bytes = encode_bytes(&signal).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 6);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4), 36 + 6);
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(read_u32(&bytes, 16), 16);
        assert_eq!(read_u16(&bytes, 20), 1);
        assert_eq!(read_u16(&bytes, 22), 1);
        assert_eq!(read_u32(&bytes, 24), 16000);
        assert_eq!(read_u32(&bytes, 28), 32000);
        assert_eq!(read_u16(&bytes, 32), 2);
        assert_eq!(read_u16(&bytes, 34), 16);
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(read_u32(&bytes, 40), 6);
        assert_eq!(&bytes[44..], &[1, 0, 0xfe, 0xff, 3, 0]);
    }

    #[test]
    fn round_trip_preserves_samples() {
        let mut rng = StdRng::seed_from_u64(7);
        for len in [0usize, 1, 63, 64, 65, 1000] {
            let samples: Vec<i16> = (0..len).map(|_| rng.gen()).collect();
            let signal = PcmSignal::from_samples(samples);
            let decoded = decode_bytes(&encode_bytes(&signal).unwrap()).unwrap();
            assert_eq!(decoded, signal, "length {len}");
        }
    }

    #[test]
    fn round_trip_keeps_extremes() {
        let signal = PcmSignal::from_samples(vec![i16::MIN, -1, 0, 1, i16::MAX]);
        let decoded = decode_bytes(&encode_bytes(&signal).unwrap()).unwrap();
        assert_eq!(decoded.samples(), &[i16::MIN, -1, 0, 1, i16::MAX]);
    }

    #[test]
    fn rejects_short_file() {
        let err = decode_bytes(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WavError::TooSmall { len: 10, min: 44 }));
        assert!(err.is_format_error());
    }

    #[test]
    fn rejects_missing_riff_and_wave_tags() {
        let mut bytes = container(1, 1, 16000, 16, &pcm_bytes(&[0; 4]));
        bytes[0..4].copy_from_slice(b"RIFX");
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::MissingRiffTag
        ));

        let mut bytes = container(1, 1, 16000, 16, &pcm_bytes(&[0; 4]));
        bytes[8..12].copy_from_slice(b"AVI ");
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::MissingWaveTag
        ));
    }

    #[test]
    fn rejects_wrong_sample_rate() {
        let bytes = container(1, 1, 8000, 16, &pcm_bytes(&[0; 8]));
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::SampleRateMismatch {
                expected: 16000,
                actual: 8000
            }
        ));
    }

    #[test]
    fn rejects_stereo() {
        let bytes = container(1, 2, 16000, 16, &pcm_bytes(&[0; 8]));
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::ChannelCountMismatch {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn rejects_non_pcm16() {
        let bytes = container(1, 1, 16000, 8, &[0u8; 16]);
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::UnsupportedFormat {
                format_tag: 1,
                bits_per_sample: 8
            }
        ));

        let bytes = container(3, 1, 16000, 16, &[0u8; 16]);
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::UnsupportedFormat { format_tag: 3, .. }
        ));
    }

    #[test]
    fn rejects_data_before_fmt() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&32u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::MissingFormatChunk
        ));
    }

    #[test]
    fn rejects_missing_data_chunk() {
        let mut bytes = container(1, 1, 16000, 16, &[]);
        // Rename the data chunk so the walker never finds it.
        bytes[36..40].copy_from_slice(b"junk");
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_bytes(&bytes).unwrap_err(),
            WavError::MissingDataChunk
        ));
    }

    #[test]
    fn skips_unknown_chunks() {
        let samples = [5i16, -5, 500, -500];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&6u32.to_le_bytes());
        bytes.extend_from_slice(b"INFOab");
        // Take fmt and data from a canonical container.
        let canonical = container(1, 1, 16000, 16, &pcm_bytes(&samples));
        bytes.extend_from_slice(&canonical[12..]);

        let signal = decode_bytes(&bytes).unwrap();
        assert_eq!(signal.samples(), &samples);
    }

    #[test]
    fn discards_odd_trailing_byte() {
        let mut data = pcm_bytes(&[10, 20, 30]);
        data.push(0x7f);
        let signal = decode_bytes(&container(1, 1, 16000, 16, &data)).unwrap();
        assert_eq!(signal.samples(), &[10, 20, 30]);
    }

    #[test]
    fn clamps_data_chunk_past_end_of_file() {
        let mut bytes = container(1, 1, 16000, 16, &pcm_bytes(&[1, 2, 3, 4]));
        bytes[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
        let signal = decode_bytes(&bytes).unwrap();
        assert_eq!(signal.samples(), &[1, 2, 3, 4]);
    }

    #[test]
    fn blocks_drop_trailing_samples() {
        let signal = PcmSignal::from_samples((0..150).collect());
        assert_eq!(signal.block_count(), 2);
        let blocks: Vec<&Block> = signal.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][0], 0);
        assert_eq!(blocks[1][0], 64);
        assert_eq!(blocks[1][63], 127);
    }

    #[test]
    fn decode_reports_missing_file() {
        let err = decode("/nonexistent/definitely/missing.wav").unwrap_err();
        assert!(matches!(err, WavError::Io { .. }));
        assert!(!err.is_format_error());
    }
}
