//! Audio Source - Dekodiert ein Audio-Asset in normalisierte Float-Samples
//!
//! Verwendet hound für RIFF/WAVE. Rohes 16-bit PCM ohne Header wird
//! ebenfalls unterstützt, dann müssen Rate und Kanalzahl bekannt sein.

use hound::{SampleFormat, WavReader};
use std::io::Read;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Failed to read audio asset: {0}")]
    Io(String),

    #[error("Invalid or unsupported WAV file: {0}")]
    InvalidWav(String),

    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("Malformed PCM data: {0}")]
    MalformedPcm(String),
}

impl From<hound::Error> for AudioError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => AudioError::Io(io.to_string()),
            hound::Error::Unsupported => {
                AudioError::UnsupportedFormat("unsupported WAV encoding".to_string())
            }
            other => AudioError::InvalidWav(other.to_string()),
        }
    }
}

// ============================================================================
// DECODED AUDIO
// ============================================================================

/// Dekodierte Audiodaten: eine Sample-Folge pro Kanal, Werte in [-1.0, 1.0].
///
/// Nach dem Dekodieren unveränderlich; kann per `Arc` zwischen Sessions
/// geteilt werden.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Erstellt DecodedAudio aus Kanaldaten; alle Kanäle müssen gleich lang sein
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self, AudioError> {
        if sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat(
                "sample rate must be positive".to_string(),
            ));
        }
        if channels.is_empty() {
            return Err(AudioError::UnsupportedFormat(
                "audio has no channels".to_string(),
            ));
        }
        let len = channels[0].len();
        if channels.iter().any(|c| c.len() != len) {
            return Err(AudioError::MalformedPcm(
                "channels differ in length".to_string(),
            ));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Anzahl Samples pro Kanal
    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel_data(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Pull-Interface: liefert pro Aufruf höchstens `max_samples` Samples je Kanal
    pub fn reader(&self, max_samples: usize) -> ChunkReader<'_> {
        ChunkReader {
            audio: self,
            position: 0,
            chunk: max_samples.max(1),
        }
    }
}

/// Liest DecodedAudio abschnittsweise
pub struct ChunkReader<'a> {
    audio: &'a DecodedAudio,
    position: usize,
    chunk: usize,
}

impl<'a> Iterator for ChunkReader<'a> {
    type Item = Vec<&'a [f32]>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.audio.len();
        if self.position >= len {
            return None;
        }
        let end = (self.position + self.chunk).min(len);
        let chunk = self
            .audio
            .channels
            .iter()
            .map(|c| &c[self.position..end])
            .collect();
        self.position = end;
        Some(chunk)
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Format eines Audio-Assets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetFormat {
    /// RIFF/WAVE mit Header
    Wav,
    /// Headerloses 16-bit little-endian PCM, Kanäle interleaved
    RawPcm16 { sample_rate: u32, channels: u16 },
}

/// Lädt und dekodiert ein Asset von der Platte
pub fn load_asset(path: &Path, format: AssetFormat) -> Result<DecodedAudio, AudioError> {
    tracing::info!("Decoding audio asset {:?} as {:?}", path, format);
    let file = std::fs::File::open(path).map_err(|e| AudioError::Io(e.to_string()))?;
    let reader = std::io::BufReader::new(file);

    let decoded = match format {
        AssetFormat::Wav => decode_wav(reader)?,
        AssetFormat::RawPcm16 {
            sample_rate,
            channels,
        } => {
            let mut bytes = Vec::new();
            let mut reader = reader;
            reader
                .read_to_end(&mut bytes)
                .map_err(|e| AudioError::Io(e.to_string()))?;
            decode_pcm16_le(&bytes, sample_rate, channels)?
        }
    };

    tracing::info!(
        "Decoded {} samples @ {}Hz, {} channel(s)",
        decoded.len(),
        decoded.sample_rate(),
        decoded.channel_count()
    );
    Ok(decoded)
}

/// Dekodiert RIFF/WAVE (Integer-PCM 8-32 bit oder 32-bit Float)
pub fn decode_wav<R: Read>(reader: R) -> Result<DecodedAudio, AudioError> {
    let mut wav = WavReader::new(reader)?;
    let spec = wav.spec();
    let channel_count = spec.channels as usize;
    if channel_count == 0 {
        return Err(AudioError::InvalidWav("zero channels".to_string()));
    }

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => wav.samples::<f32>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits @ 1..=32) => {
            let scale = (1u64 << (bits - 1)) as f32;
            wav.samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} with {} bits per sample",
                format, bits
            )))
        }
    };

    if interleaved.len() % channel_count != 0 {
        return Err(AudioError::MalformedPcm(
            "truncated sample frame".to_string(),
        ));
    }

    DecodedAudio::new(spec.sample_rate, deinterleave(&interleaved, channel_count))
}

/// Dekodiert headerloses 16-bit little-endian PCM
pub fn decode_pcm16_le(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedAudio, AudioError> {
    let channel_count = channels as usize;
    if channel_count == 0 {
        return Err(AudioError::UnsupportedFormat(
            "channel count must be positive".to_string(),
        ));
    }
    if bytes.len() % (2 * channel_count) != 0 {
        return Err(AudioError::MalformedPcm(format!(
            "{} bytes is not a whole number of {}-channel 16-bit frames",
            bytes.len(),
            channel_count
        )));
    }

    let interleaved: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();

    DecodedAudio::new(sample_rate, deinterleave(&interleaved, channel_count))
}

fn deinterleave(interleaved: &[f32], channel_count: usize) -> Vec<Vec<f32>> {
    let frames = interleaved.len() / channel_count;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (channel, sample) in channels.iter_mut().zip(frame) {
            channel.push(*sample);
        }
    }
    channels
}
