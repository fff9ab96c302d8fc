//! Resampling & Mixdown
//!
//! Wandelt DecodedAudio beliebiger Rate und Kanalzahl in Mono-PCM mit der
//! Ziel-Rate des Transports um. Rein und zustandslos: gleiche Eingabe,
//! gleiche Ausgabe, keine Abhängigkeit von der Uhr.

use super::audio::DecodedAudio;
use crate::config::StreamConfig;

/// Mittelt alle Kanäle pro Sample zu Mono. Ein einzelner Kanal bleibt unverändert.
pub fn mixdown(channels: &[Vec<f32>]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        _ => {
            let len = channels.iter().map(Vec::len).min().unwrap_or(0);
            let count = channels.len() as f32;
            (0..len)
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() / count)
                .collect()
        }
    }
}

/// Nearest-lower Resampling: `out[i] = in[floor(i * source / target)]`.
///
/// Ausgabelänge ist `floor(len * target / source)`. Kein Bandlimit.
pub fn resample(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }
    if source_rate == target_rate {
        return input.to_vec();
    }

    let source = source_rate as u64;
    let target = target_rate as u64;
    let out_len = (input.len() as u64 * target / source) as usize;

    (0..out_len as u64)
        .map(|i| input[(i * source / target) as usize])
        .collect()
}

/// Amplituden-Formung eines Samples.
///
/// Reihenfolge: vorzeichenerhaltende Kompression `sign(x) * |x|^exponent`,
/// dann Gain, dann hartes Clipping auf den i16-Bereich.
pub fn shape_sample(sample: f32, exponent: f32, gain: f32) -> i16 {
    if !sample.is_finite() {
        return 0;
    }
    let compressed = sample.signum() * sample.abs().powf(exponent);
    let amplified = compressed * gain;
    let scaled = (amplified * i16::MAX as f32).floor();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Komplette Pipeline: Mixdown, Resampling, Formung.
///
/// Wird einmal pro Asset vor dem Streaming ausgeführt, damit ein Tick nur
/// noch Samples kopiert.
pub fn prepare_stream(audio: &DecodedAudio, config: &StreamConfig) -> Vec<i16> {
    let mono = mixdown(audio.channel_data());
    let resampled = resample(&mono, audio.sample_rate(), config.target_sample_rate);

    tracing::debug!(
        "Prepared {} -> {} samples ({}Hz -> {}Hz, {} channel(s))",
        mono.len(),
        resampled.len(),
        audio.sample_rate(),
        config.target_sample_rate,
        audio.channel_count()
    );

    resampled
        .iter()
        .map(|s| shape_sample(*s, config.compression_exponent, config.gain))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsample_doubles_length_with_lower_index() {
        let input: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let output = resample(&input, 8_000, 16_000);

        assert_eq!(output.len(), 200);
        for (i, sample) in output.iter().enumerate() {
            assert_eq!(*sample, input[i * 8_000 / 16_000]);
        }
    }

    #[test]
    fn test_downsample_length_is_floored() {
        let input = vec![0.0f32; 441];
        assert_eq!(resample(&input, 44_100, 48_000).len(), 480);
        assert_eq!(resample(&[0.1, 0.2, 0.3], 48_000, 16_000).len(), 1);
    }

    #[test]
    fn test_resample_is_deterministic() {
        let input: Vec<f32> = (0..1000).map(|i| ((i * 37) % 101) as f32 / 101.0).collect();
        assert_eq!(
            resample(&input, 44_100, 48_000),
            resample(&input, 44_100, 48_000)
        );
    }

    #[test]
    fn test_stereo_mixdown_cancels() {
        let left = vec![1.0, -1.0];
        let right = vec![-1.0, 1.0];
        let mono = mixdown(&[left, right]);
        assert_eq!(mono, vec![0.0, 0.0]);
    }

    #[test]
    fn test_mono_passes_through() {
        let mono = vec![0.3, -0.7, 0.1];
        assert_eq!(mixdown(&[mono.clone()]), mono);
    }

    #[test]
    fn test_full_scale_with_gain_saturates() {
        assert_eq!(shape_sample(1.0, 0.8, 2.0), i16::MAX);
        assert_eq!(shape_sample(-1.0, 0.8, 2.0), i16::MIN);
    }

    #[test]
    fn test_compression_preserves_sign() {
        let quiet = shape_sample(0.25, 0.8, 1.0);
        let expected = (0.25f32.powf(0.8) * i16::MAX as f32).floor() as i16;
        assert_eq!(quiet, expected);
        assert!(quiet > (0.25 * i16::MAX as f32) as i16);
        assert!(shape_sample(-0.25, 0.8, 1.0) < 0);
        assert_eq!(shape_sample(0.0, 0.8, 2.0), 0);
        assert_eq!(shape_sample(f32::NAN, 0.8, 2.0), 0);
    }

    #[test]
    fn test_prepare_stream_runs_whole_pipeline() {
        let audio = DecodedAudio::new(24_000, vec![vec![1.0, 0.0], vec![1.0, 0.0]]).unwrap();
        let config = StreamConfig::default();
        let samples = prepare_stream(&audio, &config);
        assert_eq!(samples, vec![i16::MAX, i16::MAX, 0, 0]);
    }
}
