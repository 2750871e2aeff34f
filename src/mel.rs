//! Mel spectrogram of the content-source waveform.
//!
//! The conditioning features are a magnitude STFT projected on an HTK mel filterbank and
//! squashed to `[0, 1]`:
//! - Window: periodic Hann of `win_length = 4 * hop`, centered inside the `n_fft` frame
//! - Padding: reflect, `n_fft / 2` on each side (one frame every hop, `1 + len / hop` frames)
//! - Magnitude normalized by the L2 norm of the window
//! - Mel bins: `n_mels`, range 20 Hz to Nyquist, no area normalization
//! - Compression: `clamp((20 * log10(max(mel, 1e-5)) - 20 + 100) / 100, 0, 1)`

use std::sync::Arc;

use ndarray::Array2;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::{config::Params, error::{Error, Result}};

/// Why a spectrogram could not be computed. Never fatal for the pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpectrogramError {
    #[error("input of {len} samples is too short for a reflect padding of {pad}")]
    TooShort { len: usize, pad: usize },

    #[error("input contains non-finite samples")]
    NonFinite,
}

/// Turns a mono waveform into a `[n_mels, frames]` spectrogram.
pub trait SpectrogramExtractor: Send + Sync {
    fn extract(&self, samples: &[f32]) -> std::result::Result<Array2<f32>, SpectrogramError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f64,
    pub f_max: f64,
}

impl MelConfig {
    pub fn from_params(params: &Params) -> Self {
        Self {
            sample_rate: params.sample_rate,
            n_fft: params.n_fft,
            win_length: params.win_length(),
            hop_length: params.hop_samples,
            n_mels: params.n_mels,
            f_min: 20.0,
            f_max: params.sample_rate as f64 / 2.0,
        }
    }
}

/// Mel spectrogram processor.
///
/// Pre-computes the padded window, FFT plan, and mel filterbank on construction, so a single
/// instance is shared by every loader worker.
pub struct MelSpectrogram {
    config: MelConfig,
    window: Vec<f32>,
    window_norm: f32,
    filterbank: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        if config.hop_length == 0 || config.win_length == 0 || config.n_fft == 0 || config.n_mels == 0 {
            return Err(Error::Config(format!("degenerate mel configuration: {config:?}")));
        }
        if config.win_length > config.n_fft {
            return Err(Error::Config(format!(
                "window length {} exceeds FFT size {}",
                config.win_length, config.n_fft
            )));
        }

        let window = padded_hann_window(config.win_length, config.n_fft);
        let window_norm = window.iter().map(|w| w * w).sum::<f32>().sqrt();
        let filterbank = mel_filterbank(&config);
        let fft = FftPlanner::new().plan_fft_forward(config.n_fft);

        Ok(Self { config, window, window_norm, filterbank, fft })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `len` input samples.
    pub fn num_frames(&self, len: usize) -> usize {
        1 + len / self.config.hop_length
    }

    /// One-sided magnitude spectra, one row per frame.
    fn stft(&self, padded: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let num_bins = n_fft / 2 + 1;
        let num_frames = (padded.len() - n_fft) / hop + 1;

        let mut magnitudes = Array2::zeros((num_frames, num_bins));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        for (frame_idx, mut row) in magnitudes.rows_mut().into_iter().enumerate() {
            let start = frame_idx * hop;
            for (slot, (&x, &w)) in buffer.iter_mut().zip(padded[start..start + n_fft].iter().zip(&self.window)) {
                *slot = Complex::new(x * w, 0.0);
            }
            self.fft.process(&mut buffer);
            for (out, c) in row.iter_mut().zip(&buffer[..num_bins]) {
                *out = c.norm() / self.window_norm;
            }
        }
        magnitudes
    }
}

impl SpectrogramExtractor for MelSpectrogram {
    fn extract(&self, samples: &[f32]) -> std::result::Result<Array2<f32>, SpectrogramError> {
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(SpectrogramError::NonFinite);
        }
        let pad = self.config.n_fft / 2;
        if samples.len() <= pad {
            return Err(SpectrogramError::TooShort { len: samples.len(), pad });
        }

        let padded = reflect_pad(samples, pad);
        let magnitudes = self.stft(&padded);

        // [n_mels, bins] x [bins, frames]
        let mel = self.filterbank.dot(&magnitudes.t());
        Ok(mel.mapv(|m| {
            let db = 20.0 * m.max(1e-5).log10() - 20.0;
            ((db + 100.0) / 100.0).clamp(0.0, 1.0)
        }))
    }
}

/// Periodic Hann window of `win_length`, zero padded on both sides to `n_fft`.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let left = (n_fft - win_length) / 2;
    let mut window = vec![0.0f32; n_fft];
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[left + i] = (0.5 * (1.0 - phase.cos())) as f32;
    }
    window
}

/// Reflect-pad a signal by `pad` on both sides. Requires `pad < signal.len()`.
fn reflect_pad(signal: &[f32], pad: usize) -> Vec<f32> {
    let len = signal.len();
    let mut padded = Vec::with_capacity(len + 2 * pad);
    padded.extend((1..=pad).rev().map(|i| signal[i]));
    padded.extend_from_slice(signal);
    padded.extend((0..pad).map(|i| signal[len - 2 - i]));
    padded
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular HTK filters, `[n_mels, n_fft / 2 + 1]`.
fn mel_filterbank(config: &MelConfig) -> Array2<f32> {
    let num_bins = config.n_fft / 2 + 1;
    let nyquist = config.sample_rate as f64 / 2.0;
    let bin_freq = |k: usize| {
        if num_bins == 1 { 0.0 } else { nyquist * k as f64 / (num_bins - 1) as f64 }
    };

    let mel_min = hz_to_mel(config.f_min);
    let mel_max = hz_to_mel(config.f_max);
    let edges: Vec<f64> = (0..config.n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (config.n_mels + 1) as f64))
        .collect();

    Array2::from_shape_fn((config.n_mels, num_bins), |(m, k)| {
        let f = bin_freq(k);
        let down = (f - edges[m]) / (edges[m + 1] - edges[m]);
        let up = (edges[m + 2] - f) / (edges[m + 2] - edges[m + 1]);
        down.min(up).max(0.0) as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MelConfig {
        MelConfig {
            sample_rate: 16000,
            n_fft: 256,
            win_length: 256,
            hop_length: 64,
            n_mels: 32,
            f_min: 20.0,
            f_max: 8000.0,
        }
    }

    fn tone(len: usize, hz: f32, sr: f32) -> Vec<f32> {
        (0..len).map(|i| 0.5 * (2.0 * std::f32::consts::PI * hz * i as f32 / sr).sin()).collect()
    }

    #[test]
    fn test_frame_count_matches_crop() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        let crop_frames = 20;
        let samples = tone((crop_frames - 1) * 64, 440.0, 16000.0);
        let spec = mel.extract(&samples).unwrap();
        assert_eq!(spec.dim(), (32, crop_frames));
        assert_eq!(mel.num_frames(samples.len()), crop_frames);
    }

    #[test]
    fn test_values_are_bounded() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        let spec = mel.extract(&tone(4096, 1000.0, 16000.0)).unwrap();
        assert!(spec.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(spec.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_tone_energy_lands_in_matching_band() {
        let config = small_config();
        let mel = MelSpectrogram::new(config.clone()).unwrap();
        let spec = mel.extract(&tone(4096, 4000.0, 16000.0)).unwrap();
        let frame = spec.column(10);
        let loudest = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        // Band centers are spaced evenly in mel, 4 kHz sits well above the middle band.
        let center = mel_to_hz(
            hz_to_mel(config.f_min)
                + (hz_to_mel(config.f_max) - hz_to_mel(config.f_min)) * (loudest + 1) as f64
                    / (config.n_mels + 1) as f64,
        );
        assert!((center - 4000.0).abs() < 600.0, "loudest band centered at {center} Hz");
    }

    #[test]
    fn test_too_short_input_fails() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        assert_eq!(mel.extract(&[0.1; 128]), Err(SpectrogramError::TooShort { len: 128, pad: 128 }));
        assert!(mel.extract(&[0.1; 129]).is_ok());
        assert!(mel.extract(&[]).is_err());
    }

    #[test]
    fn test_non_finite_input_fails() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        let mut samples = tone(1024, 440.0, 16000.0);
        samples[100] = f32::NAN;
        assert_eq!(mel.extract(&samples), Err(SpectrogramError::NonFinite));
    }

    #[test]
    fn test_window_longer_than_fft_is_rejected() {
        let config = MelConfig { win_length: 512, ..small_config() };
        assert!(matches!(MelSpectrogram::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_reflect_pad() {
        assert_eq!(reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2), vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_filterbank_is_triangular() {
        let fb = mel_filterbank(&small_config());
        assert_eq!(fb.dim(), (32, 129));
        assert!(fb.iter().all(|&w| (0.0..=1.0).contains(&w)));
        // Upper bands are wide enough to cover several bins.
        assert!(fb.row(31).iter().filter(|&&w| w > 0.0).count() > 1);
    }
}
