//! Turns a pair of file paths into model-ready waveforms and conditioning features.
//!
//! The content source provides the notes (as a mel-spectrogram and as a waveform), the timbre
//! target provides the waveform the model should generate. Both renditions go through the
//! same crop window so they stay sample-aligned.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::Rng;

use crate::{
    audio::{self, PEAK_LEVEL},
    config::Params,
    error::{Error, Result},
    index::TrainingExample,
    mel::SpectrogramExtractor,
};

/// Outcome of the spectrogram extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum Spectrogram {
    /// Time-major `[frames, n_mels]`.
    Extracted(Array2<f32>),
    /// Input was too short or degenerate; the collator drops the example.
    Absent,
}

impl Spectrogram {
    /// Number of frames, `None` when absent.
    pub fn frames(&self) -> Option<usize> {
        match self {
            Spectrogram::Extracted(mel) => Some(mel.nrows()),
            Spectrogram::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Spectrogram::Absent)
    }
}

#[derive(Debug, Clone)]
pub struct TransformedExample {
    /// Timbre-target waveform, padded by one hop.
    pub audio: Array1<f32>,
    /// Mel-spectrogram of the content source.
    pub spectrogram: Spectrogram,
    /// Content-source waveform, padded by one hop.
    pub audio_cond_inst: Array1<f32>,
}

/// Loads, validates, normalizes and crops one pair.
#[derive(Clone)]
pub struct ExampleTransform {
    sample_rate: u32,
    hop_samples: usize,
    crop_frames: usize,
    extractor: Arc<dyn SpectrogramExtractor>,
}

impl ExampleTransform {
    /// `crop_mel` overrides `params.crop_mel_frames`, typically to validate on longer clips.
    pub fn new(params: &Params, crop_mel: Option<usize>, extractor: Arc<dyn SpectrogramExtractor>) -> Result<Self> {
        let crop_frames = crop_mel.unwrap_or(params.crop_mel_frames);
        if crop_frames == 0 {
            return Err(Error::Config("crop length must be at least one mel frame".to_string()));
        }
        if params.hop_samples == 0 {
            return Err(Error::Config("hop_samples must be positive".to_string()));
        }
        Ok(Self {
            sample_rate: params.sample_rate,
            hop_samples: params.hop_samples,
            crop_frames,
            extractor,
        })
    }

    pub fn crop_frames(&self) -> usize {
        self.crop_frames
    }

    /// Crop length in samples. One frame fewer than the crop, since the centered STFT yields a
    /// frame for both ends.
    pub fn crop_samples(&self) -> usize {
        (self.crop_frames - 1) * self.hop_samples
    }

    pub fn apply<R: Rng>(&self, example: &TrainingExample, rng: &mut R) -> Result<TransformedExample> {
        let content = audio::load(&example.content)?;
        let timbre = audio::load(&example.timbre)?;

        if content.sample_rate != self.sample_rate || timbre.sample_rate != self.sample_rate {
            return Err(Error::SampleRate {
                content: content.sample_rate,
                timbre: timbre.sample_rate,
                expected: self.sample_rate,
            });
        }
        assert_eq!(
            (content.num_channels(), content.len()),
            (timbre.num_channels(), timbre.len()),
            "{} and {} are not aligned",
            example.content.display(),
            example.timbre.display()
        );
        let (Some(mut content), Some(mut timbre)) = (content.into_mono(), timbre.into_mono()) else {
            panic!("{} and {} are not mono", example.content.display(), example.timbre.display());
        };

        audio::peak_normalize(&mut content, PEAK_LEVEL);
        audio::peak_normalize(&mut timbre, PEAK_LEVEL);

        let crop_len = self.crop_samples();
        if content.len() >= crop_len {
            let start = rng.random_range(0..=content.len() - crop_len);
            content = content[start..start + crop_len].to_vec();
            timbre = timbre[start..start + crop_len].to_vec();
        }

        let spectrogram = match self.extractor.extract(&content) {
            Ok(mel) => Spectrogram::Extracted(mel.reversed_axes()),
            Err(e) => {
                tracing::debug!("no spectrogram for {}: {}", example.content.display(), e);
                Spectrogram::Absent
            }
        };

        // The centered STFT consumes one hop more than the crop.
        content.resize(content.len() + self.hop_samples, 0.0);
        timbre.resize(timbre.len() + self.hop_samples, 0.0);

        Ok(TransformedExample {
            audio: Array1::from_vec(timbre),
            spectrogram,
            audio_cond_inst: Array1::from_vec(content),
        })
    }
}
