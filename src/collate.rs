//! Filters transformed examples and stacks the survivors into a batch.

use ndarray::{stack, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use crate::{
    config::Params,
    error::Result,
    transform::{Spectrogram, TransformedExample},
};

/// Stacked survivors of a minibatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Timbre-target waveforms `[batch, samples]`.
    pub audio: Array2<f32>,
    /// Content-source mel-spectrograms `[batch, n_mels, frames]`.
    pub spectrogram: Array3<f32>,
    /// Content-source waveforms `[batch, samples]`.
    pub audio_cond_inst: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.audio.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops examples that cannot fill a crop and stacks the rest.
#[derive(Debug, Clone, Copy)]
pub struct Collator {
    crop_frames: usize,
}

impl Collator {
    pub fn new(params: &Params, crop_mel: Option<usize>) -> Self {
        Self { crop_frames: crop_mel.unwrap_or(params.crop_mel_frames) }
    }

    pub fn crop_frames(&self) -> usize {
        self.crop_frames
    }

    /// `Ok(None)` when no example of the minibatch survives; the training loop skips it.
    pub fn collate(&self, minibatch: Vec<TransformedExample>) -> Result<Option<Batch>> {
        let total = minibatch.len();
        let survivors: Vec<(Array1<f32>, Array2<f32>, Array1<f32>)> = minibatch
            .into_iter()
            .filter_map(|record| match record.spectrogram {
                Spectrogram::Extracted(mel) if mel.nrows() >= self.crop_frames => {
                    Some((record.audio, mel, record.audio_cond_inst))
                }
                _ => None,
            })
            .collect();

        if survivors.is_empty() {
            tracing::debug!("all {} examples of the minibatch were dropped", total);
            return Ok(None);
        }
        if survivors.len() < total {
            tracing::trace!("dropped {} of {} examples", total - survivors.len(), total);
        }

        let audio: Vec<ArrayView1<f32>> = survivors.iter().map(|(a, _, _)| a.view()).collect();
        let spectrogram: Vec<ArrayView2<f32>> = survivors.iter().map(|(_, mel, _)| mel.t()).collect();
        let audio_cond_inst: Vec<ArrayView1<f32>> = survivors.iter().map(|(_, _, c)| c.view()).collect();

        Ok(Some(Batch {
            audio: stack(Axis(0), &audio)?,
            spectrogram: stack(Axis(0), &spectrogram)?,
            audio_cond_inst: stack(Axis(0), &audio_cond_inst)?,
        }))
    }
}
