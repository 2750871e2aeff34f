//! Decoding and amplitude normalization of single recordings.

use std::{fs::File, path::Path};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::error::{Error, Result};

/// Peak level waveforms are normalized to.
pub const PEAK_LEVEL: f32 = 0.95;

/// Floor of the peak used as divisor, so silence stays silence.
pub const NORM_EPSILON: f32 = 1e-12;

/// A decoded file at its native sample rate.
#[derive(Debug, Clone)]
pub struct Recording {
    /// One vector of samples per channel.
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl Recording {
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the samples of a single-channel recording, `None` otherwise.
    pub fn into_mono(mut self) -> Option<Vec<f32>> {
        if self.channels.len() == 1 { self.channels.pop() } else { None }
    }
}

/// Decodes an audio file without resampling or downmixing.
pub fn load(path: &Path) -> Result<Recording> {
    let decode_err = |message: String| Error::Decode { path: path.to_path_buf(), message };

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }
    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|e| decode_err(e.to_string()))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| decode_err("no supported audio track".to_string()))?;
    let track_id = track.id;
    let declared_channels = track.codec_params.channels.map_or(1, |c| c.count());

    let sample_rate = track.codec_params.sample_rate.ok_or_else(|| decode_err("missing sample rate".to_string()))?;
    let decode_options = DecoderOptions { verify: true };
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &decode_options)
        .map_err(|e| decode_err(e.to_string()))?;

    let mut channels: Vec<Vec<f32>> = Vec::new();

    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() != track_id {
                    continue;
                }
                let decoded = decoder.decode(&packet).map_err(|e| decode_err(e.to_string()))?;
                let channel_count = decoded.spec().channels.count();
                if channels.is_empty() {
                    channels.resize(channel_count, Vec::new());
                }
                let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                sample_buf.copy_interleaved_ref(decoded);

                for frame in sample_buf.samples().chunks_exact(channel_count) {
                    for (channel, &sample) in channels.iter_mut().zip(frame) {
                        channel.push(sample);
                    }
                }
            }
            Err(symphonia::core::errors::Error::IoError(_)) => break, // End of stream
            Err(e) => return Err(decode_err(format!("error during decoding: {e}"))),
        }
    }

    if channels.is_empty() {
        // No packets at all: keep the declared layout so callers still see the channel count.
        channels.resize(declared_channels, Vec::new());
    }

    Ok(Recording { channels, sample_rate })
}

/// Scales `samples` so that its largest magnitude becomes `level`.
///
/// Uses the infinity norm with a floor of [`NORM_EPSILON`].
pub fn peak_normalize(samples: &mut [f32], level: f32) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    let scale = level / max_abs.max(NORM_EPSILON);
    for s in samples.iter_mut() {
        *s *= scale;
    }
}
