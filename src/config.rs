//! Configuration for how the paired dataset is indexed and loaded.
//!
//! Every recording group is a set of time-aligned renditions of the same performance, one file
//! per instrument tag (`<stem>.<tag>.wav`). A training example takes the mel-spectrogram of one
//! rendition (the content source) and the waveform of another (the timbre target), so the model
//! learns to keep the notes while swapping the instrument.
//!
//! Which two tags are combined is decided by a pair regime. The restricted regime only swaps the
//! two mixtures; the full regime also swaps clarinet/strings and vibraphone/piano. The regime is
//! chosen once through [`Params::train_mixtures`] and handed to the indexer as an explicit table,
//! so a different instrument taxonomy only needs a new entry in [`PAIR_REGIMES`].
//!
//! Make sure to update the paths below with your own before running the binaries.

use std::{fmt, fs, path::{Path, PathBuf}};

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Where the driver dumps `params_saved.json`.
pub const MODEL_DIR: &str = "runs/timbre";

/// Roots of the recording groups. Zipped positionally with the list files below.
pub const DATA_DIRS: &[&str] = &["data/urmp"];

/// One stem per line, relative to the matching entry of [`DATA_DIRS`]. Leave empty to scan
/// `DATA_DIRS` recursively instead.
pub const TRAINING_FILES: &[&str] = &["data/urmp/train.txt"];
pub const VALIDATION_FILES: &[&str] = &["data/urmp/valid.txt"];

// Worker threads per loader. Each one decodes its own files, so this is mostly bounded by disk
// throughput.
pub const NUM_WORKERS: usize = 8;

// Crop used for validation. `None` evaluates on the same crop length as training.
pub const VALID_CROP_MEL_FRAMES: Option<usize> = None;

// Seed for crop offsets and shuffling. `None` draws from the thread-local generator, so runs
// are not reproducible.
pub const SEED: Option<u64> = None;

/// Name of the file the driver writes the hyper-parameters to.
pub const PARAMS_FILE_NAME: &str = "params_saved.json";

/// Selects two instrument tags of a recording group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentPair {
    /// Tag whose mel-spectrogram conditions the model.
    pub content: u8,
    /// Tag whose waveform the model learns to generate.
    pub timbre: u8,
}

impl InstrumentPair {
    pub const fn new(content: u8, timbre: u8) -> Self {
        Self { content, timbre }
    }
}

impl fmt::Display for InstrumentPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |tag: u8| INSTRUMENT_NAMES.get(&tag).copied().unwrap_or("unknown");
        write!(f, "{} ({}) -> {} ({})", self.content, name(self.content), self.timbre, name(self.timbre))
    }
}

/// Human readable names of the instrument tags.
pub const INSTRUMENT_NAMES: phf::Map<u8, &'static str> = phf_map! {
    0u8 => "mixture",
    1u8 => "clarinet",
    2u8 => "vibraphone",
    3u8 => "mixture",
    4u8 => "strings",
    5u8 => "piano",
};

pub const MIXTURES_REGIME: &str = "mixtures";
pub const INSTRUMENTS_REGIME: &str = "instruments";

/// Mixture swap only.
pub const MIXTURE_PAIRS: &[InstrumentPair] = &[
    InstrumentPair::new(0, 3),
    InstrumentPair::new(3, 0),
];

/// Mixture, clarinet/strings and vibraphone/piano swaps.
pub const INSTRUMENT_PAIRS: &[InstrumentPair] = &[
    InstrumentPair::new(0, 3),
    InstrumentPair::new(3, 0),
    InstrumentPair::new(1, 4),
    InstrumentPair::new(4, 1),
    InstrumentPair::new(2, 5),
    InstrumentPair::new(5, 2),
];

/// Named pair tables.
pub const PAIR_REGIMES: phf::Map<&'static str, &'static [InstrumentPair]> = phf_map! {
    "mixtures" => MIXTURE_PAIRS,
    "instruments" => INSTRUMENT_PAIRS,
};

/// Hyper-parameters consumed by the data pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Global batch size, split across replicas when distributed.
    pub batch_size: usize,
    pub sample_rate: u32,
    pub n_mels: usize,
    pub n_fft: usize,
    pub hop_samples: usize,
    /// Training window length, in mel frames.
    pub crop_mel_frames: usize,
    /// Restrict pairing to the mixture swap.
    pub train_mixtures: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            batch_size: 32,
            sample_rate: 16000,
            n_mels: 128,
            n_fft: 1024,
            hop_samples: 256,
            crop_mel_frames: 64,
            train_mixtures: false,
        }
    }
}

impl Params {
    pub fn regime(&self) -> &'static str {
        if self.train_mixtures { MIXTURES_REGIME } else { INSTRUMENTS_REGIME }
    }

    /// The pair table of the active regime.
    pub fn instrument_pairs(&self) -> &'static [InstrumentPair] {
        PAIR_REGIMES.get(self.regime()).copied().unwrap_or_default()
    }

    /// Window length of the STFT.
    pub fn win_length(&self) -> usize {
        self.hop_samples * 4
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes the parameters into `dir`, creating it if needed. Returns the written file.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(PARAMS_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// Position of this process among the participants of a distributed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub rank: usize,
    pub world_size: usize,
}

impl Replica {
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(Error::Config(format!("invalid replica: rank {rank} of world size {world_size}")));
        }
        Ok(Self { rank, world_size })
    }

    /// Reads `WORLD_SIZE` and `RANK`. A missing or single-process world is not distributed.
    pub fn from_env() -> Result<Option<Self>> {
        let world_size = std::env::var("WORLD_SIZE").ok();
        let rank = std::env::var("RANK").ok();
        Self::from_vars(world_size.as_deref(), rank.as_deref())
    }

    /// Replica described by the raw `WORLD_SIZE` and `RANK` values. `RANK` is required as soon
    /// as the world has more than one process.
    pub fn from_vars(world_size: Option<&str>, rank: Option<&str>) -> Result<Option<Self>> {
        let parse = |key: &str, value: &str| -> Result<usize> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} is not an integer: {value:?}")))
        };
        let world_size = match world_size {
            Some(value) => parse("WORLD_SIZE", value)?,
            None => return Ok(None),
        };
        if world_size <= 1 {
            return Ok(None);
        }
        let rank = rank.ok_or_else(|| Error::Config("RANK is required when WORLD_SIZE > 1".to_string()))?;
        Ok(Some(Self::new(parse("RANK", rank)?, world_size)?))
    }

    /// Per-replica share of a global batch size.
    pub fn split_batch_size(&self, batch_size: usize) -> Result<usize> {
        if batch_size % self.world_size != 0 {
            return Err(Error::Config(format!(
                "batch size {batch_size} is not evenly divisible by # replicas {}",
                self.world_size
            )));
        }
        Ok(batch_size / self.world_size)
    }
}
