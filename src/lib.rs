//! Paired-instrument data pipeline for training a diffusion timbre-transfer model.
//!
//! Recording groups (`<stem>.<tag>.wav`, one file per instrument, all sample-aligned) are
//! expanded into (content source, timbre target) pairs by [`index`]. Each access decodes,
//! normalizes and crops a pair and extracts the content-source mel-spectrogram
//! ([`transform`]); [`collate`] drops examples without a usable spectrogram and stacks the
//! rest; [`loader`] runs all of it on a worker pool, sharded across replicas when training is
//! distributed.

pub mod audio;
pub mod collate;
pub mod config;
pub mod dataset;
pub mod error;
pub mod index;
pub mod loader;
pub mod mel;
pub mod transform;

pub use collate::{Batch, Collator};
pub use config::{InstrumentPair, Params, Replica};
pub use dataset::PairedDataset;
pub use error::{Error, Result};
pub use index::{PairIndex, TrainingExample};
pub use loader::{training_loader, validation_loader, DataLoader};
pub use transform::{ExampleTransform, Spectrogram, TransformedExample};
