//! Random-access dataset over a pair index.

use std::path::Path;

use rand::Rng;

use crate::{
    config::Params,
    error::Result,
    index::{PairIndex, TrainingExample},
    transform::{ExampleTransform, TransformedExample},
};

pub struct PairedDataset {
    index: PairIndex,
    transform: ExampleTransform,
}

impl PairedDataset {
    pub fn new(index: PairIndex, transform: ExampleTransform) -> Self {
        Self { index, transform }
    }

    /// Indexes `data_dirs` (scanning when `list_files` is empty) with the regime of `params`.
    pub fn from_path<P: AsRef<Path>, L: AsRef<Path>>(
        data_dirs: &[P],
        list_files: &[L],
        params: &Params,
        transform: ExampleTransform,
    ) -> Result<Self> {
        let index = PairIndex::build(data_dirs, list_files, params.instrument_pairs())?;
        Ok(Self::new(index, transform))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn example(&self, idx: usize) -> Option<&TrainingExample> {
        self.index.get(idx)
    }

    pub fn transform(&self) -> &ExampleTransform {
        &self.transform
    }

    /// Decodes and transforms example `idx`.
    ///
    /// # Panics
    /// If `idx` is out of bounds, or if the pair breaks the alignment invariant.
    pub fn get<R: Rng>(&self, idx: usize, rng: &mut R) -> Result<TransformedExample> {
        let example = &self.index.examples()[idx];
        self.transform.apply(example, rng)
    }
}
