//! Worker-pool loaders yielding collated batches, optionally sharded across replicas.
//!
//! Batches are prepared `num_workers` at a time: the indices of the whole window go to a fixed
//! rayon pool, each worker decodes and transforms its examples independently, and the results
//! are collated on the consuming thread in index order. Examples that lost their spectrogram
//! are filtered there, so a batch can come out smaller than requested, or as `None` when
//! nothing survived.

use std::{collections::VecDeque, path::Path, sync::Arc};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    collate::{Batch, Collator},
    config::{Params, Replica},
    dataset::PairedDataset,
    error::{Error, Result},
    mel::{MelConfig, MelSpectrogram, SpectrogramExtractor},
    transform::{ExampleTransform, TransformedExample},
};

/// Pads `indices` to a multiple of `num_replicas` by wrapping around, then keeps every
/// `num_replicas`-th index starting at `rank`. Every replica gets the same number of indices.
pub fn shard(indices: &[usize], num_replicas: usize, rank: usize) -> Vec<usize> {
    if indices.is_empty() || num_replicas == 0 {
        return Vec::new();
    }
    let total = indices.len().div_ceil(num_replicas) * num_replicas;
    indices
        .iter()
        .cycle()
        .take(total)
        .skip(rank)
        .step_by(num_replicas)
        .copied()
        .collect()
}

/// Orders the dataset for one replica of a distributed run.
///
/// All replicas draw the same permutation for a given epoch (seeded by `seed + epoch`), so
/// their shards are disjoint up to the wrap-around padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedSampler {
    pub replica: Replica,
    pub shuffle: bool,
    pub seed: u64,
}

impl DistributedSampler {
    pub fn new(replica: Replica, shuffle: bool, seed: u64) -> Self {
        Self { replica, shuffle, seed }
    }

    /// Indices per replica for a dataset of `len` examples.
    pub fn num_samples(&self, len: usize) -> usize {
        len.div_ceil(self.replica.world_size)
    }

    pub fn indices(&self, len: usize, epoch: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            indices.shuffle(&mut rng);
        }
        shard(&indices, self.replica.world_size, self.replica.rank)
    }
}

/// How a loader orders the dataset each epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    Sequential,
    Shuffled,
    Distributed(DistributedSampler),
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Worker threads; 0 runs everything on a single worker.
    pub num_workers: usize,
    pub sampler: Sampler,
    /// Whether to drop the last incomplete batch.
    pub drop_last: bool,
    /// Seeds shuffling and crop offsets. `None` uses the thread-local generator.
    pub seed: Option<u64>,
}

pub struct DataLoader {
    dataset: PairedDataset,
    collator: Collator,
    config: LoaderConfig,
    pool: ThreadPool,
}

impl DataLoader {
    pub fn new(dataset: PairedDataset, collator: Collator, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .thread_name(|idx| format!("loader-worker-{idx}"))
            .build()?;
        Ok(Self { dataset, collator, config, pool })
    }

    pub fn dataset(&self) -> &PairedDataset {
        &self.dataset
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Examples visited per epoch by this replica.
    pub fn num_samples(&self) -> usize {
        match &self.config.sampler {
            Sampler::Distributed(sampler) => sampler.num_samples(self.dataset.len()),
            Sampler::Sequential | Sampler::Shuffled => self.dataset.len(),
        }
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.batches_in(self.num_samples())
    }

    fn batches_in(&self, num_samples: usize) -> usize {
        if self.config.drop_last {
            num_samples / self.config.batch_size
        } else {
            num_samples.div_ceil(self.config.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn indices(&self, epoch: u64) -> Vec<usize> {
        let len = self.dataset.len();
        match &self.config.sampler {
            Sampler::Sequential => (0..len).collect(),
            Sampler::Shuffled => {
                let mut indices: Vec<usize> = (0..len).collect();
                match self.config.seed {
                    Some(seed) => indices.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch))),
                    None => indices.shuffle(&mut rand::rng()),
                }
                indices
            }
            Sampler::Distributed(sampler) => sampler.indices(len, epoch),
        }
    }

    /// Starts a pass over the dataset. Can be called again for the next epoch.
    pub fn epoch(&self, epoch: u64) -> Batches<'_> {
        let indices = self.indices(epoch);
        tracing::debug!("epoch {} over {} examples", epoch, indices.len());
        Batches { loader: self, indices, position: 0, epoch, ready: VecDeque::new() }
    }

    /// Transforms `indices` on the pool, keeping their order. Failures stay per example.
    fn transform_all(&self, indices: &[usize], epoch: u64) -> Vec<Result<TransformedExample>> {
        let dataset = &self.dataset;
        let seed = self.config.seed;
        self.pool.install(|| {
            indices
                .par_iter()
                .map(|&idx| match seed {
                    Some(seed) => dataset.get(idx, &mut StdRng::seed_from_u64(example_seed(seed, epoch, idx))),
                    None => dataset.get(idx, &mut rand::rng()),
                })
                .collect()
        })
    }
}

fn example_seed(seed: u64, epoch: u64, idx: usize) -> u64 {
    seed.wrapping_add(epoch << 32).wrapping_add(idx as u64)
}

/// One epoch of batches. `Ok(None)` items are minibatches without survivors.
pub struct Batches<'a> {
    loader: &'a DataLoader,
    indices: Vec<usize>,
    position: usize,
    epoch: u64,
    /// Collated batches of the current window, in order.
    ready: VecDeque<Result<Option<Batch>>>,
}

impl Batches<'_> {
    /// Prepares up to `num_workers` batches in one go so every worker has examples to take,
    /// even with a batch size of 1.
    fn fill(&mut self) {
        let loader = self.loader;
        let batch_size = loader.config.batch_size;
        let window = loader.config.num_workers.max(1);

        let mut sizes = Vec::with_capacity(window);
        let mut end = self.position;
        while sizes.len() < window && end < self.indices.len() {
            let size = batch_size.min(self.indices.len() - end);
            if loader.config.drop_last && size < batch_size {
                break;
            }
            sizes.push(size);
            end += size;
        }
        if sizes.is_empty() {
            self.position = self.indices.len();
            return;
        }

        let mut examples = loader.transform_all(&self.indices[self.position..end], self.epoch).into_iter();
        self.position = end;
        for size in sizes {
            // Drain the whole batch before checking it so the next one starts at the right example.
            let minibatch: Vec<_> = examples.by_ref().take(size).collect();
            let batch = minibatch
                .into_iter()
                .collect::<Result<Vec<_>>>()
                .and_then(|minibatch| loader.collator.collate(minibatch));
            self.ready.push_back(batch);
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Option<Batch>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            self.fill();
        }
        self.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.indices.len().saturating_sub(self.position);
        let n = self.ready.len() + self.loader.batches_in(remaining);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Batches<'_> {}

fn mel_extractor(params: &Params) -> Result<Arc<dyn SpectrogramExtractor>> {
    Ok(Arc::new(MelSpectrogram::new(MelConfig::from_params(params))?))
}

/// Shuffled, `drop_last` loader over the training groups. With a replica, the distributed
/// sampler shards and shuffles instead.
pub fn training_loader<P: AsRef<Path>, L: AsRef<Path>>(
    data_dirs: &[P],
    training_files: &[L],
    params: &Params,
    batch_size: usize,
    num_workers: usize,
    replica: Option<Replica>,
    seed: Option<u64>,
) -> Result<DataLoader> {
    let transform = ExampleTransform::new(params, None, mel_extractor(params)?)?;
    let dataset = PairedDataset::from_path(data_dirs, training_files, params, transform)?;
    tracing::info!("{} files for training", dataset.len());

    let sampler = match replica {
        Some(replica) => Sampler::Distributed(DistributedSampler::new(replica, true, seed.unwrap_or(0))),
        None => Sampler::Shuffled,
    };
    let config = LoaderConfig { batch_size, num_workers, sampler, drop_last: true, seed };
    DataLoader::new(dataset, Collator::new(params, None), config)
}

/// One example per batch, in index order, keeping the last batch. `crop_mel` overrides the
/// training crop length, e.g. to evaluate on longer clips.
pub fn validation_loader<P: AsRef<Path>, L: AsRef<Path>>(
    data_dirs: &[P],
    validation_files: &[L],
    params: &Params,
    num_workers: usize,
    crop_mel: Option<usize>,
    replica: Option<Replica>,
    seed: Option<u64>,
) -> Result<DataLoader> {
    let transform = ExampleTransform::new(params, crop_mel, mel_extractor(params)?)?;
    let dataset = PairedDataset::from_path(data_dirs, validation_files, params, transform)?;
    tracing::info!("{} files for validation", dataset.len());

    let sampler = match replica {
        Some(replica) => Sampler::Distributed(DistributedSampler::new(replica, false, seed.unwrap_or(0))),
        None => Sampler::Sequential,
    };
    let config = LoaderConfig { batch_size: 1, num_workers, sampler, drop_last: false, seed };
    DataLoader::new(dataset, Collator::new(params, crop_mel), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::tests::{extractor, small_params, write_pair};
    use ndarray::Array2;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    const NO_LISTS: &[&Path] = &[];

    fn mixture_params() -> Params {
        Params { train_mixtures: true, ..small_params() }
    }

    fn write_groups(dir: &Path, lengths: &[usize]) {
        for (i, &len) in lengths.iter().enumerate() {
            write_pair(dir, &format!("song{i}"), len, 16000);
        }
    }

    /// Records how many extractions run at the same time.
    struct CountingExtractor {
        inner: Arc<dyn SpectrogramExtractor>,
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SpectrogramExtractor for CountingExtractor {
        fn extract(&self, samples: &[f32]) -> std::result::Result<Array2<f32>, crate::mel::SpectrogramError> {
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            let out = self.inner.extract(samples);
            self.live.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[test]
    fn test_shard_pads_and_interleaves() {
        let indices: Vec<usize> = (0..10).collect();
        assert_eq!(shard(&indices, 4, 0), vec![0, 4, 8]);
        assert_eq!(shard(&indices, 4, 1), vec![1, 5, 9]);
        assert_eq!(shard(&indices, 4, 2), vec![2, 6, 0]);
        assert_eq!(shard(&indices, 4, 3), vec![3, 7, 1]);
        assert!(shard(&[], 4, 0).is_empty());
    }

    #[test]
    fn test_distributed_shards_are_disjoint() {
        let len = 40;
        let shards: Vec<Vec<usize>> = (0..4)
            .map(|rank| DistributedSampler::new(Replica::new(rank, 4).unwrap(), true, 7).indices(len, 3))
            .collect();
        let all: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(all.len(), len);
        assert!(shards.iter().all(|s| s.len() == 10));

        let sampler = DistributedSampler::new(Replica::new(0, 4).unwrap(), true, 7);
        assert_ne!(sampler.indices(len, 3), sampler.indices(len, 4));
        assert_eq!(sampler.indices(len, 3), shards[0]);
    }

    #[test]
    fn test_training_loader_drops_last() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 5000, 5000]);
        let loader = training_loader(&[dir.path()], NO_LISTS, &mixture_params(), 4, 2, None, None).unwrap();

        assert_eq!(loader.dataset().len(), 6);
        assert_eq!(loader.len(), 1);
        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 1);
        let batch = batches[0].as_ref().unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.audio.dim(), (4, 10 * 64));
        assert_eq!(batch.spectrogram.dim(), (4, 16, 10));
    }

    #[test]
    fn test_validation_loader_keeps_everything_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 5000, 5000]);
        let loader = validation_loader(&[dir.path()], NO_LISTS, &mixture_params(), 2, None, None, None).unwrap();

        assert_eq!(loader.len(), 6);
        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 6);
        assert!(batches.iter().all(|b| b.as_ref().is_some_and(|b| b.len() == 1)));
    }

    #[test]
    fn test_validation_crop_override() {
        let dir = tempfile::tempdir().unwrap();
        // 39 hops fit a 40 frame crop, 20 hops do not.
        write_groups(dir.path(), &[39 * 64, 20 * 64]);
        let loader =
            validation_loader(&[dir.path()], NO_LISTS, &mixture_params(), 1, Some(40), None, None).unwrap();

        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[0].as_ref().unwrap().spectrogram.dim(), (1, 16, 40));
        assert!(batches[2].is_none());
        assert!(batches[3].is_none());
    }

    #[test]
    fn test_short_groups_give_empty_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[100, 100]);
        let loader = training_loader(&[dir.path()], NO_LISTS, &mixture_params(), 4, 2, None, None).unwrap();
        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches, vec![None]);
    }

    #[test]
    fn test_seeded_epochs_are_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 6000, 7000, 8000]);
        let loader = training_loader(&[dir.path()], NO_LISTS, &mixture_params(), 2, 3, None, Some(11)).unwrap();

        let first: Vec<_> = loader.epoch(1).collect::<Result<_>>().unwrap();
        let again: Vec<_> = loader.epoch(1).collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first, again);
    }

    #[test]
    fn test_distributed_training_loader() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 5000, 5000, 5000]);
        let params = mixture_params();
        let replica = Replica::new(1, 2).unwrap();
        let loader = training_loader(&[dir.path()], NO_LISTS, &params, 2, 2, Some(replica), None).unwrap();

        assert_eq!(loader.num_samples(), 4);
        assert_eq!(loader.len(), 2);
        assert_eq!(loader.epoch(0).len(), 2);
        assert!(loader.epoch(0).all(|b| b.unwrap().is_some()));
    }

    #[test]
    fn test_sample_rate_mismatch_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "song", 5000, 22050);
        let loader = validation_loader(&[dir.path()], NO_LISTS, &mixture_params(), 1, None, None, None).unwrap();
        let first = loader.epoch(0).next().unwrap();
        assert!(matches!(first, Err(Error::SampleRate { content: 22050, timbre: 22050, expected: 16000 })));
    }

    #[test]
    fn test_mismatched_lists_fail_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("train.txt");
        std::fs::write(&list, "song0\n").unwrap();
        let result = training_loader(&[dir.path(), dir.path()], &[&list], &mixture_params(), 4, 1, None, None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_single_example_batches_use_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 5000, 5000, 5000]);
        let params = mixture_params();
        let counter = Arc::new(CountingExtractor {
            inner: extractor(&params),
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let transform = ExampleTransform::new(&params, None, counter.clone()).unwrap();
        let dataset = PairedDataset::from_path(&[dir.path()], NO_LISTS, &params, transform).unwrap();
        let config = LoaderConfig {
            batch_size: 1,
            num_workers: 4,
            sampler: Sampler::Sequential,
            drop_last: false,
            seed: None,
        };
        let loader = DataLoader::new(dataset, Collator::new(&params, None), config).unwrap();

        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 8);
        assert!(batches.iter().all(|b| b.as_ref().is_some_and(|b| b.len() == 1)));
        let peak = counter.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "at most {peak} extraction ran at a time");
    }

    #[test]
    fn test_failed_batch_does_not_shift_its_window() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "a", 5000, 22050);
        write_pair(dir.path(), "b", 5000, 16000);
        let loader = validation_loader(&[dir.path()], NO_LISTS, &mixture_params(), 4, None, None, None).unwrap();

        let mut batches = loader.epoch(0);
        assert_eq!(batches.len(), 4);
        assert!(matches!(batches.next(), Some(Err(Error::SampleRate { .. }))));
        assert_eq!(batches.len(), 3);
        assert!(matches!(batches.next(), Some(Err(Error::SampleRate { .. }))));
        assert!(batches.next().unwrap().unwrap().is_some());
        assert!(batches.next().unwrap().unwrap().is_some());
        assert!(batches.next().is_none());
    }

    #[test]
    fn test_windowed_epoch_keeps_index_order() {
        let dir = tempfile::tempdir().unwrap();
        write_groups(dir.path(), &[5000, 5000, 5000]);
        let params = mixture_params();
        let config = |num_workers| LoaderConfig {
            batch_size: 1,
            num_workers,
            sampler: Sampler::Sequential,
            drop_last: false,
            seed: Some(5),
        };
        let build = |num_workers| {
            let transform = ExampleTransform::new(&params, None, extractor(&params)).unwrap();
            let dataset = PairedDataset::from_path(&[dir.path()], NO_LISTS, &params, transform).unwrap();
            DataLoader::new(dataset, Collator::new(&params, None), config(num_workers)).unwrap()
        };

        let serial: Vec<_> = build(1).epoch(0).collect::<Result<_>>().unwrap();
        let windowed: Vec<_> = build(4).epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(serial.len(), 6);
        assert_eq!(serial, windowed);
    }
}
