//! Writes the training/validation list files consumed by the loaders.
//!
//! Scans DATA_DIR for recording groups, checks every instrument file the active pair regime
//! needs (present, decodable, mono, at the configured sample rate, same length as the rest of
//! its group), shuffles the groups that pass and splits them into TRAIN_LIST and VALID_LIST.
//! Each line is a stem relative to DATA_DIR, ready to be zipped with it in `config.rs`.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rand::{rng, seq::SliceRandom};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing_subscriber::EnvFilter;

use timbre_bake::{audio, index, Params};

// --- Configuration ---
// Root of the recording groups to split.
const DATA_DIR: &str = "data/urmp";
// Output list names, written inside DATA_DIR. Existing lists are replaced.
const TRAIN_LIST: &str = "train.txt";
const VALID_LIST: &str = "valid.txt";
// Share of the groups held out for validation. At least one group is held out.
const VALIDATION_FRACTION: f64 = 0.1;

/// Checks the renditions of one group against each other and the configured sample rate.
fn check_group(stem: &Path, tags: &BTreeSet<u8>, sample_rate: u32) -> Result<()> {
    let mut length = None;
    for &tag in tags {
        let path = index::instrument_path(stem, tag);
        let recording = audio::load(&path).with_context(|| format!("could not load '{}'", path.display()))?;
        if recording.sample_rate != sample_rate {
            bail!("'{}' is sampled at {} Hz, expected {}", path.display(), recording.sample_rate, sample_rate);
        }
        if recording.num_channels() != 1 {
            bail!("'{}' has {} channels", path.display(), recording.num_channels());
        }
        match length {
            None => length = Some(recording.len()),
            Some(len) if len != recording.len() => {
                bail!("'{}' has {} samples, the group has {}", path.display(), recording.len(), len)
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn write_list(dir: &Path, name: &str, stems: &[PathBuf]) -> Result<()> {
    // Use a temporary name first to avoid leaving a truncated list behind.
    let temp_path = dir.join(format!("{}.tmp", name));
    let final_path = dir.join(name);

    let mut text = String::new();
    for stem in stems {
        let line = stem.to_str().with_context(|| format!("non UTF-8 stem '{}'", stem.display()))?;
        text.push_str(line);
        text.push('\n');
    }
    fs::write(&temp_path, text)?;
    fs::rename(temp_path, final_path)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("--- Starting Split Process ---");
    let params = Params::default();
    let data_dir = Path::new(DATA_DIR);

    // 1. Discover the recording groups.
    let stems = index::scan_groups(data_dir)?;
    if stems.is_empty() {
        bail!("No recording groups found in '{}'!", DATA_DIR);
    }
    println!("Found {} recording groups.", stems.len());

    // 2. Check every file the pair regime will touch.
    let tags: BTreeSet<u8> = params
        .instrument_pairs()
        .iter()
        .flat_map(|pair| [pair.content, pair.timbre])
        .collect();
    println!("Checking instrument tags {:?} of the '{}' regime.", tags, params.regime());

    let pb = ProgressBar::new(stems.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Checking Groups [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    let checked: Vec<(PathBuf, Result<()>)> = stems
        .into_par_iter()
        .progress_with(pb)
        .map(|stem| {
            let result = check_group(&stem, &tags, params.sample_rate);
            (stem, result)
        })
        .collect();

    let mut groups = Vec::new();
    for (stem, result) in checked {
        match result {
            Ok(()) => {
                let relative = stem.strip_prefix(data_dir).unwrap_or(&stem).to_path_buf();
                groups.push(relative);
            }
            Err(e) => println!("  - Skipping {}: {:#}", stem.display(), e),
        }
    }
    if groups.len() < 2 {
        bail!("Need at least two complete groups to split, found {}.", groups.len());
    }

    // 3. Shuffle and split.
    groups.shuffle(&mut rng());
    let num_valid = ((groups.len() as f64 * VALIDATION_FRACTION).round() as usize).clamp(1, groups.len() - 1);
    let (valid, train) = groups.split_at(num_valid);

    write_list(data_dir, TRAIN_LIST, train)?;
    write_list(data_dir, VALID_LIST, valid)?;

    println!("\n✅ Split complete!");
    println!("  - {} training groups -> '{}'", train.len(), data_dir.join(TRAIN_LIST).display());
    println!("  - {} validation groups -> '{}'", valid.len(), data_dir.join(VALID_LIST).display());

    Ok(())
}
