//! The data preparation driver. See "config.rs" for the paths and worker counts it uses.
//!
//! Dumps the hyper-parameters next to the future checkpoints, builds the training and
//! validation pipelines exactly as the trainer consumes them, and runs one pass over each so
//! broken groups (wrong sample rate, misaligned renditions, missing files) surface before a
//! long run is started. Under a distributed launcher (`WORLD_SIZE` / `RANK` set) every process
//! checks its own shard.

use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use timbre_bake::{
    config::{DATA_DIRS, MODEL_DIR, NUM_WORKERS, SEED, TRAINING_FILES, VALIDATION_FILES, VALID_CROP_MEL_FRAMES},
    training_loader, validation_loader, DataLoader, Params, Replica,
};

#[derive(Debug, Default)]
struct PassSummary {
    batches: usize,
    empty_batches: usize,
    examples: usize,
}

/// Consumes one epoch the way the training loop does: empty batches are skipped.
fn run_pass(loader: &DataLoader, m: &MultiProgress, name: &str) -> Result<PassSummary> {
    let pb = m.add(ProgressBar::new(loader.len() as u64));
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix:15.bold.dim} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
        .progress_chars("#>-"));
    pb.set_prefix(name.to_string());

    let mut summary = PassSummary::default();
    for batch in loader.epoch(0) {
        let batch = batch.with_context(|| format!("{} batch {} failed", name, summary.batches))?;
        summary.batches += 1;
        match batch {
            Some(batch) => summary.examples += batch.len(),
            None => summary.empty_batches += 1,
        }
        pb.inc(1);
    }
    pb.finish();
    Ok(summary)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let start_time = Instant::now();
    let m = MultiProgress::new();
    let mut params = Params::default();

    // --- Step 1: Dump the hyper-parameters ---
    println!("Dumping hyperparameter file...");
    let saved = params.save(MODEL_DIR).with_context(|| format!("could not write params into '{}'", MODEL_DIR))?;
    println!("-> {}", saved.display());

    let replica = Replica::from_env()?;
    if let Some(replica) = replica {
        params.batch_size = replica.split_batch_size(params.batch_size)?;
        println!("Replica {} of {}, {} examples per batch.", replica.rank, replica.world_size, params.batch_size);
    }
    println!("Pair regime '{}':", params.regime());
    for pair in params.instrument_pairs() {
        println!("    - {}", pair);
    }

    // --- Step 2: Training pipeline ---
    let main_pb = m.add(ProgressBar::new_spinner());
    main_pb.set_style(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?);
    main_pb.set_message("Step 2: Running one training epoch...");

    let train = training_loader(DATA_DIRS, TRAINING_FILES, &params, params.batch_size, NUM_WORKERS, replica, SEED)
        .context("could not build the training pipeline")?;
    let train_summary = run_pass(&train, &m, "train")?;
    main_pb.finish_with_message("Step 2: Training epoch complete.");

    // --- Step 3: Validation pipeline ---
    let valid_summary = if VALIDATION_FILES.is_empty() {
        None
    } else {
        let main_pb = m.add(ProgressBar::new_spinner());
        main_pb.set_style(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?);
        main_pb.set_message("Step 3: Running validation...");

        let valid = validation_loader(DATA_DIRS, VALIDATION_FILES, &params, NUM_WORKERS, VALID_CROP_MEL_FRAMES, replica, SEED)
            .context("could not build the validation pipeline")?;
        let summary = run_pass(&valid, &m, "valid")?;
        main_pb.finish_with_message("Step 3: Validation complete.");
        Some(summary)
    };
    m.clear()?;

    println!("\n✅ Pipelines OK!");
    println!(
        "  - train: {} examples in {} batches ({} empty, skipped)",
        train_summary.examples, train_summary.batches, train_summary.empty_batches
    );
    if let Some(summary) = valid_summary {
        println!(
            "  - valid: {} examples in {} batches ({} empty, skipped)",
            summary.examples, summary.batches, summary.empty_batches
        );
    }
    println!("Total time elapsed: {:?}", start_time.elapsed());

    Ok(())
}
