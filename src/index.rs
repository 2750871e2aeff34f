//! Expands recording groups into (content source, timbre target) file pairs.

use std::{
    collections::HashSet,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    config::InstrumentPair,
    error::{Error, Result},
};

/// One training example before decoding: two files of the same recording group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrainingExample {
    /// Rendition whose mel-spectrogram (and waveform) conditions the model.
    pub content: PathBuf,
    /// Rendition the model learns to generate.
    pub timbre: PathBuf,
}

/// `<stem>.<tag>.wav`
pub fn instrument_path(stem: &Path, tag: u8) -> PathBuf {
    let mut path = OsString::from(stem.as_os_str());
    path.push(format!(".{tag}.wav"));
    PathBuf::from(path)
}

/// Strips the trailing `.<tag>.wav` of an instrument file. `None` if the name carries no numeric
/// instrument tag or the path is not UTF-8.
pub fn group_stem(path: &Path) -> Option<PathBuf> {
    let name = path.to_str()?;
    let without_ext = name.strip_suffix(".wav")?;
    let (stem, tag) = without_ext.rsplit_once('.')?;
    if stem.is_empty() || tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(PathBuf::from(stem))
}

/// Finds every recording group below `root`, in discovery order.
pub fn scan_groups(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/**/*.wav", glob::Pattern::escape(&root.to_string_lossy()));
    let mut seen = HashSet::new();
    let mut stems = Vec::new();
    for entry in glob::glob(&pattern)? {
        let path = entry?;
        match group_stem(&path) {
            Some(stem) => {
                if seen.insert(stem.clone()) {
                    stems.push(stem);
                }
            }
            None => tracing::warn!("skipping {}: {}", path.display(), skip_reason(&path)),
        }
    }
    Ok(stems)
}

fn skip_reason(path: &Path) -> &'static str {
    if path.to_str().is_none() { "non UTF-8 path" } else { "no instrument tag" }
}

/// Reads the stems listed in `list_file` and resolves them against `dir`. Blank lines are skipped.
pub fn read_groups(dir: &Path, list_file: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(list_file)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| dir.join(line))
        .collect())
}

/// The ordered list of training examples of a dataset.
#[derive(Debug, Clone, Default)]
pub struct PairIndex {
    examples: Vec<TrainingExample>,
}

impl PairIndex {
    /// Builds the index from the `roots` alone (scanning) or from `roots` zipped with
    /// `list_files`. An empty `list_files` means scanning.
    pub fn build<P: AsRef<Path>, L: AsRef<Path>>(
        roots: &[P],
        list_files: &[L],
        pairs: &[InstrumentPair],
    ) -> Result<Self> {
        if list_files.is_empty() {
            Self::scan(roots, pairs)
        } else {
            Self::from_lists(roots, list_files, pairs)
        }
    }

    pub fn scan<P: AsRef<Path>>(roots: &[P], pairs: &[InstrumentPair]) -> Result<Self> {
        // The same group may be reachable from two roots; the first occurrence wins.
        let mut seen = HashSet::new();
        let mut stems = Vec::new();
        for root in roots {
            for stem in scan_groups(root.as_ref())? {
                if seen.insert(stem.clone()) {
                    stems.push(stem);
                }
            }
        }
        Ok(Self::expand(&stems, pairs))
    }

    pub fn from_lists<P: AsRef<Path>, L: AsRef<Path>>(
        dirs: &[P],
        list_files: &[L],
        pairs: &[InstrumentPair],
    ) -> Result<Self> {
        if dirs.len() != list_files.len() {
            return Err(Error::Config(format!(
                "{} data directories but {} list files",
                dirs.len(),
                list_files.len()
            )));
        }
        let mut stems = Vec::new();
        for (dir, list_file) in dirs.iter().zip(list_files) {
            stems.extend(read_groups(dir.as_ref(), list_file.as_ref())?);
        }
        Ok(Self::expand(&stems, pairs))
    }

    fn expand(stems: &[PathBuf], pairs: &[InstrumentPair]) -> Self {
        let examples = stems
            .iter()
            .flat_map(|stem| {
                pairs.iter().map(move |pair| TrainingExample {
                    content: instrument_path(stem, pair.content),
                    timbre: instrument_path(stem, pair.timbre),
                })
            })
            .collect();
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&TrainingExample> {
        self.examples.get(idx)
    }

    pub fn examples(&self) -> &[TrainingExample] {
        &self.examples
    }
}
