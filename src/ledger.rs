//! Persistent set of unique keys already collected by a node.
//!
//! The ledger lives next to the node's output folder as
//! `<parent-of-output-folder>/<node_id>_unique_keys.csv`, one key per line.
//! It is loaded whole at run start and only ever appended to.

use crate::error::{AppError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

static NODE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^node\d+$").expect("node segment pattern is valid"));

/// Finds the first path segment of the form `node<digits>`.
pub(crate) fn node_id_from_path(output_dir: &Path) -> Result<String> {
    output_dir
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|segment| NODE_SEGMENT.is_match(segment))
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::Config(format!(
                "Output folder '{}' must contain a node identifier like 'node1', 'node2', etc.",
                output_dir.display()
            ))
        })
}

/// Location of the ledger for the node that owns `output_dir`.
pub(crate) fn ledger_path(output_dir: &Path, node_id: &str) -> PathBuf {
    let parent = output_dir.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}_unique_keys.csv", node_id))
}

/// In-memory view of a node's ledger plus the keys discovered since the last
/// commit.
#[derive(Debug)]
pub(crate) struct UniqueKeyLedger {
    path: PathBuf,
    known: HashSet<String>,
    pending: BTreeSet<String>,
}

impl UniqueKeyLedger {
    /// Loads the ledger file. A missing file is a deployment error: the run
    /// must not start without it, or dedup continuity across runs is lost.
    pub(crate) fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tracing::info!(target: "ledger_task", "Looking for ledger file '{}'.", path.display());

        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                tracing::error!(target: "ledger_task",
                    "Ledger file '{}' was not found. Stopping before collection.", path.display());
                AppError::Config(format!(
                    "The ledger file '{}' is required but was not found. Create it in the parent directory of the output folder.",
                    path.display()
                ))
            } else {
                AppError::Io(e)
            }
        })?;

        let known: HashSet<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        tracing::info!(target: "ledger_task",
            "Ledger '{}' loaded with {} unique keys.", path.display(), known.len());

        Ok(Self {
            path,
            known,
            pending: BTreeSet::new(),
        })
    }

    /// Resolves the node from `output_dir` and loads its ledger.
    pub(crate) fn load_for_output(output_dir: &Path) -> Result<(String, Self)> {
        let node_id = node_id_from_path(output_dir)?;
        tracing::info!(target: "ledger_task", "Node ID '{}' was found in the output path.", node_id);
        let ledger = Self::load(ledger_path(output_dir, &node_id))?;
        Ok((node_id, ledger))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.known.contains(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.known.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Records a key seen for the first time. Returns `false` if it was
    /// already known.
    pub(crate) fn insert(&mut self, key: String) -> bool {
        if !self.known.insert(key.clone()) {
            return false;
        }
        self.pending.insert(key);
        true
    }

    /// Appends `keys` to the ledger file in sorted order, one per line.
    /// Duplicate lines across calls are harmless because loading dedups.
    pub(crate) fn append<'a, I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut sorted: Vec<&String> = keys.into_iter().collect();
        if sorted.is_empty() {
            return Ok(0);
        }
        sorted.sort();
        sorted.dedup();

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for key in &sorted {
            writeln!(writer, "{}", key)?;
        }
        writer.flush()?;

        tracing::info!(target: "ledger_task",
            "Appended {} new unique keys to '{}'.", sorted.len(), self.path.display());
        Ok(sorted.len())
    }

    /// Appends the keys gathered since the last commit, then forgets them.
    /// On failure the pending set is kept so a later commit can retry.
    pub(crate) fn commit_pending(&mut self) -> Result<usize> {
        let written = self.append(self.pending.iter())?;
        self.pending.clear();
        Ok(written)
    }
}
