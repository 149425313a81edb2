// ============================================================
// Layer 6 — Checkpoint Store
// ============================================================
// Saves and restores parameter snapshots as safetensors files,
// one per epoch, directly in the run directory:
//
//   <run_dir>/
//     model_epoch001.safetensors
//     model_epoch002.safetensors
//     ...
//
// Each file maps structural keys ("head.weight") to little-endian
// f32 tensors; the safetensors header metadata carries "epoch"
// and "architecture". Files are created with create_new, so an
// epoch once written can never be replaced.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use safetensors::{tensor::TensorView, Dtype, SafeTensors};

use crate::domain::architecture::Architecture;
use crate::domain::error::{FinetuneError, Result};
use crate::domain::run::Checkpoint;
use crate::ml::snapshot::{ParameterSnapshot, TensorRecord};

const PREFIX: &str = "model_epoch";
const SUFFIX: &str = ".safetensors";

pub fn checkpoint_file_name(epoch: usize) -> String {
    format!("{PREFIX}{epoch:03}{SUFFIX}")
}

fn parse_epoch(file_name: &str) -> Option<usize> {
    file_name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

/// Reads and writes the checkpoints of any run directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStore;

impl CheckpointStore {
    pub fn new() -> Self {
        Self
    }

    /// All checkpoints of a run, ordered by epoch.
    pub fn list(&self, run_dir: &Path) -> Result<Vec<Checkpoint>> {
        if !run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(run_dir).map_err(|e| FinetuneError::io(run_dir, e))? {
            let entry = entry.map_err(|e| FinetuneError::io(run_dir, e))?;
            let name  = entry.file_name();
            if let Some(epoch) = name.to_str().and_then(parse_epoch) {
                found.push(Checkpoint { run_dir: run_dir.to_path_buf(), epoch, path: entry.path() });
            }
        }
        found.sort_by_key(|c| c.epoch);
        Ok(found)
    }

    /// The checkpoint with the highest epoch.
    pub fn latest(&self, run_dir: &Path) -> Result<Checkpoint> {
        self.list(run_dir)?
            .pop()
            .ok_or_else(|| FinetuneError::NoCheckpointFound { run_dir: run_dir.to_path_buf() })
    }

    pub fn at(&self, run_dir: &Path, epoch: usize) -> Result<Checkpoint> {
        let path = run_dir.join(checkpoint_file_name(epoch));
        if !path.is_file() {
            return Err(FinetuneError::NoCheckpointFound { run_dir: run_dir.to_path_buf() });
        }
        Ok(Checkpoint { run_dir: run_dir.to_path_buf(), epoch, path })
    }

    /// Write `snapshot` as the checkpoint of `epoch`. Fails with
    /// `CheckpointExists` when that epoch was already saved.
    pub fn save(
        &self,
        snapshot:     &ParameterSnapshot,
        run_dir:      &Path,
        epoch:        usize,
        architecture: Architecture,
    ) -> Result<Checkpoint> {
        let path = run_dir.join(checkpoint_file_name(epoch));

        let buffers: Vec<(&str, Vec<u8>, Vec<usize>)> = snapshot
            .iter()
            .map(|(key, record)| (key, bytemuck::cast_slice(&record.values).to_vec(), record.shape.clone()))
            .collect();

        let mut views = Vec::with_capacity(buffers.len());
        for (key, bytes, shape) in &buffers {
            views.push((*key, TensorView::new(Dtype::F32, shape.clone(), bytes)?));
        }

        let mut metadata = HashMap::new();
        metadata.insert("epoch".to_string(), epoch.to_string());
        metadata.insert("architecture".to_string(), architecture.name().to_string());

        let bytes = safetensors::serialize(views.iter().map(|(k, v)| (*k, v)), &Some(metadata))?;

        fs::create_dir_all(run_dir).map_err(|e| FinetuneError::io(run_dir, e))?;
        write_exclusive(&path, |file| file.write_all(&bytes))?;

        tracing::debug!("Saved checkpoint: epoch {} → '{}'", epoch, path.display());
        Ok(Checkpoint { run_dir: run_dir.to_path_buf(), epoch, path })
    }

    pub fn load(&self, checkpoint: &Checkpoint) -> Result<ParameterSnapshot> {
        let path  = &checkpoint.path;
        let bytes = fs::read(path).map_err(|e| FinetuneError::io(path, e))?;
        let tensors = SafeTensors::deserialize(&bytes)?;

        let mut snapshot = ParameterSnapshot::new();
        for (key, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(malformed(path, format!("tensor '{key}' is {:?}, expected F32", view.dtype())));
            }
            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            snapshot.insert(key, TensorRecord::new(view.shape().to_vec(), values));
        }

        tracing::info!(
            "Loaded checkpoint epoch {} ({} tensors) from '{}'",
            checkpoint.epoch,
            snapshot.len(),
            path.display()
        );
        Ok(snapshot)
    }

    /// Header metadata of a checkpoint file.
    pub fn metadata(&self, checkpoint: &Checkpoint) -> Result<HashMap<String, String>> {
        let path  = &checkpoint.path;
        let bytes = fs::read(path).map_err(|e| FinetuneError::io(path, e))?;
        let (_, meta) = SafeTensors::read_metadata(&bytes)?;
        Ok(meta.metadata().clone().unwrap_or_default())
    }
}

/// Create `path` (never replacing an existing file) and fill it with
/// `write`. A failed write removes the partial file again, so a retry
/// of the same epoch is not blocked by a truncated checkpoint.
fn write_exclusive(path: &Path, write: impl FnOnce(&mut fs::File) -> io::Result<()>) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => FinetuneError::CheckpointExists { path: path.to_path_buf() },
            _ => FinetuneError::io(path, e),
        })?;

    if let Err(e) = write(&mut file).and_then(|_| file.sync_all()) {
        drop(file);
        if let Err(rm) = fs::remove_file(path) {
            tracing::warn!("Cannot remove partial checkpoint '{}': {}", path.display(), rm);
        }
        return Err(FinetuneError::io(path, e));
    }
    Ok(())
}

fn malformed(path: &PathBuf, reason: String) -> FinetuneError {
    FinetuneError::MalformedCheckpoint { path: path.clone(), reason }
}
