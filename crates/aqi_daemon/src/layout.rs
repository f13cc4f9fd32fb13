use slog::Logger;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{create_folder, ModelSlot};

pub const MODELS_DIR: &str = "models";
pub const HISTORY_DIR: &str = "historical_data";
pub const HISTORY_FILE: &str = "aqi_history.parquet";
pub const TRAINING_LOG_FILE: &str = "training_log.json";
pub const MODEL_EXTENSIONS: &[&str] = &["bin"];
pub const DATA_EXTENSIONS: &[&str] = &["parquet", "json"];

/// A local file paired with the path it is mirrored to remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFile {
    pub local: PathBuf,
    pub remote: String,
}

/// Where every persisted artifact lives under the data folder.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    pub fn history_file(&self) -> PathBuf {
        self.history_dir().join(HISTORY_FILE)
    }

    pub fn training_log_file(&self) -> PathBuf {
        self.history_dir().join(TRAINING_LOG_FILE)
    }

    pub fn regressor_file(&self, slot: ModelSlot) -> PathBuf {
        self.models_dir()
            .join(format!("{}_model.{}", slot.name(), MODEL_EXTENSIONS[0]))
    }

    pub fn scaler_file(&self, slot: ModelSlot) -> PathBuf {
        self.models_dir()
            .join(format!("{}_scaler.{}", slot.name(), MODEL_EXTENSIONS[0]))
    }

    pub fn ensure(&self, logger: &Logger) -> io::Result<()> {
        create_folder(&self.models_dir(), logger)?;
        create_folder(&self.history_dir(), logger)?;
        Ok(())
    }

    /// Files kept durable on the remote store: the online model pair and the history files.
    pub fn mirrored_files(&self) -> Vec<MirrorFile> {
        let model_files = [
            self.regressor_file(ModelSlot::Online),
            self.scaler_file(ModelSlot::Online),
        ];
        let data_files = [self.history_file(), self.training_log_file()];

        let models = model_files.into_iter().map(|local| mirror_entry(MODELS_DIR, local));
        let data = data_files.into_iter().map(|local| mirror_entry(HISTORY_DIR, local));
        models.chain(data).collect()
    }
}

fn mirror_entry(remote_dir: &str, local: PathBuf) -> MirrorFile {
    let file_name = local
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    MirrorFile {
        remote: format!("{}/{}", remote_dir, file_name),
        local,
    }
}

/// Top-level files in `dir` whose extension is one of `extensions`, sorted by name.
/// A missing folder has no files.
pub fn list_files_with_extensions(dir: &Path, extensions: &[&str]) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }
    let mut files = vec![];
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|extension| extension.to_str())
            .map(|extension| extensions.contains(&extension))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
