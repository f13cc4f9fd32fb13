use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    create_folder, list_files_with_extensions, DataLayout, DATA_EXTENSIONS, HISTORY_DIR,
    MODELS_DIR, MODEL_EXTENSIONS,
};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BACKUP_PREFIX: &str = "aqi_forecast_backup_";

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("Failed to access backup files: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to read or write archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Failed to encode manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Backup archive not found: {0}")]
    MissingArchive(String),
    #[error("Invalid backup: manifest.json not found")]
    MissingManifest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupManifest {
    pub timestamp: String,
    pub datetime: String,
    pub unix_time: i64,
    pub model_files: usize,
    pub data_files: usize,
}

/// Zips the models and history into `<dest>/aqi_forecast_backup_<ts>.zip`.
pub fn create_backup(
    layout: &DataLayout,
    dest: &Path,
    logger: &Logger,
) -> Result<PathBuf, BackupError> {
    create_folder(dest, logger)?;
    let now = OffsetDateTime::now_utc();
    let timestamp = now.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let name = format!("{}{}", BACKUP_PREFIX, timestamp);
    let staging = dest.join(&name);
    let archive = dest.join(format!("{}.zip", name));

    let result = stage_and_zip(layout, &staging, &archive, now, timestamp);
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(&staging) {
            error!(logger, "unable to remove staging folder {}: {}", staging.display(), e);
        }
    }
    let manifest = result?;
    info!(
        logger,
        "backup created: {} (models: {}, data files: {})",
        archive.display(),
        manifest.model_files,
        manifest.data_files
    );
    Ok(archive)
}

fn stage_and_zip(
    layout: &DataLayout,
    staging: &Path,
    archive: &Path,
    now: OffsetDateTime,
    timestamp: String,
) -> Result<BackupManifest, BackupError> {
    let model_files = copy_matching(
        &layout.models_dir(),
        &staging.join(MODELS_DIR),
        MODEL_EXTENSIONS,
    )?;
    let data_files = copy_matching(
        &layout.history_dir(),
        &staging.join(HISTORY_DIR),
        DATA_EXTENSIONS,
    )?;

    let manifest = BackupManifest {
        timestamp,
        datetime: now.format(&Rfc3339)?,
        unix_time: now.unix_timestamp(),
        model_files,
        data_files,
    };
    fs::write(
        staging.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest)?,
    )?;

    zip_folder(staging, archive)?;
    Ok(manifest)
}

/// Copies top-level files with a matching extension, creating `to` first.
fn copy_matching(from: &Path, to: &Path, extensions: &[&str]) -> Result<usize, BackupError> {
    fs::create_dir_all(to)?;
    let files = list_files_with_extensions(from, extensions)?;
    for file in &files {
        if let Some(name) = file.file_name() {
            fs::copy(file, to.join(name))?;
        }
    }
    Ok(files.len())
}

fn zip_folder(folder: &Path, archive: &Path) -> Result<(), BackupError> {
    let mut zip = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut entries = vec![];
    collect_files(folder, folder, &mut entries)?;
    entries.sort();
    for (name, path) in entries {
        zip.start_file(name, options)?;
        zip.write_all(&fs::read(path)?)?;
    }
    zip.finish()?;
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    entries: &mut Vec<(String, PathBuf)>,
) -> Result<(), BackupError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, entries)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            entries.push((name, path));
        }
    }
    Ok(())
}

/// Restores models and history from `archive`. Every failure is logged and
/// reported as `false`; nothing is overwritten unless the manifest is present.
pub fn restore_backup(layout: &DataLayout, archive: &Path, logger: &Logger) -> bool {
    match try_restore(layout, archive, logger) {
        Ok(manifest) => {
            info!(
                logger,
                "backup restored from {} (models: {}, data files: {})",
                if manifest.datetime.is_empty() {
                    "unknown date"
                } else {
                    manifest.datetime.as_str()
                },
                manifest.model_files,
                manifest.data_files
            );
            true
        }
        Err(e) => {
            error!(logger, "error restoring backup {}: {}", archive.display(), e);
            false
        }
    }
}

fn try_restore(
    layout: &DataLayout,
    archive: &Path,
    logger: &Logger,
) -> Result<BackupManifest, BackupError> {
    if !archive.is_file() {
        return Err(BackupError::MissingArchive(archive.display().to_string()));
    }
    let parent = archive
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    // removed on drop, including on every early return below
    let extract_dir = tempfile::Builder::new()
        .prefix("temp_restore")
        .tempdir_in(parent)?;
    unzip_to_dir(archive, extract_dir.path())?;

    let manifest_path = extract_dir.path().join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(BackupError::MissingManifest);
    }
    let manifest: BackupManifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;

    let model_files = copy_matching(
        &extract_dir.path().join(MODELS_DIR),
        &layout.models_dir(),
        MODEL_EXTENSIONS,
    )?;
    let data_files = copy_matching(
        &extract_dir.path().join(HISTORY_DIR),
        &layout.history_dir(),
        DATA_EXTENSIONS,
    )?;
    info!(logger, "restored {} model files and {} data files", model_files, data_files);

    Ok(BackupManifest {
        model_files,
        data_files,
        ..manifest
    })
}

fn unzip_to_dir(archive: &Path, dest: &Path) -> Result<(), BackupError> {
    let mut archive = ZipArchive::new(File::open(archive)?)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => continue,
        };
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&outpath)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}
