use slog::{debug, error, info, warn, Logger};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use time::{OffsetDateTime, Weekday};

use crate::{
    create_backup, normalize_city, round_to, ArtifactMirror, CitiesTrained, HistoryError,
    HistoryRecord, HistoryStore, ModelError, ModelRegistry, TrainingEvent, TrainingMetrics,
    FEATURE_COLUMNS,
};

pub const TRAINING_WINDOW_DAYS: u32 = 60;

#[derive(thiserror::Error, Debug)]
pub enum TrainingError {
    #[error("No historical data available for training")]
    NoHistory,
    #[error("No historical data available for cities: {0}")]
    NoHistoryForCities(String),
    #[error("No usable feature vectors in history")]
    NoUsableSamples,
    #[error("Failed to fit online model: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to log training event: {0}")]
    Log(#[from] HistoryError),
}

/// Pooled feature rows and targets, in canonical column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingBatch {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
    pub cities: Vec<String>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Groups records by city, orders them by date and aligns each snapshot onto
/// `FEATURE_COLUMNS`. Gaps take the city's mean for that column, or 0.0.
pub fn build_training_batch(records: &[HistoryRecord], logger: &Logger) -> TrainingBatch {
    let mut by_city: BTreeMap<&str, Vec<&HistoryRecord>> = BTreeMap::new();
    for record in records {
        by_city.entry(record.city.as_str()).or_default().push(record);
    }

    let mut batch = TrainingBatch::default();
    for (city, mut city_records) in by_city {
        city_records.sort_by_key(|record| record.date);

        let mut partial_rows = vec![];
        for record in city_records {
            if !record.aqi.is_finite() {
                debug!(logger, "skipping {} on {}: AQI not finite", city, record.date);
                continue;
            }
            let snapshot = match record.snapshot() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(logger, "skipping {} on {}: bad weather data: {}", city, record.date, e);
                    continue;
                }
            };
            let row: Vec<Option<f64>> = FEATURE_COLUMNS
                .iter()
                .map(|column| snapshot.get(column))
                .collect();
            if row.iter().all(Option::is_none) {
                continue;
            }
            partial_rows.push((row, record.aqi));
        }
        if partial_rows.is_empty() {
            debug!(logger, "no usable records for {}", city);
            continue;
        }

        let fill = column_means(partial_rows.iter().map(|(row, _)| row.as_slice()));
        for (row, aqi) in partial_rows {
            let features = row
                .into_iter()
                .zip(&fill)
                .map(|(value, mean)| value.unwrap_or(*mean))
                .collect();
            batch.features.push(features);
            batch.targets.push(aqi);
        }
        batch.cities.push(city.to_owned());
    }
    batch
}

fn column_means<'a>(rows: impl Iterator<Item = &'a [Option<f64>]>) -> Vec<f64> {
    let mut totals = vec![(0.0, 0usize); FEATURE_COLUMNS.len()];
    for row in rows {
        for ((total, count), value) in totals.iter_mut().zip(row) {
            if let Some(value) = value {
                *total += value;
                *count += 1;
            }
        }
    }
    totals
        .into_iter()
        .map(|(total, count)| if count == 0 { 0.0 } else { total / count as f64 })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    pub metrics: TrainingMetrics,
    pub cities: Vec<String>,
    pub event: TrainingEvent,
    pub backup: Option<PathBuf>,
}

/// One COLLECT, FIT, PERSIST pass over the history. Holds nothing between runs.
pub struct TrainingCycle<'a> {
    pub store: &'a HistoryStore,
    pub registry: &'a mut ModelRegistry,
    pub mirror: &'a dyn ArtifactMirror,
    pub backup_dir: Option<&'a Path>,
    pub logger: &'a Logger,
}

impl TrainingCycle<'_> {
    pub fn run(
        self,
        cities: Option<&[String]>,
        now: OffsetDateTime,
    ) -> Result<TrainingOutcome, TrainingError> {
        let requested: Option<Vec<String>> = cities
            .filter(|cities| !cities.is_empty())
            .map(|cities| cities.iter().map(|city| normalize_city(city)).collect());

        let records: Vec<HistoryRecord> = self
            .store
            .query_as_of(None, TRAINING_WINDOW_DAYS, now.date())
            .into_iter()
            .filter(|record| {
                requested
                    .as_ref()
                    .map_or(true, |requested| requested.contains(&record.city))
            })
            .collect();
        if records.is_empty() {
            let e = match &requested {
                Some(requested) => TrainingError::NoHistoryForCities(requested.join(", ")),
                None => TrainingError::NoHistory,
            };
            error!(self.logger, "{}", e);
            return Err(e);
        }

        let batch = build_training_batch(&records, self.logger);
        if batch.is_empty() {
            error!(self.logger, "{}", TrainingError::NoUsableSamples);
            return Err(TrainingError::NoUsableSamples);
        }
        info!(
            self.logger,
            "training on {} samples from {} cities",
            batch.len(),
            batch.cities.len()
        );

        let mut candidate = self.registry.online().clone();
        let scaled = candidate.scaler.fit_transform(&batch.features)?;
        candidate.regressor.partial_fit(&scaled, &batch.targets)?;
        let predictions = candidate.regressor.predict(&scaled)?;
        let metrics = training_metrics(&predictions, &batch.targets);
        info!(
            self.logger,
            "training complete: mse {} mae {} samples {}",
            metrics.mse,
            metrics.mae,
            metrics.training_samples
        );

        self.registry.replace_online(candidate)?;
        let event = self.store.append_training_event(
            CitiesTrained::Only(batch.cities.clone()),
            Some(metrics),
            now,
        )?;

        self.mirror.mirror(self.store.layout().mirrored_files());

        let backup = match self.backup_dir {
            Some(dir) if now.weekday() == Weekday::Sunday => {
                match create_backup(self.store.layout(), dir, self.logger) {
                    Ok(archive) => {
                        info!(self.logger, "weekly backup created: {}", archive.display());
                        Some(archive)
                    }
                    Err(e) => {
                        error!(self.logger, "weekly backup failed: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(TrainingOutcome {
            metrics,
            cities: batch.cities,
            event,
            backup,
        })
    }
}

fn training_metrics(predictions: &[f64], targets: &[f64]) -> TrainingMetrics {
    let count = targets.len().max(1) as f64;
    let (squared, absolute) = predictions
        .iter()
        .zip(targets)
        .fold((0.0, 0.0), |(squared, absolute), (prediction, target)| {
            let diff = prediction - target;
            (squared + diff * diff, absolute + diff.abs())
        });
    TrainingMetrics {
        mse: round_to(squared / count, 4),
        mae: round_to(absolute / count, 4),
        training_samples: targets.len(),
    }
}
