use serde::{Deserialize, Serialize};
use slog::{error, info, warn, Logger};
use std::{fs, path::Path};

use crate::{write_atomic, DataLayout};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("Scaler has not been fit")]
    ScalerNotFit,
    #[error("Regressor has not been fit")]
    RegressorNotFit,
    #[error("Expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Cannot fit on an empty batch")]
    EmptyBatch,
    #[error("Got {features} feature rows for {targets} targets")]
    LengthMismatch { features: usize, targets: usize },
    #[error("Regressor weights diverged")]
    Diverged,
    #[error("Failed to access model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode model: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSlot {
    Batch,
    Online,
}

impl ModelSlot {
    pub fn name(&self) -> &'static str {
        match self {
            ModelSlot::Batch => "batch",
            ModelSlot::Online => "online",
        }
    }
}

/// Standardizes features to zero mean and unit variance.
///
/// Starts `Unfit`; the first fit moves it to `Fit` and it only goes back by
/// being replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum StandardScaler {
    #[default]
    Unfit,
    Fit {
        mean: Vec<f64>,
        scale: Vec<f64>,
        samples: usize,
    },
}

impl StandardScaler {
    pub fn is_fit(&self) -> bool {
        matches!(self, StandardScaler::Fit { .. })
    }

    pub fn n_features(&self) -> Option<usize> {
        match self {
            StandardScaler::Unfit => None,
            StandardScaler::Fit { mean, .. } => Some(mean.len()),
        }
    }

    pub fn fit(rows: &[Vec<f64>]) -> Result<Self, ModelError> {
        let width = batch_width(rows)?;
        let count = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            for (total, value) in mean.iter_mut().zip(row) {
                *total += value;
            }
        }
        mean.iter_mut().for_each(|total| *total /= count);

        let mut variance = vec![0.0; width];
        for row in rows {
            for ((total, value), center) in variance.iter_mut().zip(row).zip(&mean) {
                *total += (value - center).powi(2);
            }
        }
        // constant columns keep a unit scale so they transform to zero
        let scale = variance
            .into_iter()
            .map(|total| {
                let std_dev = (total / count).sqrt();
                if std_dev > f64::EPSILON {
                    std_dev
                } else {
                    1.0
                }
            })
            .collect();

        Ok(StandardScaler::Fit {
            mean,
            scale,
            samples: rows.len(),
        })
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ModelError> {
        let StandardScaler::Fit { mean, scale, .. } = self else {
            return Err(ModelError::ScalerNotFit);
        };
        rows.iter()
            .map(|row| {
                if row.len() != mean.len() {
                    return Err(ModelError::DimensionMismatch {
                        expected: mean.len(),
                        actual: row.len(),
                    });
                }
                Ok(row
                    .iter()
                    .zip(mean)
                    .zip(scale)
                    .map(|((value, center), spread)| (value - center) / spread)
                    .collect())
            })
            .collect()
    }

    /// Refits from scratch on `rows`, discarding any previous fit.
    pub fn fit_transform(&mut self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ModelError> {
        *self = StandardScaler::fit(rows)?;
        self.transform(rows)
    }

    /// Transforms with the current fit, fitting on `rows` first when unfit.
    pub fn transform_or_fit(&mut self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ModelError> {
        if self.is_fit() {
            self.transform(rows)
        } else {
            self.fit_transform(rows)
        }
    }
}

/// Linear regressor trained by stochastic gradient descent on squared loss
/// with an L2 penalty and an inverse-scaling learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdRegressor {
    weights: Vec<f64>,
    intercept: f64,
    eta0: f64,
    power_t: f64,
    alpha: f64,
    t: f64,
    fitted: bool,
}

impl Default for SgdRegressor {
    fn default() -> Self {
        Self {
            weights: vec![],
            intercept: 0.0,
            eta0: 0.01,
            power_t: 0.25,
            alpha: 0.0001,
            t: 1.0,
            fitted: false,
        }
    }
}

impl SgdRegressor {
    pub fn is_fit(&self) -> bool {
        self.fitted
    }

    pub fn n_features(&self) -> Option<usize> {
        self.fitted.then_some(self.weights.len())
    }

    /// One pass over the batch. Leaves `self` untouched on error.
    pub fn partial_fit(&mut self, rows: &[Vec<f64>], targets: &[f64]) -> Result<(), ModelError> {
        if rows.len() != targets.len() {
            return Err(ModelError::LengthMismatch {
                features: rows.len(),
                targets: targets.len(),
            });
        }
        let width = batch_width(rows)?;
        if self.fitted && width != self.weights.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.weights.len(),
                actual: width,
            });
        }

        let mut next = self.clone();
        if !next.fitted {
            next.weights = vec![0.0; width];
            next.intercept = 0.0;
        }
        for (row, target) in rows.iter().zip(targets) {
            let eta = next.eta0 / next.t.powf(next.power_t);
            let gradient = next.raw_predict(row) - target;
            for (weight, value) in next.weights.iter_mut().zip(row) {
                *weight = *weight * (1.0 - eta * next.alpha) - eta * gradient * value;
            }
            next.intercept -= eta * gradient;
            next.t += 1.0;
        }
        if !next.intercept.is_finite() || next.weights.iter().any(|weight| !weight.is_finite()) {
            return Err(ModelError::Diverged);
        }
        next.fitted = true;
        *self = next;
        Ok(())
    }

    pub fn predict_one(&self, row: &[f64]) -> Result<f64, ModelError> {
        if !self.fitted {
            return Err(ModelError::RegressorNotFit);
        }
        if row.len() != self.weights.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.weights.len(),
                actual: row.len(),
            });
        }
        Ok(self.raw_predict(row))
    }

    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        rows.iter().map(|row| self.predict_one(row)).collect()
    }

    fn raw_predict(&self, row: &[f64]) -> f64 {
        self.weights
            .iter()
            .zip(row)
            .map(|(weight, value)| weight * value)
            .sum::<f64>()
            + self.intercept
    }
}

fn batch_width(rows: &[Vec<f64>]) -> Result<usize, ModelError> {
    let first = rows.first().ok_or(ModelError::EmptyBatch)?;
    let width = first.len();
    if width == 0 {
        return Err(ModelError::EmptyBatch);
    }
    if let Some(row) = rows.iter().find(|row| row.len() != width) {
        return Err(ModelError::DimensionMismatch {
            expected: width,
            actual: row.len(),
        });
    }
    Ok(width)
}

/// A regressor together with the scaler its inputs go through.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelState {
    pub regressor: SgdRegressor,
    pub scaler: StandardScaler,
}

impl ModelState {
    pub fn predict_rows(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        let scaled = self.scaler.transform(rows)?;
        if let (Some(expected), Some(actual)) =
            (self.regressor.n_features(), self.scaler.n_features())
        {
            if expected != actual {
                return Err(ModelError::DimensionMismatch { expected, actual });
            }
        }
        self.regressor.predict(&scaled)
    }

    /// Single-observation incremental update.
    pub fn learn_one(&mut self, features: &[f64], target: f64) -> Result<(), ModelError> {
        let mut next = self.clone();
        let scaled = next.scaler.transform_or_fit(&[features.to_vec()])?;
        next.regressor.partial_fit(&scaled, &[target])?;
        *self = next;
        Ok(())
    }

    /// `Ok(None)` when either file of the pair is missing.
    pub fn load(regressor_path: &Path, scaler_path: &Path) -> Result<Option<Self>, ModelError> {
        if !regressor_path.is_file() || !scaler_path.is_file() {
            return Ok(None);
        }
        let regressor: SgdRegressor = bincode::deserialize(&fs::read(regressor_path)?)?;
        let scaler: StandardScaler = bincode::deserialize(&fs::read(scaler_path)?)?;
        Ok(Some(Self { regressor, scaler }))
    }

    pub fn save(&self, regressor_path: &Path, scaler_path: &Path) -> Result<(), ModelError> {
        let regressor = bincode::serialize(&self.regressor)?;
        let scaler = bincode::serialize(&self.scaler)?;
        write_atomic(regressor_path, &regressor)?;
        write_atomic(scaler_path, &scaler)?;
        Ok(())
    }
}

/// Owns the batch and online model pairs for the life of the process.
pub struct ModelRegistry {
    layout: DataLayout,
    batch: Option<ModelState>,
    online: ModelState,
    logger: Logger,
}

impl ModelRegistry {
    pub fn load(layout: DataLayout, logger: Logger) -> Self {
        let online = match ModelState::load(
            &layout.regressor_file(ModelSlot::Online),
            &layout.scaler_file(ModelSlot::Online),
        ) {
            Ok(Some(state)) => {
                info!(logger, "loaded existing online model and scaler");
                state
            }
            Ok(None) => {
                info!(logger, "no online model on disk, starting a new one");
                ModelState::default()
            }
            Err(e) => {
                error!(logger, "error loading online model, starting a new one: {}", e);
                ModelState::default()
            }
        };

        let batch = match ModelState::load(
            &layout.regressor_file(ModelSlot::Batch),
            &layout.scaler_file(ModelSlot::Batch),
        ) {
            Ok(Some(state)) => Some(state),
            Ok(None) => {
                warn!(logger, "no batch model on disk, batch predictions will use defaults");
                None
            }
            Err(e) => {
                error!(logger, "error loading batch model: {}", e);
                None
            }
        };

        Self {
            layout,
            batch,
            online,
            logger,
        }
    }

    /// Rereads both pairs from disk, e.g. after a restore replaced the files.
    pub fn reload(&mut self) {
        *self = ModelRegistry::load(self.layout.clone(), self.logger.clone());
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn online(&self) -> &ModelState {
        &self.online
    }

    pub fn predict_batch(&self, features: &[f64]) -> Result<f64, ModelError> {
        let batch = self.batch.as_ref().ok_or(ModelError::RegressorNotFit)?;
        let predictions = batch.predict_rows(&[features.to_vec()])?;
        predictions.first().copied().ok_or(ModelError::EmptyBatch)
    }

    /// Persists `state` as the online model, swapping it in only after the write succeeds.
    pub fn replace_online(&mut self, state: ModelState) -> Result<(), ModelError> {
        state.save(
            &self.layout.regressor_file(ModelSlot::Online),
            &self.layout.scaler_file(ModelSlot::Online),
        )?;
        self.online = state;
        Ok(())
    }
}
