use serde::Serialize;
use slog::{debug, error, info, warn, Logger};
use std::{fmt, sync::Arc};
use time::{Date, Duration};

use crate::{
    normalize_city, Coordinates, Geocoder, ModelError, ModelState, Observation,
    RealtimeAqiProvider, WeatherProvider, WeatherSnapshot, WriterError, WriterHandle,
};

pub const FORECAST_DAYS: usize = 3;
pub const WEATHER_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_PREDICTED_AQI: f64 = 100.0;
pub const INSUFFICIENT_DATA_FORECAST: [f64; FORECAST_DAYS] = [110.0, 95.0, 85.0];
pub const DEFAULT_FORECAST: [f64; FORECAST_DAYS] = [80.0, 75.0, 70.0];
const SIMPLIFIED_DECAY: [f64; FORECAST_DAYS] = [1.0, 0.9, 0.85];
const PADDING_DECAY: f64 = 0.95;
const PADDING_SEED: f64 = 80.0;

/// Clamps a model output into a plausible AQI.
///
/// Negative values are mirrored, anything above 500 is capped, and values
/// under 10 are lifted with `10 + v % 40`. NaN maps to 10.
pub fn validate_aqi(value: f64) -> f64 {
    if value.is_nan() {
        return 10.0;
    }
    let mut value = value.abs();
    if value > 500.0 {
        value = 500.0;
    }
    if value < 10.0 {
        value = 10.0 + value % 40.0;
    }
    value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AqiCategory {
    Good,
    Satisfactory,
    Moderate,
    Poor,
    VeryPoor,
    Severe,
}

impl AqiCategory {
    pub fn label(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Satisfactory => "Satisfactory",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::Poor => "Poor",
            AqiCategory::VeryPoor => "Very Poor",
            AqiCategory::Severe => "Severe",
        }
    }

    pub fn advisory(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Air quality is considered satisfactory.",
            AqiCategory::Satisfactory => "Minor discomfort to sensitive people",
            AqiCategory::Moderate => {
                "May cause breathing discomfort to people with lung disease"
            }
            AqiCategory::Poor => "May cause discomfort to most people",
            AqiCategory::VeryPoor => "May cause respiratory issues",
            AqiCategory::Severe => {
                "Affects healthy people and seriously impacts those with existing diseases"
            }
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.label(), self.advisory())
    }
}

/// Upper bounds are inclusive: 50 is Good, 51 is Satisfactory.
pub fn classify_aqi(aqi: f64) -> AqiCategory {
    if aqi <= 50.0 {
        AqiCategory::Good
    } else if aqi <= 100.0 {
        AqiCategory::Satisfactory
    } else if aqi <= 200.0 {
        AqiCategory::Moderate
    } else if aqi <= 300.0 {
        AqiCategory::Poor
    } else if aqi <= 400.0 {
        AqiCategory::VeryPoor
    } else {
        AqiCategory::Severe
    }
}

/// Why part of a forecast report used a default instead of a computed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "code", content = "detail")]
pub enum FallbackReason {
    UnknownCity,
    NoWeatherData,
    BatchModelUnavailable,
    RealtimeAqiUnavailable,
    StorageError(String),
    OnlineUpdateFailed(String),
    InsufficientWeatherData,
    ModelFallback(String),
    DefaultFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastOutcome {
    pub values: Vec<f64>,
    pub reason: Option<FallbackReason>,
}

/// Predicts the next three days from the most recent (up to three) weather rows.
///
/// Always yields exactly three values in `[10, 500]`.
pub fn forecast_next_3_days(model: &ModelState, rows: &[Vec<f64>]) -> ForecastOutcome {
    let recent = &rows[rows.len().saturating_sub(FORECAST_DAYS)..];
    if recent.is_empty() {
        return ForecastOutcome {
            values: INSUFFICIENT_DATA_FORECAST.to_vec(),
            reason: Some(FallbackReason::InsufficientWeatherData),
        };
    }

    let (mut values, reason) = match model.predict_rows(recent) {
        Ok(predictions) => (
            predictions.into_iter().map(validate_aqi).collect::<Vec<_>>(),
            None,
        ),
        Err(e) => simplified_forecast(model, recent, e),
    };

    while values.len() < FORECAST_DAYS {
        let last = values.last().copied().unwrap_or(PADDING_SEED);
        values.push(validate_aqi(last * PADDING_DECAY));
    }
    ForecastOutcome { values, reason }
}

fn simplified_forecast(
    model: &ModelState,
    recent: &[Vec<f64>],
    cause: ModelError,
) -> (Vec<f64>, Option<FallbackReason>) {
    let base = recent
        .last()
        .ok_or(ModelError::EmptyBatch)
        .and_then(|row| model.predict_rows(std::slice::from_ref(row)))
        .and_then(|predictions| predictions.first().copied().ok_or(ModelError::EmptyBatch));
    match base {
        Ok(base) => {
            let base = validate_aqi(base);
            let values = SIMPLIFIED_DECAY
                .iter()
                .map(|decay| validate_aqi(base * decay))
                .collect();
            (values, Some(FallbackReason::ModelFallback(cause.to_string())))
        }
        Err(_) => (
            DEFAULT_FORECAST.to_vec(),
            Some(FallbackReason::DefaultFallback),
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyForecast {
    pub day: u32,
    pub aqi: f64,
    pub category: AqiCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastReport {
    pub city: String,
    pub coordinates: Option<Coordinates>,
    pub current_aqi: Option<f64>,
    pub predicted_aqi: Option<f64>,
    pub category: Option<AqiCategory>,
    pub forecast: Vec<DailyForecast>,
    pub weather_snapshot: Option<WeatherSnapshot>,
    pub reasons: Vec<FallbackReason>,
    pub success: bool,
}

impl ForecastReport {
    fn new(city: String) -> Self {
        Self {
            city,
            coordinates: None,
            current_aqi: None,
            predicted_aqi: None,
            category: None,
            forecast: vec![],
            weather_snapshot: None,
            reasons: vec![],
            success: false,
        }
    }
}

/// Runs the on-request forecast: geocode, weather, predict, record, learn, forecast.
pub struct Forecaster {
    geocoder: Arc<dyn Geocoder>,
    weather: Arc<dyn WeatherProvider>,
    realtime: Arc<dyn RealtimeAqiProvider>,
    writer: WriterHandle,
    logger: Logger,
}

impl Forecaster {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        weather: Arc<dyn WeatherProvider>,
        realtime: Arc<dyn RealtimeAqiProvider>,
        writer: WriterHandle,
        logger: Logger,
    ) -> Self {
        Self {
            geocoder,
            weather,
            realtime,
            writer,
            logger,
        }
    }

    pub async fn run(&self, city: &str, today: Date) -> ForecastReport {
        let city = normalize_city(city);
        let mut report = ForecastReport::new(city.clone());

        let coordinates = match self.geocoder.resolve(&city).await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                warn!(self.logger, "unable to geocode {}: {}", city, e);
                report.reasons.push(FallbackReason::UnknownCity);
                return report;
            }
        };
        info!(
            self.logger,
            "{} coords: ({}, {})", city, coordinates.latitude, coordinates.longitude
        );
        report.coordinates = Some(coordinates);

        let start = today.saturating_sub(Duration::days(WEATHER_WINDOW_DAYS));
        let end = today.saturating_sub(Duration::days(1));
        let table = match self.weather.fetch(coordinates, start, end).await {
            Ok(table) => table,
            Err(e) => {
                error!(self.logger, "error fetching weather for {}: {}", city, e);
                report.reasons.push(FallbackReason::NoWeatherData);
                return report;
            }
        };
        let Some(last_row) = table.last() else {
            warn!(self.logger, "weather data not available for {} to {}", start, end);
            report.reasons.push(FallbackReason::NoWeatherData);
            return report;
        };
        let snapshot = last_row.snapshot();
        let last_features = last_row.features();
        report.weather_snapshot = Some(snapshot.clone());

        let predicted_aqi = match self.writer.predict_batch(last_features.clone()).await {
            Ok(prediction) => prediction,
            Err(e) => {
                warn!(self.logger, "batch model unavailable, using default: {}", e);
                report.reasons.push(FallbackReason::BatchModelUnavailable);
                DEFAULT_PREDICTED_AQI
            }
        };
        report.predicted_aqi = Some(predicted_aqi);
        report.category = Some(classify_aqi(predicted_aqi));
        info!(self.logger, "predicted AQI today for {}: {}", city, predicted_aqi);

        let current_aqi = match self.realtime.fetch(&city).await {
            Ok(current) => current,
            Err(e) => {
                warn!(self.logger, "error fetching realtime AQI for {}: {}", city, e);
                None
            }
        };
        if current_aqi.is_none() {
            report.reasons.push(FallbackReason::RealtimeAqiUnavailable);
        }
        report.current_aqi = current_aqi;

        let observation = Observation {
            city: city.clone(),
            aqi: current_aqi.unwrap_or(predicted_aqi),
            snapshot,
            features: last_features,
            date: today,
        };
        if let Err(e) = self.writer.record_observation(observation).await {
            error!(self.logger, "error recording observation for {}: {}", city, e);
            report.reasons.push(observation_failure(e));
        }

        let outcome = match self.writer.forecast(table.feature_rows()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(self.logger, "store writer unavailable for forecast: {}", e);
                ForecastOutcome {
                    values: DEFAULT_FORECAST.to_vec(),
                    reason: Some(FallbackReason::DefaultFallback),
                }
            }
        };
        if let Some(reason) = outcome.reason {
            report.reasons.push(reason);
        }
        report.forecast = outcome
            .values
            .into_iter()
            .zip(1..)
            .map(|(aqi, day)| DailyForecast {
                day,
                aqi,
                category: classify_aqi(aqi),
            })
            .collect();
        for day in &report.forecast {
            debug!(self.logger, "day +{}: AQI = {:.2} -> {}", day.day, day.aqi, day.category);
        }

        report.success = true;
        report
    }
}

fn observation_failure(error: WriterError) -> FallbackReason {
    match error {
        WriterError::Model(ModelError::Io(e)) => FallbackReason::StorageError(e.to_string()),
        WriterError::Model(ModelError::Encode(e)) => FallbackReason::StorageError(e.to_string()),
        WriterError::Model(e) => FallbackReason::OnlineUpdateFailed(e.to_string()),
        e => FallbackReason::StorageError(e.to_string()),
    }
}
