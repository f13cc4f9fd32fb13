use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use std::collections::{BTreeMap, HashMap};
use time::{macros::format_description, Date};

use crate::{normalize_date, WeatherSnapshot};

/// Daily variables requested from the weather provider, in model input order.
pub const FEATURE_COLUMNS: [&str; 5] = ["T2M", "RH2M", "PS", "PRECTOTCORR", "WS2M"];
/// Provider value meaning "no reading".
pub const MISSING_SENTINEL: f64 = -999.0;

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";
const NASA_POWER_URL: &str = "https://power.larc.nasa.gov/api/temporal/daily/point";
const WAQI_URL: &str = "https://api.waqi.info/feed";

#[derive(thiserror::Error, Debug)]
pub enum WeatherError {
    #[error("Failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("Failed to send request: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("Failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Failed to format date: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Unable to resolve city: {0}")]
    UnknownCity(String),
    #[error("Provider responded with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherRow {
    pub date: Date,
    pub values: [f64; FEATURE_COLUMNS.len()],
}

impl WeatherRow {
    pub fn features(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    pub fn snapshot(&self) -> WeatherSnapshot {
        WeatherSnapshot::from_pairs(FEATURE_COLUMNS.iter().copied().zip(self.values))
    }
}

/// Daily weather rows ordered by date, with incomplete days removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherTable {
    rows: Vec<WeatherRow>,
}

impl WeatherTable {
    pub fn new(mut rows: Vec<WeatherRow>) -> Self {
        rows.sort_by_key(|row| row.date);
        Self { rows }
    }

    /// Builds rows from `{column: {YYYYMMDD: value}}`. A day is dropped when any
    /// column is missing, carries the sentinel, or is not finite.
    pub fn from_parameters(parameters: &HashMap<String, BTreeMap<String, f64>>) -> Self {
        let mut days: BTreeMap<String, [Option<f64>; FEATURE_COLUMNS.len()]> = BTreeMap::new();
        for (index, column) in FEATURE_COLUMNS.iter().enumerate() {
            let Some(series) = parameters.get(*column) else {
                continue;
            };
            for (day, value) in series {
                days.entry(day.clone()).or_default()[index] = Some(*value);
            }
        }

        let rows = days
            .into_iter()
            .filter_map(|(day, values)| {
                let date = normalize_date(&day).ok()?;
                let mut complete = [0.0; FEATURE_COLUMNS.len()];
                for (slot, value) in complete.iter_mut().zip(values) {
                    let value = value?;
                    if value == MISSING_SENTINEL || !value.is_finite() {
                        return None;
                    }
                    *slot = value;
                }
                Some(WeatherRow {
                    date,
                    values: complete,
                })
            })
            .collect();
        WeatherTable::new(rows)
    }

    pub fn rows(&self) -> &[WeatherRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn last(&self) -> Option<&WeatherRow> {
        self.rows.last()
    }

    pub fn feature_rows(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(WeatherRow::features).collect()
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, city: &str) -> Result<Coordinates, WeatherError>;
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn fetch(
        &self,
        coordinates: Coordinates,
        start: Date,
        end: Date,
    ) -> Result<WeatherTable, WeatherError>;
}

#[async_trait]
pub trait RealtimeAqiProvider: Send + Sync {
    /// `Ok(None)` when the provider has no current reading for the city.
    async fn fetch(&self, city: &str) -> Result<Option<f64>, WeatherError>;
}

pub fn build_client(user_agent: &str) -> Result<ClientWithMiddleware, WeatherError> {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = ClientBuilder::new(Client::builder().user_agent(user_agent).build()?)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build();
    Ok(client)
}

async fn fetch_text(
    logger: &Logger,
    request: reqwest_middleware::RequestBuilder,
) -> Result<String, WeatherError> {
    let response = request.send().await?;
    let status = response.status();
    debug!(logger, "provider responded: {}", status);
    if !status.is_success() {
        return Err(WeatherError::Status(status.as_u16()));
    }
    Ok(response.text().await?)
}

pub struct NominatimGeocoder {
    client: ClientWithMiddleware,
    logger: Logger,
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(logger: Logger) -> Result<Self, WeatherError> {
        Ok(Self {
            client: build_client("aqi_forecast_app")?,
            logger,
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn resolve(&self, city: &str) -> Result<Coordinates, WeatherError> {
        let request = self
            .client
            .get(NOMINATIM_URL)
            .query(&[("q", city), ("format", "json"), ("limit", "1")]);
        let body = fetch_text(&self.logger, request).await?;
        let places: Vec<NominatimPlace> = serde_json::from_str(&body)?;
        let place = places
            .first()
            .ok_or_else(|| WeatherError::UnknownCity(city.to_owned()))?;
        let latitude = place.lat.parse::<f64>();
        let longitude = place.lon.parse::<f64>();
        match (latitude, longitude) {
            (Ok(latitude), Ok(longitude)) => Ok(Coordinates {
                latitude,
                longitude,
            }),
            _ => Err(WeatherError::UnknownCity(city.to_owned())),
        }
    }
}

pub struct NasaPowerProvider {
    client: ClientWithMiddleware,
    logger: Logger,
}

#[derive(Deserialize)]
struct PowerResponse {
    properties: Option<PowerProperties>,
}

#[derive(Deserialize)]
struct PowerProperties {
    parameter: Option<HashMap<String, BTreeMap<String, f64>>>,
}

impl NasaPowerProvider {
    pub fn new(logger: Logger) -> Result<Self, WeatherError> {
        Ok(Self {
            client: build_client("aqi_forecast_app")?,
            logger,
        })
    }
}

#[async_trait]
impl WeatherProvider for NasaPowerProvider {
    async fn fetch(
        &self,
        coordinates: Coordinates,
        start: Date,
        end: Date,
    ) -> Result<WeatherTable, WeatherError> {
        let format = format_description!("[year][month][day]");
        let parameters = FEATURE_COLUMNS.join(",");
        let request = self.client.get(NASA_POWER_URL).query(&[
            ("parameters", parameters),
            ("community", String::from("SB")),
            ("longitude", coordinates.longitude.to_string()),
            ("latitude", coordinates.latitude.to_string()),
            ("start", start.format(&format)?),
            ("end", end.format(&format)?),
            ("format", String::from("JSON")),
        ]);
        let body = fetch_text(&self.logger, request).await?;
        let response: PowerResponse = serde_json::from_str(&body)?;
        let Some(parameters) = response.properties.and_then(|p| p.parameter) else {
            return Ok(WeatherTable::default());
        };
        let table = WeatherTable::from_parameters(&parameters);
        debug!(self.logger, "weather rows after cleaning: {}", table.len());
        Ok(table)
    }
}

/// Realtime AQI from the WAQI feed. Without a token every lookup is `None`.
pub struct WaqiProvider {
    client: ClientWithMiddleware,
    token: Option<String>,
    logger: Logger,
}

impl WaqiProvider {
    pub fn new(token: Option<String>, logger: Logger) -> Result<Self, WeatherError> {
        Ok(Self {
            client: build_client("aqi_forecast_app")?,
            token,
            logger,
        })
    }
}

#[async_trait]
impl RealtimeAqiProvider for WaqiProvider {
    async fn fetch(&self, city: &str) -> Result<Option<f64>, WeatherError> {
        let Some(token) = &self.token else {
            return Ok(None);
        };
        let url = format!("{}/{}/", WAQI_URL, city);
        let request = self.client.get(url).query(&[("token", token.as_str())]);
        let body = fetch_text(&self.logger, request).await?;
        Ok(parse_waqi_response(&body)?)
    }
}

/// The feed reports `"aqi": "-"` when a station has no reading.
pub fn parse_waqi_response(body: &str) -> Result<Option<f64>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if value.get("status").and_then(|status| status.as_str()) != Some("ok") {
        return Ok(None);
    }
    Ok(value
        .get("data")
        .and_then(|data| data.get("aqi"))
        .and_then(|aqi| aqi.as_f64()))
}
