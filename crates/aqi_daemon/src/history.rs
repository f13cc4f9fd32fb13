use parquet::{
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
        writer::SerializedFileWriter,
    },
    record::{RecordReader, RecordWriter},
};
use parquet_derive::{ParquetRecordReader, ParquetRecordWriter};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use slog::{debug, error, info, warn, Logger};
use std::{fs::File, sync::Arc};
use time::{macros::format_description, Date, Duration, OffsetDateTime};

use crate::{calendar_date, round_to, utc_datetime, write_atomic, DataLayout};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("Failed to access history file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to read or write parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to format date: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Invalid date `{0}`, expected YYYY-MM-DD or YYYYMMDD")]
    InvalidDate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotField {
    pub name: String,
    pub value: f64,
}

/// Named weather features captured alongside an AQI value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub schema_version: u32,
    pub fields: Vec<SnapshotField>,
}

impl Default for WeatherSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            fields: vec![],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSnapshot {
    Versioned(WeatherSnapshot),
    // flat {"T2M": 31.2, ...} blobs written before snapshots carried a version
    Legacy(serde_json::Map<String, serde_json::Value>),
}

impl WeatherSnapshot {
    /// Values are rounded to two decimals; non-finite values are dropped.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let fields = pairs
            .into_iter()
            .filter(|(_, value)| value.is_finite())
            .map(|(name, value)| SnapshotField {
                name: name.to_owned(),
                value: round_to(value, 2),
            })
            .collect();
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            fields,
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| field.value)
            .filter(|value| value.is_finite())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(blob: &str) -> Result<Self, serde_json::Error> {
        let snapshot = match serde_json::from_str::<StoredSnapshot>(blob)? {
            StoredSnapshot::Versioned(snapshot) => snapshot,
            StoredSnapshot::Legacy(map) => WeatherSnapshot {
                schema_version: 0,
                fields: map
                    .into_iter()
                    .filter_map(|(name, value)| {
                        value.as_f64().map(|value| SnapshotField { name, value })
                    })
                    .collect(),
            },
        };
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, Default, ParquetRecordWriter, ParquetRecordReader)]
struct HistoryRow {
    date: String,
    city: String,
    aqi: f64,
    weather_data: String,
}

/// One AQI observation for a (date, city) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(with = "calendar_date")]
    pub date: Date,
    pub city: String,
    pub aqi: f64,
    pub weather_data: String,
}

impl HistoryRecord {
    pub fn snapshot(&self) -> Result<WeatherSnapshot, serde_json::Error> {
        WeatherSnapshot::decode(&self.weather_data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub mse: f64,
    pub mae: f64,
    pub training_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredCities {
    Listed(Vec<String>),
    Label(String),
}

/// Which cities a training event covered; stored as a list or the label "all".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredCities", into = "StoredCities")]
pub enum CitiesTrained {
    All,
    Only(Vec<String>),
}

impl From<StoredCities> for CitiesTrained {
    fn from(value: StoredCities) -> Self {
        match value {
            StoredCities::Listed(cities) => CitiesTrained::Only(cities),
            StoredCities::Label(_) => CitiesTrained::All,
        }
    }
}

impl From<CitiesTrained> for StoredCities {
    fn from(value: CitiesTrained) -> Self {
        match value {
            CitiesTrained::All => StoredCities::Label(String::from("all")),
            CitiesTrained::Only(cities) => StoredCities::Listed(cities),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEvent {
    #[serde(with = "utc_datetime")]
    pub timestamp: OffsetDateTime,
    pub unix_time: i64,
    pub cities_trained: CitiesTrained,
    #[serde(
        default,
        serialize_with = "serialize_metrics",
        deserialize_with = "deserialize_metrics"
    )]
    pub metrics: Option<TrainingMetrics>,
}

// events without metrics are stored as `{}`
fn serialize_metrics<S>(value: &Option<TrainingMetrics>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(metrics) => metrics.serialize(serializer),
        None => serde_json::Map::new().serialize(serializer),
    }
}

fn deserialize_metrics<'de, D>(deserializer: D) -> Result<Option<TrainingMetrics>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match &value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) if map.is_empty() => Ok(None),
        _ => serde_json::from_value(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    pub training_events: Vec<TrainingEvent>,
}

pub fn normalize_city(city: &str) -> String {
    city.trim().to_lowercase()
}

pub fn normalize_date(input: &str) -> Result<Date, HistoryError> {
    let trimmed = input.trim();
    let dashed = if trimmed.len() == 8 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("{}-{}-{}", &trimmed[..4], &trimmed[4..6], &trimmed[6..])
    } else {
        trimmed.to_owned()
    };
    let format = format_description!("[year]-[month]-[day]");
    Date::parse(&dashed, &format).map_err(|_| HistoryError::InvalidDate(input.to_owned()))
}

fn format_date(date: Date) -> Result<String, HistoryError> {
    let format = format_description!("[year]-[month]-[day]");
    Ok(date.format(&format)?)
}

/// The ledger of daily AQI observations plus the training event log.
#[derive(Clone)]
pub struct HistoryStore {
    layout: DataLayout,
    logger: Logger,
}

impl HistoryStore {
    pub fn new(layout: DataLayout, logger: Logger) -> Self {
        Self { layout, logger }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Writes the record for (date, city), replacing any existing one.
    /// `date` defaults to today (UTC).
    pub fn upsert(
        &self,
        city: &str,
        aqi: f64,
        snapshot: &WeatherSnapshot,
        date: Option<Date>,
    ) -> Result<HistoryRecord, HistoryError> {
        let date = date.unwrap_or_else(|| OffsetDateTime::now_utc().date());
        let row = HistoryRow {
            date: format_date(date)?,
            city: normalize_city(city),
            aqi,
            weather_data: snapshot.encode()?,
        };

        let mut rows = match self.read_rows() {
            Ok(rows) => rows,
            Err(e) => {
                error!(self.logger, "error reading history file, starting fresh: {}", e);
                vec![]
            }
        };
        match rows
            .iter_mut()
            .find(|existing| existing.date == row.date && existing.city == row.city)
        {
            Some(existing) => {
                existing.aqi = row.aqi;
                existing.weather_data = row.weather_data.clone();
            }
            None => rows.push(row.clone()),
        }
        self.write_rows(&rows)?;
        info!(self.logger, "saved AQI data for {} on {}", row.city, row.date);

        Ok(HistoryRecord {
            date,
            city: row.city,
            aqi: row.aqi,
            weather_data: row.weather_data,
        })
    }

    pub fn query(&self, city: Option<&str>, days: u32) -> Vec<HistoryRecord> {
        self.query_as_of(city, days, OffsetDateTime::now_utc().date())
    }

    /// Records dated on or after `today - days`, optionally for a single city.
    pub fn query_as_of(&self, city: Option<&str>, days: u32, today: Date) -> Vec<HistoryRecord> {
        let rows = match self.read_rows() {
            Ok(rows) => rows,
            Err(e) => {
                error!(self.logger, "error reading historical data: {}", e);
                return vec![];
            }
        };
        let cutoff = today.saturating_sub(Duration::days(i64::from(days)));
        let city = city.map(normalize_city);

        rows.into_iter()
            .filter_map(|row| match normalize_date(&row.date) {
                Ok(date) => Some(HistoryRecord {
                    date,
                    city: row.city,
                    aqi: row.aqi,
                    weather_data: row.weather_data,
                }),
                Err(e) => {
                    warn!(self.logger, "skipping history row: {}", e);
                    None
                }
            })
            .filter(|record| record.date >= cutoff)
            .filter(|record| city.as_ref().map_or(true, |city| &record.city == city))
            .collect()
    }

    pub fn read_training_log(&self) -> TrainingLog {
        let path = self.layout.training_log_file();
        if !path.is_file() {
            return TrainingLog::default();
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(HistoryError::from)
            .and_then(|content| Ok(serde_json::from_str::<TrainingLog>(&content)?));
        match parsed {
            Ok(log) => log,
            Err(e) => {
                warn!(self.logger, "training log unreadable, treating it as empty: {}", e);
                TrainingLog::default()
            }
        }
    }

    pub fn append_training_event(
        &self,
        cities: CitiesTrained,
        metrics: Option<TrainingMetrics>,
        timestamp: OffsetDateTime,
    ) -> Result<TrainingEvent, HistoryError> {
        let mut log = self.read_training_log();
        let event = TrainingEvent {
            timestamp,
            unix_time: timestamp.unix_timestamp(),
            cities_trained: cities,
            metrics,
        };
        log.training_events.push(event.clone());
        let content = serde_json::to_vec_pretty(&log)?;
        write_atomic(&self.layout.training_log_file(), &content)?;
        info!(self.logger, "logged training event at {}", event.timestamp);
        Ok(event)
    }

    pub fn last_training_time(&self) -> Option<OffsetDateTime> {
        self.read_training_log()
            .training_events
            .last()
            .map(|event| event.timestamp)
    }

    fn read_rows(&self) -> Result<Vec<HistoryRow>, HistoryError> {
        let path = self.layout.history_file();
        if !path.is_file() {
            return Ok(vec![]);
        }
        let reader = SerializedFileReader::new(File::open(&path)?)?;
        let mut rows = vec![];
        for index in 0..reader.num_row_groups() {
            let num_rows = reader.metadata().row_group(index).num_rows() as usize;
            let mut row_group = reader.get_row_group(index)?;
            // the derived reader fills from the front, so each group gets its own buffer
            let mut group_rows: Vec<HistoryRow> = Vec::with_capacity(num_rows);
            group_rows.read_from_row_group(&mut *row_group, num_rows)?;
            rows.extend(group_rows);
        }
        debug!(self.logger, "read {} history rows from {}", rows.len(), path.display());
        Ok(rows)
    }

    fn write_rows(&self, rows: &[HistoryRow]) -> Result<(), HistoryError> {
        let path = self.layout.history_file();
        let buffer = encode_rows(rows)?;
        write_atomic(&path, &buffer)?;
        Ok(())
    }
}

fn encode_rows(rows: &[HistoryRow]) -> Result<Vec<u8>, HistoryError> {
    let schema = rows.schema()?;
    let props = WriterProperties::builder().build();
    let mut buffer = vec![];
    let mut writer = SerializedFileWriter::new(&mut buffer, schema, Arc::new(props))?;
    if !rows.is_empty() {
        let mut row_group = writer.next_row_group()?;
        rows.write_to_row_group(&mut row_group)?;
        row_group.close()?;
    }
    writer.close()?;
    Ok(buffer)
}
