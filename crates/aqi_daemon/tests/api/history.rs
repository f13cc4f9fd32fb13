use crate::helpers::{snapshot, TestData};
use aqi_daemon::{
    normalize_date, CitiesTrained, HistoryError, TrainingMetrics, WeatherSnapshot,
    SNAPSHOT_SCHEMA_VERSION,
};
use std::fs;
use time::{
    macros::{date, datetime},
    Duration,
};

#[test]
fn upsert_twice_keeps_one_record_with_latest_value() {
    let data = TestData::new();
    let store = data.store();
    let day = date!(2024 - 03 - 10);

    store
        .upsert("Delhi", 120.0, &snapshot([30.0, 40.0, 99.0, 0.0, 2.0]), Some(day))
        .unwrap();
    store
        .upsert(" delhi ", 145.5, &snapshot([31.0, 41.0, 99.1, 0.2, 2.5]), Some(day))
        .unwrap();

    let records = store.query_as_of(None, 30, day);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].city, "delhi");
    assert_eq!(records[0].aqi, 145.5);
    assert_eq!(records[0].snapshot().unwrap().get("T2M"), Some(31.0));
}

#[test]
fn query_never_returns_records_older_than_window() {
    let data = TestData::new();
    let store = data.store();
    let today = date!(2024 - 03 - 31);
    for back in [0, 5, 10, 11, 40] {
        store
            .upsert(
                "pune",
                50.0,
                &snapshot([1.0, 2.0, 3.0, 4.0, 5.0]),
                Some(today - Duration::days(back)),
            )
            .unwrap();
    }

    let records = store.query_as_of(None, 10, today);
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|record| record.date >= today - Duration::days(10)));
}

#[test]
fn query_filters_by_case_folded_city() {
    let data = TestData::new();
    let store = data.store();
    let today = date!(2024 - 03 - 31);
    let weather = snapshot([1.0, 2.0, 3.0, 4.0, 5.0]);
    store.upsert("Mumbai", 70.0, &weather, Some(today)).unwrap();
    store.upsert("Chennai", 60.0, &weather, Some(today)).unwrap();

    let records = store.query_as_of(Some("MUMBAI"), 30, today);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].city, "mumbai");
}

#[test]
fn missing_history_file_is_empty() {
    let data = TestData::new();
    assert!(data.store().query(None, 30).is_empty());
}

#[test]
fn corrupt_history_file_reads_empty_and_next_write_starts_fresh() {
    let data = TestData::new();
    let store = data.store();
    fs::write(data.layout.history_file(), b"not a parquet file").unwrap();
    let today = date!(2024 - 03 - 31);

    assert!(store.query_as_of(None, 30, today).is_empty());

    store
        .upsert("jaipur", 90.0, &snapshot([1.0, 2.0, 3.0, 4.0, 5.0]), Some(today))
        .unwrap();
    assert_eq!(store.query_as_of(None, 30, today).len(), 1);
}

#[test]
fn snapshot_values_are_rounded_and_versioned() {
    let weather = WeatherSnapshot::from_pairs([("T2M", 31.256), ("RH2M", f64::NAN)]);
    assert_eq!(weather.schema_version, SNAPSHOT_SCHEMA_VERSION);
    assert_eq!(weather.get("T2M"), Some(31.26));
    assert_eq!(weather.get("RH2M"), None);

    let decoded = WeatherSnapshot::decode(&weather.encode().unwrap()).unwrap();
    assert_eq!(decoded, weather);
}

#[test]
fn legacy_snapshot_blob_decodes_as_version_zero() {
    let decoded = WeatherSnapshot::decode(r#"{"T2M": 28.4, "PS": 99.12, "note": "x"}"#).unwrap();
    assert_eq!(decoded.schema_version, 0);
    assert_eq!(decoded.get("T2M"), Some(28.4));
    assert_eq!(decoded.get("PS"), Some(99.12));
    assert_eq!(decoded.get("note"), None);
}

#[test]
fn dates_accept_dashed_and_compact_forms() {
    assert_eq!(normalize_date("2024-02-29").unwrap(), date!(2024 - 02 - 29));
    assert_eq!(normalize_date("20240229").unwrap(), date!(2024 - 02 - 29));
    assert!(matches!(
        normalize_date("29/02/2024"),
        Err(HistoryError::InvalidDate(_))
    ));
}

#[test]
fn training_events_append_in_order() {
    let data = TestData::new();
    let store = data.store();
    assert_eq!(store.last_training_time(), None);

    let first = datetime!(2024-03-30 02:00:00 UTC);
    let second = datetime!(2024-03-31 02:00:00 UTC);
    store
        .append_training_event(CitiesTrained::All, None, first)
        .unwrap();
    let metrics = TrainingMetrics {
        mse: 12.5,
        mae: 3.1,
        training_samples: 40,
    };
    store
        .append_training_event(
            CitiesTrained::Only(vec![String::from("delhi")]),
            Some(metrics),
            second,
        )
        .unwrap();

    let log = store.read_training_log();
    assert_eq!(log.training_events.len(), 2);
    assert_eq!(log.training_events[0].cities_trained, CitiesTrained::All);
    assert_eq!(log.training_events[0].metrics, None);
    assert_eq!(log.training_events[1].metrics, Some(metrics));
    assert_eq!(log.training_events[1].unix_time, second.unix_timestamp());
    assert_eq!(store.last_training_time(), Some(second));

    let raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(data.layout.training_log_file()).unwrap())
            .unwrap();
    assert_eq!(raw["training_events"][0]["cities_trained"], "all");
    assert_eq!(raw["training_events"][0]["metrics"], serde_json::json!({}));
}

#[test]
fn unreadable_training_log_is_treated_as_empty() {
    let data = TestData::new();
    let store = data.store();
    fs::write(data.layout.training_log_file(), b"{ not json").unwrap();

    assert!(store.read_training_log().training_events.is_empty());
    store
        .append_training_event(CitiesTrained::All, None, datetime!(2024-03-31 02:00:00 UTC))
        .unwrap();
    assert_eq!(store.read_training_log().training_events.len(), 1);
}
