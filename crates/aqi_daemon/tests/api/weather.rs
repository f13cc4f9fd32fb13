use aqi_daemon::{parse_waqi_response, WeatherTable, FEATURE_COLUMNS, MISSING_SENTINEL};
use std::collections::{BTreeMap, HashMap};
use time::macros::date;

fn parameters(days: &[(&str, [f64; 5])]) -> HashMap<String, BTreeMap<String, f64>> {
    let mut parameters: HashMap<String, BTreeMap<String, f64>> = HashMap::new();
    for (day, values) in days {
        for (column, value) in FEATURE_COLUMNS.iter().zip(values) {
            parameters
                .entry(column.to_string())
                .or_default()
                .insert(day.to_string(), *value);
        }
    }
    parameters
}

#[test]
fn sentinel_rows_are_dropped_and_rows_sorted() {
    let table = WeatherTable::from_parameters(&parameters(&[
        ("20240605", [30.0, 40.0, 99.0, 0.0, 2.0]),
        ("20240603", [28.0, 42.0, 99.1, 0.4, 2.2]),
        ("20240604", [29.0, MISSING_SENTINEL, 99.2, 0.1, 2.4]),
    ]));

    assert_eq!(table.len(), 2);
    let dates: Vec<_> = table.rows().iter().map(|row| row.date).collect();
    assert_eq!(dates, vec![date!(2024 - 06 - 03), date!(2024 - 06 - 05)]);
    assert_eq!(table.last().unwrap().values, [30.0, 40.0, 99.0, 0.0, 2.0]);
    assert_eq!(table.feature_rows()[0], vec![28.0, 42.0, 99.1, 0.4, 2.2]);
}

#[test]
fn days_missing_a_column_are_dropped() {
    let mut parameters = parameters(&[("20240605", [30.0, 40.0, 99.0, 0.0, 2.0])]);
    parameters
        .get_mut("T2M")
        .unwrap()
        .insert(String::from("20240606"), 31.0);

    let table = WeatherTable::from_parameters(&parameters);
    assert_eq!(table.len(), 1);
}

#[test]
fn empty_parameters_make_an_empty_table() {
    let table = WeatherTable::from_parameters(&HashMap::new());
    assert!(table.is_empty());
    assert!(table.last().is_none());
}

#[test]
fn row_snapshot_is_named_and_rounded() {
    let table = WeatherTable::from_parameters(&parameters(&[(
        "20240605",
        [30.456, 40.0, 99.0, 0.004, 2.0],
    )]));
    let snapshot = table.last().unwrap().snapshot();
    assert_eq!(snapshot.get("T2M"), Some(30.46));
    assert_eq!(snapshot.get("PRECTOTCORR"), Some(0.0));
    assert_eq!(snapshot.fields.len(), FEATURE_COLUMNS.len());
}

#[test]
fn waqi_response_parsing() {
    let ok = r#"{"status": "ok", "data": {"aqi": 152, "idx": 1}}"#;
    assert_eq!(parse_waqi_response(ok).unwrap(), Some(152.0));

    let no_reading = r#"{"status": "ok", "data": {"aqi": "-"}}"#;
    assert_eq!(parse_waqi_response(no_reading).unwrap(), None);

    let unknown = r#"{"status": "error", "data": "Unknown station"}"#;
    assert_eq!(parse_waqi_response(unknown).unwrap(), None);

    assert!(parse_waqi_response("<html>").is_err());
}
