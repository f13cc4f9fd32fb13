use std::sync::Arc;

use crate::helpers::{
    coordinates, quiet_mirror, weather_table, MockGeocoderAccess, MockRealtimeAccess,
    MockWeatherAccess, TestData,
};
use aqi_daemon::{
    classify_aqi, FallbackReason, Forecaster, ModelSlot, ModelState, WeatherError, WeatherTable,
    DEFAULT_FORECAST, DEFAULT_PREDICTED_AQI,
};
use time::{macros::date, Date, Duration};

const TODAY: Date = date!(2024 - 06 - 10);

fn forecaster(
    data: &TestData,
    geocoder: MockGeocoderAccess,
    weather: MockWeatherAccess,
    realtime: MockRealtimeAccess,
) -> Forecaster {
    Forecaster::new(
        Arc::new(geocoder),
        Arc::new(weather),
        Arc::new(realtime),
        data.spawn_writer(quiet_mirror()),
        data.logger.clone(),
    )
}

fn resolving_geocoder() -> MockGeocoderAccess {
    let mut geocoder = MockGeocoderAccess::new();
    geocoder.expect_resolve().returning(|_| Ok(coordinates()));
    geocoder
}

#[tokio::test]
async fn unknown_city_reports_failure_and_records_nothing() {
    let data = TestData::new();
    let mut geocoder = MockGeocoderAccess::new();
    geocoder
        .expect_resolve()
        .times(1)
        .returning(|city| Err(WeatherError::UnknownCity(city.to_owned())));
    let mut weather = MockWeatherAccess::new();
    weather.expect_fetch().times(0);
    let realtime = MockRealtimeAccess::new();

    let report = forecaster(&data, geocoder, weather, realtime)
        .run("Nowhere", TODAY)
        .await;

    assert!(!report.success);
    assert_eq!(report.reasons, vec![FallbackReason::UnknownCity]);
    assert!(report.forecast.is_empty());
    assert!(data.store().query_as_of(None, 30, TODAY).is_empty());
}

#[tokio::test]
async fn empty_weather_reports_no_weather_data() {
    let data = TestData::new();
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .times(1)
        .returning(|_, _, _| Ok(WeatherTable::default()));
    let mut realtime = MockRealtimeAccess::new();
    realtime.expect_fetch().times(0);

    let report = forecaster(&data, resolving_geocoder(), weather, realtime)
        .run("delhi", TODAY)
        .await;

    assert!(!report.success);
    assert_eq!(report.coordinates, Some(coordinates()));
    assert_eq!(report.reasons, vec![FallbackReason::NoWeatherData]);
    assert!(data.store().query_as_of(None, 30, TODAY).is_empty());
}

#[tokio::test]
async fn weather_is_requested_for_the_previous_week() {
    let data = TestData::new();
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .withf(|_, start, end| {
            *start == TODAY - Duration::days(7) && *end == TODAY - Duration::days(1)
        })
        .times(1)
        .returning(|_, _, _| Ok(WeatherTable::default()));

    forecaster(&data, resolving_geocoder(), weather, MockRealtimeAccess::new())
        .run("delhi", TODAY)
        .await;
}

#[tokio::test]
async fn realtime_value_is_recorded_and_forecast_has_three_days() {
    let data = TestData::new();
    let table = weather_table(TODAY, 7);
    let last_snapshot = table.last().unwrap().snapshot();
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .returning(move |_, _, _| Ok(table.clone()));
    let mut realtime = MockRealtimeAccess::new();
    realtime
        .expect_fetch()
        .withf(|city| city == "delhi")
        .returning(|_| Ok(Some(150.0)));

    let report = forecaster(&data, resolving_geocoder(), weather, realtime)
        .run("  Delhi ", TODAY)
        .await;

    assert!(report.success);
    assert_eq!(report.city, "delhi");
    assert_eq!(report.current_aqi, Some(150.0));
    assert_eq!(report.predicted_aqi, Some(DEFAULT_PREDICTED_AQI));
    assert!(report.reasons.contains(&FallbackReason::BatchModelUnavailable));
    assert!(!report.reasons.contains(&FallbackReason::RealtimeAqiUnavailable));
    assert_eq!(report.weather_snapshot, Some(last_snapshot.clone()));
    assert_eq!(report.forecast.len(), 3);
    for (index, day) in report.forecast.iter().enumerate() {
        assert_eq!(day.day as usize, index + 1);
        assert!((10.0..=500.0).contains(&day.aqi));
        assert_eq!(day.category, classify_aqi(day.aqi));
    }

    let records = data.store().query_as_of(None, 30, TODAY);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].city, "delhi");
    assert_eq!(records[0].date, TODAY);
    assert_eq!(records[0].aqi, 150.0);
    assert_eq!(records[0].snapshot().unwrap(), last_snapshot);
    assert!(data.layout.regressor_file(ModelSlot::Online).is_file());
    assert!(data.layout.scaler_file(ModelSlot::Online).is_file());
}

#[tokio::test]
async fn missing_realtime_value_records_the_prediction() {
    let data = TestData::new();
    let table = weather_table(TODAY, 3);
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .returning(move |_, _, _| Ok(table.clone()));
    let mut realtime = MockRealtimeAccess::new();
    realtime.expect_fetch().returning(|_| Ok(None));

    let report = forecaster(&data, resolving_geocoder(), weather, realtime)
        .run("pune", TODAY)
        .await;

    assert!(report.success);
    assert_eq!(report.current_aqi, None);
    assert!(report.reasons.contains(&FallbackReason::RealtimeAqiUnavailable));
    let records = data.store().query_as_of(Some("pune"), 30, TODAY);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].aqi, DEFAULT_PREDICTED_AQI);
}

#[tokio::test]
async fn realtime_provider_errors_are_not_fatal() {
    let data = TestData::new();
    let table = weather_table(TODAY, 7);
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .returning(move |_, _, _| Ok(table.clone()));
    let mut realtime = MockRealtimeAccess::new();
    realtime
        .expect_fetch()
        .returning(|_| Err(WeatherError::Status(503)));

    let report = forecaster(&data, resolving_geocoder(), weather, realtime)
        .run("jaipur", TODAY)
        .await;

    assert!(report.success);
    assert!(report.reasons.contains(&FallbackReason::RealtimeAqiUnavailable));
    assert_eq!(report.forecast.len(), 3);
}

#[tokio::test]
async fn online_update_failure_still_records_and_forecasts() {
    let data = TestData::new();
    let mut narrow = ModelState::default();
    narrow.learn_one(&[20.0, 50.0, 99.0, 0.5], 90.0).unwrap();
    narrow
        .save(
            &data.layout.regressor_file(ModelSlot::Online),
            &data.layout.scaler_file(ModelSlot::Online),
        )
        .unwrap();

    let table = weather_table(TODAY, 7);
    let mut weather = MockWeatherAccess::new();
    weather
        .expect_fetch()
        .returning(move |_, _, _| Ok(table.clone()));
    let mut realtime = MockRealtimeAccess::new();
    realtime.expect_fetch().returning(|_| Ok(Some(120.0)));

    let report = forecaster(&data, resolving_geocoder(), weather, realtime)
        .run("lucknow", TODAY)
        .await;

    assert!(report.success);
    assert!(report
        .reasons
        .iter()
        .any(|reason| matches!(reason, FallbackReason::OnlineUpdateFailed(_))));
    assert!(report.reasons.contains(&FallbackReason::DefaultFallback));
    let values: Vec<f64> = report.forecast.iter().map(|day| day.aqi).collect();
    assert_eq!(values, DEFAULT_FORECAST.to_vec());

    let records = data.store().query_as_of(Some("lucknow"), 30, TODAY);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].aqi, 120.0);
    let on_disk = ModelState::load(
        &data.layout.regressor_file(ModelSlot::Online),
        &data.layout.scaler_file(ModelSlot::Online),
    )
    .unwrap()
    .unwrap();
    assert_eq!(on_disk, narrow);
}
