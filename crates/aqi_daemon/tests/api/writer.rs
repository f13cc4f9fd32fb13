use std::sync::Arc;

use crate::helpers::{quiet_mirror, seed_history, snapshot, MockMirrorAccess, TestData};
use aqi_daemon::{
    forecast_next_3_days, HistoryStore, ModelRegistry, ModelSlot, ModelState, Observation,
    StoreWriter, WriterError,
};
use time::{macros::date, OffsetDateTime};

fn observation(city: &str, aqi: f64, shift: f64) -> Observation {
    let values = [25.0 + shift, 45.0 - shift, 99.0, 0.1 * shift, 2.0];
    Observation {
        city: city.to_owned(),
        aqi,
        snapshot: snapshot(values),
        features: values.to_vec(),
        date: date!(2024 - 06 - 10),
    }
}

#[tokio::test]
async fn concurrent_observations_are_all_kept() {
    let data = TestData::new();
    let writer = data.spawn_writer(quiet_mirror());

    let mut tasks = vec![];
    for index in 0..20 {
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            writer
                .record_observation(observation(
                    &format!("city{}", index),
                    60.0 + index as f64,
                    index as f64,
                ))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let records = data.store().query_as_of(None, 30, date!(2024 - 06 - 10));
    assert_eq!(records.len(), 20);
}

#[tokio::test]
async fn batch_prediction_without_batch_model_is_an_error() {
    let data = TestData::new();
    let writer = data.spawn_writer(quiet_mirror());

    let result = writer.predict_batch(vec![1.0, 2.0, 3.0, 4.0, 5.0]).await;
    assert!(matches!(result, Err(WriterError::Model(_))));
}

#[tokio::test]
async fn batch_model_on_disk_is_used_for_predictions() {
    let data = TestData::new();
    let mut batch = ModelState::default();
    for _ in 0..10 {
        batch.learn_one(&[1.0, 2.0, 3.0, 4.0, 5.0], 90.0).unwrap();
    }
    batch
        .save(
            &data.layout.regressor_file(ModelSlot::Batch),
            &data.layout.scaler_file(ModelSlot::Batch),
        )
        .unwrap();
    let writer = data.spawn_writer(quiet_mirror());

    let expected = batch.predict_rows(&[vec![1.0, 2.0, 3.0, 4.0, 5.0]]).unwrap()[0];
    let predicted = writer
        .predict_batch(vec![1.0, 2.0, 3.0, 4.0, 5.0])
        .await
        .unwrap();
    assert_eq!(predicted, expected);
}

#[tokio::test]
async fn restore_reloads_the_online_model() {
    let data = TestData::new();
    let writer = data.spawn_writer(quiet_mirror());
    let rows = vec![vec![26.0, 44.0, 99.0, 0.1, 2.0]];

    writer
        .record_observation(observation("delhi", 120.0, 1.0))
        .await
        .unwrap();
    let archive = writer
        .backup(data.dir.path().join("backups"))
        .await
        .unwrap();
    let backed_up = ModelState::load(
        &data.layout.regressor_file(ModelSlot::Online),
        &data.layout.scaler_file(ModelSlot::Online),
    )
    .unwrap()
    .unwrap();

    writer
        .record_observation(observation("delhi", 400.0, 3.0))
        .await
        .unwrap();
    let drifted = writer.forecast(rows.clone()).await.unwrap();

    assert!(writer.restore(archive).await.unwrap());
    let restored = writer.forecast(rows.clone()).await.unwrap();

    assert_eq!(restored, forecast_next_3_days(&backed_up, &rows));
    assert_ne!(restored, drifted);
}

#[tokio::test]
async fn train_runs_through_the_writer_and_mirrors() {
    let data = TestData::new();
    let now = OffsetDateTime::now_utc();
    seed_history(&data.store(), &["delhi"], 5, now.date());
    let mut mirror = MockMirrorAccess::new();
    mirror.expect_mirror().times(1).returning(|_| ());
    let writer = data.spawn_writer(Arc::new(mirror));

    let outcome = writer.train(None, now).await.unwrap();
    assert_eq!(outcome.metrics.training_samples, 5);
    assert_eq!(writer.last_training_time().await.unwrap(), Some(now));
    assert_eq!(writer.query(Some(String::from("delhi")), 30).await.unwrap().len(), 5);
}

#[tokio::test]
async fn train_failure_is_reported_not_raised() {
    let data = TestData::new();
    let writer = data.spawn_writer(quiet_mirror());

    let result = writer.train(None, OffsetDateTime::now_utc()).await;
    assert!(matches!(result, Err(WriterError::Training(_))));
    assert_eq!(writer.last_training_time().await.unwrap(), None);
}

#[test]
fn writer_thread_stops_when_handles_drop() {
    let data = TestData::new();
    let (handle, thread) = StoreWriter::new(
        HistoryStore::new(data.layout.clone(), data.logger.clone()),
        ModelRegistry::load(data.layout.clone(), data.logger.clone()),
        quiet_mirror(),
        None,
        data.logger.clone(),
    )
    .spawn()
    .unwrap();

    drop(handle);
    thread.join().unwrap();
}
