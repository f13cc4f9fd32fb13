use crate::helpers::TestData;
use aqi_daemon::{list_files_with_extensions, ModelSlot, MODEL_EXTENSIONS};
use std::fs;

#[test]
fn ensure_creates_model_and_history_folders() {
    let data = TestData::new();
    assert!(data.layout.models_dir().is_dir());
    assert!(data.layout.history_dir().is_dir());
    // a second call is a no-op
    data.layout.ensure(&data.logger).unwrap();
}

#[test]
fn model_files_are_named_by_slot() {
    let data = TestData::new();
    let online = data.layout.regressor_file(ModelSlot::Online);
    let batch_scaler = data.layout.scaler_file(ModelSlot::Batch);
    assert_eq!(online.file_name().unwrap(), "online_model.bin");
    assert_eq!(batch_scaler.file_name().unwrap(), "batch_scaler.bin");
    assert!(online.starts_with(data.layout.models_dir()));
}

#[test]
fn mirrored_files_cover_online_model_and_history() {
    let data = TestData::new();
    let remotes: Vec<String> = data
        .layout
        .mirrored_files()
        .into_iter()
        .map(|file| file.remote)
        .collect();
    assert_eq!(
        remotes,
        vec![
            "models/online_model.bin",
            "models/online_scaler.bin",
            "historical_data/aqi_history.parquet",
            "historical_data/training_log.json",
        ]
    );
}

#[test]
fn listing_filters_by_extension_and_skips_folders() {
    let data = TestData::new();
    let models = data.layout.models_dir();
    fs::write(models.join("b.bin"), b"b").unwrap();
    fs::write(models.join("a.bin"), b"a").unwrap();
    fs::write(models.join("readme.md"), b"r").unwrap();
    fs::create_dir(models.join("nested.bin")).unwrap();

    let files = list_files_with_extensions(&models, MODEL_EXTENSIONS).unwrap();
    assert_eq!(files, vec![models.join("a.bin"), models.join("b.bin")]);
    assert!(list_files_with_extensions(&data.dir.path().join("missing"), MODEL_EXTENSIONS)
        .unwrap()
        .is_empty());
}
