use anyhow::anyhow;
use aqi_daemon::{
    get_config_info, get_log_level, run_scheduler, setup_logger, Command, DataLayout, Forecaster,
    HistoryStore, Mirror, ModelRegistry, NasaPowerProvider, NominatimGeocoder, StoreWriter,
    WaqiProvider,
};
use slog::{error, info};
use std::{path::PathBuf, sync::Arc};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = get_config_info()?;
    let settings = cli.settings;
    let logger = setup_logger(get_log_level(&settings));

    let layout = DataLayout::new(settings.data_dir());
    layout.ensure(&logger)?;
    let mirror = Arc::new(Mirror::from_settings(&settings, logger.clone()));

    if let Command::Pull = cli.command {
        let pulled = mirror.pull(&layout).await;
        info!(logger, "pulled {} files into {}", pulled, layout.root().display());
        return Ok(());
    }

    let store = HistoryStore::new(layout.clone(), logger.clone());
    let registry = ModelRegistry::load(layout.clone(), logger.clone());
    let (writer, writer_thread) = StoreWriter::new(
        store,
        registry,
        mirror.clone(),
        Some(settings.backup_dir()),
        logger.clone(),
    )
    .spawn()?;

    let result = match cli.command {
        Command::Run => {
            let schedule = settings.schedule()?;
            tokio::select! {
                _ = run_scheduler(writer.clone(), schedule, logger.clone()) => {},
                _ = shutdown_signal() => {
                    info!(logger, "shutdown signal received");
                },
            }
            Ok(())
        }
        Command::Forecast { city } => {
            let forecaster = Forecaster::new(
                Arc::new(NominatimGeocoder::new(logger.clone())?),
                Arc::new(NasaPowerProvider::new(logger.clone())?),
                Arc::new(WaqiProvider::new(settings.waqi_token.clone(), logger.clone())?),
                writer.clone(),
                logger.clone(),
            );
            let report = forecaster
                .run(&city, OffsetDateTime::now_utc().date())
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Train { cities } => {
            let cities = (!cities.is_empty()).then_some(cities);
            writer
                .train(cities, OffsetDateTime::now_utc())
                .await
                .map(|outcome| {
                    println!(
                        "trained on {} samples from [{}]: mse {}, mae {}",
                        outcome.metrics.training_samples,
                        outcome.cities.join(", "),
                        outcome.metrics.mse,
                        outcome.metrics.mae
                    );
                })
                .map_err(anyhow::Error::from)
        }
        Command::History { city, days } => {
            let records = writer.query(city, days).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Command::Status => {
            match writer.last_training_time().await? {
                Some(trained_at) => println!("last trained at {}", trained_at.format(&Rfc3339)?),
                None => println!("online model has never been trained"),
            }
            Ok(())
        }
        Command::Backup { dest } => {
            let dest = dest.map(PathBuf::from).unwrap_or(settings.backup_dir());
            let archive = writer.backup(dest).await?;
            println!("{}", archive.display());
            Ok(())
        }
        Command::Restore { archive } => {
            if writer.restore(PathBuf::from(&archive)).await? {
                Ok(())
            } else {
                Err(anyhow!("unable to restore backup {}", archive))
            }
        }
        Command::Pull => Ok(()),
    };

    mirror.flush().await;
    drop(writer);
    if writer_thread.join().is_err() {
        error!(logger, "store writer thread panicked");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                eprintln!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
