use slog::{debug, error, info, Logger};
use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};
use time::{Date, OffsetDateTime};
use tokio::sync::{mpsc, oneshot};

use crate::{
    create_backup, forecast_next_3_days, restore_backup, ArtifactMirror, BackupError,
    ForecastOutcome, HistoryError, HistoryRecord, HistoryStore, ModelError, ModelRegistry,
    TrainingCycle, TrainingError, TrainingOutcome, WeatherSnapshot,
};

const QUEUE_DEPTH: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum WriterError {
    #[error("Store writer is no longer running")]
    Closed,
    #[error("History store failed: {0}")]
    Store(#[from] HistoryError),
    #[error("Model failed: {0}")]
    Model(#[from] ModelError),
    #[error("Training failed: {0}")]
    Training(#[from] TrainingError),
    #[error("Backup failed: {0}")]
    Backup(#[from] BackupError),
}

/// A realized AQI value and the weather row it was observed with.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub city: String,
    pub aqi: f64,
    pub snapshot: WeatherSnapshot,
    pub features: Vec<f64>,
    pub date: Date,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    RecordObservation(Observation, Reply<Result<HistoryRecord, WriterError>>),
    PredictBatch(Vec<f64>, Reply<Result<f64, ModelError>>),
    Forecast(Vec<Vec<f64>>, Reply<ForecastOutcome>),
    Train {
        cities: Option<Vec<String>>,
        now: OffsetDateTime,
        reply: Reply<Result<TrainingOutcome, TrainingError>>,
    },
    Query {
        city: Option<String>,
        days: u32,
        reply: Reply<Vec<HistoryRecord>>,
    },
    LastTrainingTime(Reply<Option<OffsetDateTime>>),
    Backup(PathBuf, Reply<Result<PathBuf, BackupError>>),
    Restore(PathBuf, Reply<bool>),
}

/// Sole owner of the history store and model registry. Commands are applied
/// one at a time on a dedicated thread, in the order they were sent.
pub struct StoreWriter {
    store: HistoryStore,
    registry: ModelRegistry,
    mirror: Arc<dyn ArtifactMirror>,
    backup_dir: Option<PathBuf>,
    logger: Logger,
}

impl StoreWriter {
    pub fn new(
        store: HistoryStore,
        registry: ModelRegistry,
        mirror: Arc<dyn ArtifactMirror>,
        backup_dir: Option<PathBuf>,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            registry,
            mirror,
            backup_dir,
            logger,
        }
    }

    /// The thread exits once every `WriterHandle` has been dropped.
    pub fn spawn(self) -> io::Result<(WriterHandle, JoinHandle<()>)> {
        let (sender, mut receiver) = mpsc::channel::<Command>(QUEUE_DEPTH);
        let join = thread::Builder::new()
            .name(String::from("store-writer"))
            .spawn(move || {
                let mut writer = self;
                info!(writer.logger, "store writer started");
                while let Some(command) = receiver.blocking_recv() {
                    writer.handle(command);
                }
                info!(writer.logger, "store writer stopped");
            })?;
        Ok((WriterHandle { sender }, join))
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RecordObservation(observation, reply) => {
                let _ = reply.send(self.record_observation(observation));
            }
            Command::PredictBatch(features, reply) => {
                let _ = reply.send(self.registry.predict_batch(&features));
            }
            Command::Forecast(rows, reply) => {
                let _ = reply.send(forecast_next_3_days(self.registry.online(), &rows));
            }
            Command::Train { cities, now, reply } => {
                let cycle = TrainingCycle {
                    store: &self.store,
                    registry: &mut self.registry,
                    mirror: self.mirror.as_ref(),
                    backup_dir: self.backup_dir.as_deref(),
                    logger: &self.logger,
                };
                let _ = reply.send(cycle.run(cities.as_deref(), now));
            }
            Command::Query { city, days, reply } => {
                let _ = reply.send(self.store.query(city.as_deref(), days));
            }
            Command::LastTrainingTime(reply) => {
                let _ = reply.send(self.store.last_training_time());
            }
            Command::Backup(dest, reply) => {
                let _ = reply.send(create_backup(self.store.layout(), &dest, &self.logger));
            }
            Command::Restore(archive, reply) => {
                let restored = restore_backup(self.store.layout(), &archive, &self.logger);
                if restored {
                    self.registry.reload();
                }
                let _ = reply.send(restored);
            }
        }
    }

    /// Upserts the observation, then runs one incremental step on the online model.
    fn record_observation(
        &mut self,
        observation: Observation,
    ) -> Result<HistoryRecord, WriterError> {
        let record = self.store.upsert(
            &observation.city,
            observation.aqi,
            &observation.snapshot,
            Some(observation.date),
        )?;

        let mut online = self.registry.online().clone();
        online.learn_one(&observation.features, observation.aqi)?;
        self.registry.replace_online(online).map_err(|e| {
            error!(self.logger, "error saving online model: {}", e);
            e
        })?;
        debug!(self.logger, "online model updated with {} = {}", record.city, record.aqi);
        Ok(record)
    }
}

/// Cloneable sender side of the store writer.
#[derive(Clone)]
pub struct WriterHandle {
    sender: mpsc::Sender<Command>,
}

impl WriterHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, WriterError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| WriterError::Closed)?;
        response.await.map_err(|_| WriterError::Closed)
    }

    pub async fn record_observation(
        &self,
        observation: Observation,
    ) -> Result<HistoryRecord, WriterError> {
        self.request(|reply| Command::RecordObservation(observation, reply))
            .await?
    }

    pub async fn predict_batch(&self, features: Vec<f64>) -> Result<f64, WriterError> {
        Ok(self
            .request(|reply| Command::PredictBatch(features, reply))
            .await??)
    }

    pub async fn forecast(&self, rows: Vec<Vec<f64>>) -> Result<ForecastOutcome, WriterError> {
        self.request(|reply| Command::Forecast(rows, reply)).await
    }

    pub async fn train(
        &self,
        cities: Option<Vec<String>>,
        now: OffsetDateTime,
    ) -> Result<TrainingOutcome, WriterError> {
        Ok(self
            .request(|reply| Command::Train { cities, now, reply })
            .await??)
    }

    pub async fn query(
        &self,
        city: Option<String>,
        days: u32,
    ) -> Result<Vec<HistoryRecord>, WriterError> {
        self.request(|reply| Command::Query { city, days, reply })
            .await
    }

    pub async fn last_training_time(&self) -> Result<Option<OffsetDateTime>, WriterError> {
        self.request(Command::LastTrainingTime).await
    }

    pub async fn backup(&self, dest: PathBuf) -> Result<PathBuf, WriterError> {
        Ok(self.request(|reply| Command::Backup(dest, reply)).await??)
    }

    pub async fn restore(&self, archive: PathBuf) -> Result<bool, WriterError> {
        self.request(|reply| Command::Restore(archive, reply)).await
    }
}
