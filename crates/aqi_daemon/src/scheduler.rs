use slog::{error, info, Logger};
use std::time::Duration;
use time::{macros::time, OffsetDateTime, Time};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::{WriterError, WriterHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Time of day (UTC) of the recurring training cycle.
    pub daily_at: Time,
    pub startup_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            daily_at: time!(02:00),
            startup_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// First occurrence of `at` strictly after `now`.
pub fn next_daily_run(now: OffsetDateTime, at: Time) -> OffsetDateTime {
    let today = now.replace_time(at);
    if today > now {
        today
    } else {
        today + time::Duration::days(1)
    }
}

/// Tracks when the next daily cycle is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    daily_at: Time,
    next_run: OffsetDateTime,
}

impl SchedulerState {
    pub fn new(daily_at: Time, now: OffsetDateTime) -> Self {
        Self {
            daily_at,
            next_run: next_daily_run(now, daily_at),
        }
    }

    pub fn next_run(&self) -> OffsetDateTime {
        self.next_run
    }

    /// True once per daily slot; advances to the following slot when it fires.
    pub fn due(&mut self, now: OffsetDateTime) -> bool {
        if now < self.next_run {
            return false;
        }
        self.next_run = next_daily_run(now, self.daily_at);
        true
    }
}

/// Runs one cycle shortly after startup, then one per day. Never returns
/// unless the store writer goes away.
pub async fn run_scheduler(writer: WriterHandle, schedule: Schedule, logger: Logger) {
    info!(
        logger,
        "training scheduler started, daily at {} UTC", schedule.daily_at
    );
    let mut state = SchedulerState::new(schedule.daily_at, OffsetDateTime::now_utc());
    sleep(schedule.startup_delay).await;
    if !run_cycle(&writer, &logger).await {
        return;
    }

    let mut check_interval = interval(schedule.poll_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        check_interval.tick().await;
        if state.due(OffsetDateTime::now_utc()) {
            if !run_cycle(&writer, &logger).await {
                return;
            }
            info!(logger, "next training cycle at {}", state.next_run());
        }
    }
}

/// False when the writer is gone and the scheduler should stop.
async fn run_cycle(writer: &WriterHandle, logger: &Logger) -> bool {
    info!(logger, "running scheduled training cycle");
    match writer.train(None, OffsetDateTime::now_utc()).await {
        Ok(outcome) => {
            info!(
                logger,
                "scheduled training finished: {} samples, mse {}",
                outcome.metrics.training_samples,
                outcome.metrics.mse
            );
            true
        }
        Err(WriterError::Closed) => {
            error!(logger, "store writer closed, stopping scheduler");
            false
        }
        Err(e) => {
            error!(logger, "scheduled training failed: {}", e);
            true
        }
    }
}
