use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use slog::{info, o, Drain, Level, Logger};
use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};
use time::{macros::format_description, Time};

use crate::Schedule;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the store writer and the training scheduler until interrupted
    Run,
    /// Forecast the next three days of AQI for a city
    Forecast { city: String },
    /// Run one training cycle over the stored history
    Train {
        /// Restrict training to these cities (repeatable)
        #[arg(long = "city")]
        cities: Vec<String>,
    },
    /// Print stored history records as json
    History {
        #[arg(long)]
        city: Option<String>,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Show when the online model was last trained
    Status,
    /// Package models and history into a zip archive
    Backup {
        /// Folder to write the archive into (default: backup_dir)
        #[arg(long)]
        dest: Option<String>,
    },
    /// Restore models and history from a backup archive
    Restore { archive: String },
    /// Download mirrored artifacts into the data folder
    Pull,
}

#[derive(Args, Clone, Debug, Default, Deserialize)]
pub struct Settings {
    /// Path to Settings.toml file holding the rest of the options
    #[arg(short, long, global = true)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Set the log level (default: info)
    #[arg(short, long, global = true)]
    pub level: Option<String>,

    /// Folder holding models/ and historical_data/ (default: ./data)
    #[arg(short, long, global = true)]
    pub data_dir: Option<String>,

    /// Folder backup archives are written to (default: ~/aqi_forecast_backups)
    #[arg(long, global = true)]
    pub backup_dir: Option<String>,

    /// Daily training time in UTC as HH:MM (default: 02:00)
    #[arg(long, global = true)]
    pub train_at: Option<String>,

    /// Seconds to wait before the startup training cycle (default: 10)
    #[arg(long, global = true)]
    pub startup_delay_secs: Option<u64>,

    /// Seconds between schedule checks (default: 60)
    #[arg(long, global = true)]
    pub poll_secs: Option<u64>,

    /// Token for the WAQI realtime feed, realtime AQI is skipped without it
    #[arg(long, env = "WAQI_API_KEY", global = true, hide_env_values = true)]
    pub waqi_token: Option<String>,

    /// Token for mirroring artifacts to github, mirroring is disabled without it
    #[arg(long, env = "GITHUB_TOKEN", global = true, hide_env_values = true)]
    pub github_token: Option<String>,

    /// Repository artifacts are mirrored to, as owner/name
    #[arg(long, env = "GITHUB_REPO", global = true)]
    pub github_repo: Option<String>,
}

impl Settings {
    /// Values already set (command line or env) win over the file.
    pub fn merge(self, file: Settings) -> Settings {
        Settings {
            config: self.config,
            level: self.level.or(file.level),
            data_dir: self.data_dir.or(file.data_dir),
            backup_dir: self.backup_dir.or(file.backup_dir),
            train_at: self.train_at.or(file.train_at),
            startup_delay_secs: self.startup_delay_secs.or(file.startup_delay_secs),
            poll_secs: self.poll_secs.or(file.poll_secs),
            waqi_token: self.waqi_token.or(file.waqi_token),
            github_token: self.github_token.or(file.github_token),
            github_repo: self.github_repo.or(file.github_repo),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.clone().unwrap_or(String::from("./data")))
    }

    pub fn backup_dir(&self) -> PathBuf {
        if let Some(backup_dir) = &self.backup_dir {
            return PathBuf::from(backup_dir);
        }
        match env::var("HOME") {
            Ok(home) => Path::new(&home).join("aqi_forecast_backups"),
            Err(_) => PathBuf::from("./aqi_forecast_backups"),
        }
    }

    pub fn schedule(&self) -> Result<Schedule, anyhow::Error> {
        let mut schedule = Schedule::default();
        if let Some(train_at) = &self.train_at {
            schedule.daily_at = parse_time_of_day(train_at)?;
        }
        if let Some(delay) = self.startup_delay_secs {
            schedule.startup_delay = Duration::from_secs(delay);
        }
        if let Some(poll) = self.poll_secs {
            schedule.poll_interval = Duration::from_secs(poll.max(1));
        }
        Ok(schedule)
    }
}

pub fn parse_time_of_day(value: &str) -> Result<Time, anyhow::Error> {
    let format = format_description!("[hour]:[minute]");
    Time::parse(value.trim(), &format)
        .map_err(|e| anyhow!("invalid time of day `{}`, expected HH:MM: {}", value, e))
}

pub fn get_config_info() -> Result<Cli, anyhow::Error> {
    let mut cli = Cli::parse();

    if let Some(config_path) = cli.settings.config.clone() {
        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow!("error reading config file {}: {}", config_path, e))?;
        let from_file: Settings = toml::from_str(&content)
            .map_err(|e| anyhow!("error parsing config file {}: {}", config_path, e))?;
        cli.settings = cli.settings.merge(from_file);
    }
    Ok(cli)
}

pub fn get_log_level(settings: &Settings) -> Level {
    let level = settings
        .level
        .clone()
        .unwrap_or_else(|| env::var("RUST_LOG").unwrap_or_else(|_| String::from("")));
    match level.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "info" => Level::Info,
        "warn" => Level::Warning,
        "error" => Level::Error,
        _ => Level::Info,
    }
}

pub fn setup_logger(log_level: Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = drain.filter_level(log_level).fuse();
    slog::Logger::root(drain, o!("version" => env!("CARGO_PKG_VERSION")))
}

pub fn create_folder(path: &Path, logger: &Logger) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    info!(logger, "folder created: {}", path.display());
    Ok(())
}

/// Replaces `path` only once the new content is fully on disk.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
