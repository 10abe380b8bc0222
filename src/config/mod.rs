//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::worker::{Condition, ExecutionMode};

pub use cli::{BuildArgs, BuildOverrides, CliArgs, Command, LoggingOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "prerender";
pub const ENV_PREFIX: &str = "PRERENDER";
const DEFAULT_PAYLOAD_DIR: &str = "build/rsc";
const DEFAULT_OUT_DIR: &str = "dist";
const DEFAULT_BASE_PATH: &str = "/";
const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;
/// Keeps an encoded CHUNK frame well under the worker's frame limit.
const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
const DEFAULT_MESSAGE_BUDGET: u64 = 256;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub build: BuildSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Directory(PathBuf),
    Inline,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub payload_dir: PathBuf,
    pub output: OutputTarget,
    pub base_path: String,
    pub chunk_size: NonZeroUsize,
    pub max_concurrency: Option<NonZeroUsize>,
    pub write_payload: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mode: ExecutionMode,
    /// Condition the host runs under; the worker gets the opposite one.
    pub host_condition: Condition,
    pub module_root: Option<PathBuf>,
    pub message_budget: NonZeroUsize,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
    pub in_process: bool,
    /// Worker executable; defaults to the running binary.
    pub program: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    if let Some(Command::Build(args)) = cli.command.as_ref() {
        raw.apply_build_overrides(&args.overrides);
    }

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    build: RawBuildSettings,
    worker: RawWorkerSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_build_overrides(&mut self, overrides: &BuildOverrides) {
        if let Some(dir) = overrides.payload_dir.as_ref() {
            self.build.payload_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.out_dir.as_ref() {
            self.build.out_dir = Some(dir.clone());
        }
        if let Some(inline) = overrides.inline {
            self.build.inline = Some(inline);
        }
        if let Some(base_path) = overrides.base_path.as_ref() {
            self.build.base_path = Some(base_path.clone());
        }
        if let Some(size) = overrides.chunk_size {
            self.build.chunk_size = Some(size);
        }
        if let Some(max) = overrides.max_concurrency {
            self.build.max_concurrency = Some(max);
        }
        if let Some(write) = overrides.write_payload {
            self.build.write_payload = Some(write);
        }
        if let Some(mode) = overrides.mode.as_ref() {
            self.worker.mode = Some(mode.clone());
        }
        if let Some(root) = overrides.module_root.as_ref() {
            self.worker.module_root = Some(root.clone());
        }
        if let Some(in_process) = overrides.in_process {
            self.worker.in_process = Some(in_process);
        }
        if let Some(timeout) = overrides.handshake_timeout_ms {
            self.worker.handshake_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            build,
            worker,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            build: build_build_settings(build)?,
            worker: build_worker_settings(worker)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_build_settings(build: RawBuildSettings) -> Result<BuildSettings, LoadError> {
    let payload_dir = build
        .payload_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PAYLOAD_DIR));
    if payload_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "build.payload_dir",
            "path must not be empty",
        ));
    }

    let output = if build.inline.unwrap_or(false) {
        OutputTarget::Inline
    } else {
        let out_dir = build
            .out_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUT_DIR));
        if out_dir.as_os_str().is_empty() {
            return Err(LoadError::invalid("build.out_dir", "path must not be empty"));
        }
        OutputTarget::Directory(out_dir)
    };

    let base_path = build
        .base_path
        .unwrap_or_else(|| DEFAULT_BASE_PATH.to_string());
    if base_path.chars().any(char::is_control) {
        return Err(LoadError::invalid(
            "build.base_path",
            "must not contain control characters",
        ));
    }

    let chunk_size = build.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(LoadError::invalid(
            "build.chunk_size",
            format!("must be at most {MAX_CHUNK_SIZE} bytes"),
        ));
    }
    let chunk_size = non_zero_usize(chunk_size, "build.chunk_size")?;
    let max_concurrency = build
        .max_concurrency
        .map(|value| non_zero_usize(value, "build.max_concurrency"))
        .transpose()?;

    Ok(BuildSettings {
        payload_dir,
        output,
        base_path,
        chunk_size,
        max_concurrency,
        write_payload: build.write_payload.unwrap_or(false),
    })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let mode = match worker.mode {
        Some(mode) => ExecutionMode::from_str(&mode)
            .map_err(|err| LoadError::invalid("worker.mode", err.to_string()))?,
        None => ExecutionMode::default(),
    };
    let host_condition = match worker.host_condition {
        Some(condition) => Condition::from_str(&condition)
            .map_err(|err| LoadError::invalid("worker.host_condition", err.to_string()))?,
        None => Condition::ReactServer,
    };

    let module_root = worker
        .module_root
        .filter(|root| !root.as_os_str().is_empty());
    let program = worker.program.filter(|program| !program.as_os_str().is_empty());

    let message_budget = non_zero_usize(
        worker.message_budget.unwrap_or(DEFAULT_MESSAGE_BUDGET),
        "worker.message_budget",
    )?;
    let handshake_timeout = non_zero_millis(
        worker
            .handshake_timeout_ms
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        "worker.handshake_timeout_ms",
    )?;
    let shutdown_grace = non_zero_millis(
        worker.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        "worker.shutdown_grace_ms",
    )?;

    Ok(WorkerSettings {
        mode,
        host_condition,
        module_root,
        message_budget,
        handshake_timeout,
        shutdown_grace,
        in_process: worker.in_process.unwrap_or(false),
        program,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBuildSettings {
    payload_dir: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    inline: Option<bool>,
    base_path: Option<String>,
    chunk_size: Option<u64>,
    max_concurrency: Option<u64>,
    write_payload: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    mode: Option<String>,
    host_condition: Option<String>,
    module_root: Option<PathBuf>,
    message_budget: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    in_process: Option<bool>,
    program: Option<PathBuf>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests;
