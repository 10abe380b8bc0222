use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the prerender binary.
#[derive(Debug, Parser)]
#[command(name = "prerender", version, about = "Static route prerenderer")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PRERENDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render routes from their payloads to HTML.
    Build(Box<BuildArgs>),
    /// Serve the worker side of the render protocol on stdio.
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BuildArgs {
    /// Routes to render. When omitted, every payload under the payload directory is rendered.
    #[arg(long = "route", value_name = "ROUTE")]
    pub routes: Vec<String>,

    #[command(flatten)]
    pub overrides: BuildOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BuildOverrides {
    /// Override the directory holding one `index.rsc` payload per route.
    #[arg(long = "payload-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub payload_dir: Option<PathBuf>,

    /// Override the output directory for rendered HTML.
    #[arg(long = "out-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub out_dir: Option<PathBuf>,

    /// Return rendered pages inline and print a JSON summary instead of writing files.
    #[arg(
        long = "inline",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub inline: Option<bool>,

    /// Override the public URL prefix the site is served under.
    #[arg(long = "base-path", value_name = "PATH")]
    pub base_path: Option<String>,

    /// Override the payload chunk size in bytes.
    #[arg(long = "chunk-size", value_name = "BYTES")]
    pub chunk_size: Option<u64>,

    /// Limit the number of routes in flight at once.
    #[arg(long = "max-concurrency", value_name = "COUNT")]
    pub max_concurrency: Option<u64>,

    /// Keep a copy of each payload next to its HTML.
    #[arg(
        long = "write-payload",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub write_payload: Option<bool>,

    /// Override the worker execution mode (production|development).
    #[arg(long = "mode", value_name = "MODE")]
    pub mode: Option<String>,

    /// Override the module root the worker resolves its renderer from.
    #[arg(long = "module-root", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub module_root: Option<PathBuf>,

    /// Run the worker on a thread of this process instead of a child process.
    #[arg(
        long = "in-process",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub in_process: Option<bool>,

    /// Override the worker handshake timeout.
    #[arg(long = "worker-handshake-timeout-ms", value_name = "MILLIS")]
    pub handshake_timeout_ms: Option<u64>,
}
