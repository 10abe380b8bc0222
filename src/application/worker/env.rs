use std::{fmt, num::NonZeroUsize, path::PathBuf, str::FromStr};

use thiserror::Error;

pub const ENV_MODE: &str = "PRERENDER_MODE";
pub const ENV_CONDITION: &str = "PRERENDER_CONDITION";
pub const ENV_MODULE_ROOT: &str = "PRERENDER_MODULE_ROOT";
pub const ENV_MESSAGE_BUDGET: &str = "PRERENDER_MESSAGE_BUDGET";

const DEFAULT_MESSAGE_BUDGET: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid value `{value}` for {name}")]
pub struct EnvParseError {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Production,
    Development,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Production => "production",
            ExecutionMode::Development => "development",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = EnvParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            _ => Err(EnvParseError {
                name: ENV_MODE,
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build variant a context resolves its modules under.
///
/// The host produces payloads under one condition; the worker runs the
/// complementary stage under the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Condition {
    #[default]
    ReactServer,
    Default,
}

impl Condition {
    pub fn as_str(self) -> &'static str {
        match self {
            Condition::ReactServer => "react-server",
            Condition::Default => "default",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Condition::ReactServer => Condition::Default,
            Condition::Default => Condition::ReactServer,
        }
    }
}

impl FromStr for Condition {
    type Err = EnvParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "react-server" => Ok(Self::ReactServer),
            "default" | "ssr" => Ok(Self::Default),
            _ => Err(EnvParseError {
                name: ENV_CONDITION,
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution environment handed to a worker.
///
/// Process workers receive it as environment variables; in-process workers
/// receive the value directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    pub mode: ExecutionMode,
    pub condition: Condition,
    pub module_root: Option<PathBuf>,
    /// Capacity of the host → worker channel.
    pub message_budget: NonZeroUsize,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            condition: Condition::ReactServer.opposite(),
            module_root: None,
            message_budget: default_message_budget(),
        }
    }
}

fn default_message_budget() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_MESSAGE_BUDGET).unwrap_or(NonZeroUsize::MIN)
}

impl WorkerEnv {
    /// Environment for a worker serving a host that runs under `host_condition`.
    pub fn for_host(mode: ExecutionMode, host_condition: Condition) -> Self {
        Self {
            mode,
            condition: host_condition.opposite(),
            ..Self::default()
        }
    }

    pub fn with_module_root(mut self, module_root: Option<PathBuf>) -> Self {
        self.module_root = module_root;
        self
    }

    pub fn with_message_budget(mut self, message_budget: NonZeroUsize) -> Self {
        self.message_budget = message_budget;
        self
    }

    pub fn to_env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_MODE, self.mode.as_str().to_string()),
            (ENV_CONDITION, self.condition.as_str().to_string()),
            (ENV_MESSAGE_BUDGET, self.message_budget.to_string()),
        ];
        if let Some(root) = &self.module_root {
            vars.push((ENV_MODULE_ROOT, root.display().to_string()));
        }
        vars
    }

    /// Read the environment of the current process. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, EnvParseError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvParseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = Self::default();
        if let Some(mode) = lookup(ENV_MODE) {
            env.mode = mode.parse()?;
        }
        if let Some(condition) = lookup(ENV_CONDITION) {
            env.condition = condition.parse()?;
        }
        if let Some(root) = lookup(ENV_MODULE_ROOT).filter(|root| !root.trim().is_empty()) {
            env.module_root = Some(PathBuf::from(root));
        }
        if let Some(budget) = lookup(ENV_MESSAGE_BUDGET) {
            env.message_budget = budget
                .trim()
                .parse::<NonZeroUsize>()
                .map_err(|_| EnvParseError {
                    name: ENV_MESSAGE_BUDGET,
                    value: budget.clone(),
                })?;
        }
        Ok(env)
    }
}
