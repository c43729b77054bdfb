//! External process port.
//!
//! Every binary the hub runs (cluster start/stop, the upgrade tool, rsync,
//! version queries) goes through an injected [`ProcessLauncher`], so tests
//! substitute a recording mock instead of swapping global command
//! constructors.

pub mod tools;

use std::fmt;
use std::path::PathBuf;

use crate::workflow::OutStreams;

pub use tools::UpgradeToolRunner;

/// A command line to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    /// Start from an empty environment instead of inheriting the hub's.
    pub clear_env: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            clear_env: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("starting {program:?}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{command:?} exited with {}", exit_label(.code))]
    Exit { command: String, code: Option<i32> },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

impl LaunchError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            LaunchError::Exit { code, .. } => *code,
            LaunchError::Spawn { .. } => None,
        }
    }
}

/// Runs external processes.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ProcessLauncher: Send + Sync {
    /// Run to completion, streaming stdout and stderr line by line into
    /// `streams`. A non-zero exit is [`LaunchError::Exit`].
    fn run(
        &self,
        command: CommandSpec,
        streams: &OutStreams,
    ) -> impl std::future::Future<Output = Result<(), LaunchError>> + Send;

    /// Run to completion and return combined stdout and stderr.
    fn output(
        &self,
        command: CommandSpec,
    ) -> impl std::future::Future<Output = Result<String, LaunchError>> + Send;
}

/// Quote an argument for `bash -c` when it contains shell metacharacters.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
