//! `ProcessLauncher` backed by `tokio::process`.

use std::process::Stdio;

use clustergrade_core::process::{CommandSpec, LaunchError, ProcessLauncher};
use clustergrade_core::workflow::OutStreams;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// Runs commands on the hub host.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

fn build(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
    if spec.clear_env {
        command.env_clear();
    }
    command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }
    command
}

fn spawn_error(spec: &CommandSpec, err: std::io::Error) -> LaunchError {
    LaunchError::Spawn {
        program: spec.program.clone(),
        reason: err.to_string(),
    }
}

/// Forward every line of `reader` to `sink`.
async fn pump<R, F>(reader: Option<R>, sink: F)
where
    R: AsyncRead + Unpin,
    F: Fn(&str),
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink(&line),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("reading process output: {err}");
                break;
            }
        }
    }
}

impl ProcessLauncher for TokioProcessLauncher {
    async fn run(&self, command: CommandSpec, streams: &OutStreams) -> Result<(), LaunchError> {
        tracing::info!(command = %command, "running");
        let mut child = build(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&command, e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, _, status) = tokio::join!(
            pump(stdout, |line| streams.stdout(line)),
            pump(stderr, |line| streams.stderr(line)),
            child.wait(),
        );

        let status = status.map_err(|e| spawn_error(&command, e))?;
        if !status.success() {
            return Err(LaunchError::Exit {
                command: command.to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }

    async fn output(&self, command: CommandSpec) -> Result<String, LaunchError> {
        tracing::debug!(command = %command, "running for output");
        let output = build(&command)
            .output()
            .await
            .map_err(|e| spawn_error(&command, e))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            tracing::debug!(command = %command, output = %text, "command failed");
            return Err(LaunchError::Exit {
                command: command.to_string(),
                code: output.status.code(),
            });
        }
        Ok(text)
    }
}
