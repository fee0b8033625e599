use std::{future::Future, pin::Pin, process::Stdio, sync::Arc, time::Duration};

use tokio::{io::AsyncReadExt as _, process::Command};
use tracing::{debug, warn};

pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(30);

const STDERR_TAIL_BYTES: usize = 512;

// Anything a plain argv split would get wrong goes through `sh -c`.
const SHELL_SYNTAX: &[char] = &[
    '|', '&', ';', '<', '>', '(', ')', '$', '`', '\\', '"', '\'', '*', '?', '[', ']', '#', '~',
    '=', '%', '{', '}', '\n',
];

pub type RestartFuture = Pin<Box<dyn Future<Output = Result<(), RestartError>> + Send>>;

pub trait Restarter: Send + Sync {
    fn restart(&self) -> RestartFuture;
    fn name(&self) -> &str;
}

/// A restart command line, pre-split into argv when it is a plain word list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCommand {
    Argv(Vec<String>),
    Shell(String),
}

impl RestartCommand {
    pub fn parse(line: &str) -> Result<Self, RestartError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RestartError::EmptyCommand);
        }
        if line.contains(SHELL_SYNTAX) {
            return Ok(Self::Shell(line.to_string()));
        }
        Ok(Self::Argv(
            line.split_whitespace().map(str::to_string).collect(),
        ))
    }

    pub fn program(&self) -> &str {
        match self {
            Self::Argv(argv) => argv.first().map(String::as_str).unwrap_or_default(),
            Self::Shell(_) => "sh",
        }
    }

    fn to_command(&self) -> Command {
        match self {
            Self::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
            Self::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

impl std::fmt::Display for RestartCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Argv(argv) => write!(f, "{}", argv.join(" ")),
            Self::Shell(line) => write!(f, "sh -c {line:?}"),
        }
    }
}

/// Runs the configured restart command with a wall-clock deadline; the child is killed when
/// the deadline passes.
#[derive(Debug, Clone)]
pub struct CommandRestarter {
    command: RestartCommand,
    timeout: Duration,
}

impl CommandRestarter {
    pub fn new(command: RestartCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_command_line(line: &str, timeout: Duration) -> Result<Self, RestartError> {
        Ok(Self::new(RestartCommand::parse(line)?, timeout))
    }

    pub fn command(&self) -> &RestartCommand {
        &self.command
    }
}

impl Restarter for CommandRestarter {
    fn restart(&self) -> RestartFuture {
        let command = self.command.clone();
        let timeout = self.timeout;
        Box::pin(async move { run_with_timeout(&command, timeout).await })
    }

    fn name(&self) -> &str {
        self.command.program()
    }
}

pub fn restarter_from_config(
    config: &crate::config::Config,
) -> Result<Arc<dyn Restarter>, RestartError> {
    Ok(Arc::new(CommandRestarter::from_command_line(
        &config.xray_restart_command,
        config.restart_timeout(),
    )?))
}

async fn run_with_timeout(command: &RestartCommand, timeout: Duration) -> Result<(), RestartError> {
    let program = command.program().to_string();
    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| RestartError::Spawn {
        program: program.clone(),
        details: e.to_string(),
    })?;

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            stderr_task.abort();
            return Err(RestartError::Spawn {
                program,
                details: format!("wait: {e}"),
            });
        }
        Err(_) => {
            let kill_error = match child.kill().await {
                Ok(()) => None,
                Err(e) => {
                    warn!(program = %program, error = %e, "kill after restart timeout failed");
                    Some(e.to_string())
                }
            };
            stderr_task.abort();
            return Err(RestartError::Timeout {
                program,
                timeout,
                kill_error,
            });
        }
    };

    if status.success() {
        stderr_task.abort();
        debug!(command = %command, "restart command succeeded");
        return Ok(());
    }

    // Grandchildren may hold the pipe open; don't wait on them.
    let stderr = match tokio::time::timeout(Duration::from_millis(200), stderr_task).await {
        Ok(Ok(bytes)) => stderr_tail(&bytes),
        _ => String::new(),
    };
    Err(RestartError::Failed {
        program,
        status: status.to_string(),
        stderr,
    })
}

fn stderr_tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL_BYTES)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartError {
    EmptyCommand,
    Spawn {
        program: String,
        details: String,
    },
    Timeout {
        program: String,
        timeout: Duration,
        /// Set when the child could not be killed and may still be running.
        kill_error: Option<String>,
    },
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

impl std::fmt::Display for RestartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "restart command is empty"),
            Self::Spawn { program, details } => write!(f, "spawn {program}: {details}"),
            Self::Timeout {
                program,
                timeout,
                kill_error: None,
            } => write!(f, "{program} timed out after {timeout:?} and was killed"),
            Self::Timeout {
                program,
                timeout,
                kill_error: Some(e),
            } => write!(f, "{program} timed out after {timeout:?}; kill failed: {e}"),
            Self::Failed {
                program,
                status,
                stderr,
            } if stderr.is_empty() => write!(f, "{program} {status}"),
            Self::Failed {
                program,
                status,
                stderr,
            } => write!(f, "{program} {status}: {stderr}"),
        }
    }
}

impl std::error::Error for RestartError {}
