//! Server session - runs one job in a child `scorekeep --server` process.
//!
//! The request goes to the child's stdin and events come back on its stdout.
//! The child is killed when the session is dropped.

use super::{event_stream, write_request};
use crate::error::JobError;
use crate::model::{Caller, JobInput, JobRequest};
use crate::streaming::{EventSource, EventStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// A running `scorekeep --server` child.
pub struct ServerSession {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ServerSession {
    /// Spawn `program --server`, passing `config` through when given.
    pub async fn spawn(program: &Path, config: Option<&Path>) -> Result<Self> {
        let mut cmd = Command::new(program);
        if let Some(config) = config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("--server");

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;

        Ok(Self { child, stdin, stdout })
    }

    /// Spawn the running executable as the server.
    pub async fn connect_local(config: Option<&Path>) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Self::spawn(&exe, config).await
    }

    /// Split into the child handle and its stdin/stdout.
    pub fn split(self) -> (Child, ChildStdin, ChildStdout) {
        (self.child, self.stdin, self.stdout)
    }
}

/// Event source that spawns one server child per job.
#[derive(Debug, Clone)]
pub struct SubprocessSource {
    program: Option<PathBuf>,
    config: Option<PathBuf>,
    caller: Caller,
}

impl SubprocessSource {
    /// Use the running executable as the server.
    pub fn current_exe(config: Option<PathBuf>, caller: Caller) -> Self {
        Self {
            program: None,
            config,
            caller,
        }
    }

    pub fn with_program(program: impl Into<PathBuf>, config: Option<PathBuf>, caller: Caller) -> Self {
        Self {
            program: Some(program.into()),
            config,
            caller,
        }
    }
}

#[async_trait]
impl EventSource for SubprocessSource {
    async fn open(&self, input: &JobInput) -> Result<EventStream, JobError> {
        let session = match &self.program {
            Some(program) => ServerSession::spawn(program, self.config.as_deref()).await,
            None => ServerSession::connect_local(self.config.as_deref()).await,
        }
        .map_err(|e| JobError::ChannelTransport(format!("{:#}", e)))?;

        let (child, mut stdin, stdout) = session.split();
        let request = JobRequest {
            caller: self.caller.clone(),
            input: input.clone(),
        };
        write_request(&mut stdin, &request).await?;
        drop(stdin);

        tracing::debug!(pid = ?child.id(), "server child started");
        Ok(event_stream(stdout, child))
    }
}
