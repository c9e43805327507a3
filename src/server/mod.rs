//! Job server.
//!
//! A connection carries exactly one job: the client writes one JSON
//! [`JobRequest`] line, the server answers with the event stream and closes.
//! Two front ends share [`serve_connection`]:
//!
//! - `scorekeep --server` serves a single job over stdin/stdout, for a parent
//!   process that spawned it.
//! - `scorekeep serve` accepts TCP connections until interrupted. Admission
//!   windows live as long as the daemon does.

use crate::admission::{spawn_sweeper, AdmissionGate};
use crate::config::Config;
use crate::coordinator::VersionedPersistenceCoordinator;
use crate::error::{ErrorCode, JobError};
use crate::model::JobRequest;
use crate::producer::CommandProducer;
use crate::store::SqliteStore;
use crate::streaming::{JobDriver, JobReport, ProgressChannel};
use crate::usage::UsageMeter;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Largest accepted request line.
pub const MAX_REQUEST_SIZE: u64 = 1024 * 1024;

/// Pause after a failed accept, e.g. when out of file descriptors.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Assemble a driver backed by SQLite and the configured producer command.
pub fn build_driver(config: &Config) -> Result<JobDriver> {
    let db_path = config.database_path();
    let store = Arc::new(
        SqliteStore::open(&db_path).with_context(|| format!("Failed to open {}", db_path.display()))?,
    );

    let command = config
        .producer
        .command
        .clone()
        .context("No producer configured: set [producer] command in the config file")?;
    let producer = Arc::new(CommandProducer::new(command, config.producer.args.clone()));

    let coordinator = VersionedPersistenceCoordinator::new(store.clone(), UsageMeter::new(store))
        .with_max_attempts(config.persistence.max_attempts);

    Ok(JobDriver::new(
        Arc::new(AdmissionGate::new()),
        Arc::new(coordinator),
        producer,
        config.driver(),
    ))
}

/// Serve one job on an already-open connection.
///
/// Returns `None` if the client hung up before sending a request.
pub async fn serve_connection<R, W>(driver: &JobDriver, reader: R, writer: W) -> Option<JobReport>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut line = String::new();
    let mut limited = BufReader::new(reader.take(MAX_REQUEST_SIZE));

    let request = match limited.read_line(&mut line).await {
        Ok(0) => {
            tracing::debug!("client closed before sending a request");
            return None;
        }
        Ok(_) => serde_json::from_str::<JobRequest>(line.trim())
            .map_err(|e| JobError::InvalidRequest(format!("unreadable request: {}", e))),
        Err(e) => Err(JobError::InvalidRequest(format!("unreadable request: {}", e))),
    };

    match request {
        Ok(request) => Some(driver.run(request, writer).await),
        Err(err) => {
            tracing::info!(error = %err, "rejecting request");
            let mut channel = ProgressChannel::new(writer);
            let _ = channel.error(ErrorCode::InvalidRequest, err.to_string()).await;
            None
        }
    }
}

/// `scorekeep --server`: one job over stdin/stdout.
pub async fn run_stdio(driver: JobDriver) -> Result<()> {
    let report = serve_connection(&driver, io::stdin(), io::stdout()).await;
    if let Some(report) = report {
        tracing::debug!(job = %report.job_id, version = ?report.version, error = ?report.error, "stdio job done");
    }
    Ok(())
}

/// `scorekeep serve`: accept connections until Ctrl-C, then wait for running
/// jobs so their results are committed.
pub async fn run_tcp(driver: JobDriver, listener: TcpListener, sweep_interval: Duration) -> Result<()> {
    let driver = Arc::new(driver);
    let sweeper = spawn_sweeper(driver.gate().clone(), sweep_interval);
    let local: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?local, "listening");

    let mut jobs = JoinSet::new();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            (stream, peer) = accept_with_backoff(|| listener.accept()) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, %peer, "could not set TCP_NODELAY");
                }
                let driver = driver.clone();
                jobs.spawn(async move {
                    let (reader, writer) = stream.into_split();
                    tracing::debug!(%peer, "connection accepted");
                    serve_connection(&driver, reader, writer).await;
                });
            }
            Some(finished) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "connection task failed");
                }
            }
            _ = &mut shutdown => {
                tracing::info!(running = jobs.len(), "shutting down");
                break;
            }
        }
    }

    drop(listener);
    while let Some(finished) = jobs.join_next().await {
        if let Err(e) = finished {
            tracing::error!(error = %e, "connection task failed");
        }
    }
    sweeper.abort();
    Ok(())
}

/// Retry `accept` until it yields a connection, pausing after each failure.
async fn accept_with_backoff<A, F, S>(mut accept: A) -> (S, SocketAddr)
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<(S, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
