//! Job driver: admission, producer relay, commit, terminal event.
//!
//! ```text
//! request -> AdmissionGate -> ResultProducer --progress--> ProgressChannel
//!                                   |
//!                                   v
//!                     VersionedPersistenceCoordinator -> UsageMeter
//!                                   |
//!                                   v
//!                      complete{version} | error{code}
//! ```
//!
//! The driver is the outermost error boundary: whatever happens to the job,
//! including a panic inside the producer, the channel ends with exactly one
//! terminal event.

use crate::admission::{AdmissionGate, AdmissionPolicies};
use crate::coordinator::{Committed, VersionedPersistenceCoordinator};
use crate::error::{ErrorCode, JobError};
use crate::model::{JobRequest, NewRecord, Version};
use crate::producer::{ProgressReporter, ProgressUpdate, ResultProducer};
use crate::streaming::channel::{ChannelError, ChannelStats, ProgressChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;
use uuid::Uuid;

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default upper bound for one producer call.
pub const DEFAULT_PRODUCER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub heartbeat_interval: Duration,
    pub producer_timeout: Duration,
    pub admission: AdmissionPolicies,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            producer_timeout: DEFAULT_PRODUCER_TIMEOUT,
            admission: AdmissionPolicies::default(),
        }
    }
}

/// Summary of one driven job, for logging and tests.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub version: Option<Version>,
    pub error: Option<ErrorCode>,
    pub stats: ChannelStats,
    /// Whether the listener was still attached when the job ended.
    pub delivered: bool,
}

pub struct JobDriver {
    gate: Arc<AdmissionGate>,
    coordinator: Arc<VersionedPersistenceCoordinator>,
    producer: Arc<dyn ResultProducer>,
    config: DriverConfig,
}

impl JobDriver {
    pub fn new(
        gate: Arc<AdmissionGate>,
        coordinator: Arc<VersionedPersistenceCoordinator>,
        producer: Arc<dyn ResultProducer>,
        config: DriverConfig,
    ) -> Self {
        Self {
            gate,
            coordinator,
            producer,
            config,
        }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    /// Drive one job to its terminal event on `writer`.
    pub async fn run<W>(&self, request: JobRequest, writer: W) -> JobReport
    where
        W: AsyncWrite + Unpin + Send,
    {
        let job_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "job",
            id = %job_id,
            user = %request.caller.user_id,
            subject = %request.input.subject,
            feature = %request.input.feature,
        );
        self.drive(job_id, request, ProgressChannel::new(writer))
            .instrument(span)
            .await
    }

    async fn drive<W>(&self, job_id: Uuid, request: JobRequest, mut channel: ProgressChannel<W>) -> JobReport
    where
        W: AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();

        if let Err(reason) = request.validate() {
            return finish_with_error(job_id, channel, JobError::InvalidRequest(reason)).await;
        }
        if let Err(denied) = self.gate.check(&request.caller, &self.config.admission) {
            return finish_with_error(job_id, channel, denied).await;
        }

        tracing::info!(retry = request.input.is_retry, "job started");

        let (reporter, mut progress_rx) = ProgressReporter::channel();
        let mut job = self.spawn_job(request, reporter);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let joined = loop {
            tokio::select! {
                biased;
                Some(update) = progress_rx.recv() => relay_progress(&mut channel, update).await,
                joined = &mut job => break joined,
                _ = heartbeat.tick() => note_delivery(channel.heartbeat().await),
            }
        };

        // Progress queued before the job finished still precedes the terminal event.
        while let Ok(update) = progress_rx.try_recv() {
            relay_progress(&mut channel, update).await;
        }

        let outcome = match joined {
            Ok(result) => result,
            Err(join_err) => {
                tracing::error!(error = %join_err, "job task aborted");
                let message = if join_err.is_panic() {
                    "job failed unexpectedly".to_string()
                } else {
                    "job was cancelled".to_string()
                };
                let _ = channel.error(ErrorCode::Internal, message).await;
                return report(job_id, &channel, None, Some(ErrorCode::Internal));
            }
        };

        match outcome {
            Ok(committed) => {
                let Committed { record, usage, .. } = committed;
                tracing::info!(
                    version = record.version,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job complete"
                );
                let version = record.version;
                if let Err(e) = channel.complete(record.payload, version, usage).await {
                    tracing::warn!(error = %e, version, "result committed but not delivered");
                }
                report(job_id, &channel, Some(version), None)
            }
            Err(e) => finish_with_error(job_id, channel, e).await,
        }
    }

    fn spawn_job(
        &self,
        request: JobRequest,
        reporter: ProgressReporter,
    ) -> JoinHandle<Result<Committed, JobError>> {
        let coordinator = self.coordinator.clone();
        let producer = self.producer.clone();
        let timeout = self.config.producer_timeout;

        tokio::spawn(
            async move {
                let group = request.group_key();
                let row_group = group.clone();
                let credentials = request.caller.credentials;
                let input = request.input;

                coordinator
                    .execute(
                        &group,
                        credentials,
                        move || async move {
                            match tokio::time::timeout(timeout, producer.produce(input, reporter)).await {
                                Ok(result) => result,
                                Err(_) => Err(anyhow::anyhow!(
                                    "producer timed out after {}s",
                                    timeout.as_secs()
                                )),
                            }
                        },
                        move |data, version| NewRecord::new(row_group.clone(), version, data.clone()),
                    )
                    .await
            }
            .in_current_span(),
        )
    }
}

async fn relay_progress<W: AsyncWrite + Unpin>(channel: &mut ProgressChannel<W>, update: ProgressUpdate) {
    let result = channel.progress(update.percent, update.message).await;
    note_delivery(result);
}

fn note_delivery(result: Result<(), ChannelError>) {
    if let Err(e) = result {
        // The job keeps running and still commits; only the live view is lost.
        tracing::warn!(error = %e, "listener gone, finishing job without it");
    }
}

async fn finish_with_error<W>(job_id: Uuid, mut channel: ProgressChannel<W>, err: JobError) -> JobReport
where
    W: AsyncWrite + Unpin,
{
    let code = err.code();
    match &err {
        JobError::AdmissionDenied { .. } | JobError::InvalidRequest(_) => {
            tracing::info!(error = %err, "job rejected")
        }
        _ => tracing::error!(error = %err, ?code, "job failed"),
    }
    let _ = channel.error(code, err.to_string()).await;
    report(job_id, &channel, None, Some(code))
}

fn report<W: AsyncWrite + Unpin>(
    job_id: Uuid,
    channel: &ProgressChannel<W>,
    version: Option<Version>,
    error: Option<ErrorCode>,
) -> JobReport {
    JobReport {
        job_id,
        version,
        error,
        stats: channel.stats(),
        delivered: channel.is_connected(),
    }
}
