//! Client side of a progress stream.
//!
//! `StreamConsumer` opens a channel through an [`EventSource`], forwards what
//! arrives into a local queue tagged with the channel's epoch, and folds each
//! item into a [`StreamSession`] through a single reducer. Tearing a channel
//! down bumps the epoch, so anything the old channel still had in flight is
//! dropped instead of overwriting newer state.

use crate::error::{ErrorCode, JobError};
use crate::model::{JobInput, Usage, Version};
use crate::streaming::protocol::{MalformedEvent, StreamEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default time without any event before the channel counts as dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const INBOUND_CHANNEL_SIZE: usize = 64;

/// One item read off a channel: an event, a frame that failed to parse, or a
/// transport failure.
pub type Inbound = Result<Result<StreamEvent, MalformedEvent>, JobError>;

pub type EventStream = BoxStream<'static, Inbound>;

/// Opens one event channel per job attempt.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn open(&self, input: &JobInput) -> Result<EventStream, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Processing,
    Complete,
    Error,
}

impl SessionStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Processing)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Inputs to [`StreamSession::reduce`].
#[derive(Debug)]
pub enum Action {
    Start(JobInput),
    Event(StreamEvent),
    Malformed(MalformedEvent),
    TransportFailed(String),
    Cancel,
}

/// What a reduction asks of the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; the channel stays open.
    Updated,
    /// Nothing changed.
    Ignored,
    /// The channel is finished and must be torn down.
    Finished,
    /// A result arrived: tear down and notify completion hooks.
    Completed,
}

/// Client-local view of one job and its retries.
#[derive(Debug, Clone, Default)]
pub struct StreamSession {
    pub status: SessionStatus,
    pub percent: u8,
    pub message: String,
    pub log: Vec<LogEntry>,
    pub result: Option<Value>,
    pub version: Option<Version>,
    pub usage: Option<Usage>,
    /// Most recent result that completed; seeds the next retry.
    pub last_good_result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub last_input: Option<JobInput>,
}

impl StreamSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_log(&mut self, message: impl Into<String>) {
        self.log.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    fn fail(&mut self, code: ErrorCode, message: String) -> Transition {
        self.status = SessionStatus::Error;
        self.push_log(format!("Error: {}", message));
        self.error = Some(message);
        self.error_code = Some(code);
        Transition::Finished
    }

    /// The only place session state changes.
    pub fn reduce(&mut self, action: Action) -> Transition {
        match action {
            Action::Start(input) => {
                self.status = SessionStatus::Connecting;
                self.percent = 0;
                self.message = "Connecting".to_string();
                self.result = None;
                self.version = None;
                self.usage = None;
                self.error = None;
                self.error_code = None;
                self.push_log(if input.is_retry {
                    "Retrying with previous output as context"
                } else {
                    "Started"
                });
                self.last_input = Some(input);
                Transition::Updated
            }

            Action::Cancel => {
                if !self.status.is_in_flight() {
                    return Transition::Ignored;
                }
                self.status = SessionStatus::Idle;
                self.message.clear();
                self.push_log("Cancelled");
                Transition::Finished
            }

            _ if !self.status.is_in_flight() => Transition::Ignored,

            Action::Event(StreamEvent::Progress { percent, message }) => {
                self.status = SessionStatus::Processing;
                self.percent = percent.min(100);
                self.push_log(message.clone());
                self.message = message;
                Transition::Updated
            }

            Action::Event(StreamEvent::Heartbeat) => Transition::Ignored,

            Action::Event(StreamEvent::Complete {
                result,
                version,
                usage,
            }) => {
                self.status = SessionStatus::Complete;
                self.percent = 100;
                self.message = format!("Saved as version {}", version);
                self.push_log(self.message.clone());
                self.last_good_result = Some(result.clone());
                self.result = Some(result);
                self.version = Some(version);
                self.usage = Some(usage);
                Transition::Completed
            }

            Action::Event(StreamEvent::Error { message, code }) => self.fail(code, message),

            Action::TransportFailed(message) => self.fail(ErrorCode::Transport, message),

            Action::Malformed(err) => {
                tracing::warn!(error = %err, "skipping malformed event");
                Transition::Ignored
            }
        }
    }
}

type CompletionHook = Box<dyn Fn(&StreamSession) + Send + Sync>;

pub struct StreamConsumer {
    source: Arc<dyn EventSource>,
    session: StreamSession,
    epoch: u64,
    tx: mpsc::Sender<(u64, Inbound)>,
    rx: mpsc::Receiver<(u64, Inbound)>,
    pump: Option<JoinHandle<()>>,
    idle_timeout: Duration,
    hooks: Vec<CompletionHook>,
    stale_dropped: u64,
}

impl StreamConsumer {
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        Self {
            source,
            session: StreamSession::new(),
            epoch: 0,
            tx,
            rx,
            pump: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            hooks: Vec::new(),
            stale_dropped: 0,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Register a callback fired each time a job completes, typically to
    /// invalidate cached views of the group's versions.
    pub fn on_complete(&mut self, hook: impl Fn(&StreamSession) + Send + Sync + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Items discarded because their channel had been torn down.
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    /// Open a channel for `input`, closing any channel already open.
    pub fn start(&mut self, input: JobInput) {
        self.teardown();
        self.epoch += 1;
        self.session.reduce(Action::Start(input.clone()));

        tracing::debug!(epoch = self.epoch, retry = input.is_retry, "opening channel");
        let source = self.source.clone();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.pump = Some(tokio::spawn(pump(source, input, epoch, tx)));
    }

    pub fn cancel(&mut self) {
        self.teardown();
        self.epoch += 1;
        self.session.reduce(Action::Cancel);
    }

    /// Start again from the last input, carrying the previous outcome as context.
    pub fn retry(&mut self, prior_result: Option<Value>, prior_error: Option<String>) -> Result<(), JobError> {
        let input = self
            .session
            .last_input
            .as_ref()
            .ok_or_else(|| JobError::InvalidRequest("nothing to retry".to_string()))?
            .with_prior(prior_result, prior_error);
        self.start(input);
        Ok(())
    }

    /// Wait for the next item from the open channel and apply it.
    ///
    /// Returns `None` once no channel is in flight.
    pub async fn next_update(&mut self) -> Option<Transition> {
        // Stale items do not extend the deadline for the current channel.
        let deadline = tokio::time::Instant::now() + self.idle_timeout;
        loop {
            if !self.session.status.is_in_flight() {
                return None;
            }

            let action = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => Action::TransportFailed(format!(
                    "no event received for {}s",
                    self.idle_timeout.as_secs()
                )),
                // The consumer holds a sender, so the queue never closes.
                Ok(None) => return None,
                Ok(Some((epoch, _))) if epoch != self.epoch => {
                    self.stale_dropped += 1;
                    tracing::trace!(epoch, current = self.epoch, "dropping stale event");
                    continue;
                }
                Ok(Some((_, Ok(Ok(event))))) => Action::Event(event),
                Ok(Some((_, Ok(Err(malformed))))) => Action::Malformed(malformed),
                Ok(Some((_, Err(e)))) => Action::TransportFailed(e.to_string()),
            };

            return Some(self.apply(action));
        }
    }

    /// Pump until the session leaves the in-flight states.
    pub async fn run_to_end(&mut self) -> &StreamSession {
        while self.next_update().await.is_some() {}
        &self.session
    }

    fn apply(&mut self, action: Action) -> Transition {
        let transition = self.session.reduce(action);
        match transition {
            Transition::Finished => self.teardown(),
            Transition::Completed => {
                self.teardown();
                for hook in &self.hooks {
                    hook(&self.session);
                }
            }
            Transition::Updated | Transition::Ignored => {}
        }
        transition
    }

    fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Forward one channel into the consumer's queue, tagged with its epoch.
async fn pump(source: Arc<dyn EventSource>, input: JobInput, epoch: u64, tx: mpsc::Sender<(u64, Inbound)>) {
    let mut stream = match source.open(&input).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send((epoch, Err(e))).await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let last = match &item {
            Ok(Ok(event)) => event.is_terminal(),
            Ok(Err(_)) => false,
            Err(_) => true,
        };
        if tx.send((epoch, item)).await.is_err() || last {
            return;
        }
    }

    let _ = tx
        .send((
            epoch,
            Err(JobError::ChannelTransport(
                "stream ended before a terminal event".to_string(),
            )),
        ))
        .await;
}
