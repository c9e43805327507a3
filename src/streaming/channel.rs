//! Server side of a progress stream.
//!
//! One `ProgressChannel` per job. It writes events in order, flushes each one,
//! and refuses anything after the terminal event.

use crate::error::ErrorCode;
use crate::model::{Usage, Version};
use crate::streaming::protocol::{write_event, StreamEvent};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("a terminal event was already sent on this channel")]
    AlreadyTerminated,

    #[error("client disconnected: {0}")]
    Disconnected(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Open,
    /// Writes failed; the listener is gone but no terminal event went out.
    Broken,
    Terminated,
}

/// Counters for one channel's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub progress: u64,
    pub heartbeats: u64,
    pub terminal: u64,
}

pub struct ProgressChannel<W> {
    writer: W,
    state: ChannelState,
    stats: ChannelStats,
    disconnected: bool,
}

impl<W: AsyncWrite + Unpin> ProgressChannel<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: ChannelState::Open,
            stats: ChannelStats::default(),
            disconnected: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ChannelState::Terminated
    }

    /// Whether every write so far reached the listener.
    pub fn is_connected(&self) -> bool {
        !self.disconnected
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Send one event. A terminal event also shuts down the write side.
    pub async fn send(&mut self, event: StreamEvent) -> Result<(), ChannelError> {
        if self.state == ChannelState::Terminated {
            tracing::error!(event = event.name(), "event emitted after terminal event");
            return Err(ChannelError::AlreadyTerminated);
        }

        let terminal = event.is_terminal();
        let broken = self.state == ChannelState::Broken;
        if terminal {
            self.state = ChannelState::Terminated;
        }

        match &event {
            StreamEvent::Progress { .. } => self.stats.progress += 1,
            StreamEvent::Heartbeat => self.stats.heartbeats += 1,
            StreamEvent::Complete { .. } | StreamEvent::Error { .. } => self.stats.terminal += 1,
        }

        if broken {
            return Ok(());
        }

        tracing::debug!(event = event.name(), "emit");
        let written = match write_event(&mut self.writer, &event).await {
            Ok(()) if terminal => self.writer.shutdown().await,
            other => other,
        };

        if let Err(e) = written {
            self.disconnected = true;
            if !terminal {
                self.state = ChannelState::Broken;
            }
            return Err(ChannelError::Disconnected(e));
        }
        Ok(())
    }

    pub async fn progress(&mut self, percent: u8, message: impl Into<String>) -> Result<(), ChannelError> {
        self.send(StreamEvent::progress(percent, message)).await
    }

    pub async fn heartbeat(&mut self) -> Result<(), ChannelError> {
        self.send(StreamEvent::Heartbeat).await
    }

    pub async fn complete(&mut self, result: Value, version: Version, usage: Usage) -> Result<(), ChannelError> {
        self.send(StreamEvent::Complete {
            result,
            version,
            usage,
        })
        .await
    }

    pub async fn error(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), ChannelError> {
        self.send(StreamEvent::error(code, message)).await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::EventReader;
    use serde_json::json;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Writer whose peer has hung up.
    struct HungUp;

    impl AsyncWrite for HungUp {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn decode(bytes: Vec<u8>) -> Vec<StreamEvent> {
        let mut reader = EventReader::new(bytes.as_slice());
        let mut events = Vec::new();
        while let Some(item) = reader.next_event().await.unwrap() {
            events.push(item.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_events_written_in_order() {
        let mut channel = ProgressChannel::new(Vec::new());
        channel.progress(10, "cloning").await.unwrap();
        channel.heartbeat().await.unwrap();
        channel.progress(60, "scoring").await.unwrap();
        channel.complete(json!({"score": 5}), 2, Usage::new(1, 1)).await.unwrap();

        assert_eq!(
            channel.stats(),
            ChannelStats {
                progress: 2,
                heartbeats: 1,
                terminal: 1
            }
        );

        let events = decode(channel.into_inner()).await;
        let names: Vec<_> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["progress", "heartbeat", "progress", "complete"]);
    }

    #[tokio::test]
    async fn test_nothing_after_terminal() {
        let mut channel = ProgressChannel::new(Vec::new());
        channel.error(ErrorCode::GenerationFailed, "model timed out").await.unwrap();

        assert!(matches!(
            channel.progress(99, "late").await,
            Err(ChannelError::AlreadyTerminated)
        ));
        assert!(matches!(
            channel.complete(json!(null), 1, Usage::default()).await,
            Err(ChannelError::AlreadyTerminated)
        ));
        assert!(channel.is_terminated());

        let events = decode(channel.into_inner()).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[tokio::test]
    async fn test_broken_writer_marks_disconnected() {
        let mut channel = ProgressChannel::new(HungUp);
        assert!(matches!(
            channel.progress(1, "x").await,
            Err(ChannelError::Disconnected(_))
        ));
        assert!(!channel.is_connected());

        // Later events are accepted silently; the terminal still closes the channel.
        channel.heartbeat().await.unwrap();
        channel.complete(json!(1), 1, Usage::default()).await.unwrap();
        assert!(channel.is_terminated());
        assert!(matches!(
            channel.heartbeat().await,
            Err(ChannelError::AlreadyTerminated)
        ));
    }
}
