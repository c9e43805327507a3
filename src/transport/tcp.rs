//! TCP client for `scorekeep serve`.

use super::{event_stream, transport_error, write_request};
use crate::error::JobError;
use crate::model::{Caller, JobInput, JobRequest};
use crate::streaming::{EventSource, EventStream};
use async_trait::async_trait;
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct TcpSource {
    addr: String,
    caller: Caller,
}

impl TcpSource {
    pub fn new(addr: impl Into<String>, caller: Caller) -> Self {
        Self {
            addr: addr.into(),
            caller,
        }
    }
}

#[async_trait]
impl EventSource for TcpSource {
    async fn open(&self, input: &JobInput) -> Result<EventStream, JobError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| JobError::ChannelTransport(format!("connect to {}: {}", self.addr, e)))?;
        stream.set_nodelay(true).map_err(transport_error)?;

        let (reader, mut writer) = stream.into_split();
        let request = JobRequest {
            caller: self.caller.clone(),
            input: input.clone(),
        };
        write_request(&mut writer, &request).await?;

        // Holding the write half keeps the socket fully open until the stream is dropped.
        Ok(event_stream(reader, writer))
    }
}
