//! In-process transport: the job runs on this runtime behind a duplex pipe.

use super::{event_stream, write_request};
use crate::error::JobError;
use crate::model::{Caller, JobInput, JobRequest};
use crate::server::serve_connection;
use crate::streaming::{EventSource, EventStream, JobDriver};
use async_trait::async_trait;
use std::sync::Arc;

/// Pipe capacity in each direction.
const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Clone)]
pub struct LocalSource {
    driver: Arc<JobDriver>,
    caller: Caller,
}

impl LocalSource {
    pub fn new(driver: Arc<JobDriver>, caller: Caller) -> Self {
        Self { driver, caller }
    }
}

#[async_trait]
impl EventSource for LocalSource {
    async fn open(&self, input: &JobInput) -> Result<EventStream, JobError> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);

        let driver = self.driver.clone();
        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(server);
            serve_connection(&driver, reader, writer).await;
        });

        let (reader, mut writer) = tokio::io::split(client);
        let request = JobRequest {
            caller: self.caller.clone(),
            input: input.clone(),
        };
        write_request(&mut writer, &request).await?;
        Ok(event_stream(reader, writer))
    }
}
