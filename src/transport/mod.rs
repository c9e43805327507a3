//! Client transports.
//!
//! Each transport is an [`EventSource`](crate::streaming::EventSource): it
//! sends one [`JobRequest`] line and exposes the reply as an event stream.
//! Dropping the stream closes the connection.
//!
//! - [`server::SubprocessSource`] spawns `scorekeep --server` per job and kills
//!   it when the stream is dropped, abandoning the producer.
//! - [`tcp::TcpSource`] connects to `scorekeep serve`. A dropped stream only
//!   closes the socket; the daemon still finishes and commits the job.
//! - [`local::LocalSource`] runs the job in-process over a duplex pipe.

pub mod local;
pub mod server;
pub mod tcp;

pub use local::LocalSource;
pub use server::{ServerSession, SubprocessSource};
pub use tcp::TcpSource;

use crate::error::JobError;
use crate::model::JobRequest;
use crate::streaming::{EventReader, EventStream};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Write the request line that opens a job.
pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, request: &JobRequest) -> Result<(), JobError> {
    let mut line =
        serde_json::to_vec(request).map_err(|e| JobError::InvalidRequest(e.to_string()))?;
    line.push(b'\n');
    w.write_all(&line).await.map_err(transport_error)?;
    w.flush().await.map_err(transport_error)
}

pub(crate) fn transport_error(err: std::io::Error) -> JobError {
    JobError::ChannelTransport(err.to_string())
}

/// Decode `reader` as an event stream.
///
/// `guard` lives exactly as long as the stream and is how a transport ties a
/// child process or socket half to it.
pub fn event_stream<R, G>(reader: R, guard: G) -> EventStream
where
    R: AsyncRead + Unpin + Send + 'static,
    G: Send + 'static,
{
    let state = Some((EventReader::new(reader), guard));
    futures::stream::unfold(state, |state| async move {
        let (mut reader, guard) = state?;
        match reader.next_event().await {
            Ok(Some(item)) => Some((Ok(item), Some((reader, guard)))),
            Ok(None) => None,
            Err(e) => Some((Err(transport_error(e)), None)),
        }
    })
    .boxed()
}
