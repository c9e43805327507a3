//! Job progress streaming.
//!
//! A job request is answered with a one-way stream of events. The server side
//! runs the job and relays progress; the client side folds events into a
//! session it can cancel or retry.
//!
//! # Architecture
//!
//! ```text
//! server                                         client
//! +-----------+    +-----------------+  bytes   +----------------+
//! | JobDriver | -> | ProgressChannel | -------> | StreamConsumer |
//! +-----------+    +-----------------+   SSE    +----------------+
//!   admission        progress / heartbeat         session reducer
//!   producer         complete | error             epoch filtering
//!   commit
//! ```
//!
//! The wire format is Server-Sent-Events text, see [`protocol`].

pub mod channel;
pub mod consumer;
pub mod pipeline;
pub mod protocol;

pub use channel::{ChannelError, ChannelStats, ProgressChannel};
pub use consumer::{
    Action, EventSource, EventStream, Inbound, LogEntry, SessionStatus, StreamConsumer, StreamSession,
    Transition, DEFAULT_IDLE_TIMEOUT,
};
pub use pipeline::{DriverConfig, JobDriver, JobReport, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PRODUCER_TIMEOUT};
pub use protocol::{write_event, EventReader, MalformedEvent, StreamEvent, MAX_EVENT_SIZE};
