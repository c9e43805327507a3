//! Versioned, metered execution of long-running analysis jobs.
//!
//! A job asks a [`producer::ResultProducer`] for an analysis of one subject,
//! commits the output as the next version of its group, meters the usage, and
//! streams progress to the caller while it runs.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod model;
pub mod producer;
pub mod server;
pub mod store;
pub mod streaming;
pub mod transport;
pub mod usage;

pub use error::{ErrorCode, JobError, Result};
