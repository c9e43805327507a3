//! Best-effort usage metering.

use crate::error::JobError;
use crate::model::{AnalysisRecord, CredentialSource, Usage, UsageEvent};
use crate::store::UsageSink;
use chrono::Utc;
use std::sync::Arc;

/// Records one usage entry per committed version.
///
/// A failed write is logged and swallowed: the committed record stands
/// whether or not its bookkeeping made it to the store.
#[derive(Clone)]
pub struct UsageMeter {
    sink: Arc<dyn UsageSink>,
}

impl UsageMeter {
    pub fn new(sink: Arc<dyn UsageSink>) -> Self {
        Self { sink }
    }

    /// Record usage for `record`. Returns whether the entry was stored.
    pub async fn record(
        &self,
        record: &AnalysisRecord,
        usage: Usage,
        credentials: CredentialSource,
    ) -> bool {
        let event = UsageEvent {
            owner_id: record.group.owner_id.clone(),
            subject_id: record.group.subject.id(),
            feature: record.group.feature.clone(),
            version: record.version,
            usage,
            credentials,
            recorded_at: Utc::now(),
        };

        match self.sink.record_usage(&event).await {
            Ok(()) => {
                tracing::debug!(
                    subject = %event.subject_id,
                    version = event.version,
                    total_units = usage.total_units,
                    "usage recorded"
                );
                true
            }
            Err(e) => {
                let err = JobError::UsageLoggingFailed(e.to_string());
                tracing::warn!(
                    group = %record.group,
                    version = record.version,
                    error = %err,
                    "dropping usage entry"
                );
                false
            }
        }
    }
}
