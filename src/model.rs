//! Domain types: group keys, persisted records, usage entries and job requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version number of a committed run within one group key. Starts at 1.
pub type Version = u32;

/// The repository (or other subject) an analysis runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    pub owner: String,
    pub name: String,
    pub git_ref: String,
}

impl SubjectRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            git_ref: git_ref.into(),
        }
    }

    /// `owner/name`, used as the subject id on usage entries.
    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.git_ref)
    }
}

/// Identity of one versioning lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub owner_id: String,
    pub subject: SubjectRef,
    pub feature: String,
}

impl GroupKey {
    pub fn new(owner_id: impl Into<String>, subject: SubjectRef, feature: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            subject,
            feature: feature.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.owner_id, self.subject, self.feature)
    }
}

/// Token counters reported by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: u64,
    pub output_units: u64,
    pub total_units: u64,
}

impl Usage {
    pub fn new(input_units: u64, output_units: u64) -> Self {
        Self {
            input_units,
            output_units,
            total_units: input_units + output_units,
        }
    }
}

/// Whose credentials paid for the producer call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    CallerSupplied,
    #[default]
    Pooled,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::CallerSupplied => "caller_supplied",
            CredentialSource::Pooled => "pooled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "caller_supplied" => Some(CredentialSource::CallerSupplied),
            "pooled" => Some(CredentialSource::Pooled),
            _ => None,
        }
    }
}

/// One persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub group: GroupKey,
    pub version: Version,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// A row about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub group: GroupKey,
    pub version: Version,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl NewRecord {
    pub fn new(group: GroupKey, version: Version, payload: Value) -> Self {
        Self {
            group,
            version,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Listing entry for `versions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub version: Version,
    pub created_at: DateTime<Utc>,
}

/// One metering entry, written after a version commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub owner_id: String,
    pub subject_id: String,
    pub feature: String,
    pub version: Version,
    pub usage: Usage,
    pub credentials: CredentialSource,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated usage for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub runs: u64,
    pub input_units: u64,
    pub output_units: u64,
    pub total_units: u64,
}

/// What the producer returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerOutput {
    pub data: Value,
    #[serde(default)]
    pub usage: Usage,
}

/// Input handed to the producer.
///
/// On a retry the client carries the previous result and error message so the
/// producer can attempt a targeted fix instead of starting over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub subject: SubjectRef,
    pub feature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_error_message: Option<String>,
    #[serde(default)]
    pub is_retry: bool,
}

impl JobInput {
    pub fn new(subject: SubjectRef, feature: impl Into<String>) -> Self {
        Self {
            subject,
            feature: feature.into(),
            prior_result: None,
            prior_error_message: None,
            is_retry: false,
        }
    }

    /// Copy of this input seeded with the outcome of a failed attempt.
    pub fn with_prior(&self, prior_result: Option<Value>, prior_error: Option<String>) -> Self {
        Self {
            prior_result,
            prior_error_message: prior_error,
            is_retry: true,
            ..self.clone()
        }
    }
}

/// Who is asking. Each present identifier is an admission key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<String>,
    #[serde(default)]
    pub credentials: CredentialSource,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip: None,
            installation_id: None,
            credentials: CredentialSource::default(),
        }
    }
}

/// The single line a client sends before reading the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub caller: Caller,
    pub input: JobInput,
}

impl JobRequest {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(
            self.caller.user_id.clone(),
            self.input.subject.clone(),
            self.input.feature.clone(),
        )
    }

    /// Reject requests whose identifiers cannot form a group key.
    pub fn validate(&self) -> Result<(), String> {
        if self.caller.user_id.trim().is_empty() {
            return Err("user id is empty".to_string());
        }
        let subject = &self.input.subject;
        for (field, value) in [
            ("subject owner", &subject.owner),
            ("subject name", &subject.name),
            ("ref", &subject.git_ref),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{} is empty", field));
            }
        }
        let feature = &self.input.feature;
        if feature.is_empty()
            || !feature
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(format!("invalid feature name: {:?}", feature));
        }
        Ok(())
    }
}
