//! Status classification
//!
//! Every resource type reports its lifecycle as a free-form label. A
//! `StatusClassifier` sorts those labels into three buckets so that a single
//! poller implementation can drive any resource type.
//!
//! Only [`StatusClass::Failed`] changes how a poll proceeds. Whether a settled
//! label ends a wait is decided by that wait's target set, so `stopped` is a
//! success for a stop and a pending label for a start.

use serde::{Deserialize, Serialize};

/// Bucket a status label falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Transitional status
    Pending,
    /// Settled status; informational, the wait's target set decides
    Success,
    /// Stop polling and return an error carrying the status reasons
    Failed,
}

/// Maps a status label to its class
pub trait StatusClassifier: Send + Sync {
    fn classify(&self, label: &str) -> StatusClass;
}

impl<F> StatusClassifier for F
where
    F: Fn(&str) -> StatusClass + Send + Sync,
{
    fn classify(&self, label: &str) -> StatusClass {
        self(label)
    }
}

/// Table-driven classifier: explicit success and failure labels, everything
/// else is pending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusTable {
    success: Vec<String>,
    failed: Vec<String>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn failed<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failed.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn success_labels(&self) -> &[String] {
        &self.success
    }

    pub fn failed_labels(&self) -> &[String] {
        &self.failed
    }
}

impl StatusClassifier for StatusTable {
    fn classify(&self, label: &str) -> StatusClass {
        // Failure wins when a label is listed twice
        if self.failed.iter().any(|l| l == label) {
            StatusClass::Failed
        } else if self.success.iter().any(|l| l == label) {
            StatusClass::Success
        } else {
            StatusClass::Pending
        }
    }
}

/// Structured diagnostic attached to a failed status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReason {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_info: Option<String>,
}

impl StatusReason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            more_info: None,
        }
    }

    pub fn with_more_info(mut self, more_info: impl Into<String>) -> Self {
        self.more_info = Some(more_info.into());
        self
    }
}

/// A typed snapshot of a remote resource that exposes its lifecycle status
pub trait Observed {
    fn status(&self) -> &str;

    fn status_reasons(&self) -> &[StatusReason] {
        &[]
    }
}
