//! Processing status state machine and retry backoff

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StatusKind {
    pub const ALL: [StatusKind; 4] = [
        StatusKind::Pending,
        StatusKind::Processing,
        StatusKind::Completed,
        StatusKind::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Pending => "pending",
            StatusKind::Processing => "processing",
            StatusKind::Completed => "completed",
            StatusKind::Failed => "failed",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear retry backoff.
///
/// `retry_count` is the number of failures recorded *before* the one being
/// handled. Returns the delay until the next attempt, or `None` once this
/// failure exhausts the budget.
pub fn backoff_delay(retry_count: u32, base_delay: Duration, max_retries: u32) -> Option<Duration> {
    let attempts = retry_count.saturating_add(1);
    if attempts >= max_retries {
        return None;
    }
    let factor = i32::try_from(attempts).ok()?;
    base_delay.checked_mul(factor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::minutes(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn next_attempt(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        backoff_delay(retry_count, self.base_delay, self.max_retries).map(|delay| now + delay)
    }
}

/// One per chunk. `version` increases on every committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStatus {
    pub chunk_id: String,
    pub status: StatusKind,
    pub error: Option<String>,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ProcessingStatus {
    pub fn new(chunk_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            status: StatusKind::Pending,
            error: None,
            retry_count: 0,
            last_attempt: None,
            next_attempt: None,
            updated_at: now,
            version: 0,
        }
    }

    /// Failed with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        self.status == StatusKind::Failed && self.next_attempt.is_none()
    }

    /// Pending and either never failed or past its backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StatusKind::Pending && self.next_attempt.is_none_or(|at| at <= now)
    }

    /// Failed with a retry scheduled at or before `now`.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == StatusKind::Failed && self.next_attempt.is_some_and(|at| at <= now)
    }

    /// Compute the successor state for `to`, or reject the transition.
    ///
    /// Entering `failed` always increments `retry_count`; whether a retry is
    /// scheduled is decided by the policy. `failed -> pending` is only legal
    /// once the scheduled retry time has arrived.
    pub fn transition(
        &self,
        to: StatusKind,
        error: Option<String>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        use StatusKind::*;

        let mut next = self.clone();
        match (self.status, to) {
            (Pending, Processing) | (Pending, Completed) | (Processing, Completed) => {
                next.error = None;
                next.last_attempt = Some(now);
            }
            (Pending, Failed) | (Processing, Failed) | (Completed, Failed) => {
                next.error = Some(error.unwrap_or_else(|| "unspecified failure".to_string()));
                next.next_attempt = policy.next_attempt(self.retry_count, now);
                next.retry_count = self.retry_count.saturating_add(1);
                next.last_attempt = Some(now);
            }
            (Failed, Pending) if self.next_attempt.is_some_and(|at| at <= now) => {
                next.next_attempt = None;
            }
            (from, to) => return Err(StrataError::invalid_transition(&self.chunk_id, from, to)),
        }

        next.status = to;
        next.updated_at = now;
        next.version += 1;
        Ok(next)
    }

    /// Explicit re-ingestion: the only way back from `completed` or a terminal
    /// failure. `retry_count` is kept.
    pub fn reingested(&self, now: DateTime<Utc>) -> Result<Self> {
        if self.status != StatusKind::Completed && !self.is_terminal() {
            return Err(StrataError::invalid_transition(
                &self.chunk_id,
                self.status,
                "pending (reingest)",
            ));
        }

        let mut next = self.clone();
        next.status = StatusKind::Pending;
        next.error = None;
        next.next_attempt = None;
        next.updated_at = now;
        next.version += 1;
        Ok(next)
    }
}
