//! Core data model.
//!
//! A task is a unit of work parked in a queue until a consumer claims it.
//! Its visible state (waiting / active / failed) is never stored — it is
//! derived from `expires` and `tries` by the queue's predicate module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task record as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at insertion. Immutable.
    pub id: TaskId,

    /// Caller-supplied payload. The engine never interprets this.
    pub data: serde_json::Value,

    /// Insertion time. Tie-breaker among equally-eligible tasks (oldest first).
    pub created: DateTime<Utc>,

    /// Lease expiry. A value at or before now means the task is unleased
    /// and eligible for claim; freshly inserted tasks sit at the epoch.
    pub expires: DateTime<Utc>,

    /// Attempt counter, incremented once per successful claim.
    /// `None` when the queue runs with unlimited retries.
    pub tries: Option<u32>,

    /// Token identifying the current lease holder. Only meaningful while
    /// the task is active; every claim issues a fresh one, invalidating
    /// whatever tag was handed out before.
    pub tag: Option<LeaseTag>,
}

impl Task {
    /// Is this task currently leased, as of `now`?
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TaskId)
    }
}

/// Newtype for lease tokens.
///
/// A tag is the capability to renew or complete the task it is attached
/// to; holding a stale tag grants nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseTag(pub Uuid);

impl LeaseTag {
    /// Generate a fresh tag for a new lease.
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for LeaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LeaseTag {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(LeaseTag)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How many claims a task gets before it is terminally failed.
///
/// Under `Unlimited` the attempt counter is not persisted at all and no
/// task can ever be classified as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Claimable at most this many times.
    Limited(u32),
    /// Claimable forever.
    Unlimited,
}

impl RetryPolicy {
    /// The attempt limit, if one is configured.
    pub fn limit(self) -> Option<u32> {
        match self {
            RetryPolicy::Limited(n) => Some(n),
            RetryPolicy::Unlimited => None,
        }
    }

    /// Initial value of the persisted attempt counter for a new task.
    pub(crate) fn initial_tries(self) -> Option<i32> {
        match self {
            RetryPolicy::Limited(_) => Some(0),
            RetryPolicy::Unlimited => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Three-way breakdown of the not-yet-completed tasks in a queue,
/// observed in a single aggregation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Currently leased.
    pub active: u64,
    /// Unleased and eligible for claim.
    pub waiting: u64,
    /// Retry budget exhausted. Terminal.
    pub failed: u64,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "active={} waiting={} failed={}",
            self.active, self.waiting, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_limit() {
        assert_eq!(RetryPolicy::Limited(3).limit(), Some(3));
        assert_eq!(RetryPolicy::Unlimited.limit(), None);
    }

    #[test]
    fn initial_tries_tracked_only_when_limited() {
        assert_eq!(RetryPolicy::Limited(10).initial_tries(), Some(0));
        assert_eq!(RetryPolicy::Unlimited.initial_tries(), None);
    }

    #[test]
    fn ids_round_trip_through_display() {
        let id = TaskId(Uuid::new_v4());
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);

        let tag = LeaseTag::generate();
        assert_eq!(tag.to_string().parse::<LeaseTag>().unwrap(), tag);
    }
}
