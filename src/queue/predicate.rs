//! Task state derivation.
//!
//! A task's visible state is computed from two persisted fields and
//! nothing else: `expires` against the observation instant, and `tries`
//! against the retry limit. Every SQL fragment that performs that
//! classification lives here, so the claim statement and the counters
//! can never disagree about what "waiting" means.
//!
//! Bind convention shared by all fragments: `$1` is the queue name,
//! `$2` is the observation instant, `$3` is the retry limit (bound only
//! under a finite policy). Statement-specific binds start at the next
//! free position.

use crate::model::RetryPolicy;

/// Claimable: lease lapsed, retry budget not exhausted.
pub(crate) fn waiting(policy: RetryPolicy) -> &'static str {
    match policy {
        RetryPolicy::Limited(_) => "queue = $1 AND expires <= $2 AND tries < $3",
        RetryPolicy::Unlimited => "queue = $1 AND expires <= $2",
    }
}

/// Currently leased.
pub(crate) fn active() -> &'static str {
    "queue = $1 AND expires > $2"
}

/// Terminal: lease lapsed with no retry budget left.
/// Only meaningful under a finite policy.
pub(crate) fn failed() -> &'static str {
    "queue = $1 AND expires <= $2 AND tries >= $3"
}

/// The same three-way classification as a CASE expression, for the
/// single-pass stats aggregation.
pub(crate) fn state_case(policy: RetryPolicy) -> &'static str {
    match policy {
        RetryPolicy::Limited(_) => {
            "CASE WHEN expires > $2 THEN 'active' \
                  WHEN tries >= $3 THEN 'failed' \
                  ELSE 'waiting' END"
        }
        RetryPolicy::Unlimited => "CASE WHEN expires > $2 THEN 'active' ELSE 'waiting' END",
    }
}

/// Candidate order for the atomic claim pick. Default is FIFO: the task
/// whose lease lapsed longest ago wins, oldest-created breaking ties.
/// Insistent mode flips the primary sort to favor the most recently
/// retried task over long-idle backlog.
pub(crate) fn claim_order(insistent: bool) -> &'static str {
    if insistent {
        "expires DESC, created ASC"
    } else {
        "expires ASC, created ASC"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_checks_tries_only_under_finite_policy() {
        assert!(waiting(RetryPolicy::Limited(5)).contains("tries < $3"));
        assert!(!waiting(RetryPolicy::Unlimited).contains("tries"));
    }

    #[test]
    fn state_case_never_yields_failed_under_unlimited() {
        assert!(state_case(RetryPolicy::Limited(5)).contains("'failed'"));
        assert!(!state_case(RetryPolicy::Unlimited).contains("'failed'"));
    }

    #[test]
    fn insistent_flips_primary_sort_only() {
        assert_eq!(claim_order(false), "expires ASC, created ASC");
        assert_eq!(claim_order(true), "expires DESC, created ASC");
    }
}
