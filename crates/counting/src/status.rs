//! Session lifecycle: the eleven states and the exact transition table.

use serde::{Deserialize, Serialize};

use crate::error::CountingError;
use crate::ids::CountNumber;

/// Lifecycle state of a counting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "count_1_in_progress")]
    Count1InProgress,
    #[serde(rename = "count_1_completed")]
    Count1Completed,
    #[serde(rename = "count_2_in_progress")]
    Count2InProgress,
    #[serde(rename = "count_2_completed")]
    Count2Completed,
    #[serde(rename = "count_3_in_progress")]
    Count3InProgress,
    #[serde(rename = "count_3_completed")]
    Count3Completed,
    #[serde(rename = "pending_review")]
    PendingReview,
    #[serde(rename = "finalized")]
    Finalized,
    #[serde(rename = "cancelled")]
    Cancelled,
}

use SessionStatus::*;

impl SessionStatus {
    /// Allowed next states. Nothing outside this table is ever permitted.
    pub fn allowed_transitions(self) -> &'static [SessionStatus] {
        match self {
            Draft => &[Scheduled, Count1InProgress, Cancelled],
            Scheduled => &[Count1InProgress, Cancelled],
            Count1InProgress => &[Count1Completed, Cancelled],
            Count1Completed => &[Count2InProgress, PendingReview],
            Count2InProgress => &[Count2Completed, Cancelled],
            Count2Completed => &[Count3InProgress, PendingReview],
            Count3InProgress => &[Count3Completed, Cancelled],
            Count3Completed => &[PendingReview],
            PendingReview => &[Finalized, Count3InProgress],
            Finalized | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn ensure_transition(self, to: SessionStatus) -> Result<(), CountingError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CountingError::InvalidStateTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Finalized | Cancelled)
    }

    pub fn in_progress(count: CountNumber) -> Self {
        match count {
            CountNumber::First => Count1InProgress,
            CountNumber::Second => Count2InProgress,
            CountNumber::Third => Count3InProgress,
        }
    }

    pub fn completed(count: CountNumber) -> Self {
        match count {
            CountNumber::First => Count1Completed,
            CountNumber::Second => Count2Completed,
            CountNumber::Third => Count3Completed,
        }
    }

    /// True once activation froze the item set and counting started.
    pub fn is_activated(self) -> bool {
        !matches!(self, Draft | Scheduled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Draft => "draft",
            Scheduled => "scheduled",
            Count1InProgress => "count_1_in_progress",
            Count1Completed => "count_1_completed",
            Count2InProgress => "count_2_in_progress",
            Count2Completed => "count_2_completed",
            Count3InProgress => "count_3_in_progress",
            Count3Completed => "count_3_completed",
            PendingReview => "pending_review",
            Finalized => "finalized",
            Cancelled => "cancelled",
        }
    }

    pub const ALL: [SessionStatus; 11] = [
        Draft,
        Scheduled,
        Count1InProgress,
        Count1Completed,
        Count2InProgress,
        Count2Completed,
        Count3InProgress,
        Count3Completed,
        PendingReview,
        Finalized,
        Cancelled,
    ];
}

impl core::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the count phases of a session are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Counts 1 and 2 are open at the same time (different counters).
    Parallel,
    /// One count number is open at a time.
    Sequential,
}
