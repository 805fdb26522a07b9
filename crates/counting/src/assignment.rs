//! Assignment tracker records: which counter may submit which count number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocktake_core::UserId;

use crate::ids::CountNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    InProgress,
    Completed,
    /// Derived at read time; never stored.
    Overdue,
}

impl AssignmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Pending => "pending",
            AssignmentStatus::InProgress => "in_progress",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Overdue => "overdue",
        }
    }
}

/// One counter's assignment to one count number (and third-count round).
///
/// Completion does not close the write window: the counter may keep
/// correcting their entries for as long as the session phase is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountingAssignment {
    pub counter: UserId,
    pub count_number: CountNumber,
    /// Always 1 for counts 1 and 2; increments per third-count trigger.
    pub round: u32,
    pub(crate) status: AssignmentStatus,
    pub opened_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl CountingAssignment {
    pub(crate) fn open(
        counter: UserId,
        count_number: CountNumber,
        round: u32,
        opened_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            counter,
            count_number,
            round,
            status: AssignmentStatus::Pending,
            opened_at,
            started_at: None,
            completed_at: None,
            deadline,
        }
    }

    /// Stored status (never `overdue`).
    pub fn stored_status(&self) -> AssignmentStatus {
        self.status
    }

    /// Status as seen at `now`: an unfinished assignment past its deadline is `overdue`.
    pub fn status_at(&self, now: DateTime<Utc>) -> AssignmentStatus {
        match (self.status, self.deadline) {
            (AssignmentStatus::Completed, _) => AssignmentStatus::Completed,
            (_, Some(deadline)) if now > deadline => AssignmentStatus::Overdue,
            (status, _) => status,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AssignmentStatus::Completed
    }

    pub(crate) fn mark_started(&mut self, at: DateTime<Utc>) {
        if self.status == AssignmentStatus::Pending {
            self.status = AssignmentStatus::InProgress;
            self.started_at = Some(at);
        }
    }

    pub(crate) fn mark_completed(&mut self, at: DateTime<Utc>) {
        self.status = AssignmentStatus::Completed;
        self.completed_at = Some(at);
    }

    /// New items arrived in scope (unexpected item registration).
    pub(crate) fn reopen(&mut self) {
        if self.status == AssignmentStatus::Completed {
            self.status = AssignmentStatus::InProgress;
            self.completed_at = None;
        }
    }
}
