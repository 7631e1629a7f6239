//! Step and document status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a single pipeline step for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not started yet.
    #[default]
    Pending,
    /// An attempt currently holds the step.
    InProgress,
    /// Finished successfully; the output is stored.
    Completed,
    /// The last attempt failed.
    Failed,
    /// Deliberately skipped.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl StepStatus {
    /// Returns true if a following step may start.
    #[must_use]
    pub fn satisfies_prerequisite(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Returns true if no further transition happens without caller action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    ///
    /// `IN_PROGRESS -> IN_PROGRESS` covers takeover of an abandoned claim and
    /// `IN_PROGRESS -> PENDING` the release of a cancelled one.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Skipped)
                | (Self::InProgress, Self::Completed | Self::Failed | Self::InProgress)
                | (Self::Failed, Self::InProgress | Self::Skipped)
                | (Self::InProgress, Self::Pending)
        )
    }
}

/// The overall status of a document, derived from its step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// No step has started.
    #[default]
    Pending,
    /// Some steps are done or running.
    Processing,
    /// Every step is completed or skipped.
    Completed,
    /// A step failed.
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl DocumentStatus {
    /// Derives the document status from step statuses in pipeline order.
    pub fn derive<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StepStatus>,
    {
        let mut all_pending = true;
        let mut all_done = true;
        let mut any = false;

        for status in statuses {
            any = true;
            if status == StepStatus::Failed {
                return Self::Failed;
            }
            all_pending &= status == StepStatus::Pending;
            all_done &= status.satisfies_prerequisite();
        }

        if !any || all_pending {
            Self::Pending
        } else if all_done {
            Self::Completed
        } else {
            Self::Processing
        }
    }
}
