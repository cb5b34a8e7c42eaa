//! The results of running steps and plans.

use crate::error::StepError;
use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// The outcome of one [Step](crate::core::Step).
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    /// The check showed the desired state already holds. No actions ran.
    Skipped,

    /// Every action ran and succeeded.
    Succeeded,

    /// The check could not be evaluated or an action failed.
    Failed(StepError),
}

impl StepResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepResult::Failed(_))
    }

    /// A one-word label for user output.
    pub fn label(&self) -> &'static str {
        match self {
            StepResult::Skipped => "skipped",
            StepResult::Succeeded => "succeeded",
            StepResult::Failed(_) => "failed",
        }
    }
}

/// A [StepResult] together with the name of the step it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRecord {
    pub name: String,
    pub result: StepResult,
}

// Serialized flat, as `{name, outcome, detail}`, so that reports read well as YAML.
impl Serialize for StepRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let detail = match &self.result {
            StepResult::Failed(err) => Some(err.to_string()),
            _ => None,
        };
        let mut record = serializer.serialize_struct("StepRecord", 3)?;
        record.serialize_field("name", &self.name)?;
        record.serialize_field("outcome", self.result.label())?;
        match detail {
            Some(detail) => record.serialize_field("detail", &detail)?,
            None => record.skip_field("detail")?,
        }
        record.end()
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step was attempted.
    Completed,

    /// A step failed under [FailurePolicy::StopOnFailure](super::FailurePolicy::StopOnFailure)
    /// and the remaining steps were not attempted.
    Aborted,
}

/// The outcome of running one [Plan](crate::core::Plan) on one host.
///
/// `steps` holds one record per attempted step, in plan order. After an abort, steps that were
/// never attempted have no record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub plan: String,
    pub host: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.count(|r| *r == StepResult::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(|r| *r == StepResult::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(StepResult::is_failed)
    }

    /// Whether the run completed with no failed steps.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed && self.failed() == 0
    }

    /// Returns the result recorded for the step named `name`, if it was attempted.
    pub fn result_of(&self, name: &str) -> Option<&StepResult> {
        self.steps
            .iter()
            .find(|record| record.name == name)
            .map(|record| &record.result)
    }

    fn count(&self, predicate: impl Fn(&StepResult) -> bool) -> usize {
        self.steps.iter().filter(|r| predicate(&r.result)).count()
    }
}
