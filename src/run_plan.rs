//! Runs [Plan]s against hosts and records what happened.
//!
//! A [Runner] walks a plan's steps in order on one [Session]. [run_plan], [run_plans] and
//! [run_plans_on_hosts] add connection handling on top: they open a session through a
//! [ManageSession], run, and close the session again whatever the outcome.

pub mod report;
pub mod session;

#[doc(hidden)]
pub mod fake;

mod outcome;

pub use outcome::{RunReport, RunStatus, StepRecord, StepResult};

use crate::core::Plan;
use crate::error::ConnectionError;
use chrono::Utc;
use report::Report;
use serde::{Deserialize, Serialize};
use session::{ManageSession, Session};
use std::time::Duration;
use tracing::{info, warn};

/// What a [Runner] does after a step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the plan. Later steps are not attempted.
    #[default]
    StopOnFailure,

    /// Record the failure and carry on with the next step.
    ContinueOnFailure,
}

/// Settings for a [Runner].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerOptions {
    pub failure_policy: FailurePolicy,

    /// Longest time any single check or action may take, in seconds. No limit if absent.
    #[serde(with = "secs")]
    pub command_timeout: Option<Duration>,
}

/// (De)serializes an optional [Duration] as whole seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_some(&duration.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Where a [Runner] is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running,

    /// The last run attempted every step.
    Completed,

    /// The last run stopped at a failed step.
    Aborted,
}

/// Executes the steps of a [Plan] in order on one session.
///
/// A [Runner] keeps no state between runs besides [RunState], so it can be reused.
#[derive(Clone, Debug, Default)]
pub struct Runner {
    options: RunnerOptions,
    state: RunState,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> Self {
        Runner {
            options,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Runs every step of `plan` on `session` and returns the report.
    ///
    /// Each step's check runs before its actions, so steps that are already satisfied are
    /// skipped. Failures never propagate as errors: they are recorded in the [RunReport], and
    /// [RunnerOptions::failure_policy] decides whether the run continues.
    pub async fn run<S: Session, R: Report>(
        &mut self,
        host: &str,
        plan: &Plan,
        session: &mut S,
        reporter: &mut R,
    ) -> RunReport {
        self.state = RunState::Running;
        info!(host, plan = %plan.name, "running plan");

        let started_at = Utc::now();
        let mut status = RunStatus::Completed;
        let mut steps = Vec::with_capacity(plan.steps().len());

        for step in plan.steps() {
            if let Err(err) = reporter.starting(host, step) {
                warn!(host, %err, "could not report progress");
            }

            let result = step.apply(session, self.options.command_timeout).await;
            if let StepResult::Failed(err) = &result {
                warn!(host, step = %step.name, %err, "step failed");
            }
            if let Err(err) = reporter.report(host, step, &result) {
                warn!(host, %err, "could not report progress");
            }

            let failed = result.is_failed();
            steps.push(StepRecord {
                name: step.name.clone(),
                result,
            });

            if failed && self.options.failure_policy == FailurePolicy::StopOnFailure {
                status = RunStatus::Aborted;
                break;
            }
        }

        let report = RunReport {
            plan: plan.name.clone(),
            host: host.to_owned(),
            status,
            started_at,
            finished_at: Utc::now(),
            steps,
        };

        self.state = match status {
            RunStatus::Completed => RunState::Completed,
            RunStatus::Aborted => RunState::Aborted,
        };
        info!(
            host,
            plan = %plan.name,
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            status = ?report.status,
            "plan finished",
        );
        if let Err(err) = reporter.finished(&report) {
            warn!(host, %err, "could not report progress");
        }
        report
    }
}

/// Connects to `host`, runs `plan` and disconnects.
///
/// The session is closed whether or not the plan succeeds. A failure to close is logged but does
/// not change the report.
///
/// # Errors
///
/// Returns [ConnectionError] if the host cannot be reached. No steps run in that case.
pub async fn run_plan<S, M, R>(
    plan: &Plan,
    host: &str,
    connector: &mut M,
    reporter: &mut R,
    options: RunnerOptions,
) -> Result<RunReport, ConnectionError>
where
    S: Session,
    M: ManageSession<S>,
    R: Report,
{
    let mut session = connector.connect(host).await?;
    let report = Runner::new(options)
        .run(host, plan, &mut session, reporter)
        .await;
    close(host, session).await;
    Ok(report)
}

/// Connects to `host` once and runs `plans` in order on that session.
///
/// Returns one report per plan that was started. A plan that ends [RunStatus::Aborted] is the
/// last one started on the host, whatever the [FailurePolicy].
///
/// # Errors
///
/// Returns [ConnectionError] if the host cannot be reached. No plans run in that case.
pub async fn run_plans<S, M, R>(
    plans: &[Plan],
    host: &str,
    connector: &mut M,
    reporter: &mut R,
    options: RunnerOptions,
) -> Result<Vec<RunReport>, ConnectionError>
where
    S: Session,
    M: ManageSession<S>,
    R: Report,
{
    let mut session = connector.connect(host).await?;
    let mut reports = Vec::with_capacity(plans.len());
    for plan in plans {
        let report = Runner::new(options)
            .run(host, plan, &mut session, reporter)
            .await;
        let aborted = report.status == RunStatus::Aborted;
        reports.push(report);
        if aborted {
            info!(host, plan = %plan.name, "not starting later plans");
            break;
        }
    }
    close(host, session).await;
    Ok(reports)
}

/// Runs `plans` on each host in turn with [run_plans], one session per host.
///
/// Returns one entry per host, in the order given. A connection failure or an aborted plan on
/// one host does not stop the others.
pub async fn run_plans_on_hosts<S, M, R>(
    plans: &[Plan],
    hosts: &[String],
    connector: &mut M,
    reporter: &mut R,
    options: RunnerOptions,
) -> Vec<(String, Result<Vec<RunReport>, ConnectionError>)>
where
    S: Session,
    M: ManageSession<S>,
    R: Report,
{
    let mut results = Vec::with_capacity(hosts.len());
    for host in hosts {
        let result = run_plans(plans, host, connector, reporter, options).await;
        if let Err(err) = &result {
            warn!(host = %host, %err, "skipping host");
        }
        results.push((host.clone(), result));
    }
    results
}

async fn close<S: Session>(host: &str, session: S) {
    if let Err(err) = session.close().await {
        warn!(host, %err, "could not close session");
    }
}
