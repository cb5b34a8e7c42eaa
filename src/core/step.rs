//! Types for representing steps: one guarded unit of provisioning work.

use crate::core::action::{Action, Upload};
use crate::core::command::{Command, Privilege};
#[cfg(doc)]
use crate::core::plan::Plan;
use crate::error::{QueryError, StepError};
use crate::run_plan::session::{CommandOutput, Session};
use crate::run_plan::StepResult;
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Mapping;
use std::fs;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// What a check command's output must look like for the check to pass.
///
/// Every expectation also requires the command to exit with code 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Exit code 0 is enough.
    #[default]
    Success,

    /// Standard output contains something other than white space. This is the shape of a
    /// row-existence query such as `psql -tAc "SELECT 1 FROM pg_roles WHERE rolname='x'"`.
    NonEmpty,

    /// Standard output matches a regular expression.
    Matches(String),
}

impl Expect {
    /// Evaluates this expectation against a command's output.
    ///
    /// # Errors
    ///
    /// Returns an error if [Expect::Matches] holds an invalid regular expression.
    pub fn is_met(&self, output: &CommandOutput) -> Result<bool, regex::Error> {
        if !output.success() {
            return Ok(false);
        }
        Ok(match self {
            Expect::Success => true,
            Expect::NonEmpty => !output.stdout.trim().is_empty(),
            Expect::Matches(pattern) => Regex::new(pattern)?.is_match(&output.stdout),
        })
    }
}

/// An idempotency check: a command plus the result that means "already done".
///
/// In plan files the command's keys and `expect` share one mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Check {
    #[serde(flatten)]
    pub command: Command,

    #[serde(serialize_with = "serde_yaml::with::singleton_map::serialize")]
    pub expect: Expect,
}

impl Check {
    pub fn new(command: Command, expect: Expect) -> Self {
        Check { command, expect }
    }
}

// `expect` is split off by hand so that Command sees the remaining keys and rejects unknown ones.
impl<'de> Deserialize<'de> for Check {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Mapping::deserialize(deserializer)?;
        let expect = match fields.shift_remove("expect") {
            Some(value) => serde_yaml::with::singleton_map::deserialize(value),
            None => Ok(Expect::default()),
        }
        .map_err(D::Error::custom)?;
        let command = Command::deserialize(serde_yaml::Value::Mapping(fields))
            .map_err(D::Error::custom)?;
        Ok(Check { command, expect })
    }
}

/// A named unit of work, guarded by an optional idempotency check.
///
/// A [Step] is an immutable descriptor. Running it never changes it, so the same [Step] can be
/// evaluated any number of times, by any number of runs.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// The [Step]'s name. Used in reports, so it should be unique within its [Plan].
    pub name: String,

    /// The default privilege for [Self::check] and [Self::actions].
    #[serde(default)]
    pub privilege: Privilege,

    /// The default user for elevated commands in this step.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,

    /// Decides whether the step is already satisfied.
    ///
    /// A step without a check is never satisfied, so its actions run every time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub check: Option<Check>,

    /// Commands and uploads that establish the desired state. Run in order.
    pub actions: Vec<Action>,
}

impl Step {
    /// Creates a [Step] with no check and no actions.
    pub fn new(name: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            privilege: Privilege::Normal,
            user: None,
            check: None,
            actions: Vec::new(),
        }
    }

    /// Builder-style setter for [Self::check].
    pub fn check(mut self, command: Command, expect: Expect) -> Self {
        self.check = Some(Check::new(command, expect));
        self
    }

    /// Builder-style method that appends an action.
    pub fn action(mut self, action: impl Into<Action>) -> Self {
        self.actions.push(action.into());
        self
    }

    /// Builder-style setter for the step's default privilege and user.
    pub fn run_as(mut self, privilege: Privilege, user: Option<&str>) -> Self {
        self.privilege = privilege;
        self.user = user.map(str::to_owned);
        self
    }

    /// Whether any command in this step runs with [Privilege::Elevated].
    pub fn is_elevated(&self) -> bool {
        let check = self.check.iter().map(|c| c.command.privilege);
        let actions = self.actions.iter().map(|a| a.identity().0);
        check
            .chain(actions)
            .any(|p| p.unwrap_or(self.privilege) == Privilege::Elevated)
    }

    /// Returns `command` with this step's defaults filled in.
    fn resolve(&self, command: &Command) -> Command {
        command.inherit(self.privilege, self.user.as_deref())
    }

    /// Runs the idempotency check.
    ///
    /// Returns `Ok(true)` if the step is already satisfied and `Ok(false)` if its actions need to
    /// run. A step with no check is never satisfied.
    ///
    /// # Errors
    ///
    /// Fails closed: if the check cannot produce an answer, e.g. because the session is gone or
    /// the check command does not exist on the host, returns
    /// [StepError::AmbiguousPrecondition]. Returns [StepError::Timeout] if the check runs longer
    /// than `timeout`.
    pub async fn evaluate<S: Session>(
        &self,
        session: &mut S,
        timeout: Option<Duration>,
    ) -> Result<bool, StepError> {
        let Some(check) = &self.check else {
            return Ok(false);
        };
        let command = self.resolve(&check.command);

        debug!(step = %self.name, command = %command.run, "evaluating check");
        let answer = within(timeout, &command, session.query(&command, &check.expect)).await?;
        answer.map_err(|err: QueryError| StepError::AmbiguousPrecondition {
            command: command.run.clone(),
            reason: err.to_string(),
        })
    }

    /// Runs the step's actions unless the step is already satisfied.
    ///
    /// The check runs first, every time, so a step applied twice in a row skips the second time.
    /// Actions run in order and stop at the first one that fails.
    pub async fn apply<S: Session>(&self, session: &mut S, timeout: Option<Duration>) -> StepResult {
        match self.evaluate(session, timeout).await {
            Ok(true) => StepResult::Skipped,
            Ok(false) => match self.run_actions(session, timeout).await {
                Ok(()) => StepResult::Succeeded,
                Err(err) => StepResult::Failed(err),
            },
            Err(err) => StepResult::Failed(err),
        }
    }

    async fn run_actions<S: Session>(
        &self,
        session: &mut S,
        timeout: Option<Duration>,
    ) -> Result<(), StepError> {
        for action in &self.actions {
            let (command, input) = match action {
                Action::Run(command) => (self.resolve(command), None),
                Action::Upload(upload) => {
                    let (command, contents) = self.prepare_upload(upload)?;
                    (command, Some(contents))
                }
            };
            debug!(step = %self.name, command = %command.run, "running action");

            let sent = match &input {
                None => within(timeout, &command, session.execute(&command)).await?,
                Some(input) => {
                    within(timeout, &command, session.execute_with_input(&command, input)).await?
                }
            };
            let output = sent.map_err(|source| StepError::Session {
                command: command.run.clone(),
                source,
            })?;

            if !output.success() {
                return Err(StepError::CommandExecution {
                    command: command.run,
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
        }
        Ok(())
    }

    /// Reads the local file and builds the command that receives it.
    fn prepare_upload(&self, upload: &Upload) -> Result<(Command, Vec<u8>), StepError> {
        let failed = |reason: String| StepError::Upload {
            from: upload.from.clone(),
            reason,
        };
        let receiver = upload.receiver().map_err(|err| failed(err.to_string()))?;
        let contents = fs::read(&upload.from).map_err(|err| failed(err.to_string()))?;
        Ok((self.resolve(&receiver), contents))
    }
}

/// Awaits `future`, giving up after `limit` if there is one.
async fn within<F: Future>(
    limit: Option<Duration>,
    command: &Command,
    future: F,
) -> Result<F::Output, StepError> {
    match limit {
        None => Ok(future.await),
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| StepError::Timeout {
                command: command.run.clone(),
                timeout: limit,
            }),
    }
}
