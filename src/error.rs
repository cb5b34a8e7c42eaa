//! Error types shared across the crate.
//!
//! Only [ConnectionError] is fatal to a run. Everything else is captured into a
//! [StepResult](crate::run_plan::StepResult) and surfaces through the
//! [RunReport](crate::run_plan::RunReport).

use std::time::Duration;
use thiserror::Error;

/// Describes an exit code for user output, e.g. `exit code 2`.
///
/// A missing code means the remote process was killed by a signal.
pub fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(i) => format!("exit code {i}"),
        None => "a signal".to_string(),
    }
}

/// Could not reach or authenticate to a host. No steps can run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("could not connect to {host}: {reason}")]
pub struct ConnectionError {
    pub host: String,
    pub reason: String,
}

/// The session could not run a command at all.
///
/// This is distinct from a command that ran and exited with an error, which is reported through
/// the exit code in [CommandOutput](crate::run_plan::session::CommandOutput).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is disconnected")]
    Disconnected,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Why an idempotency check could not produce a yes-or-no answer.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The check command never really ran, e.g. the shell could not find it.
    #[error("check command could not run ({})", describe_exit(.exit_code))]
    NotRunnable {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("invalid expected-output pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// The reason a step failed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StepError {
    /// An action ran and exited unsuccessfully.
    #[error("`{command}` exited with {}", describe_exit(.exit_code))]
    CommandExecution {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The idempotency check could not be evaluated, so the step fails closed.
    #[error("could not evaluate precondition `{command}`: {reason}")]
    AmbiguousPrecondition { command: String, reason: String },

    #[error("`{command}` timed out after {}s", .timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },

    /// A file could not be prepared for upload.
    #[error("could not upload `{from}`: {reason}")]
    Upload { from: String, reason: String },

    /// An action could not be sent to the host.
    #[error("could not run `{command}`: {source}")]
    Session {
        command: String,
        #[source]
        source: SessionError,
    },
}

/// Problems found while validating a [Plan](crate::core::Plan).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has an empty name")]
    EmptyPlanName,

    #[error("plan \"{plan}\" has a step with an empty name")]
    EmptyStepName { plan: String },

    #[error("plan \"{plan}\" has more than one step named \"{step}\"")]
    DuplicateStep { plan: String, step: String },

    #[error("step \"{step}\" has no actions")]
    NoActions { step: String },

    #[error("step \"{step}\" has a command with nothing to run")]
    EmptyCommand { step: String },

    #[error("step \"{step}\" has an upload with an empty path")]
    EmptyUploadPath { step: String },

    #[error("step \"{step}\" sets environment variable \"{name}\", which is not a valid name")]
    InvalidEnvName { step: String, name: String },

    #[error("step \"{step}\" runs as user \"{user}\" without elevated privilege")]
    UserWithoutElevation { step: String, user: String },

    #[error("step \"{step}\" has an invalid check pattern: {reason}")]
    InvalidPattern { step: String, reason: String },

    #[error("step \"{step}\" has a command containing a NUL byte")]
    NulByte { step: String },
}
