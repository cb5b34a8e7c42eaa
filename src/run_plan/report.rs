//! Reports progress and outcomes of each [Step] as a plan runs.
//!
//! The arrangement of this module is a bit unusual. Instead of presenting a generic method that
//! the user calls with either a real or a fake trait implementation, the user chooses either a
//! real or a fake trait implementation and calls that trait's methods. Those methods call public
//! functions (`_starting`, `_report`, `_finished`) that hold all of the formatting logic and write
//! to writers that can be either real or fake stdout and stderr. This allows the real
//! implementation to lock stdout and stderr just before reporting and release the locks as soon
//! as reporting is done, while tests examine the same logic with [Vec]s.

use crate::core::Step;
use crate::error::StepError;
use crate::run_plan::{RunReport, RunStatus, StepResult};
use std::fmt::Display;
use std::io::{self, Write};
use std::ops::DerefMut;

/// Prints feedback about each [Step] to keep the user informed.
///
/// The [Runner](super::Runner) logs errors from these methods and carries on; the
/// [RunReport] is the authoritative record of what happened.
pub trait Report {
    /// Reports that a step is about to be evaluated.
    fn starting(&mut self, host: &str, step: &Step) -> io::Result<()>;

    /// Reports the outcome of a step.
    fn report(&mut self, host: &str, step: &Step, result: &StepResult) -> io::Result<()>;

    /// Reports a summary once a plan has finished on a host.
    fn finished(&mut self, report: &RunReport) -> io::Result<()>;
}

/// The real, production-ready [Report] implementation. Uses the real stdout/stderr.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reporter {
    progress_on_stderr: bool,
}

impl Reporter {
    /// Returns a [Reporter] that writes everything to stderr, leaving stdout free for
    /// machine-readable output.
    pub fn progress_on_stderr() -> Self {
        Reporter {
            progress_on_stderr: true,
        }
    }

    // Where lines that would normally go to stdout are written.
    fn progress(&self) -> Box<dyn Write> {
        match self.progress_on_stderr {
            true => Box::new(io::stderr().lock()),
            false => Box::new(io::stdout().lock()),
        }
    }
}

impl Report for Reporter {
    fn starting(&mut self, host: &str, step: &Step) -> io::Result<()> {
        _starting(&mut self.progress(), host, step)
    }

    fn report(&mut self, host: &str, step: &Step, result: &StepResult) -> io::Result<()> {
        // Lock stdout and stderr for sane output ordering. The locks are released as soon as
        // reporting is done, so we construct them here instead of storing them in the struct.
        // Stderr locks are reentrant, so this works when progress goes to stderr too.
        let mut progress = self.progress();
        let mut stderr = io::stderr().lock();
        _report(&mut progress, &mut stderr, host, step, result)
    }

    fn finished(&mut self, report: &RunReport) -> io::Result<()> {
        let mut progress = self.progress();
        let mut stderr = io::stderr().lock();
        _finished(&mut progress, &mut stderr, report)
    }
}

/// Generates a one-line identifier for a [Step], suitable for use as its title in user output.
pub fn title(step: &Step) -> String {
    if step.is_elevated() {
        format!("{} (elevated)", step.name)
    } else {
        step.name.clone()
    }
}

fn write_indented(
    mut writer: impl Write,
    header: impl Display,
    content: impl AsRef<str>,
) -> io::Result<()> {
    //                1234
    writeln!(writer, "    {header}")?;
    for line in content.as_ref().lines() {
        //                12345678
        writeln!(writer, "        {line}")?;
    }
    Ok(())
}

/// A testable function containing the logic for reporting that a [Step] is starting.
pub fn _starting<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    host: &str,
    step: &Step,
) -> io::Result<()> {
    let step = title(step);
    writeln!(
        &mut stdout,
        // Adding one extra space lines up "Starting" with "Completed" in the final output.
        "[{host}] Starting  {step}",
        // Ex:    Completed {step}
    )
}

/// A testable function containing the logic for reporting the outcome of a [Step].
pub fn _report<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    host: &str,
    step: &Step,
    result: &StepResult,
) -> io::Result<()> {
    let title = title(step);
    let err = match result {
        StepResult::Skipped => {
            return writeln!(&mut stdout, "[{host}] Skipped   {title} (already satisfied)");
        }
        StepResult::Succeeded => return writeln!(&mut stdout, "[{host}] Completed {title}"),
        StepResult::Failed(err) => err,
    };

    writeln!(&mut stderr, "[{host}] Failed    {title}")?;
    writeln!(&mut stderr, "    {err}")?;
    match err {
        StepError::CommandExecution { stderr: out, .. } if !out.trim().is_empty() => {
            write_indented(stderr.deref_mut(), "Captured stderr:", out)
        }
        _ => Ok(()),
    }
}

/// A testable function containing the logic for summarizing a finished plan.
///
/// Runs that ended cleanly go to stdout; anything with a failure goes to stderr.
pub fn _finished<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    report: &RunReport,
) -> io::Result<()> {
    let status = match report.status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
    };
    let line = format!(
        "[{}] Plan \"{}\" {status}: {} succeeded, {} skipped, {} failed",
        report.host,
        report.plan,
        report.succeeded(),
        report.skipped(),
        report.failed(),
    );

    if report.is_success() {
        writeln!(&mut stdout, "{line}")
    } else {
        writeln!(&mut stderr, "{line}")
    }
}

/// Prints a one-off message about a host, e.g. a connection failure.
pub fn print_host_message(
    mut writer: impl Write,
    host: &str,
    message: impl Display,
) -> io::Result<()> {
    writeln!(writer, "[{host}] {message}")
}
