//! Types for representing plans: named, ordered lists of steps.

use crate::core::action::Action;
use crate::core::command::{is_env_name, Command, Privilege};
use crate::core::step::{Expect, Step};
use crate::error::PlanError;
use anyhow::Context;
use indexmap::IndexMap;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A named, ordered list of [Step]s describing one provisioning procedure.
///
/// This type is typically parsed from a plan file, but it can be constructed programmatically as
/// well. A [Plan] holds no execution logic; see [Runner](crate::run_plan::Runner).
///
/// Steps must be written so that any prefix of the plan may already have been applied: a run
/// that stopped halfway can simply be started again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Where this plan came from.
    ///
    /// For instance, a plan loaded from a file should set this to the path to the file. For plans
    /// built in Rust there is no standard value.
    #[serde(skip)]
    pub source: Option<PathBuf>,

    /// The [Plan]'s name. Used in reports and logs.
    pub name: String,

    /// [Plan]-level variables, which are substituted by [Plan::compile].
    ///
    /// Order is preserved from the source file and determines substitution order.
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub vars: IndexMap<String, String>,

    /// The steps, in execution order.
    pub steps: Vec<Step>,
}

/// Loads every [Plan] from a YAML file.
///
/// A file may hold several plans as separate YAML documents (separated by `---`). Each returned
/// plan records `path` as its [Plan::source], and relative upload paths are resolved against the
/// file's directory.
pub fn load_plans(path: impl AsRef<Path>) -> anyhow::Result<Vec<Plan>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("could not read plan file {}", path.display()))?;
    let mut plans = parse_plans(&contents)
        .with_context(|| format!("could not parse plan file {}", path.display()))?;
    let dir = path.parent().unwrap_or(Path::new(""));
    for plan in &mut plans {
        plan.source = Some(path.to_owned());
        for step in &mut plan.steps {
            for action in &mut step.actions {
                if let Action::Upload(upload) = action {
                    upload.resolve_against(dir);
                }
            }
        }
    }
    Ok(plans)
}

/// Parses every [Plan] from a string holding one or more YAML documents.
pub fn parse_plans(yaml: &str) -> Result<Vec<Plan>, serde_yaml::Error> {
    serde_yaml::Deserializer::from_str(yaml)
        .map(Plan::deserialize)
        .collect()
}

impl Plan {
    /// Creates a [Plan] with no steps.
    pub fn new(name: impl Into<String>) -> Self {
        Plan {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style method that appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Returns the steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Checks that the plan can run.
    ///
    /// # Errors
    ///
    /// Returns the first problem found:
    /// - the plan or a step has an empty name, or two steps share a name;
    /// - a step has no actions, a command has nothing to run, or an upload has an empty path;
    /// - an environment variable name is not a shell identifier;
    /// - a command names a user without elevated privilege;
    /// - an [Expect::Matches] pattern does not compile;
    /// - a command contains a NUL byte.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::EmptyPlanName);
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(PlanError::EmptyStepName {
                    plan: self.name.clone(),
                });
            }
            if !names.insert(step.name.as_str()) {
                return Err(PlanError::DuplicateStep {
                    plan: self.name.clone(),
                    step: step.name.clone(),
                });
            }
            validate_step(step)?;
        }
        Ok(())
    }

    /// Returns a copy of this plan with variables substituted.
    ///
    /// # Variable precedence
    ///
    /// `vars` (typically from the configuration) are merged first, and [Plan::vars] take
    /// precedence. For example, if the configuration sets `db_user` to `graphite` and the plan
    /// sets it to `dashboard`, the final value is `dashboard`.
    ///
    /// # Variable substitution
    ///
    /// Variables are interpolated into every command field (`run`, `user`, `cwd`, `prefix` and
    /// `env` values), into upload paths and users, and into [Expect::Matches] patterns. There are two forms:
    ///
    /// 1. Simple substitution (`$var`): matches on word boundaries, so `$foobar.baz` matches the
    ///    variable `foobar` but not `foo`. Use braced substitution for the latter: `${foo}bar`.
    ///
    /// 2. Braced substitution (`${var}`): a plain text substitution, not recursive.
    ///
    /// Unknown variables are left alone, so shell variables pass through to the remote host.
    ///
    /// # Substitution order
    ///
    /// Variables are substituted in the order in which they are defined, with `vars` before
    /// [Plan::vars]. Cascading substitution works to a limited degree because of this ordering,
    /// though relying on it is not recommended.
    ///
    /// ```
    /// # use provision::core::{Command, Plan, Step};
    /// # use indexmap::IndexMap;
    /// let mut plan = Plan::new("graphite")
    ///     .step(Step::new("create").action(Command::new("createdb $db && echo $HOME")));
    /// plan.vars.insert("db".to_owned(), "graphite".to_owned());
    ///
    /// let plan = plan.compile(&IndexMap::new());
    /// assert_eq!(
    ///     "createdb graphite && echo $HOME",
    ///     plan.steps()[0].actions[0].command().unwrap().run,
    /// );
    /// ```
    pub fn compile(&self, vars: &IndexMap<String, String>) -> Plan {
        let mut plan = self.clone();

        // To implement precedence, merge variables in order, then substitute in order.
        let mut merged = vars.clone();
        for (var, value) in &self.vars {
            merged.insert(var.clone(), value.clone());
        }

        // Substitute with one regular expression per variable rather than two naive string
        // passes, so that `$var` and `${var}` cannot feed into each other.
        for (var, value) in &merged {
            let pattern = format!(r"\${var}\b|\$\{{{var}}}", var = regex::escape(var));
            let Ok(regex) = Regex::new(&pattern) else {
                continue;
            };

            let replace = |s: &mut String| {
                *s = regex.replace_all(s.as_str(), NoExpand(value)).into_owned();
            };

            for step in &mut plan.steps {
                if let Some(user) = &mut step.user {
                    replace(user);
                }
                if let Some(check) = &mut step.check {
                    check.command.rewrite(&replace);
                    if let Expect::Matches(pattern) = &mut check.expect {
                        replace(pattern);
                    }
                }
                for action in &mut step.actions {
                    action.rewrite(&replace);
                }
            }
        }
        plan
    }
}

fn validate_step(step: &Step) -> Result<(), PlanError> {
    if step.actions.is_empty() {
        return Err(PlanError::NoActions {
            step: step.name.clone(),
        });
    }

    if let Some(check) = &step.check {
        validate_command(step, &check.command)?;
        if let Expect::Matches(pattern) = &check.expect {
            Regex::new(pattern).map_err(|err| PlanError::InvalidPattern {
                step: step.name.clone(),
                reason: err.to_string(),
            })?;
        }
    }

    for action in &step.actions {
        match action {
            Action::Run(command) => validate_command(step, command)?,
            Action::Upload(upload) => {
                if upload.from.trim().is_empty() || upload.to.trim().is_empty() {
                    return Err(PlanError::EmptyUploadPath {
                        step: step.name.clone(),
                    });
                }
                if upload.from.contains('\0') {
                    return Err(PlanError::NulByte {
                        step: step.name.clone(),
                    });
                }
                let receiver = upload.receiver().map_err(|_| PlanError::NulByte {
                    step: step.name.clone(),
                })?;
                validate_command(step, &receiver)?;
            }
        }
    }
    Ok(())
}

fn validate_command(step: &Step, command: &Command) -> Result<(), PlanError> {
    if command.run.trim().is_empty() {
        return Err(PlanError::EmptyCommand {
            step: step.name.clone(),
        });
    }
    if command.has_nul() || step.user.as_deref().is_some_and(|u| u.contains('\0')) {
        return Err(PlanError::NulByte {
            step: step.name.clone(),
        });
    }
    if let Some(name) = command.env.keys().find(|name| !is_env_name(name)) {
        return Err(PlanError::InvalidEnvName {
            step: step.name.clone(),
            name: name.clone(),
        });
    }

    let command = command.inherit(step.privilege, step.user.as_deref());
    match (&command.user, command.privilege()) {
        (Some(user), Privilege::Normal) => Err(PlanError::UserWithoutElevation {
            step: step.name.clone(),
            user: user.clone(),
        }),
        _ => Ok(()),
    }
}
