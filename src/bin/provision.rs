//! Runs provisioning plans against remote hosts over SSH.
//!
//! ```text
//! provision [--config FILE] [--host HOST]... [--var KEY=VALUE]... PLAN_FILE...
//! ```
//!
//! Every plan is loaded, validated and compiled before any host is contacted. Each host then runs
//! every plan in order. A plan that aborts on a host prevents later plans from starting there.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use provision::config::Config;
use provision::core::{load_plans, Plan};
use provision::run_plan::report::{print_host_message, Reporter};
use provision::run_plan::session::SshConnector;
use provision::run_plan::{run_plans_on_hosts, FailurePolicy, RunReport};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Progress lines only.
    #[default]
    Text,

    /// Every run report as YAML on stdout. Progress lines go to stderr.
    Yaml,
}

#[derive(Debug, Parser)]
#[command(version, about = "Idempotent provisioning of remote hosts over SSH")]
struct Cli {
    /// Configuration file. Defaults to /etc/provision/config.yaml if it exists.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host to provision. May be repeated. Replaces the hosts in the configuration.
    #[arg(long = "host", value_name = "HOST")]
    hosts: Vec<String>,

    /// Variable for plan substitution. May be repeated. Overrides configuration variables.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    /// Keep running after a step fails.
    #[arg(long, conflicts_with = "stop_on_failure")]
    continue_on_failure: bool,

    /// Stop a plan at the first failed step (the default).
    #[arg(long)]
    stop_on_failure: bool,

    /// Longest time, in seconds, that any single check or action may take.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, value_enum, default_value_t)]
    format: Format,

    /// Plan files to run, in order.
    #[arg(value_name = "PLAN_FILE", required = true)]
    plans: Vec<PathBuf>,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every host connected and every step succeeded or was skipped.
async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    apply_overrides(&mut config, &cli);

    if config.hosts.is_empty() {
        bail!("no hosts to provision; pass --host or list hosts in the configuration");
    }

    let mut plans = Vec::new();
    for path in &cli.plans {
        for plan in load_plans(path)? {
            plans.push(prepare(plan, &config)?);
        }
    }

    let mut connector = SshConnector::new(config.ssh.clone());
    let mut reporter = reporter_for(cli.format);
    let results = run_plans_on_hosts(
        &plans,
        &config.hosts,
        &mut connector,
        &mut reporter,
        config.runner,
    )
    .await;

    let mut all_ok = true;
    let mut reports: Vec<RunReport> = Vec::new();
    for (host, result) in results {
        match result {
            Ok(host_reports) => {
                all_ok &= host_reports.iter().all(RunReport::is_success);
                reports.extend(host_reports);
            }
            Err(err) => {
                all_ok = false;
                if let Err(io_err) = print_host_message(io::stderr().lock(), &host, &err) {
                    warn!(host = %host, %err, %io_err, "could not report connection failure");
                }
            }
        }
    }

    if cli.format == Format::Yaml {
        let yaml = serde_yaml::to_string(&reports).context("could not serialize run reports")?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "---")?;
        write!(stdout, "{yaml}")?;
    }
    Ok(all_ok)
}

fn reporter_for(format: Format) -> Reporter {
    match format {
        Format::Text => Reporter::default(),
        Format::Yaml => Reporter::progress_on_stderr(),
    }
}

/// Folds command-line options into the configuration.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if !cli.hosts.is_empty() {
        config.hosts = cli.hosts.clone();
    }
    for (key, value) in &cli.vars {
        config.vars.insert(key.clone(), value.clone());
    }
    if cli.continue_on_failure {
        config.runner.failure_policy = FailurePolicy::ContinueOnFailure;
    }
    if cli.stop_on_failure {
        config.runner.failure_policy = FailurePolicy::StopOnFailure;
    }
    if let Some(secs) = cli.timeout {
        config.runner.command_timeout = Some(Duration::from_secs(secs));
    }
}

/// Compiles a freshly loaded plan with the configuration's variables, then validates it.
fn prepare(plan: Plan, config: &Config) -> anyhow::Result<Plan> {
    let source = plan
        .source
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let plan = plan.compile(&config.vars);
    plan.validate()
        .with_context(|| format!("invalid plan \"{}\" in {source}", plan.name))?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use provision::core::{Command, Step};
    use provision::error::PlanError;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["provision"];
        argv.extend_from_slice(args);
        argv.push("plan.yaml");
        Cli::try_parse_from(argv).unwrap()
    }

    fn configured() -> Config {
        let mut config = Config {
            hosts: vec!["dashboard".to_owned(), "metrics".to_owned()],
            ..Default::default()
        };
        config.vars.insert("db_user".to_owned(), "config".to_owned());
        config.vars.insert("db_name".to_owned(), "graphite".to_owned());
        config
    }

    mod parse_var {
        use super::*;

        #[test]
        fn splits_at_first_equals_sign() {
            assert_eq!(
                Ok(("opts".to_owned(), "a=b".to_owned())),
                parse_var("opts=a=b")
            );
            assert_eq!(Ok(("empty".to_owned(), String::new())), parse_var("empty="));
        }

        #[test]
        fn rejects_missing_key_or_separator() {
            assert!(parse_var("=value").is_err());
            assert!(parse_var("novalue").is_err());
        }

        #[test]
        fn is_wired_into_the_parser() {
            assert!(Cli::try_parse_from(["provision", "--var", "oops", "plan.yaml"]).is_err());
        }
    }

    mod apply_overrides {
        use super::*;

        #[test]
        fn no_flags_keep_config() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&[]));
            assert_eq!(configured(), config);
        }

        #[test]
        fn hosts_replace_config_hosts() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&["--host", "web1", "--host", "web2"]));
            assert_eq!(vec!["web1".to_owned(), "web2".to_owned()], config.hosts);
        }

        #[test]
        fn vars_override_config_vars() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&["--var", "db_user=cli", "--var", "new=1"]));
            assert_eq!("cli", config.vars["db_user"]);
            assert_eq!("graphite", config.vars["db_name"]);
            assert_eq!("1", config.vars["new"]);
        }

        #[test]
        fn selects_failure_policy() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&["--continue-on-failure"]));
            assert_eq!(FailurePolicy::ContinueOnFailure, config.runner.failure_policy);

            apply_overrides(&mut config, &cli(&["--stop-on-failure"]));
            assert_eq!(FailurePolicy::StopOnFailure, config.runner.failure_policy);
        }

        #[test]
        fn policy_flags_conflict() {
            let argv = [
                "provision",
                "--continue-on-failure",
                "--stop-on-failure",
                "plan.yaml",
            ];
            assert!(Cli::try_parse_from(argv).is_err());
        }

        #[test]
        fn sets_timeout() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&["--timeout", "30"]));
            assert_eq!(Some(Duration::from_secs(30)), config.runner.command_timeout);
        }
    }

    mod prepare {
        use super::*;

        fn grant_plan() -> Plan {
            let mut plan = Plan::new("grants").step(
                Step::new("grant").action(Command::new("grant ${db_name} to $db_user")),
            );
            plan.vars = IndexMap::from([("db_user".to_owned(), "plan".to_owned())]);
            plan
        }

        fn compiled_run(plan: &Plan) -> &str {
            &plan.steps()[0].actions[0].command().unwrap().run
        }

        #[test]
        fn plan_vars_beat_cli_vars() {
            let mut config = configured();
            apply_overrides(&mut config, &cli(&["--var", "db_user=cli", "--var", "db_name=cli"]));

            let plan = prepare(grant_plan(), &config).unwrap();
            assert_eq!("grant cli to plan", compiled_run(&plan));
        }

        #[test]
        fn invalid_plan_names_plan_and_problem() {
            let plan = Plan::new("broken").step(Step::new("empty"));
            let err = prepare(plan, &configured()).unwrap_err();

            assert!(format!("{err:#}").contains("invalid plan \"broken\""));
            assert_eq!(
                Some(&PlanError::NoActions {
                    step: "empty".to_owned()
                }),
                err.downcast_ref::<PlanError>(),
            );
        }
    }

    #[test]
    fn yaml_format_keeps_stdout_for_reports() {
        assert_eq!(Reporter::progress_on_stderr(), reporter_for(Format::Yaml));
        assert_eq!(Reporter::default(), reporter_for(Format::Text));
        assert_eq!(Format::Text, cli(&[]).format);
        assert_eq!(Format::Yaml, cli(&["--format", "yaml"]).format);
    }
}
