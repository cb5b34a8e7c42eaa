//! Verifies deserialization of plan files.
//!
//! Plans, steps and commands are not tested on their own here; steps and commands are used in the
//! context of plans, since that is how users write them.

use indexmap::IndexMap;
use provision::core::*;
use std::path::{Path, PathBuf};

fn resource(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("resources/test/plans")
        .join(name)
}

fn parse(yaml: &str) -> Plan {
    let mut plans = plan::parse_plans(yaml).unwrap();
    assert_eq!(1, plans.len(), "expected exactly one plan");
    plans.remove(0)
}

mod plan_file {
    use super::*;

    #[test]
    fn loads_dashboard_plan() {
        let plans = load_plans(resource("dashboard.yaml")).unwrap();
        assert_eq!(1, plans.len());

        let plan = &plans[0];
        assert_eq!(Some(resource("dashboard.yaml")), plan.source);
        assert_eq!("dashboard database", plan.name);
        assert_eq!(
            IndexMap::from([
                ("db_user".to_owned(), "dashboard".to_owned()),
                ("db_name".to_owned(), "graphite".to_owned()),
            ]),
            plan.vars,
        );

        let names: Vec<_> = plan.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            vec!["create database user", "create database", "grant privileges"],
            names,
        );

        let first = &plan.steps()[0];
        assert_eq!(Privilege::Elevated, first.privilege);
        assert_eq!(Some("postgres".to_owned()), first.user);
        assert_eq!(
            Some(Check::new(Command::new("has user:$db_user"), Expect::NonEmpty)),
            first.check,
        );
        assert_eq!(vec![Action::from(Command::new("set user:$db_user"))], first.actions);
        assert_eq!(Ok(()), plan.validate());
    }

    #[test]
    fn loads_multiple_documents() {
        let plans = load_plans(resource("graphite.yaml")).unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(vec!["graphite", "nginx"], names);
        for plan in &plans {
            assert_eq!(Some(resource("graphite.yaml")), plan.source);
        }
    }

    #[test]
    fn loads_command_context() {
        let plans = load_plans(resource("graphite.yaml")).unwrap();
        let step = &plans[0].steps()[2];

        let mut expected = Command::new("bin/carbon-cache.py start");
        expected.cwd = Some("$graphite_dir".to_owned());
        expected.env.insert("GRAPHITE_ROOT".to_owned(), "$graphite_dir".to_owned());
        expected
            .env
            .insert("PYTHONPATH".to_owned(), "$graphite_dir/webapp".to_owned());
        assert_eq!(vec![Action::from(expected)], step.actions);

        // Order is preserved from the source file.
        let keys: Vec<_> = step.actions[0].command().unwrap().env.keys().collect();
        assert_eq!(vec!["GRAPHITE_ROOT", "PYTHONPATH"], keys);
    }

    #[test]
    fn loads_uploads_relative_to_plan_file() {
        let plans = load_plans(resource("graphite.yaml")).unwrap();
        let step = &plans[1].steps()[0];

        let expected = Upload::new(
            resource("files/dashboard.conf").to_string_lossy(),
            "/etc/nginx/sites-enabled/dashboard",
        );
        assert_eq!(vec![Action::from(expected.clone())], step.actions);
        assert!(Path::new(&expected.from).is_file());

        // The step's privilege applies when the upload has none of its own.
        assert!(step.is_elevated());
        assert_eq!(Ok(()), plans[1].validate());
    }

    #[test]
    fn compiles_with_config_vars() {
        let plans = load_plans(resource("graphite.yaml")).unwrap();
        let vars = IndexMap::from([("graphite_dir".to_owned(), "/opt/graphite".to_owned())]);
        let plan = plans[0].compile(&vars);

        let check = plan.steps()[1].check.as_ref().unwrap();
        assert_eq!(Some("/opt/graphite".to_owned()), check.command.cwd);
        assert_eq!(Some("source bin/activate".to_owned()), check.command.prefix);
        assert_eq!(
            Expect::Matches("(?m)^Name: whisper$".to_owned()),
            check.expect
        );
        assert_eq!(
            "/opt/graphite/webapp",
            plan.steps()[2].actions[0].command().unwrap().env["PYTHONPATH"]
        );
        assert_eq!(Ok(()), plan.validate());
    }
}

mod check {
    use super::*;

    fn check_of(yaml: &str) -> Check {
        let plan = parse(&format!(
            "name: p\n\
             steps:\n\
             \x20 - name: s\n\
             \x20   check:\n\
             {yaml}\
             \x20   actions:\n\
             \x20     - run: ls\n",
        ));
        plan.steps[0].check.clone().unwrap()
    }

    #[test]
    fn expect_defaults_to_success() {
        let check = check_of("      run: test -f /etc/nginx/sites-enabled/dashboard\n");
        assert_eq!(Expect::Success, check.expect);
    }

    #[test]
    fn expect_non_empty() {
        let check = check_of("      run: psql -tAc 'SELECT 1'\n      expect: non_empty\n");
        assert_eq!(Expect::NonEmpty, check.expect);
        assert_eq!("psql -tAc 'SELECT 1'", check.command.run);
    }

    #[test]
    fn expect_matches() {
        let check = check_of("      run: systemctl is-active nginx\n      expect:\n        matches: ^active\n");
        assert_eq!(Expect::Matches("^active".to_owned()), check.expect);
    }

    #[test]
    fn check_may_override_privilege() {
        let check = check_of("      run: whoami\n      privilege: elevated\n      user: postgres\n");
        assert_eq!(Some(Privilege::Elevated), check.command.privilege);
        assert_eq!(Some("postgres".to_owned()), check.command.user);
    }

    #[test]
    fn rejects_misspelled_key() {
        let yaml = "name: p\n\
                    steps:\n\
                    \x20 - name: s\n\
                    \x20   check:\n\
                    \x20     run: ls\n\
                    \x20     expct: non_empty\n\
                    \x20   actions:\n\
                    \x20     - run: ls\n";
        assert!(plan::parse_plans(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_expectation() {
        let yaml = "name: p\n\
                    steps:\n\
                    \x20 - name: s\n\
                    \x20   check:\n\
                    \x20     run: ls\n\
                    \x20     expect: maybe\n\
                    \x20   actions:\n\
                    \x20     - run: ls\n";
        assert!(plan::parse_plans(yaml).is_err());
    }
}

mod step {
    use super::*;

    #[test]
    fn privilege_defaults_to_normal() {
        let plan = parse("name: p\nsteps:\n  - name: s\n    actions:\n      - run: ls\n");
        let step = &plan.steps[0];
        assert_eq!(Privilege::Normal, step.privilege);
        assert_eq!(None, step.user);
        assert_eq!(None, step.check);
        assert_eq!(None, step.actions[0].command().unwrap().privilege);
    }

    #[test]
    fn actions_are_required() {
        assert!(plan::parse_plans("name: p\nsteps:\n  - name: s\n").is_err());
    }

    #[test]
    fn misspelled_check_is_rejected_not_dropped() {
        let yaml = "name: p\n\
                    steps:\n\
                    \x20 - name: create role\n\
                    \x20   chek:\n\
                    \x20     run: psql -tAc 'SELECT 1'\n\
                    \x20     expect: non_empty\n\
                    \x20   actions:\n\
                    \x20     - run: createuser dashboard\n";
        let err = plan::parse_plans(yaml).unwrap_err();
        assert!(err.to_string().contains("chek"), "{err}");
    }

    #[test]
    fn rejects_misspelled_privilege_key() {
        let yaml = "name: p\nsteps:\n  - name: s\n    privilage: elevated\n    actions:\n      - run: ls\n";
        assert!(plan::parse_plans(yaml).is_err());
    }

    #[test]
    fn rejects_misspelled_action_key() {
        let yaml = "name: p\nsteps:\n  - name: s\n    actions:\n      - run: ls\n        cdw: /tmp\n";
        assert!(plan::parse_plans(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_privilege() {
        let yaml = "name: p\nsteps:\n  - name: s\n    privilege: root\n    actions:\n      - run: ls\n";
        assert!(plan::parse_plans(yaml).is_err());
    }
}

#[test]
fn serialized_plan_parses_back() {
    let plans = load_plans(resource("graphite.yaml")).unwrap();
    let yaml = serde_yaml::to_string(&plans[0]).unwrap();
    let mut reparsed = parse(&yaml);

    // The source is not part of the file format.
    reparsed.source = plans[0].source.clone();
    assert_eq!(plans[0], reparsed);
}
