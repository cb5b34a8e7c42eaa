//! Idempotent provisioning of remote hosts over SSH.
//!
//! # Plan files
//!
//! A plan is a named, ordered list of steps. Each step pairs an optional idempotency check with
//! the commands and file uploads that establish the desired state:
//!
//! ```yaml
//! name: dashboard database
//! steps:
//!   - name: create database
//!     privilege: elevated
//!     user: postgres
//!     check:
//!       run: psql -tAc "SELECT 1 FROM pg_database WHERE datname='graphite'"
//!       expect: non_empty
//!     actions:
//!       - run: createdb graphite
//!   - name: configure site
//!     privilege: elevated
//!     check:
//!       run: test -f /etc/nginx/sites-enabled/dashboard
//!     actions:
//!       - upload: files/dashboard.conf
//!         to: /etc/nginx/sites-enabled/dashboard
//! ```
//!
//! Running the same plan twice is safe: every step whose check passes is skipped. A plan that
//! stopped halfway can be run again from the start.
//!
//! # Program flow
//!
//! This section is meant for developers. If you are using `provision` to manage systems, you
//! don't need to read it.
//!
//! 1. The `provision` binary loads a [Config](config::Config) and one or more plan files
//!    ([core::load_plans]), then validates and compiles each [Plan](core::Plan).
//!
//! 2. For each host, [run_plans](run_plan::run_plans) opens a
//!    [Session](run_plan::session::Session) through a
//!    [ManageSession](run_plan::session::ManageSession) and hands it to a
//!    [Runner](run_plan::Runner).
//!
//! 3. The runner walks the steps in order. A step's check decides whether its actions run. If
//!    the check cannot be evaluated the step fails rather than guessing.
//!
//! 4. Each step's outcome goes to a [Report](run_plan::report::Report) for the user and into
//!    the [RunReport](run_plan::RunReport) that the run returns.

pub mod config;
pub mod core;
pub mod error;
pub mod run_plan;

#[doc(inline)]
pub use run_plan::run_plan;
