//! Provides types that represent the user's instructions: plans, steps, commands and uploads.

pub mod action;
pub mod command;
pub mod plan;
pub mod step;

#[doc(inline)]
pub use action::{Action, Upload};

#[doc(inline)]
pub use command::{Command, Privilege};

#[doc(inline)]
pub use plan::{load_plans, Plan};

#[doc(inline)]
pub use step::{Check, Expect, Step};

#[cfg(test)]
pub mod fixtures {
    use super::*;

    /// Returns a [Plan] with three [Step]s in the shape of a database setup: the first two are
    /// guarded by checks, the third always runs.
    pub fn plan() -> Plan {
        Plan::new("dashboard database")
            .step(
                Step::new("create database user")
                    .check(Command::new("has user"), Expect::NonEmpty)
                    .action(Command::new("set user")),
            )
            .step(
                Step::new("create database")
                    .check(Command::new("has database"), Expect::NonEmpty)
                    .action(Command::new("set database")),
            )
            .step(Step::new("grant privileges").action(Command::new("set grants")))
    }
}
