//! Types for representing individual shell commands sent to a host.

#[cfg(doc)]
use crate::core::step::Step;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shlex::QuoteError;

/// Whether a [Command] runs as the login user or through `sudo`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    /// Runs as the SSH login user.
    #[default]
    Normal,

    /// Runs through `sudo`, as root unless a user is given.
    Elevated,
}

/// A shell command and the context it runs in.
///
/// The context fields replace ambient state such as "change into this directory and activate this
/// virtual environment first". Everything a command needs travels with the command, so the
/// session itself holds no state beyond its transport.
///
/// `privilege` and `user` are optional so that a command can inherit them from its [Step].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    /// The shell command line. Passed through to the remote shell without parsing.
    pub run: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub privilege: Option<Privilege>,

    /// The user to become when running with [Privilege::Elevated].
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,

    /// Working directory on the remote host.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cwd: Option<String>,

    /// A command that must run first in the same shell, e.g. `source venv/bin/activate`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prefix: Option<String>,

    /// Environment variables exported before [Self::run].
    ///
    /// Order is preserved from the source file.
    #[serde(skip_serializing_if = "IndexMap::is_empty", default)]
    pub env: IndexMap<String, String>,
}

impl Command {
    /// Creates a [Command] with no context that inherits its privilege.
    pub fn new(run: impl Into<String>) -> Self {
        Command {
            run: run.into(),
            ..Default::default()
        }
    }

    /// Builder-style setter for [Privilege::Elevated].
    pub fn elevated(mut self) -> Self {
        self.privilege = Some(Privilege::Elevated);
        self
    }

    /// Builder-style setter for running as another user. Implies [Privilege::Elevated].
    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.privilege = Some(Privilege::Elevated);
        self.user = Some(user.into());
        self
    }

    /// The effective privilege, defaulting to [Privilege::Normal].
    pub fn privilege(&self) -> Privilege {
        self.privilege.unwrap_or_default()
    }

    /// Fills in `privilege` and `user` from a [Step]'s defaults where this command has none.
    pub fn inherit(&self, privilege: Privilege, user: Option<&str>) -> Self {
        let mut command = self.clone();
        if command.privilege.is_none() {
            command.privilege = Some(privilege);
        }
        if command.user.is_none() {
            command.user = user.map(str::to_owned);
        }
        command
    }

    /// Applies `replace` to every text field of the command.
    pub(crate) fn rewrite(&mut self, replace: &impl Fn(&mut String)) {
        replace(&mut self.run);
        if let Some(user) = &mut self.user {
            replace(user);
        }
        if let Some(cwd) = &mut self.cwd {
            replace(cwd);
        }
        if let Some(prefix) = &mut self.prefix {
            replace(prefix);
        }
        self.env.values_mut().for_each(replace);
    }

    /// Whether any text field contains a NUL byte, which no shell can carry.
    pub(crate) fn has_nul(&self) -> bool {
        let nul = |s: &str| s.contains('\0');
        nul(&self.run)
            || self.user.as_deref().is_some_and(nul)
            || self.cwd.as_deref().is_some_and(nul)
            || self.prefix.as_deref().is_some_and(nul)
            || self.env.iter().any(|(k, v)| nul(k) || nul(v))
    }

    /// Renders the command into one line for a POSIX shell.
    ///
    /// Context is composed with `&&`, so a failing `cd` or prefix stops the command. `cwd` may
    /// start with `~/`, which the remote shell expands. `env` values are double-quoted, so `$VAR`
    /// references in them expand remotely too.
    ///
    /// Elevated commands are wrapped as `sudo -n -H [-u <user>] bash -c '<line>'`. Bash rather
    /// than `sh` keeps prefixes such as `source venv/bin/activate` working where `/bin/sh` is
    /// dash. `-n` makes sudo fail instead of waiting for a password prompt that nobody will
    /// answer.
    ///
    /// ```
    /// # use provision::core::Command;
    /// let mut command = Command::new("pip install whisper");
    /// command.cwd = Some("~/graphite".to_owned());
    /// command.prefix = Some("source bin/activate".to_owned());
    /// assert_eq!(
    ///     "cd ~/graphite && source bin/activate && pip install whisper",
    ///     command.render().unwrap(),
    /// );
    ///
    /// let command = Command::new("createdb graphite").as_user("postgres");
    /// assert_eq!(
    ///     "sudo -n -H -u postgres bash -c 'createdb graphite'",
    ///     command.render().unwrap(),
    /// );
    /// ```
    pub fn render(&self) -> Result<String, QuoteError> {
        let mut parts = Vec::new();
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cd {}", quote_path(cwd)?));
        }
        if let Some(prefix) = &self.prefix {
            parts.push(prefix.clone());
        }
        for (key, value) in &self.env {
            parts.push(format!("export {key}={}", double_quote(value)));
        }
        parts.push(self.run.clone());
        let line = parts.join(" && ");

        match self.privilege() {
            Privilege::Normal => Ok(line),
            Privilege::Elevated => {
                let mut sudo = "sudo -n -H".to_owned();
                if let Some(user) = &self.user {
                    sudo.push_str(" -u ");
                    sudo.push_str(&shlex::try_quote(user)?);
                }
                Ok(format!("{sudo} bash -c {}", shlex::try_quote(&line)?))
            }
        }
    }
}

/// Quotes a remote path, leaving a leading `~` or `~/` bare so the remote shell expands it.
pub(crate) fn quote_path(path: &str) -> Result<String, QuoteError> {
    if path == "~" {
        return Ok(path.to_owned());
    }
    match path.strip_prefix("~/") {
        Some("") => Ok("~/".to_owned()),
        Some(rest) => Ok(format!("~/{}", shlex::try_quote(rest)?)),
        None => Ok(shlex::try_quote(path)?.into_owned()),
    }
}

// Double quotes keep `$` expansion but stop word splitting and globbing.
fn double_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Whether `name` can be exported as an environment variable by a POSIX shell.
pub(crate) fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
