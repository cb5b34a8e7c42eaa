//! Types for representing the actions of a step: shell commands and file uploads.

use crate::core::command::{quote_path, Command, Privilege};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One thing a [Step](crate::core::Step) does to establish its desired state.
///
/// In plan files the two kinds are told apart by their keys: `run` for a command, `upload` for a
/// file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Action {
    Run(Command),
    Upload(Upload),
}

/// Copies a local file to the host.
///
/// The file is streamed into `cat > <to>` on the host, so an elevated upload can write where the
/// login user cannot. An existing file at `to` is replaced.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Upload {
    /// Local path. Relative paths are resolved against the plan file's directory by
    /// [load_plans](crate::core::load_plans). Written as `upload` in plan files.
    #[serde(rename = "upload")]
    pub from: String,

    /// Remote path. A leading `~/` means the remote user's home directory.
    pub to: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub privilege: Option<Privilege>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
}

impl Upload {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Upload {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    /// Builder-style setter for [Privilege::Elevated].
    pub fn elevated(mut self) -> Self {
        self.privilege = Some(Privilege::Elevated);
        self
    }

    /// Returns the remote command that receives the file on its standard input.
    ///
    /// ```
    /// # use provision::core::Upload;
    /// let upload = Upload::new("carbon.conf", "~/graphite/conf/carbon.conf");
    /// assert_eq!("cat > ~/graphite/conf/carbon.conf", upload.receiver().unwrap().run);
    /// ```
    pub fn receiver(&self) -> Result<Command, shlex::QuoteError> {
        Ok(Command {
            run: format!("cat > {}", quote_path(&self.to)?),
            privilege: self.privilege,
            user: self.user.clone(),
            ..Default::default()
        })
    }

    /// Makes a relative [Self::from] path relative to `dir` instead.
    pub(crate) fn resolve_against(&mut self, dir: &Path) {
        if Path::new(&self.from).is_relative() {
            self.from = dir.join(&self.from).to_string_lossy().into_owned();
        }
    }
}

impl Action {
    /// Returns the command if this is an [Action::Run].
    pub fn command(&self) -> Option<&Command> {
        match self {
            Action::Run(command) => Some(command),
            Action::Upload(_) => None,
        }
    }

    pub fn command_mut(&mut self) -> Option<&mut Command> {
        match self {
            Action::Run(command) => Some(command),
            Action::Upload(_) => None,
        }
    }

    /// Applies `replace` to every text field of the action.
    pub(crate) fn rewrite(&mut self, replace: &impl Fn(&mut String)) {
        match self {
            Action::Run(command) => command.rewrite(replace),
            Action::Upload(upload) => {
                replace(&mut upload.from);
                replace(&mut upload.to);
                if let Some(user) = &mut upload.user {
                    replace(user);
                }
            }
        }
    }

    /// The privilege and user the action asks for, before a step's defaults apply.
    pub(crate) fn identity(&self) -> (Option<Privilege>, Option<&str>) {
        match self {
            Action::Run(command) => (command.privilege, command.user.as_deref()),
            Action::Upload(upload) => (upload.privilege, upload.user.as_deref()),
        }
    }
}

impl From<Command> for Action {
    fn from(command: Command) -> Self {
        Action::Run(command)
    }
}

impl From<Upload> for Action {
    fn from(upload: Upload) -> Self {
        Action::Upload(upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod deserialize {
        use super::*;

        #[test]
        fn run_key_means_command() {
            let action: Action = serde_yaml::from_str("run: ls\ncwd: /tmp\n").unwrap();
            let mut expected = Command::new("ls");
            expected.cwd = Some("/tmp".to_owned());
            assert_eq!(Action::Run(expected), action);
        }

        #[test]
        fn upload_key_means_upload() {
            let action: Action = serde_yaml::from_str(
                "upload: files/nginx.conf\nto: /etc/nginx/nginx.conf\nprivilege: elevated\n",
            )
            .unwrap();
            assert_eq!(
                Action::Upload(Upload::new("files/nginx.conf", "/etc/nginx/nginx.conf").elevated()),
                action,
            );
        }

        #[test]
        fn rejects_misspelled_keys() {
            assert!(serde_yaml::from_str::<Action>("run: ls\ncdw: /tmp\n").is_err());
            assert!(serde_yaml::from_str::<Action>("upload: a\ntoo: b\n").is_err());
            assert!(serde_yaml::from_str::<Action>("upload: a\n").is_err());
        }
    }

    mod receiver {
        use super::*;

        #[test]
        fn carries_privilege_and_quotes_path() {
            let mut upload = Upload::new("a", "/etc/my app.conf").elevated();
            upload.user = Some("www-data".to_owned());

            let command = upload.receiver().unwrap();
            assert_eq!("cat > '/etc/my app.conf'", command.run);
            assert_eq!(Some(Privilege::Elevated), command.privilege);
            assert_eq!(Some("www-data".to_owned()), command.user);
        }

        #[test]
        fn rejects_nul_bytes() {
            assert!(Upload::new("a", "/tmp/\0").receiver().is_err());
        }
    }

    #[test]
    fn resolve_against_only_touches_relative_paths() {
        let dir = Path::new("/srv/plans");
        let mut relative = Upload::new("files/carbon.conf", "x");
        relative.resolve_against(dir);
        assert_eq!("/srv/plans/files/carbon.conf", relative.from);

        let mut absolute = Upload::new("/etc/hosts", "x");
        absolute.resolve_against(dir);
        assert_eq!("/etc/hosts", absolute.from);
    }
}
