//! Provides an interface to run [Command]s on a remote host.
//!
//! [ManageSession] opens connections and [Session] uses them. The production implementations
//! talk OpenSSH through the [openssh] crate; tests use [crate::run_plan::fake].

use crate::core::step::Expect;
use crate::core::Command;
use crate::error::{ConnectionError, QueryError, SessionError};
use async_trait::async_trait;
use std::process::Output;

/// The captured result of a command that ran on a host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, or [None] if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Whether the output shows that the command never really ran.
    ///
    /// POSIX shells exit with 127 when a command is not found and 126 when it is not executable.
    /// A process killed by a signal did not finish either.
    pub fn not_runnable(&self) -> bool {
        matches!(self.exit_code, None | Some(126) | Some(127))
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Connects to hosts and returns sessions representing those connections.
#[async_trait]
pub trait ManageSession<S: Session> {
    /// Connect to `host` and, on success, return a session on the host.
    async fn connect(&mut self, host: &str) -> Result<S, ConnectionError>;
}

/// A connection to one host that runs one command at a time.
#[async_trait]
pub trait Session: Send {
    /// Runs `command` and waits for it to finish.
    ///
    /// A command that runs and exits with an error is not an error here; inspect
    /// [CommandOutput::exit_code]. Errors mean the command could not be run at all.
    async fn execute(&mut self, command: &Command) -> Result<CommandOutput, SessionError>;

    /// Like [Self::execute], but feeds `input` to the command's standard input and then closes
    /// it. This is how files reach the host.
    async fn execute_with_input(
        &mut self,
        command: &Command,
        input: &[u8],
    ) -> Result<CommandOutput, SessionError>;

    /// Runs `command` and reports whether its output meets `expect`.
    ///
    /// # Errors
    ///
    /// Returns an error rather than `false` whenever the answer is unknown: the command could not
    /// be sent, the command could not run on the host, or `expect` is invalid.
    async fn query(&mut self, command: &Command, expect: &Expect) -> Result<bool, QueryError> {
        let output = self.execute(command).await?;
        if output.not_runnable() {
            return Err(QueryError::NotRunnable {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(expect.is_met(&output)?)
    }

    /// Closes the session and releases the transport.
    async fn close(self) -> Result<(), SessionError>
    where
        Self: Sized;
}

#[cfg(feature = "openssh")]
pub use self::ssh::{SshConnector, SshSession};

#[cfg(feature = "openssh")]
mod ssh {
    use super::*;
    use crate::config::{KnownHostsPolicy, SshConfig};
    use openssh::{KnownHosts, SessionBuilder, Stdio};
    use tokio::io::AsyncWriteExt;
    use tracing::{debug, info};

    /// Production implementation of [ManageSession].
    #[derive(Clone, Debug, Default)]
    pub struct SshConnector {
        config: SshConfig,
    }

    impl SshConnector {
        pub fn new(config: SshConfig) -> Self {
            SshConnector { config }
        }

        fn builder(&self) -> SessionBuilder {
            let mut builder = SessionBuilder::default();
            builder.known_hosts_check(match self.config.known_hosts {
                KnownHostsPolicy::Strict => KnownHosts::Strict,
                KnownHostsPolicy::Add => KnownHosts::Add,
                KnownHostsPolicy::Accept => KnownHosts::Accept,
            });
            if let Some(user) = &self.config.user {
                builder.user(user.clone());
            }
            if let Some(port) = self.config.port {
                builder.port(port);
            }
            if let Some(keyfile) = self.config.identity_file() {
                builder.keyfile(keyfile);
            }
            if let Some(timeout) = self.config.connect_timeout() {
                builder.connect_timeout(timeout);
            }
            if !self.config.use_ssh_config {
                builder.config_file("/dev/null");
            }
            builder
        }
    }

    #[async_trait]
    impl ManageSession<SshSession> for SshConnector {
        async fn connect(&mut self, host: &str) -> Result<SshSession, ConnectionError> {
            info!(host, "connecting");
            let session = self
                .builder()
                .connect_mux(host)
                .await
                .map_err(|err| ConnectionError {
                    host: host.to_owned(),
                    reason: err.to_string(),
                })?;
            Ok(SshSession {
                session,
                host: host.to_owned(),
            })
        }
    }

    /// Production implementation of [Session].
    pub struct SshSession {
        session: openssh::Session,
        host: String,
    }

    #[async_trait]
    impl Session for SshSession {
        async fn execute(&mut self, command: &Command) -> Result<CommandOutput, SessionError> {
            let line = command
                .render()
                .map_err(|err| SessionError::Transport(err.to_string()))?;
            debug!(host = %self.host, command = %line, "executing");

            let output = self
                .session
                .raw_command(&line)
                .output()
                .await
                .map_err(to_session_error)?;
            Ok(output.into())
        }

        async fn execute_with_input(
            &mut self,
            command: &Command,
            input: &[u8],
        ) -> Result<CommandOutput, SessionError> {
            let line = command
                .render()
                .map_err(|err| SessionError::Transport(err.to_string()))?;
            debug!(host = %self.host, command = %line, bytes = input.len(), "executing with input");

            let mut child = self
                .session
                .raw_command(&line)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .await
                .map_err(to_session_error)?;

            // Dropping stdin sends EOF.
            if let Some(mut stdin) = child.stdin().take() {
                stdin
                    .write_all(input)
                    .await
                    .map_err(|err| SessionError::Transport(err.to_string()))?;
            }
            let output = child.wait_with_output().await.map_err(to_session_error)?;
            Ok(output.into())
        }

        async fn close(self) -> Result<(), SessionError> {
            info!(host = %self.host, "disconnecting");
            self.session.close().await.map_err(to_session_error)
        }
    }

    fn to_session_error(err: openssh::Error) -> SessionError {
        match err {
            openssh::Error::Disconnected => SessionError::Disconnected,
            err => SessionError::Transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    mod command_output {
        use super::*;

        #[test]
        fn from_output() {
            let output = Output {
                // Raw wait statuses put the exit code in the second byte.
                status: ExitStatus::from_raw(2 << 8),
                stdout: b"out".to_vec(),
                stderr: b"err".to_vec(),
            };
            assert_eq!(
                CommandOutput {
                    exit_code: Some(2),
                    stdout: "out".to_owned(),
                    stderr: "err".to_owned(),
                },
                output.into(),
            );
        }

        #[test]
        fn signal_has_no_exit_code() {
            let output = Output {
                status: ExitStatus::from_raw(9),
                stdout: vec![],
                stderr: vec![],
            };
            let output: CommandOutput = output.into();
            assert_eq!(None, output.exit_code);
            assert!(output.not_runnable());
        }

        #[test]
        fn not_runnable_codes() {
            let code = |exit_code| CommandOutput {
                exit_code: Some(exit_code),
                ..Default::default()
            };
            assert!(!code(0).not_runnable());
            assert!(!code(1).not_runnable());
            assert!(code(126).not_runnable());
            assert!(code(127).not_runnable());
        }
    }

    mod query {
        use super::*;
        use crate::run_plan::fake::FakeSession;

        #[tokio::test]
        async fn true_when_expectation_holds() {
            let mut session = FakeSession::new("host").with_fact("graphite");
            let answer = session
                .query(&Command::new("has graphite"), &Expect::NonEmpty)
                .await;
            assert!(answer.unwrap());
        }

        #[tokio::test]
        async fn false_when_expectation_fails() {
            let mut session = FakeSession::new("host");
            let answer = session
                .query(&Command::new("has graphite"), &Expect::NonEmpty)
                .await;
            assert!(!answer.unwrap());
        }

        #[tokio::test]
        async fn error_when_not_runnable() {
            let mut session = FakeSession::new("host");
            let answer = session
                .query(&Command::new("exit 127"), &Expect::Success)
                .await;
            assert!(matches!(answer, Err(QueryError::NotRunnable { .. })));
        }

        #[tokio::test]
        async fn error_when_pattern_is_invalid() {
            let mut session = FakeSession::new("host");
            let answer = session
                .query(&Command::new("echo hi"), &Expect::Matches("[".to_owned()))
                .await;
            assert!(matches!(answer, Err(QueryError::Pattern(_))));
        }

        #[tokio::test]
        async fn error_when_disconnected() {
            let mut session = FakeSession::new("host");
            session.disconnect();
            let answer = session
                .query(&Command::new("has graphite"), &Expect::NonEmpty)
                .await;
            assert!(matches!(
                answer,
                Err(QueryError::Session(SessionError::Disconnected))
            ));
        }
    }
}
