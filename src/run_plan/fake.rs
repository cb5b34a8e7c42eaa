//! An in-memory host for exercising plans without a network.
//!
//! [FakeSession] understands a handful of commands, which is enough to model check-then-create
//! provisioning:
//!
//! | Command            | Effect                                               |
//! |--------------------|------------------------------------------------------|
//! | `has <fact>`       | prints `1` if the fact exists, nothing otherwise     |
//! | `exists <path>`    | prints `1` if a file was uploaded to the path        |
//! | `cat > <path>`     | stores its standard input as the file at the path    |
//! | `set <fact>`       | records the fact                                     |
//! | `unset <fact>`     | forgets the fact                                     |
//! | `echo <text>`      | prints the text                                      |
//! | `exit <code>`      | exits with the code                                  |
//! | `fail <code> <msg>`| prints the message on stderr and exits with the code |
//! | `killed`           | dies without an exit code                            |
//! | `hang`             | never finishes                                       |
//!
//! Anything else succeeds silently. Facts live on the host, not the session, so a second session
//! opened through the same [FakeConnector] sees what the first one did.
//!
//! To enable integration testing, this module is public but stripped from documentation.

use crate::core::Command;
use crate::error::{ConnectionError, SessionError};
use crate::run_plan::session::{CommandOutput, ManageSession, Session};
use async_trait::async_trait;
use tracing::debug;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// State of one fake host, shared by every session opened on it.
#[derive(Debug, Default)]
struct HostState {
    facts: BTreeSet<String>,

    /// Uploaded files by remote path.
    files: BTreeMap<String, Vec<u8>>,

    /// Every command that reached the host, in order.
    commands: Vec<Command>,

    /// How many more commands may run before the connection drops. [None] means no limit.
    remaining: Option<usize>,

    /// How many sessions on this host have been closed.
    closed: usize,
}

enum Reply {
    Done(CommandOutput),
    Hang,
}

/// A [Session] on an in-memory host.
#[derive(Clone, Debug)]
pub struct FakeSession {
    host: String,
    state: Arc<Mutex<HostState>>,
}

impl FakeSession {
    /// Creates a session on a new, empty host.
    pub fn new(host: impl Into<String>) -> Self {
        FakeSession {
            host: host.into(),
            state: Arc::default(),
        }
    }

    /// Builder-style method that records a fact on the host.
    pub fn with_fact(self, fact: impl Into<String>) -> Self {
        self.state().facts.insert(fact.into());
        self
    }

    pub fn has_fact(&self, fact: &str) -> bool {
        self.state().facts.contains(fact)
    }

    /// Returns the contents of the file uploaded to `path`, if any.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    /// Returns every command that has run on the host.
    pub fn commands(&self) -> Vec<Command> {
        self.state().commands.clone()
    }

    /// Returns how many sessions on this host have been closed.
    pub fn closed(&self) -> usize {
        self.state().closed
    }

    /// Drops the connection: every later command fails with [SessionError::Disconnected].
    pub fn disconnect(&mut self) {
        self.disconnect_after(0);
    }

    /// Lets `count` more commands run, then drops the connection.
    pub fn disconnect_after(&mut self, count: usize) {
        self.state().remaining = Some(count);
    }

    /// Undoes [Self::disconnect] and [Self::disconnect_after].
    pub fn reconnect(&mut self) {
        self.state().remaining = None;
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        lock(&self.state)
    }

    fn interpret(state: &mut HostState, run: &str, input: &[u8]) -> Reply {
        let (program, rest) = run.split_once(' ').unwrap_or((run, ""));
        let exit = |exit_code, stdout: &str, stderr: &str| {
            Reply::Done(CommandOutput {
                exit_code,
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
            })
        };

        match program {
            "has" if state.facts.contains(rest) => exit(Some(0), "1\n", ""),
            "has" => exit(Some(0), "", ""),
            "exists" if state.files.contains_key(rest) => exit(Some(0), "1\n", ""),
            "exists" => exit(Some(0), "", ""),
            "cat" => match rest.strip_prefix("> ").and_then(shlex::split).as_deref() {
                Some([path]) => {
                    state.files.insert(path.clone(), input.to_vec());
                    exit(Some(0), "", "")
                }
                _ => exit(Some(1), "", "cat: bad redirect\n"),
            },
            "set" => {
                state.facts.insert(rest.to_owned());
                exit(Some(0), "", "")
            }
            "unset" => {
                state.facts.remove(rest);
                exit(Some(0), "", "")
            }
            "echo" => exit(Some(0), &format!("{rest}\n"), ""),
            "exit" => exit(Some(rest.trim().parse().unwrap_or(1)), "", ""),
            "fail" => {
                let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
                exit(Some(code.parse().unwrap_or(1)), "", &format!("{message}\n"))
            }
            "killed" => exit(None, "", ""),
            "hang" => Reply::Hang,
            _ => exit(Some(0), "", ""),
        }
    }
}

impl FakeSession {
    async fn send(
        &mut self,
        command: &Command,
        input: &[u8],
    ) -> Result<CommandOutput, SessionError> {
        debug!(host = %self.host, command = %command.run, "fake host received command");
        let reply = {
            let mut state = self.state();
            match state.remaining {
                Some(0) => return Err(SessionError::Disconnected),
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            state.commands.push(command.clone());
            Self::interpret(&mut state, &command.run, input)
        };

        match reply {
            Reply::Done(output) => Ok(output),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&mut self, command: &Command) -> Result<CommandOutput, SessionError> {
        self.send(command, &[]).await
    }

    async fn execute_with_input(
        &mut self,
        command: &Command,
        input: &[u8],
    ) -> Result<CommandOutput, SessionError> {
        self.send(command, input).await
    }

    async fn close(self) -> Result<(), SessionError> {
        self.state().closed += 1;
        Ok(())
    }
}

/// A [ManageSession] that opens [FakeSession]s.
///
/// Clones share the same hosts, so a test can keep one clone for inspection.
#[derive(Clone, Debug, Default)]
pub struct FakeConnector {
    inner: Arc<Mutex<ConnectorState>>,
}

#[derive(Debug, Default)]
struct ConnectorState {
    hosts: HashMap<String, FakeSession>,
    unreachable: HashSet<String>,
    connections: usize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail for `host`.
    pub fn set_unreachable(&self, host: impl Into<String>) {
        lock(&self.inner).unreachable.insert(host.into());
    }

    /// Returns a handle on `host` for setting up or inspecting its state.
    ///
    /// The host is created if it does not exist yet.
    pub fn host(&self, host: &str) -> FakeSession {
        lock(&self.inner)
            .hosts
            .entry(host.to_owned())
            .or_insert_with(|| FakeSession::new(host))
            .clone()
    }

    /// How many sessions have been opened successfully.
    pub fn connections(&self) -> usize {
        lock(&self.inner).connections
    }
}

#[async_trait]
impl ManageSession<FakeSession> for FakeConnector {
    async fn connect(&mut self, host: &str) -> Result<FakeSession, ConnectionError> {
        if lock(&self.inner).unreachable.contains(host) {
            return Err(ConnectionError {
                host: host.to_owned(),
                reason: "unreachable".to_owned(),
            });
        }
        let session = self.host(host);
        lock(&self.inner).connections += 1;
        Ok(session)
    }
}

// A test that panicked while holding a lock leaves the state usable for the others.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
