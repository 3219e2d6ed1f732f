// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Every side effect outside of the file system goes through a
//! [`CommandRunner`]: package managers, database clients, the process
//! supervisor, the reverse proxy, `chown`, and so on. Components never spawn
//! processes themselves. They describe what to run through an [`Invocation`],
//! and hand it to whatever runner the caller supplied.
//!
//! # Running As Another User
//!
//! Most commands must run as the owning user of a deployment rather than as
//! root. [`PrivilegeContext::run_as`] marks an invocation with a target user,
//! which [`SystemRunner`] turns into `sudo -u <user> -H ...` at spawn time.
//!
//! # Testing
//!
//! [`ScriptedRunner`] never spawns anything. It records every invocation it
//! receives, and answers through a list of scripted rules.

use indicatif::{ProgressBar, ProgressStyle};
use std::{
    cell::RefCell,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, instrument};

/// Description of a single external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    run_as: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory of the spawned process.
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_path_buf());
        self
    }

    /// Extra environment variable for the spawned process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run as target user instead of the current one.
    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    /// Hand path over to owner and its group of the same name.
    pub fn chown(owner: &str, path: impl AsRef<Path>) -> Self {
        Self::new("chown").args([
            format!("{owner}:{owner}"),
            path.as_ref().display().to_string(),
        ])
    }

    /// Like [`Invocation::chown`], but for a whole tree.
    pub fn chown_recursive(owner: &str, path: impl AsRef<Path>) -> Self {
        Self::new("chown").args([
            "-R".to_string(),
            format!("{owner}:{owner}"),
            path.as_ref().display().to_string(),
        ])
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn user(&self) -> Option<&str> {
        self.run_as.as_deref()
    }

    /// Program and arguments that will actually be spawned.
    ///
    /// Invocations bound to a user are wrapped in `sudo -u <user> -H`. Since
    /// sudo scrubs the environment, extra variables are forwarded through
    /// `env` in that case.
    pub fn resolve(&self) -> (String, Vec<String>) {
        let Some(user) = &self.run_as else {
            return (self.program.clone(), self.args.clone());
        };

        let mut args = vec!["-u".to_string(), user.clone(), "-H".to_string()];
        if !self.env.is_empty() {
            args.push("env".into());
            args.extend(self.env.iter().map(|(key, value)| format!("{key}={value}")));
        }
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());

        ("sudo".into(), args)
    }

    /// Shell-like rendering of the resolved command line.
    pub fn command_line(&self) -> String {
        let (program, args) = self.resolve();
        let mut line = program;
        for arg in args {
            line.push(' ');
            line.push_str(&quote(&arg));
        }
        line
    }
}

impl Display for Invocation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.command_line())
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && !arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '$' | '`' | '\\'))
    {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Combined stdout and stderr with the trailing newline chomped.
    pub fn message(&self) -> String {
        let mut message = String::new();

        if !self.stdout.is_empty() {
            message.push_str(format!("stdout: {}", self.stdout).as_str());
        }

        if !self.stderr.is_empty() {
            if !message.is_empty() && !message.ends_with('\n') {
                message.push('\n');
            }
            message.push_str(format!("stderr: {}", self.stderr).as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message)
    }
}

/// Capability to run external commands.
pub trait CommandRunner {
    /// Run invocation to completion.
    ///
    /// # Errors
    ///
    /// - Return [`CommandError::Failed`] if the command exits unsuccessfully.
    /// - Return [`CommandError::Spawn`] if the command cannot be started.
    /// - Return [`CommandError::Timeout`] if the command exceeds its deadline.
    fn run(&self, invocation: &Invocation) -> Result<Output>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, invocation: &Invocation) -> Result<Output> {
        (**self).run(invocation)
    }
}

/// Capability to run commands under the identity of another user.
pub trait PrivilegeContext {
    /// Run invocation as target user.
    ///
    /// # Errors
    ///
    /// - Return [`CommandError`] under the same rules as [`CommandRunner::run`].
    fn run_as(&self, user: &str, invocation: Invocation) -> Result<Output>;
}

impl<R: CommandRunner + ?Sized> PrivilegeContext for R {
    fn run_as(&self, user: &str, invocation: Invocation) -> Result<Output> {
        self.run(&invocation.as_user(user))
    }
}

/// Runner that spawns real processes.
///
/// Commands run one at a time on a private current-thread runtime, each under
/// a wall-clock deadline. A child that outlives its deadline is killed.
#[derive(Debug)]
pub struct SystemRunner {
    runtime: Runtime,
    timeout: Duration,
}

impl SystemRunner {
    /// Construct new system runner with per-command timeout.
    ///
    /// # Errors
    ///
    /// - Return [`CommandError::Runtime`] if async runtime cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CommandError::Runtime)?;

        Ok(Self { runtime, timeout })
    }

    fn spinner(&self, invocation: &Invocation) -> ProgressBar {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{elapsed_precise:.green}  {spinner:.yellow}  {msg}");
        if let Ok(style) = style {
            bar.set_style(style);
        }
        bar.set_message(invocation.command_line());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }
}

impl CommandRunner for SystemRunner {
    #[instrument(skip(self, invocation), level = "debug")]
    fn run(&self, invocation: &Invocation) -> Result<Output> {
        let command_line = invocation.command_line();
        debug!("run {command_line}");

        let (program, args) = invocation.resolve();
        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = invocation.working_dir() {
            command.current_dir(cwd);
        }

        // INVARIANT: Environment of sudo wrapped invocations is forwarded by resolve().
        if invocation.user().is_none() {
            command.envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        let bar = self.spinner(invocation);
        let result = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, command.output()).await });
        bar.finish_and_clear();

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(CommandError::Spawn {
                    command: command_line,
                    source: err,
                })
            }
            Err(_) => {
                return Err(CommandError::Timeout {
                    command: command_line,
                    timeout: self.timeout,
                })
            }
        };

        let captured = Output::new(
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command_line,
                status: output.status.code(),
                output: captured.message(),
            });
        }

        Ok(captured)
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Succeed(String),
    Fail(i32, String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    reply: Reply,
}

/// Runner that answers from scripted rules instead of spawning processes.
///
/// Rules match by substring against the resolved command line, first match
/// wins. Unmatched invocations succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    calls: RefCell<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Succeed with given stdout on any command line containing pattern.
    pub fn respond(mut self, pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            reply: Reply::Succeed(stdout.into()),
        });
        self
    }

    /// Fail with given exit status on any command line containing pattern.
    pub fn fail(mut self, pattern: impl Into<String>, status: i32, output: impl Into<String>) -> Self {
        self.rules.push(Rule {
            pattern: pattern.into(),
            reply: Reply::Fail(status, output.into()),
        });
        self
    }

    /// Every invocation received so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    /// Rendered command lines of every invocation received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    /// Check if any received command line contains pattern.
    pub fn called(&self, pattern: &str) -> bool {
        self.calls().iter().any(|line| line.contains(pattern))
    }

    /// Check if any received invocation has an argument containing pattern.
    ///
    /// Unlike [`ScriptedRunner::called`], arguments are matched unquoted.
    pub fn called_with(&self, pattern: &str) -> bool {
        self.calls
            .borrow()
            .iter()
            .any(|call| call.arguments().iter().any(|arg| arg.contains(pattern)))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<Output> {
        self.calls.borrow_mut().push(invocation.clone());
        let command = invocation.command_line();

        match self.rules.iter().find(|rule| command.contains(&rule.pattern)) {
            Some(Rule {
                reply: Reply::Fail(status, output),
                ..
            }) => Err(CommandError::Failed {
                command,
                status: Some(*status),
                output: output.clone(),
            }),
            Some(Rule {
                reply: Reply::Succeed(stdout),
                ..
            }) => Ok(Output::new(stdout.clone(), "")),
            None => Ok(Output::default()),
        }
    }
}

/// External command error types.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Command ran but exited unsuccessfully.
    #[error("command `{command}` failed with exit status {}:\n{output}", display_status(.status))]
    Failed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    /// Command could not be started.
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exceeded its wall-clock deadline.
    #[error("command `{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Async runtime for process execution could not be built.
    #[error(transparent)]
    Runtime(std::io::Error),
}

fn display_status(status: &Option<i32>) -> String {
    status
        .map(|code| code.to_string())
        .unwrap_or_else(|| "<signal>".into())
}

/// Friendly result alias :3
pub type Result<T, E = CommandError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolve_wraps_user_invocation_in_sudo() {
        let invocation = Invocation::new("pm2")
            .args(["start", "/home/example.com/pm.example.com.config.json"])
            .env("PM2_HOME", "/home/example.com/.pm2")
            .as_user("example");

        let (program, args) = invocation.resolve();
        assert_eq!(program, "sudo");
        assert_eq!(
            args,
            vec![
                "-u",
                "example",
                "-H",
                "env",
                "PM2_HOME=/home/example.com/.pm2",
                "pm2",
                "start",
                "/home/example.com/pm.example.com.config.json",
            ]
        );
    }

    #[test]
    fn command_line_quotes_awkward_arguments() {
        let invocation = Invocation::new("ssh-keygen").args(["-C", "a b", "-N", ""]);
        assert_eq!(invocation.command_line(), "ssh-keygen -C 'a b' -N ''");
    }

    #[test]
    fn output_message_chomps_trailing_newline() {
        let output = Output::new("done\n", "warn: peer deps\n");
        assert_eq!(output.message(), "stdout: done\nstderr: warn: peer deps");
    }

    #[test]
    fn scripted_runner_first_match_wins() {
        let runner = ScriptedRunner::new()
            .respond("--legacy-peer-deps", "ok")
            .fail("npm install", 1, "ERESOLVE");

        let plain = runner.run(&Invocation::new("npm").arg("install"));
        assert!(matches!(plain, Err(CommandError::Failed { status: Some(1), .. })));

        let legacy = runner.run(&Invocation::new("npm").args(["install", "--legacy-peer-deps"]));
        assert_eq!(legacy.unwrap().stdout, "ok");

        let other = runner.run_as("example", Invocation::new("node").arg("-v"));
        assert_eq!(other.unwrap(), Output::default());

        assert_eq!(
            runner.calls(),
            vec![
                "npm install",
                "npm install --legacy-peer-deps",
                "sudo -u example -H node -v",
            ]
        );
    }

    #[test]
    fn failed_error_reports_command_status_and_output() {
        let error = CommandError::Failed {
            command: "composer install".into(),
            status: Some(127),
            output: "stderr: composer: not found".into(),
        };
        assert_eq!(
            error.to_string(),
            "command `composer install` failed with exit status 127:\nstderr: composer: not found"
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output_and_failure() -> anyhow::Result<()> {
        let runner = SystemRunner::new(Duration::from_secs(10))?;

        let output = runner.run(&Invocation::new("sh").args(["-c", "echo hello"]))?;
        assert_eq!(output.stdout, "hello\n");

        let result = runner.run(&Invocation::new("sh").args(["-c", "echo oops >&2; exit 3"]));
        match result {
            Err(CommandError::Failed { status, output, .. }) => {
                assert_eq!(status, Some(3));
                assert_eq!(output, "stderr: oops");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_enforces_timeout() -> anyhow::Result<()> {
        let runner = SystemRunner::new(Duration::from_millis(200))?;
        let result = runner.run(&Invocation::new("sleep").arg("5"));
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        Ok(())
    }
}
