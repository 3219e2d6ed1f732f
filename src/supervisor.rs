// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Process supervision through pm2.
//!
//! Each deployment runs as a single pm2 process named after its domain,
//! described by a JSON descriptor in the home directory of the owning user.
//! Supervisor state is never assumed to match the descriptor between runs.
//! Whatever is registered under the domain name is deleted before the new
//! process starts, both in the pm2 daemon of root and in the pm2 daemon of
//! the owning user.

use crate::{
    deploy::Warnings,
    path::DeploymentTarget,
    system::{CommandRunner, Invocation, PrivilegeContext},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, remove_file, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Fixed restart policy shared by every deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RestartPolicy {
    pub merge_logs: bool,
    pub max_memory_restart: String,
    pub restart_delay: u64,
    pub watch: bool,
    pub exec_mode: String,
    pub instances: u32,
    pub autorestart: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            merge_logs: true,
            max_memory_restart: "200M".into(),
            restart_delay: 3000,
            watch: false,
            exec_mode: "fork".into(),
            instances: 1,
            autorestart: true,
        }
    }
}

/// Single supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessDescriptor {
    pub name: String,
    pub script: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub error_file: PathBuf,
    pub out_file: PathBuf,

    #[serde(flatten)]
    pub restart: RestartPolicy,
}

impl ProcessDescriptor {
    pub fn new(target: &DeploymentTarget, app_dir: &Path, port: u16, start_command: &str) -> Self {
        Self {
            name: target.domain().to_string(),
            script: start_command.to_string(),
            cwd: app_dir.to_path_buf(),
            env: BTreeMap::from([
                ("NODE_ENV".to_string(), "production".to_string()),
                ("PORT".to_string(), port.to_string()),
            ]),
            error_file: target.error_log(),
            out_file: target.output_log(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Layout of a pm2 ecosystem file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Ecosystem {
    pub apps: Vec<ProcessDescriptor>,
}

/// Register and remove supervised processes.
pub struct Supervisor<'a, R: CommandRunner> {
    runner: &'a R,
    program: &'a str,
}

impl<'a, R: CommandRunner> Supervisor<'a, R> {
    /// Construct new supervisor driving the pm2 binary named program.
    pub fn new(runner: &'a R, program: &'a str) -> Self {
        Self { runner, program }
    }

    fn pm2(&self, args: &[&str]) -> Invocation {
        Invocation::new(self.program).args(args.iter().copied())
    }

    /// Write descriptor of target, then replace any running instance with it.
    ///
    /// # Errors
    ///
    /// - Return [`SupervisorError::Io`] if logs or descriptor cannot be written.
    /// - Return [`SupervisorError::Command`] if ownership cannot be fixed, or
    ///   the new process fails to start.
    #[instrument(skip(self, target, app_dir, warnings), level = "debug")]
    pub fn apply(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        port: u16,
        start_command: &str,
        warnings: &mut Warnings,
    ) -> Result<PathBuf> {
        let owner = target.owner_user();
        let domain = target.domain();

        let logs = target.logs_dir();
        info!("prepare logs in {}", logs.display());
        create_dir_all(&logs).map_err(|err| io_error(err, &logs))?;
        self.runner.run(&Invocation::chown(owner, &logs))?;
        for log in [target.error_log(), target.output_log()] {
            write(&log, "").map_err(|err| io_error(err, &log))?;
            self.runner.run(&Invocation::chown(owner, &log))?;
        }

        let descriptor = ProcessDescriptor::new(target, app_dir, port, start_command);
        let path = target.descriptor_path();
        info!("write process descriptor {}", path.display());
        let json = serde_json::to_string_pretty(&Ecosystem {
            apps: vec![descriptor],
        })?;
        write(&path, json).map_err(|err| io_error(err, &path))?;
        self.runner.run(&Invocation::chown(owner, &path))?;

        info!("replace any running instance of {domain}");
        self.discard(owner, domain);

        if let Err(error) = self.runner.run_as(owner, self.pm2(&["startup"])) {
            warnings.push(format!("pm2 startup hook for {owner} not registered: {error}"));
        }

        info!("start {domain} on port {port} as {owner}");
        let descriptor = path.display().to_string();
        self.runner
            .run_as(owner, self.pm2(&["start", descriptor.as_str()]))?;

        if let Err(error) = self.runner.run_as(owner, self.pm2(&["save"])) {
            warnings.push(format!("pm2 process table of {owner} not saved: {error}"));
        }

        Ok(path)
    }

    /// Stop and unregister the process of target, and drop its descriptor.
    ///
    /// Every supervisor call is tolerated to fail.
    ///
    /// # Errors
    ///
    /// - Return [`SupervisorError::Io`] if descriptor cannot be removed.
    #[instrument(skip(self, target, warnings), level = "debug")]
    pub fn remove(&self, target: &DeploymentTarget, warnings: &mut Warnings) -> Result<()> {
        let owner = target.owner_user();
        let domain = target.domain();

        info!("stop and delete pm2 process {domain}");
        for action in ["stop", "delete"] {
            if let Err(error) = self.runner.run_as(owner, self.pm2(&[action, domain])) {
                warnings.push(format!("pm2 {action} {domain} failed: {error}"));
            }
        }
        if let Err(error) = self.runner.run(&self.pm2(&["delete", domain])) {
            debug!("no root pm2 process {domain}: {error}");
        }
        if let Err(error) = self.runner.run_as(owner, self.pm2(&["save"])) {
            warnings.push(format!("pm2 process table of {owner} not saved: {error}"));
        }

        let path = target.descriptor_path();
        if path.exists() {
            info!("remove process descriptor {}", path.display());
            remove_file(&path).map_err(|err| io_error(err, &path))?;
        }

        Ok(())
    }

    // INVARIANT: Either context may not know the process, so failures only get logged.
    fn discard(&self, owner: &str, domain: &str) {
        for action in ["stop", "delete"] {
            if let Err(error) = self.runner.run(&self.pm2(&[action, domain])) {
                debug!("root pm2 {action} {domain}: {error}");
            }
            if let Err(error) = self.runner.run_as(owner, self.pm2(&[action, domain])) {
                debug!("pm2 {action} {domain} as {owner}: {error}");
            }
        }
    }
}

fn io_error(source: std::io::Error, path: &Path) -> SupervisorError {
    SupervisorError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Process supervision error types.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to write {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Command(#[from] crate::system::CommandError),
}

/// Friendly result alias :3
pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
