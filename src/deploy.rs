// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment orchestration.
//!
//! A [`Deployer`] drives a domain and a Git repository to a running,
//! supervised application:
//!
//! ```text
//! resolve -> acquire -> detect -> provision database -> synthesize env
//!         -> install -> build -> patch upstream port -> supervise
//! ```
//!
//! The reset path re-enters at detection with the checkout already on disk.
//! It skips acquisition, dependency installation, and builds, and it reuses
//! the database password recorded in the current `.env`.
//!
//! # Failure Handling
//!
//! Bad input and missing sites are rejected before anything is touched.
//! Failed external commands abort the run, unless the step is tolerated, in
//! which case a soft warning is pushed onto [`Warnings`] and the run goes on.
//! Soft warnings never change the exit code.

use crate::{
    config::Settings,
    database::{self, DatabaseCredential, PasswordPolicy, Provisioner, Provisioning},
    detect::{self, AppKind, DatabaseEngine, ProjectProfile},
    env::{framework_defaults, EnvFile, EnvLayers, Synthesizer},
    laravel::Laravel,
    nginx::{PatchStrategy, Patcher, PortAllocator},
    path::DeploymentTarget,
    prompt::{InquirePrompt, PromptSource},
    repo::{Acquirer, RepositoryRef},
    supervisor::Supervisor,
    system::{CommandError, CommandRunner, Invocation, PrivilegeContext, SystemRunner},
};

use chrono::Local;
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read_dir, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Everything a run needs, built once at startup.
#[derive(Debug)]
pub struct RuntimeContext<R = SystemRunner, P = InquirePrompt> {
    pub settings: Settings,
    pub runner: R,
    pub prompt: P,
}

impl RuntimeContext {
    /// Context that spawns real processes and prompts on the terminal.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Command`] if the command runtime cannot start.
    pub fn system(settings: Settings) -> Result<Self> {
        let runner = SystemRunner::new(settings.command_timeout())?;
        Ok(Self::new(settings, runner, InquirePrompt))
    }
}

impl<R: CommandRunner, P: PromptSource> RuntimeContext<R, P> {
    pub fn new(settings: Settings, runner: R, prompt: P) -> Self {
        Self {
            settings,
            runner,
            prompt,
        }
    }
}

/// Soft warnings collected over a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Warnings(Vec<String>);

impl Warnings {
    /// Log warning and keep it for the final summary.
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.0.push(message);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Log every collected warning again.
    pub fn summarize(&self) {
        if self.is_empty() {
            return;
        }

        warn!("finished with {} warning(s):", self.len());
        for (idx, message) in self.0.iter().enumerate() {
            warn!("  {}. {}", idx + 1, message.lines().next().unwrap_or_default());
        }
    }
}

/// Arguments of a full deployment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub domain: String,
    pub repo_url: String,
    pub branch: Option<String>,

    /// Application kind, detected from the checkout when absent.
    pub kind: Option<String>,
    pub use_ssh: bool,

    /// Database engine overriding detection.
    pub database: Option<String>,
    pub overrides: BTreeMap<String, String>,
    pub interactive: bool,
    pub keep_db_password: bool,
}

/// Arguments of a supervisor reset.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub domain: String,
    pub database: Option<String>,
}

/// Arguments of an env re-synthesis.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvRequest {
    pub domain: String,
    pub overrides: BTreeMap<String, String>,

    /// Env file whose variables are imported as overrides.
    pub import: Option<PathBuf>,
    pub interactive: bool,
}

/// Arguments of a deployment removal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub domain: String,
    pub backup: bool,
}

/// What a run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub domain: String,
    pub app_dir: Option<PathBuf>,
    pub kind: Option<AppKind>,
    pub port: Option<u16>,
    pub env_file: Option<PathBuf>,
    pub backup: Option<PathBuf>,
    pub warnings: Warnings,
}

impl Outcome {
    fn new(target: &DeploymentTarget) -> Self {
        Self {
            domain: target.domain().to_string(),
            ..Default::default()
        }
    }
}

/// Drive deployments of sites.
pub struct Deployer<'a, R: CommandRunner, P: PromptSource> {
    ctx: &'a RuntimeContext<R, P>,
}

impl<'a, R: CommandRunner, P: PromptSource> Deployer<'a, R, P> {
    pub fn new(ctx: &'a RuntimeContext<R, P>) -> Self {
        Self { ctx }
    }

    fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    /// Deploy repository to domain.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Validation`] if domain, URL, or type is invalid.
    /// - Return [`DeployError::Precondition`] if the site is not provisioned.
    /// - Return any component error that is not tolerated.
    #[instrument(skip(self, request), fields(domain = %request.domain), level = "debug")]
    pub fn deploy(&self, request: &DeployRequest) -> Result<Outcome> {
        let target = self.resolve(&request.domain)?;
        let repo = RepositoryRef::parse(
            &request.repo_url,
            request.branch.as_deref(),
            request.use_ssh,
            target.first_label(),
        )
        .map_err(|err| DeployError::Validation(err.to_string()))?;
        let kind = request
            .kind
            .as_deref()
            .map(str::parse::<AppKind>)
            .transpose()
            .map_err(|err| DeployError::Validation(err.to_string()))?;

        let mut outcome = Outcome::new(&target);
        let engine = self.forced_engine(request.database.as_deref(), &mut outcome.warnings);
        self.ensure_site(&target)?;

        // INVARIANT: Env of the previous checkout must be read before acquisition wipes it.
        let previous_env = self.previous_env(&target.app_dir(repo.name()))?;

        info!("deploy {} from {} ({})", target.domain(), repo.url(), repo.branch());
        let app_dir = Acquirer::new(&self.ctx.runner, &self.ctx.prompt).acquire(&target, &repo)?;

        let kind = match kind {
            Some(kind) => kind,
            None => AppKind::detect(&app_dir).ok_or_else(|| {
                DeployError::Precondition(format!(
                    "neither artisan nor package.json found in {}, pass --type",
                    app_dir.display()
                ))
            })?,
        };
        info!("deploy {} as a {kind} application", target.domain());
        outcome.kind = Some(kind);
        outcome.app_dir = Some(app_dir.clone());

        match kind {
            AppKind::Laravel => {
                self.deploy_laravel(&target, &app_dir, request, engine, previous_env, &mut outcome)?
            }
            AppKind::NodeJs => {
                self.deploy_node(&target, &app_dir, request, engine, previous_env, &mut outcome)?
            }
        }

        info!("{} deployed", target.domain());
        Ok(outcome)
    }

    fn deploy_node(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        request: &DeployRequest,
        engine: Option<DatabaseEngine>,
        previous_env: BTreeMap<String, String>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let profile = self.profile(app_dir, engine)?;
        let port = PortAllocator::new(self.settings().ports.clone()).allocate(target.domain())?;
        outcome.port = Some(port);
        info!("{} will listen on port {port}", target.domain());

        let mut layers = EnvLayers::load(app_dir)?;
        layers.existing.extend(previous_env);
        let db_ready = self.database_layer(
            &profile,
            target,
            &mut layers,
            request.keep_db_password,
            &mut outcome.warnings,
        )?;
        layers.framework = framework_defaults(&profile, target, port, &layers.existing);
        layers.overrides = request.overrides.clone();

        if profile.requires_env_file
            || profile.requires_database
            || !layers.existing.is_empty()
            || request.interactive
            || !request.overrides.is_empty()
        {
            let path = Synthesizer::new(&self.ctx.runner, &self.ctx.prompt).synthesize(
                target,
                app_dir,
                &layers,
                request.interactive,
            )?;
            outcome.env_file = Some(path);
        } else {
            info!("{} needs no .env file", target.domain());
        }

        self.install_dependencies(target, app_dir, &profile, &mut outcome.warnings);
        if profile.has_orm && db_ready && layers.merge().contains_key("DATABASE_URL") {
            self.bootstrap_orm(target, app_dir, &profile, &mut outcome.warnings);
        }
        self.build(target, app_dir, &profile)?;

        self.route(target, port, &mut outcome.warnings)?;
        Supervisor::new(&self.ctx.runner, &self.settings().supervisor).apply(
            target,
            app_dir,
            port,
            &profile.start_command(port),
            &mut outcome.warnings,
        )?;

        Ok(())
    }

    fn deploy_laravel(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        request: &DeployRequest,
        engine: Option<DatabaseEngine>,
        previous_env: BTreeMap<String, String>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let laravel = Laravel::new(&self.ctx.runner);
        laravel.prepare(target, app_dir)?;

        let mut layers = EnvLayers::load(app_dir)?;
        let redeploy = !previous_env.is_empty();
        layers.existing.extend(previous_env);
        let mut profile = ProjectProfile::default();
        if let Some(engine) = engine {
            profile.force_engine(engine);
        }
        self.database_layer(
            &profile,
            target,
            &mut layers,
            request.keep_db_password,
            &mut outcome.warnings,
        )?;
        layers.overrides = request.overrides.clone();

        if redeploy
            || !layers.database.is_empty()
            || !layers.overrides.is_empty()
            || request.interactive
        {
            let path = Synthesizer::new(&self.ctx.runner, &self.ctx.prompt).synthesize(
                target,
                app_dir,
                &layers,
                request.interactive,
            )?;
            outcome.env_file = Some(path);
        }

        laravel.finish(target, app_dir, &mut outcome.warnings)?;
        Ok(())
    }

    /// Re-apply the supervisor of an existing Node.js deployment.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Precondition`] if there is no Node.js checkout.
    /// - Return any component error that is not tolerated.
    #[instrument(skip(self, request), fields(domain = %request.domain), level = "debug")]
    pub fn reset(&self, request: &ResetRequest) -> Result<Outcome> {
        let target = self.resolve(&request.domain)?;
        let mut outcome = Outcome::new(&target);
        let engine = self.forced_engine(request.database.as_deref(), &mut outcome.warnings);
        self.ensure_site(&target)?;

        let app_dir = self.locate_app(&target)?;
        if AppKind::detect(&app_dir) != Some(AppKind::NodeJs) {
            return Err(DeployError::Precondition(format!(
                "{} holds no Node.js application",
                app_dir.display()
            )));
        }
        info!("reset {} from {}", target.domain(), app_dir.display());
        outcome.kind = Some(AppKind::NodeJs);
        outcome.app_dir = Some(app_dir.clone());

        let profile = self.profile(&app_dir, engine)?;
        let patcher = Patcher::new(&self.ctx.runner, self.settings());
        let port = match patcher.current_port(&target) {
            Some(port) => {
                info!("recovered port {port} from nginx configuration");
                port
            }
            None => PortAllocator::new(self.settings().ports.clone()).allocate(target.domain())?,
        };
        outcome.port = Some(port);

        let mut layers = EnvLayers::load(&app_dir)?;
        self.database_layer(&profile, &target, &mut layers, true, &mut outcome.warnings)?;
        layers.framework = framework_defaults(&profile, &target, port, &layers.existing);
        if profile.requires_env_file || profile.requires_database {
            let path = Synthesizer::new(&self.ctx.runner, &self.ctx.prompt)
                .synthesize(&target, &app_dir, &layers, false)?;
            outcome.env_file = Some(path);
        }

        self.route(&target, port, &mut outcome.warnings)?;
        Supervisor::new(&self.ctx.runner, &self.settings().supervisor).apply(
            &target,
            &app_dir,
            port,
            &profile.start_command(port),
            &mut outcome.warnings,
        )?;

        info!("{} reset", target.domain());
        Ok(outcome)
    }

    /// Rewrite `.env` of an existing deployment.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Precondition`] if there is no checkout, or the
    ///   imported file does not exist.
    /// - Return any component error that is not tolerated.
    #[instrument(skip(self, request), fields(domain = %request.domain), level = "debug")]
    pub fn configure_env(&self, request: &EnvRequest) -> Result<Outcome> {
        let target = self.resolve(&request.domain)?;
        let mut outcome = Outcome::new(&target);
        self.ensure_site(&target)?;

        let app_dir = self.locate_app(&target)?;
        outcome.app_dir = Some(app_dir.clone());
        outcome.kind = AppKind::detect(&app_dir);

        let mut layers = EnvLayers::load(&app_dir)?;
        if outcome.kind == Some(AppKind::NodeJs) {
            let profile = self.profile(&app_dir, None)?;
            let port = Patcher::new(&self.ctx.runner, self.settings())
                .current_port(&target)
                .or_else(|| layers.existing.get("PORT").and_then(|port| port.parse().ok()))
                .unwrap_or(profile.default_port);
            outcome.port = Some(port);

            self.database_layer(&profile, &target, &mut layers, true, &mut outcome.warnings)?;
            layers.framework = framework_defaults(&profile, &target, port, &layers.existing);
        }

        if let Some(import) = &request.import {
            let imported = EnvFile::read(import)?.ok_or_else(|| {
                DeployError::Precondition(format!("no env file at {}", import.display()))
            })?;
            info!("import {} variables from {}", imported.keys().count(), import.display());
            layers.overrides.extend(imported.into_map());
        }
        layers.overrides.extend(request.overrides.clone());

        let path = Synthesizer::new(&self.ctx.runner, &self.ctx.prompt).synthesize(
            &target,
            &app_dir,
            &layers,
            request.interactive,
        )?;
        outcome.env_file = Some(path);

        Ok(outcome)
    }

    /// Tear down deployment of domain, optionally backing it up first.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Precondition`] if the site is not provisioned.
    /// - Return [`DeployError::Command`] if the backup fails, in which case
    ///   nothing is deleted.
    /// - Return [`DeployError::Io`] if the checkout cannot be deleted.
    #[instrument(skip(self, request), fields(domain = %request.domain), level = "debug")]
    pub fn remove(&self, request: &RemoveRequest) -> Result<Outcome> {
        let target = self.resolve(&request.domain)?;
        let mut outcome = Outcome::new(&target);
        self.ensure_site(&target)?;

        Supervisor::new(&self.ctx.runner, &self.settings().supervisor)
            .remove(&target, &mut outcome.warnings)?;

        let app_root = target.app_root();
        let pattern = format!("node.*{}", app_root.display());
        if let Err(error) = self.ctx.runner.run(&Invocation::new("pkill").args(["-f", pattern.as_str()])) {
            debug!("no stray node processes under {}: {error}", app_root.display());
        }

        if app_root.exists() {
            if request.backup {
                outcome.backup = Some(self.backup(&target)?);
            }

            info!("remove {}", app_root.display());
            remove_dir_all(&app_root).map_err(|err| DeployError::Io {
                source: err,
                path: app_root.clone(),
            })?;
            outcome.app_dir = Some(app_root);
        } else {
            info!("nothing deployed under {}", app_root.display());
        }

        PortAllocator::new(self.settings().ports.clone()).release(target.domain())?;
        info!("{} removed", target.domain());
        Ok(outcome)
    }

    fn backup(&self, target: &DeploymentTarget) -> Result<PathBuf> {
        let backups = target.backups_dir();
        create_dir_all(&backups).map_err(|err| DeployError::Io {
            source: err,
            path: backups.clone(),
        })?;

        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let archive = backups.join(format!("{}_{stamp}.tar.gz", target.domain()));
        info!("back up {} into {}", target.app_root().display(), archive.display());
        self.ctx.runner.run(&Invocation::new("tar").args([
            "-czf".to_string(),
            archive.display().to_string(),
            "-C".to_string(),
            target.apps_dir().display().to_string(),
            target.domain().to_string(),
        ]))?;

        let owner = target.owner_user();
        self.ctx.runner.run(&Invocation::chown_recursive(owner, &backups))?;
        Ok(archive)
    }

    fn resolve(&self, domain: &str) -> Result<DeploymentTarget> {
        DeploymentTarget::resolve(domain, &self.settings().home_root)
            .map_err(|err| DeployError::Validation(err.to_string()))
    }

    /// Check that the site of target was provisioned and its user exists.
    fn ensure_site(&self, target: &DeploymentTarget) -> Result<()> {
        let uid = self
            .ctx
            .runner
            .run(&Invocation::new("id").arg("-u"))
            .map_err(|err| DeployError::Precondition(format!("cannot determine current user: {err}")))?;
        if uid.stdout.trim() != "0" {
            return Err(DeployError::Precondition("sm must run as root".into()));
        }

        let site = match target.parent_domain() {
            Some(parent) => format!("parent domain {parent}"),
            None => format!("site {}", target.domain()),
        };

        if !target.home_dir().is_dir() {
            return Err(DeployError::Precondition(format!(
                "{site} is not provisioned, {} does not exist",
                target.home_dir().display()
            )));
        }

        let owner = target.owner_user();
        self.ctx
            .runner
            .run(&Invocation::new("id").args(["-u", owner]))
            .map_err(|_| DeployError::Precondition(format!("{site} has no system user {owner}")))?;

        Ok(())
    }

    /// Variables of the `.env` a previous deployment left in app_dir.
    fn previous_env(&self, app_dir: &Path) -> Result<BTreeMap<String, String>> {
        let env = EnvFile::read(app_dir.join(".env"))?;
        if let Some(env) = &env {
            debug!("carry {} variable(s) over from previous .env", env.keys().count());
        }
        Ok(env.map(EnvFile::into_map).unwrap_or_default())
    }

    /// First checkout under the app root of target.
    fn locate_app(&self, target: &DeploymentTarget) -> Result<PathBuf> {
        let app_root = target.app_root();
        let missing = || {
            DeployError::Precondition(format!(
                "{} has no deployed application under {}",
                target.domain(),
                app_root.display()
            ))
        };

        let mut candidates = read_dir(&app_root)
            .map_err(|_| missing())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| AppKind::detect(path).is_some())
            .collect::<Vec<_>>();
        candidates.sort();
        candidates.into_iter().next().ok_or_else(missing)
    }

    fn forced_engine(&self, raw: Option<&str>, warnings: &mut Warnings) -> Option<DatabaseEngine> {
        let raw = raw?;
        match raw.parse::<DatabaseEngine>() {
            Ok(engine) => Some(engine),
            Err(_) => {
                warnings.push(format!(
                    "unknown database engine {raw:?}, falling back to detection"
                ));
                None
            }
        }
    }

    fn profile(&self, app_dir: &Path, engine: Option<DatabaseEngine>) -> Result<ProjectProfile> {
        let mut profile = detect::detect(app_dir)?;
        if let Some(engine) = engine {
            profile.force_engine(engine);
        }
        info!(
            "detected {} (typescript: {}, orm: {}, database: {})",
            profile.framework, profile.uses_typescript, profile.has_orm, profile.database_engine
        );
        Ok(profile)
    }

    /// Fill database layer of env, returning whether the database is usable.
    ///
    /// When `reuse` is set, the password of the same role recorded in the
    /// existing env is kept instead of rotated.
    fn database_layer(
        &self,
        profile: &ProjectProfile,
        target: &DeploymentTarget,
        layers: &mut EnvLayers,
        reuse: bool,
        warnings: &mut Warnings,
    ) -> Result<bool> {
        if !profile.requires_database {
            return Ok(false);
        }

        let settings = &self.settings().database;
        let provisioner = Provisioner::new(&self.ctx.runner, settings);
        let Some(server) = provisioner.server(profile.database_engine) else {
            warnings.push(format!(
                "{} databases are not provisioned, set DATABASE_URL by hand",
                profile.database_engine
            ));
            return Ok(false);
        };

        let skeleton =
            DatabaseCredential::for_target(profile.database_engine, target, server, profile.has_orm);
        let policy = if reuse {
            recorded_password(&layers.existing, &skeleton)
                .map(PasswordPolicy::Reuse)
                .unwrap_or(PasswordPolicy::Rotate)
        } else {
            PasswordPolicy::Rotate
        };

        let remedy = format!(
            "create role {} and database {} by hand, then update the database settings in .env",
            skeleton.user, skeleton.name
        );
        let credential = match provisioner.provision(profile, target, &policy) {
            Ok(Provisioning::Ready(credential)) => {
                info!("database {} ready for {}", credential.name, credential.user);
                layers.database = credential.env_vars();
                return Ok(true);
            }
            Ok(Provisioning::Unavailable { engine, reason }) => {
                warnings.push(format!(
                    "{engine} server is unavailable ({}), {remedy}",
                    reason.lines().next().unwrap_or_default()
                ));
                database::placeholder(profile, target, settings)
            }
            Ok(Provisioning::Unsupported(_)) => None,
            Err(error) => {
                warnings.push(format!("database provisioning failed: {error}, {remedy}"));
                database::placeholder(profile, target, settings)
            }
        };

        if let Some(credential) = credential {
            info!("write placeholder database credentials");
            layers.database = credential.env_vars();
        }
        Ok(false)
    }

    fn install_dependencies(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        profile: &ProjectProfile,
        warnings: &mut Warnings,
    ) {
        let mut attempts = Vec::new();
        if profile.has_lockfile {
            attempts.push(vec!["ci".to_string()]);
        }
        attempts.push(vec!["install".to_string()]);
        for flag in &self.settings().node.install_fallbacks {
            attempts.push(vec!["install".to_string(), flag.clone()]);
        }

        let owner = target.owner_user();
        let mut last_error = None;
        for args in attempts {
            info!("npm {}", args.join(" "));
            let invocation = Invocation::new("npm").args(args.iter()).cwd(app_dir);
            match self.ctx.runner.run_as(owner, invocation) {
                Ok(_) => return,
                Err(error) => {
                    debug!("npm {} failed: {error}", args.join(" "));
                    last_error = Some(error);
                }
            }
        }

        if let Some(error) = last_error {
            warnings.push(format!("dependencies could not be installed: {error}"));
        }
    }

    fn bootstrap_orm(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        profile: &ProjectProfile,
        warnings: &mut Warnings,
    ) {
        let owner = target.owner_user();
        info!("generate prisma client");
        let generate = Invocation::new("npx").args(["prisma", "generate"]).cwd(app_dir);
        if let Err(error) = self.ctx.runner.run_as(owner, generate) {
            warnings.push(format!("prisma client generation failed: {error}"));
            return;
        }

        if profile.has_migrations {
            info!("apply prisma migrations");
            let migrate = Invocation::new("npx")
                .args(["prisma", "migrate", "deploy"])
                .cwd(app_dir);
            if let Err(error) = self.ctx.runner.run_as(owner, migrate) {
                warnings.push(format!("prisma migrations failed: {error}"));
            }
        }
    }

    fn build(&self, target: &DeploymentTarget, app_dir: &Path, profile: &ProjectProfile) -> Result<()> {
        let Some(command) = profile.build_command() else {
            return Ok(());
        };

        info!("build with {command}");
        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or("npm");
        let invocation = Invocation::new(program).args(words).cwd(app_dir);
        self.ctx.runner.run_as(target.owner_user(), invocation)?;
        Ok(())
    }

    fn route(&self, target: &DeploymentTarget, port: u16, warnings: &mut Warnings) -> Result<()> {
        let patcher = Patcher::new(&self.ctx.runner, self.settings());
        match patcher.patch(target, port)? {
            None => warnings.push(format!(
                "no nginx configuration at {}, upstream not set",
                target.nginx_conf().display()
            )),
            Some(strategy) => {
                if strategy != PatchStrategy::ReplacePort {
                    info!("added upstream to {}", target.nginx_conf().display());
                }
                if let Err(error) = patcher.reload() {
                    warnings.push(format!("nginx reload failed: {error}"));
                }
            }
        }
        Ok(())
    }
}

/// Password of the role of skeleton, as recorded in an existing env.
fn recorded_password(existing: &BTreeMap<String, String>, skeleton: &DatabaseCredential) -> Option<String> {
    let from_url = existing
        .get("DATABASE_URL")
        .and_then(|url| DatabaseCredential::parse_url(url).ok())
        .filter(|recorded| recorded.user == skeleton.user)
        .map(|recorded| recorded.password);
    let from_fields = existing
        .get("DB_USERNAME")
        .filter(|user| **user == skeleton.user)
        .and_then(|_| existing.get("DB_PASSWORD").cloned());

    from_url
        .or(from_fields)
        .filter(|password| !password.is_empty() && password != database::PLACEHOLDER_PASSWORD)
}

/// Deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Input rejected before any side effect.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Site is not in a state that allows the operation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Repo(#[from] crate::repo::RepoError),

    #[error(transparent)]
    Detect(#[from] crate::detect::DetectError),

    #[error(transparent)]
    Env(#[from] crate::env::EnvError),

    #[error(transparent)]
    Database(#[from] crate::database::DatabaseError),

    #[error(transparent)]
    Nginx(#[from] crate::nginx::NginxError),

    #[error(transparent)]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    #[error(transparent)]
    Laravel(#[from] crate::laravel::LaravelError),

    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = DeployError> = std::result::Result<T, E>;
