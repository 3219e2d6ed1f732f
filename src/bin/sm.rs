// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sitemanager::{
    config::Settings,
    deploy::{
        DeployRequest, Deployer, EnvRequest, Outcome, RemoveRequest, ResetRequest, RuntimeContext,
    },
    env::parse_override,
    path::default_config_path,
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::{collections::BTreeMap, path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  sm [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = Settings::load_or_create(path)?;
        let ctx = RuntimeContext::system(settings)?;
        let deployer = Deployer::new(&ctx);

        let outcome = match self.command {
            Command::Deploy(opts) => match opts.action {
                Some(DeployAction::ResetPm2(opts)) => deployer.reset(&ResetRequest {
                    domain: opts.domain,
                    database: opts.database,
                })?,
                Some(DeployAction::Remove(opts)) => deployer.remove(&RemoveRequest {
                    domain: opts.domain,
                    backup: opts.backup,
                })?,
                None => deployer.deploy(&opts.into_request()?)?,
            },
            Command::Env(opts) => deployer.configure_env(&EnvRequest {
                domain: opts.domain,
                overrides: overrides(&opts.env)?,
                import: opts.file,
                interactive: opts.interactive,
            })?,
        };

        report(&outcome);
        Ok(())
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Deploy application from Git repository to a site.
    #[command(
        override_usage = "sm deploy --domain <domain> --repo <url> [options]",
        subcommand_negates_reqs = true
    )]
    Deploy(DeployOptions),

    /// Rewrite environment file of deployed application.
    #[command(override_usage = "sm env --domain <domain> [options]")]
    Env(EnvOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    #[command(subcommand)]
    pub action: Option<DeployAction>,

    /// Domain to deploy to.
    #[arg(short, long, required = true, value_name = "domain")]
    pub domain: Option<String>,

    /// URL of repository to deploy.
    #[arg(short, long, required = true, value_name = "url")]
    pub repo: Option<String>,

    /// Branch to deploy instead of main.
    #[arg(short, long, value_name = "branch")]
    pub branch: Option<String>,

    /// Application type, detected from the checkout when omitted.
    #[arg(short = 't', long = "type", value_name = "laravel|nodejs")]
    pub kind: Option<String>,

    /// Clone over SSH with a generated deploy key.
    #[arg(long)]
    pub ssh: bool,

    /// Database engine to provision instead of the detected one.
    #[arg(long, value_name = "postgresql|mysql")]
    pub database: Option<String>,

    /// Set environment variable, may be repeated.
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Edit environment variables interactively.
    #[arg(short, long)]
    pub interactive: bool,

    /// Keep database password recorded in existing .env.
    #[arg(long)]
    pub keep_db_password: bool,
}

impl DeployOptions {
    fn into_request(self) -> Result<DeployRequest> {
        Ok(DeployRequest {
            domain: self.domain.unwrap_or_default(),
            repo_url: self.repo.unwrap_or_default(),
            branch: self.branch,
            kind: self.kind,
            use_ssh: self.ssh,
            database: self.database,
            overrides: overrides(&self.env)?,
            interactive: self.interactive,
            keep_db_password: self.keep_db_password,
        })
    }
}

#[derive(Debug, Clone, Subcommand)]
enum DeployAction {
    /// Re-apply pm2 configuration of existing deployment.
    #[command(name = "reset-pm2", override_usage = "sm deploy reset-pm2 --domain <domain>")]
    ResetPm2(ResetOptions),

    /// Remove deployed application.
    #[command(override_usage = "sm deploy remove --domain <domain> [--backup]")]
    Remove(RemoveOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResetOptions {
    /// Domain of deployment to reset.
    #[arg(short, long, value_name = "domain")]
    pub domain: String,

    /// Database engine to provision instead of the detected one.
    #[arg(long, value_name = "postgresql|mysql")]
    pub database: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Domain of deployment to remove.
    #[arg(short, long, value_name = "domain")]
    pub domain: String,

    /// Archive application into backups directory before removal.
    #[arg(short, long)]
    pub backup: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct EnvOptions {
    /// Domain of deployment to configure.
    #[arg(short, long, value_name = "domain")]
    pub domain: String,

    /// Set environment variable, may be repeated.
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Import variables from env file.
    #[arg(short, long, value_name = "path")]
    pub file: Option<PathBuf>,

    /// Edit environment variables interactively.
    #[arg(short, long)]
    pub interactive: bool,
}

fn overrides(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| parse_override(pair).map_err(Into::into))
        .collect()
}

fn report(outcome: &Outcome) {
    if let Some(app_dir) = &outcome.app_dir {
        info!("application directory: {}", app_dir.display());
    }
    if let Some(port) = outcome.port {
        info!("port: {port}");
    }
    if let Some(env_file) = &outcome.env_file {
        info!("environment file: {}", env_file.display());
    }
    if let Some(backup) = &outcome.backup {
        info!("backup: {}", backup.display());
    }
    outcome.warnings.summarize();
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}
