// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Laravel deployments.
//!
//! Laravel applications are served by PHP-FPM straight out of their `public`
//! directory, so no supervised process or upstream port is involved. The
//! public web root of the site is replaced by a symlink to the application.

use crate::{
    deploy::Warnings,
    path::DeploymentTarget,
    system::{CommandRunner, Invocation, PrivilegeContext},
};

use std::{
    fs::{copy, create_dir_all, remove_dir_all, remove_file, symlink_metadata},
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Writable directories Laravel expects to exist.
pub const WRITABLE_DIRS: [&str; 8] = [
    "bootstrap/cache",
    "storage/app",
    "storage/app/public",
    "storage/framework",
    "storage/framework/cache",
    "storage/framework/sessions",
    "storage/framework/views",
    "storage/logs",
];

/// Artisan commands run after dependencies are in place, and whether their
/// failure is tolerated.
const ARTISAN_STEPS: [(&str, bool); 6] = [
    ("key:generate", false),
    ("storage:link", false),
    ("migrate --force", true),
    ("config:cache", false),
    ("route:cache", true),
    ("view:cache", false),
];

/// Drive the deployment of a Laravel application.
pub struct Laravel<'a, R: CommandRunner> {
    runner: &'a R,
}

impl<'a, R: CommandRunner> Laravel<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self { runner }
    }

    /// Lay out writable directories, install dependencies, and seed `.env`.
    ///
    /// # Errors
    ///
    /// - Return [`LaravelError::MissingArtisan`] if app is not a Laravel app.
    /// - Return [`LaravelError::Io`] if directories cannot be created.
    /// - Return [`LaravelError::Command`] if `chown` or composer fails.
    #[instrument(skip(self, target, app_dir), level = "debug")]
    pub fn prepare(&self, target: &DeploymentTarget, app_dir: &Path) -> Result<()> {
        if !app_dir.join("artisan").exists() {
            return Err(LaravelError::MissingArtisan(app_dir.to_path_buf()));
        }

        let owner = target.owner_user();
        info!("prepare writable directories of {}", app_dir.display());
        for dir in WRITABLE_DIRS {
            let dir = app_dir.join(dir);
            create_dir_all(&dir).map_err(|err| io_error(err, &dir))?;
        }
        self.runner.run(&Invocation::chown_recursive(owner, app_dir))?;

        info!("install composer dependencies");
        self.runner.run_as(
            owner,
            Invocation::new("composer")
                .args(["install", "--no-dev", "--optimize-autoloader"])
                .cwd(app_dir),
        )?;

        let env = app_dir.join(".env");
        let example = app_dir.join(".env.example");
        if !env.exists() && example.exists() {
            info!("seed {} from {}", env.display(), example.display());
            copy(&example, &env).map_err(|err| io_error(err, &env))?;
            self.runner.run(&Invocation::chown(owner, &env))?;
        }

        Ok(())
    }

    /// Run artisan steps and publish the public directory.
    ///
    /// Migration and route caching failures only produce warnings.
    ///
    /// # Errors
    ///
    /// - Return [`LaravelError::Command`] if a required artisan step fails.
    /// - Return [`LaravelError::Io`] if the public web root cannot be replaced.
    #[instrument(skip(self, target, app_dir, warnings), level = "debug")]
    pub fn finish(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        warnings: &mut Warnings,
    ) -> Result<PathBuf> {
        let owner = target.owner_user();
        for (step, tolerated) in ARTISAN_STEPS {
            info!("php artisan {step}");
            let invocation = Invocation::new("php")
                .arg("artisan")
                .args(step.split_whitespace())
                .cwd(app_dir);

            match self.runner.run_as(owner, invocation) {
                Ok(_) => {}
                Err(error) if tolerated => {
                    warnings.push(format!("php artisan {step} failed: {error}"))
                }
                Err(error) => return Err(error.into()),
            }
        }

        self.publish(target, app_dir)
    }

    /// Replace public web root of target with a symlink to app's `public`.
    ///
    /// # Errors
    ///
    /// - Return [`LaravelError::Io`] if the web root cannot be replaced.
    /// - Return [`LaravelError::Command`] if link ownership cannot be changed.
    pub fn publish(&self, target: &DeploymentTarget, app_dir: &Path) -> Result<PathBuf> {
        let link = target.public_html();
        let public = app_dir.join("public");

        if let Ok(meta) = symlink_metadata(&link) {
            let removed = if meta.is_dir() {
                remove_dir_all(&link)
            } else {
                remove_file(&link)
            };
            removed.map_err(|err| io_error(err, &link))?;
        }

        if let Some(parent) = link.parent() {
            create_dir_all(parent).map_err(|err| io_error(err, parent))?;
        }

        info!("link {} to {}", link.display(), public.display());
        symlink(&public, &link).map_err(|err| io_error(err, &link))?;

        let owner = target.owner_user();
        self.runner.run(&Invocation::new("chown").args([
            "-h".to_string(),
            format!("{owner}:{owner}"),
            link.display().to_string(),
        ]))?;

        Ok(link)
    }
}

fn io_error(source: std::io::Error, path: &Path) -> LaravelError {
    LaravelError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Laravel deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum LaravelError {
    #[error("no artisan file in {:?}, is this a Laravel application?", .0.display())]
    MissingArtisan(PathBuf),

    #[error("failed to access {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Command(#[from] crate::system::CommandError),
}

/// Friendly result alias :3
pub type Result<T, E = LaravelError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use std::fs::{read_link, read_to_string, write};

    fn laravel_app(home: &Path, domain: &str) -> anyhow::Result<(DeploymentTarget, PathBuf)> {
        let target = DeploymentTarget::resolve(domain, home)?;
        let app_dir = target.app_dir("site");
        create_dir_all(app_dir.join("public"))?;
        write(app_dir.join("artisan"), "#!/usr/bin/env php\n")?;
        write(app_dir.join(".env.example"), "APP_NAME=Laravel\n")?;
        Ok((target, app_dir))
    }

    #[test]
    fn prepare_requires_artisan() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let target = DeploymentTarget::resolve("example.com", home.path())?;
        let app_dir = target.app_dir("site");
        create_dir_all(&app_dir)?;

        let runner = ScriptedRunner::new();
        let result = Laravel::new(&runner).prepare(&target, &app_dir);
        assert!(matches!(result, Err(LaravelError::MissingArtisan(_))));
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn prepare_lays_out_storage_and_seeds_env() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let (target, app_dir) = laravel_app(home.path(), "example.com")?;

        let runner = ScriptedRunner::new();
        Laravel::new(&runner).prepare(&target, &app_dir)?;

        for dir in WRITABLE_DIRS {
            assert!(app_dir.join(dir).is_dir(), "{dir} missing");
        }
        assert_eq!(read_to_string(app_dir.join(".env"))?, "APP_NAME=Laravel\n");
        assert!(runner.called("sudo -u example -H composer install --no-dev --optimize-autoloader"));
        Ok(())
    }

    #[test]
    fn finish_tolerates_migrations_and_links_subdomain_root() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let (target, app_dir) = laravel_app(home.path(), "shop.example.com")?;
        let stale = target.public_html();
        create_dir_all(&stale)?;
        write(stale.join("index.html"), "old")?;

        let runner = ScriptedRunner::new().fail("migrate", 1, "SQLSTATE[HY000] connection refused");
        let mut warnings = Warnings::default();
        let link = Laravel::new(&runner).finish(&target, &app_dir, &mut warnings)?;

        assert_eq!(link, home.path().join("example.com/public_html/shop.example.com"));
        assert_eq!(read_link(&link)?, app_dir.join("public"));
        assert_eq!(warnings.len(), 1);
        assert!(runner.called("php artisan view:cache"));
        assert!(runner.called("chown -h example:example"));
        Ok(())
    }

    #[test]
    fn finish_fails_on_required_step() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let (target, app_dir) = laravel_app(home.path(), "example.com")?;

        let runner = ScriptedRunner::new().fail("key:generate", 1, "no .env");
        let mut warnings = Warnings::default();
        let result = Laravel::new(&runner).finish(&target, &app_dir, &mut warnings);
        assert!(matches!(result, Err(LaravelError::Command(_))));
        assert!(!runner.called("storage:link"));
        Ok(())
    }
}
