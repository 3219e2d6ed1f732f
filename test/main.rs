// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sitemanager::{
    config::Settings,
    deploy::{DeployRequest, Deployer, RemoveRequest, RuntimeContext},
    detect::AppKind,
    env::EnvFile,
    path::DeploymentTarget,
    prompt::NonInteractive,
    repo::{shallow_clone, RepositoryRef},
    system::ScriptedRunner,
};

use anyhow::Result;
use git2::{IndexEntry, IndexTime, Repository, RepositoryInitOptions};
use indoc::indoc;
use pretty_assertions::assert_eq;
use std::{
    fs::{create_dir_all, read_link, read_to_string, write, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// Source repository that deployments clone from.
struct SourceRepo {
    repo: Repository,
    path: PathBuf,
}

impl SourceRepo {
    fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self {
            repo,
            path: path.as_ref().to_path_buf(),
        })
    }

    fn url(&self) -> String {
        self.path.display().to_string()
    }

    fn commit_file(&self, filename: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
        let contents = contents.as_ref();
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: contents.len() as u32,
            id: self.repo.blob(contents.as_bytes())?,
            flags: 0,
            flags_extended: 0,
            path: filename.as_ref().to_string_lossy().into_owned().into_bytes(),
        };

        let mut index = self.repo.index()?;
        index.add_frombuffer(&entry, contents.as_bytes())?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        let signature = self.repo.signature()?;
        let parent = self
            .repo
            .head()
            .ok()
            .and_then(|head| head.target())
            .map(|oid| self.repo.find_commit(oid))
            .transpose()?;
        let parents = parent.iter().collect::<Vec<_>>();

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("chore: add {:?}", filename.as_ref()),
            &tree,
            &parents,
        )?;

        Ok(())
    }

    fn branch(&self, name: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head, false)?;
        Ok(())
    }
}

/// Home root with a provisioned site for `example.com`.
struct Host {
    root: TempDir,
}

impl Host {
    fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        create_dir_all(root.path().join("home/example.com/nginx"))?;
        create_dir_all(root.path().join("sites-enabled"))?;
        Ok(Self { root })
    }

    fn home(&self) -> PathBuf {
        self.root.path().join("home")
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings {
            home_root: self.home(),
            sites_enabled: self.root.path().join("sites-enabled"),
            ..Default::default()
        };
        settings.ports.table = self.root.path().join("ports.toml");
        settings
    }

    fn context(&self) -> RuntimeContext<ScriptedRunner, NonInteractive> {
        self.context_with(ScriptedRunner::new())
    }

    fn context_with(&self, runner: ScriptedRunner) -> RuntimeContext<ScriptedRunner, NonInteractive> {
        let runner = runner.respond("id -u", "0\n");
        RuntimeContext::new(self.settings(), runner, NonInteractive)
    }

    fn source(&self, name: &str) -> Result<SourceRepo> {
        SourceRepo::new(self.root.path().join("src").join(name))
    }
}

fn request(domain: &str, repo: &SourceRepo) -> DeployRequest {
    DeployRequest {
        domain: domain.into(),
        repo_url: repo.url(),
        ..Default::default()
    }
}

#[test]
fn clone_checks_out_requested_branch() -> Result<()> {
    let host = Host::new()?;
    let source = host.source("landing")?;
    source.commit_file("README.md", "main\n")?;
    source.branch("staging")?;
    source.commit_file("CHANGELOG.md", "only on main\n")?;

    let repo = RepositoryRef::parse(source.url(), Some("staging"), false, "example")?;
    let dest = host.root.path().join("checkout");
    let cloned = shallow_clone(&repo, &dest, None)?;

    assert_eq!(read_to_string(dest.join("README.md"))?, "main\n");
    assert!(!dest.join("CHANGELOG.md").exists());
    assert_eq!(cloned.head()?.shorthand(), Some("staging"));
    Ok(())
}

#[test]
fn deploy_express_application_end_to_end() -> Result<()> {
    let host = Host::new()?;
    let conf = host.home().join("example.com/nginx/example.com.conf");
    write(
        &conf,
        indoc! {"
            server {
                server_name example.com;
                location / {
                    proxy_pass http://localhost:3000;
                }
            }
        "},
    )?;

    let source = host.source("shop-api")?;
    source.commit_file(
        "package.json",
        r#"{"name":"shop-api","main":"server.js","scripts":{"start":"node server.js"},"dependencies":{"express":"^4"}}"#,
    )?;
    source.commit_file("server.js", "require('express')().listen(process.env.PORT);\n")?;
    source.commit_file(".env.example", "PORT=3000\nSESSION_SECRET=\n")?;

    let ctx = host.context();
    let outcome = Deployer::new(&ctx).deploy(&request("example.com", &source))?;

    let app_dir = host.home().join("example.com/apps/example.com/shop-api");
    assert_eq!(outcome.kind, Some(AppKind::NodeJs));
    assert_eq!(outcome.app_dir.as_deref(), Some(app_dir.as_path()));
    assert!(app_dir.join("server.js").is_file());

    let port = outcome.port.expect("node deployment gets a port");
    let env = read_to_string(app_dir.join(".env"))?;
    assert!(env.contains(&format!("PORT={port}")));
    assert!(env.contains("NODE_ENV=production"));
    assert!(env.contains("SESSION_SECRET="));

    let conf = read_to_string(&conf)?;
    assert!(conf.contains(&format!("proxy_pass http://localhost:{port};")));
    assert!(!conf.contains("3000"));

    let descriptor = read_to_string(host.home().join("example.com/pm.example.com.config.json"))?;
    assert!(descriptor.contains(r#""name": "example.com""#));
    assert!(descriptor.contains(r#""script": "npm run start""#));

    assert!(ctx.runner.called("sudo -u example -H npm install"));
    assert!(ctx.runner.called("systemctl reload nginx"));
    assert!(ctx.runner.called("sudo -u example -H pm2 start"));
    assert!(outcome.warnings.is_empty());
    Ok(())
}

#[test]
fn redeploy_keeps_port_and_replaces_checkout() -> Result<()> {
    let host = Host::new()?;
    let source = host.source("worker")?;
    source.commit_file("package.json", r#"{"name":"worker","dependencies":{"express":"^4"}}"#)?;

    let ctx = host.context();
    let deployer = Deployer::new(&ctx);
    let first = deployer.deploy(&request("example.com", &source))?;

    let stale = host.home().join("example.com/apps/example.com/worker/stale.txt");
    write(&stale, "left over")?;
    let second = deployer.deploy(&request("example.com", &source))?;

    assert_eq!(first.port, second.port);
    assert!(!stale.exists());
    assert!(read_to_string(host.root.path().join("ports.toml"))?.contains("example.com"));

    // INVARIANT: Missing nginx configuration is only a warning.
    assert!(second.warnings.iter().any(|message| message.contains("no nginx configuration")));
    Ok(())
}

fn read_env(path: impl AsRef<Path>) -> Result<EnvFile> {
    Ok(EnvFile::parse(&read_to_string(path)?))
}

#[test]
fn redeploy_keeps_database_password_and_previous_env() -> Result<()> {
    let host = Host::new()?;
    let source = host.source("api")?;
    source.commit_file(
        "package.json",
        r#"{"name":"api","dependencies":{"@nestjs/core":"^10","pg":"^8"}}"#,
    )?;
    source.commit_file(".env.example", "JWT_SECRET=changeme\nJWT_EXPIRES_IN=1d\n")?;

    let runner = ScriptedRunner::new()
        .respond("pg_roles", "1\n")
        .respond("pg_database", "1\n");
    let ctx = host.context_with(runner);
    let deployer = Deployer::new(&ctx);
    deployer.deploy(&request("example.com", &source))?;

    let env_path = host.home().join("example.com/apps/example.com/api/.env");
    let first = read_env(&env_path)?;
    let mut env = OpenOptions::new().append(true).open(&env_path)?;
    writeln!(env, "MAIL_FROM=ops@example.com")?;

    deployer.deploy(&DeployRequest {
        keep_db_password: true,
        ..request("example.com", &source)
    })?;
    let second = read_env(&env_path)?;

    let rotations = ctx
        .runner
        .calls()
        .iter()
        .filter(|call| call.contains("ALTER USER"))
        .count();
    assert_eq!(rotations, 1);
    assert!(first.get("DB_PASSWORD").is_some_and(|password| !password.is_empty()));
    assert_eq!(second.get("DB_PASSWORD"), first.get("DB_PASSWORD"));
    assert_eq!(second.get("DATABASE_URL"), first.get("DATABASE_URL"));
    assert_eq!(second.get("JWT_SECRET"), first.get("JWT_SECRET"));
    assert_eq!(second.get("MAIL_FROM"), Some("ops@example.com"));
    Ok(())
}

#[test]
fn deploy_laravel_subdomain_links_public_root() -> Result<()> {
    let host = Host::new()?;
    let source = host.source("storefront")?;
    source.commit_file("artisan", "#!/usr/bin/env php\n")?;
    source.commit_file("public/index.php", "<?php\n")?;
    source.commit_file(".env.example", "APP_NAME=Storefront\n")?;

    let ctx = host.context();
    let outcome = Deployer::new(&ctx).deploy(&request("shop.example.com", &source))?;

    let target = DeploymentTarget::resolve("shop.example.com", host.home())?;
    let app_dir = target.app_dir("storefront");
    assert_eq!(outcome.kind, Some(AppKind::Laravel));
    assert_eq!(outcome.port, None);
    assert_eq!(read_link(target.public_html())?, app_dir.join("public"));
    assert_eq!(read_to_string(app_dir.join(".env"))?, "APP_NAME=Storefront\n");
    assert!(ctx.runner.called("composer install --no-dev --optimize-autoloader"));
    assert!(!ctx.runner.called("pm2 start"));
    Ok(())
}

#[test]
fn remove_after_deploy_releases_port() -> Result<()> {
    let host = Host::new()?;
    let source = host.source("blog")?;
    source.commit_file("package.json", r#"{"name":"blog","dependencies":{"express":"^4"}}"#)?;

    let ctx = host.context();
    let deployer = Deployer::new(&ctx);
    deployer.deploy(&request("example.com", &source))?;
    deployer.remove(&RemoveRequest {
        domain: "example.com".into(),
        backup: false,
    })?;

    assert!(!host.home().join("example.com/apps/example.com").exists());
    assert!(!host.home().join("example.com/pm.example.com.config.json").exists());
    assert!(!read_to_string(host.root.path().join("ports.toml"))?.contains("example.com"));
    assert!(ctx.runner.called("pm2 delete example.com"));
    Ok(())
}
