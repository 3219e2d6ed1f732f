// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository acquisition.
//!
//! Clone the repository of a deployment into its application directory. The
//! clone is destructive-idempotent: any previous checkout at the same path is
//! removed first, and a fresh shallow single-branch clone takes its place.
//!
//! # SSH Deploy Keys
//!
//! When cloning over SSH, every (domain, owner, repository) tuple gets its own
//! ed25519 key pair under the owning user's `.ssh` directory. The key is
//! generated once, shown to the operator so it can be registered as a Deploy
//! Key upstream, and reused on every later deploy. A host alias stanza is
//! added to the user's SSH client configuration so keys for different
//! repositories on the same host never collide.

use crate::{
    path::DeploymentTarget,
    prompt::PromptSource,
    system::{CommandRunner, Invocation},
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::RepoBuilder, CertificateCheckStatus, Config, Cred, FetchOptions, RemoteCallbacks,
    Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fs::{create_dir_all, read_to_string, remove_dir_all, set_permissions, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Transport used to reach a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Https,
    Ssh,

    /// Local file system path, mostly useful for mirrors and testing.
    Local,
}

/// Parsed reference to a remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    url: String,
    branch: String,
    use_ssh: bool,
    transport: Transport,
    host: Option<String>,
    owner: Option<String>,
    name: String,
}

impl RepositoryRef {
    /// Parse repository URL.
    ///
    /// Understands `git@host:owner/name.git`, `ssh://` URLs, `https://` URLs,
    /// `file://` URLs, and absolute paths. If no repository name can be found,
    /// then `fallback_name` is used instead.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::InvalidUrl`] if the URL matches no known form.
    pub fn parse(
        url: impl Into<String>,
        branch: Option<&str>,
        use_ssh: bool,
        fallback_name: &str,
    ) -> Result<Self> {
        let url = url.into();
        let (transport, host, path) = split_url(&url)?;

        let mut segments = path
            .trim_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();
        let name = segments
            .pop()
            .map(|name| name.strip_suffix(".git").unwrap_or(name).to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback_name.to_string());
        let owner = match transport {
            Transport::Local => None,
            _ => segments.pop().map(ToString::to_string),
        };

        // INVARIANT: SSH mode forces the SSH transport for remote repositories.
        let transport = match (use_ssh, transport) {
            (true, Transport::Https) => Transport::Ssh,
            (_, transport) => transport,
        };

        Ok(Self {
            url,
            branch: branch.unwrap_or("main").to_string(),
            use_ssh,
            transport,
            host,
            owner,
            name,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn use_ssh(&self) -> bool {
        self.use_ssh
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL handed to libgit2.
    ///
    /// HTTPS URLs are rewritten to their SCP-like SSH form when SSH mode is on.
    pub fn clone_url(&self) -> String {
        match (self.use_ssh, self.url.starts_with("http"), &self.host) {
            (true, true, Some(host)) => format!("git@{host}:{}.git", self.slug()),
            _ => self.url.clone(),
        }
    }

    /// Deterministic deploy key path for this repository under target.
    pub fn ssh_key_path(&self, target: &DeploymentTarget) -> Option<PathBuf> {
        if !self.use_ssh {
            return None;
        }

        let mut key = target.domain_safe();
        if let Some(owner) = &self.owner {
            key.push('_');
            key.push_str(&owner.replace('-', "_"));
        }
        key.push('_');
        key.push_str(&self.name.replace('-', "_"));

        Some(target.ssh_dir().join(key))
    }

    /// Synthetic SSH host alias, e.g., `github-owner-name`.
    pub fn host_alias(&self) -> String {
        let host = self
            .host
            .as_deref()
            .and_then(|host| host.split('.').next())
            .unwrap_or("git");
        format!("{host}-{}", self.slug().replace('/', "-"))
    }

    /// SSH client configuration stanza routing the host alias through key.
    pub fn ssh_config_stanza(&self, domain: &str, key: &Path) -> String {
        format!(
            "\n# Added by sitemanager for {domain}\n\
             Host {}\n    \
             Hostname {}\n    \
             User git\n    \
             IdentityFile {}\n    \
             IdentitiesOnly yes\n    \
             StrictHostKeyChecking no\n",
            self.host_alias(),
            self.host.as_deref().unwrap_or("github.com"),
            key.display(),
        )
    }

    fn slug(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{owner}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

fn split_url(url: &str) -> Result<(Transport, Option<String>, String)> {
    if url.is_empty() {
        return Err(RepoError::InvalidUrl(url.into()));
    }

    if url.starts_with('/') {
        return Ok((Transport::Local, None, url.into()));
    }

    // INVARIANT: SCP-like syntax has no scheme, and a colon before the first slash.
    if !url.contains("://") {
        let (host, path) = url
            .split_once(':')
            .filter(|(host, _)| !host.contains('/'))
            .ok_or_else(|| RepoError::InvalidUrl(url.into()))?;
        let host = host.rsplit('@').next().unwrap_or(host).to_string();
        return Ok((Transport::Ssh, Some(host), path.into()));
    }

    let parsed = Url::parse(url).map_err(|_| RepoError::InvalidUrl(url.into()))?;
    let transport = match parsed.scheme() {
        "https" | "http" => Transport::Https,
        "ssh" => Transport::Ssh,
        "file" => Transport::Local,
        _ => return Err(RepoError::InvalidUrl(url.into())),
    };

    Ok((
        transport,
        parsed.host_str().map(ToString::to_string),
        parsed.path().to_string(),
    ))
}

/// Clone repositories into deployment application directories.
pub struct Acquirer<'a, R, P>
where
    R: CommandRunner,
    P: PromptSource,
{
    runner: &'a R,
    prompt: &'a P,
}

impl<'a, R, P> Acquirer<'a, R, P>
where
    R: CommandRunner,
    P: PromptSource,
{
    pub fn new(runner: &'a R, prompt: &'a P) -> Self {
        Self { runner, prompt }
    }

    /// Acquire fresh checkout of repository for target.
    ///
    /// Partial clones are left in place on failure for inspection.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::Io`] if directories cannot be prepared.
    /// - Return [`RepoError::Command`] if key generation or `chown` fails.
    /// - Return [`RepoError::Git2`] if cloning fails.
    #[instrument(skip(self, target, repo), level = "debug")]
    pub fn acquire(&self, target: &DeploymentTarget, repo: &RepositoryRef) -> Result<PathBuf> {
        let app_dir = target.app_dir(repo.name());
        let owner = target.owner_user();

        if app_dir.exists() {
            info!("remove existing checkout at {}", app_dir.display());
            remove_dir_all(&app_dir).map_err(|err| io_error(err, &app_dir))?;
        }

        let parent = target.app_root();
        info!("prepare application directory {}", parent.display());
        create_dir_all(&parent).map_err(|err| io_error(err, &parent))?;
        self.chown_recursive(owner, &target.apps_dir())?;

        let key = match repo.ssh_key_path(target) {
            Some(key) => Some(self.ensure_deploy_key(target, repo, &key)?),
            None => None,
        };

        info!("clone {} ({}) into {}", repo.url(), repo.branch(), app_dir.display());
        let repository = shallow_clone(repo, &app_dir, key.as_deref())?;

        if repo.use_ssh() {
            if let Some(owner_slug) = repo.owner() {
                let alias_url = format!("git@{}:{owner_slug}/{}.git", repo.host_alias(), repo.name());
                repository.remote_set_url("origin", &alias_url)?;
            }
        }

        self.chown_recursive(owner, &app_dir)?;
        info!("repository cloned into {}", app_dir.display());

        Ok(app_dir)
    }

    /// Make sure deploy key exists for repository, generating it if absent.
    ///
    /// # Errors
    ///
    /// - Return [`RepoError::DeployKeyRejected`] if operator does not confirm
    ///   registration of a freshly generated key.
    #[instrument(skip(self, target, repo, key), level = "debug")]
    pub fn ensure_deploy_key(
        &self,
        target: &DeploymentTarget,
        repo: &RepositoryRef,
        key: &Path,
    ) -> Result<PathBuf> {
        let owner = target.owner_user();
        let ssh_dir = target.ssh_dir();
        create_dir_all(&ssh_dir).map_err(|err| io_error(err, &ssh_dir))?;
        set_permissions(&ssh_dir, Permissions::from_mode(0o700))
            .map_err(|err| io_error(err, &ssh_dir))?;
        self.chown(owner, &ssh_dir)?;

        if key.exists() {
            info!("reuse deploy key {}", key.display());
        } else {
            info!("generate deploy key {}", key.display());
            self.runner.run(
                &Invocation::new("ssh-keygen").args([
                    "-t".to_string(),
                    "ed25519".to_string(),
                    "-f".to_string(),
                    key.display().to_string(),
                    "-C".to_string(),
                    format!("{owner}@{}", target.domain()),
                    "-N".to_string(),
                    String::new(),
                ]),
            )?;

            let public = PathBuf::from(format!("{}.pub", key.display()));
            self.chown(owner, key)?;
            self.chown(owner, &public)?;

            let contents = read_to_string(&public).map_err(|err| io_error(err, &public))?;
            info!("add this Deploy Key to the repository:\n\n{}\n", contents.trim_end());
            if !self
                .prompt
                .confirm("Has the Deploy Key been registered upstream?", true)?
            {
                return Err(RepoError::DeployKeyRejected(key.to_path_buf()));
            }
        }

        self.ensure_ssh_config(target, repo, key)?;
        Ok(key.to_path_buf())
    }

    fn ensure_ssh_config(
        &self,
        target: &DeploymentTarget,
        repo: &RepositoryRef,
        key: &Path,
    ) -> Result<()> {
        let config = target.ssh_dir().join("config");
        let marker = format!("Host {}", repo.host_alias());
        let current = read_to_string(&config).unwrap_or_default();
        if current.lines().any(|line| line.trim() == marker) {
            debug!("ssh config already routes {}", repo.host_alias());
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&config)
            .map_err(|err| io_error(err, &config))?;
        file.write_all(repo.ssh_config_stanza(target.domain(), key).as_bytes())
            .map_err(|err| io_error(err, &config))?;
        self.chown(target.owner_user(), &config)?;

        Ok(())
    }

    fn chown(&self, owner: &str, path: &Path) -> Result<()> {
        self.runner.run(&Invocation::chown(owner, path))?;
        Ok(())
    }

    fn chown_recursive(&self, owner: &str, path: &Path) -> Result<()> {
        self.runner.run(&Invocation::chown_recursive(owner, path))?;
        Ok(())
    }
}

/// Shallow single-branch clone of repository through libgit2.
///
/// The progress of the clone is displayed through a progress bar, which is
/// suspended whenever credentials must be asked for.
///
/// # Errors
///
/// - Return [`RepoError::Git2`] if libgit2 operations fail.
/// - Return [`RepoError::IndicatifStyleTemplate`] if progress bar style is bad.
pub fn shallow_clone(repo: &RepositoryRef, path: &Path, key: Option<&Path>) -> Result<Repository> {
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(repo.name().to_string());
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar);
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();

    // INVARIANT: Deploy keys take precedence over any ambient credential helper.
    match key {
        Some(key) => {
            let private = key.to_path_buf();
            let public = PathBuf::from(format!("{}.pub", key.display()));
            rc.credentials(move |_url, username, _allowed| {
                Cred::ssh_key(username.unwrap_or("git"), Some(public.as_path()), &private, None)
            });
            rc.certificate_check(|_cert, _host| Ok(CertificateCheckStatus::CertificateOk));
        }
        None => {
            rc.credentials(authenticator.credentials(&config));
        }
    }

    rc.transfer_progress(|progress| {
        let stats = progress.to_owned();
        let bar_size = stats.total_objects() as u64;
        let bar_pos = stats.received_objects() as u64;
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(bar_size);
            prompter.bar.set_position(bar_pos);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);

    // INVARIANT: Local transport of libgit2 cannot perform shallow fetches.
    if repo.transport() != Transport::Local {
        fo.depth(1);
    }

    let branch = repo.branch().to_string();
    let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
    let result = RepoBuilder::new()
        .branch(&branch)
        .fetch_options(fo)
        .remote_create(move |repository, name, url| {
            repository.remote_with_fetch(name, url, &refspec)
        })
        .clone(&repo.clone_url(), path);

    match &result {
        Ok(_) => prompter.bar.finish_and_clear(),
        Err(err) => {
            prompter.bar.abandon();
            warn!("clone failed, partial checkout left at {}", path.display());
            debug!("libgit2 error class {:?}", err.class());
        }
    }

    Ok(result?)
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

fn io_error(source: std::io::Error, path: &Path) -> RepoError {
    RepoError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Repository acquisition error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Repository URL matches no known form.
    #[error("invalid repository url {0:?}")]
    InvalidUrl(String),

    /// Operator declined to confirm Deploy Key registration.
    #[error("deploy key {:?} was not registered upstream", .0.display())]
    DeployKeyRejected(PathBuf),

    #[error("failed to prepare {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Command(#[from] crate::system::CommandError),

    #[error(transparent)]
    Prompt(#[from] crate::prompt::PromptError),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RepoError> = std::result::Result<T, E>;
