// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path and identity resolution.
//!
//! Every site managed by `sm` lives under the home directory of a dedicated
//! system user. A __root domain__ such as `example.com` owns the user `example`
//! and the home directory `/home/example.com`. A __subdomain__ such as
//! `blog.example.com` does not get a user of its own. Instead it borrows the
//! user and home directory of its parent root domain, which must have been
//! provisioned beforehand.
//!
//! # Home Directory Layout
//!
//! ```text
//! /home/<rootDomain>/
//!   apps/<domain>/<repoName>/
//!   .ssh/<domainSafe>_<ownerSafe>_<repoSafe>[.pub]
//!   nginx/<domain>.conf
//!   logs/<domain>_error.log, <domain>_output.log
//!   pm.<domain>.config.json
//! ```
//!
//! Resolution is a pure function of the domain string and the configured home
//! root. Nothing here touches the file system.

use std::path::{Path, PathBuf};

/// Resolved identity of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    domain: String,
    parent_domain: Option<String>,
    owner_user: String,
    home_dir: PathBuf,
}

impl DeploymentTarget {
    /// Resolve domain into its owning user and directory layout.
    ///
    /// A domain is a subdomain if and only if it has more than two labels,
    /// and its first label is not "www". The parent domain is every label
    /// after the first.
    ///
    /// # Errors
    ///
    /// - Return [`ResolveError`] if domain fails label validation.
    pub fn resolve(domain: impl AsRef<str>, home_root: impl AsRef<Path>) -> Result<Self> {
        let domain = domain.as_ref();
        validate_domain(domain)?;

        let labels = domain.split('.').collect::<Vec<_>>();
        let (parent_domain, root_domain) = if labels.len() > 2 && labels[0] != "www" {
            let parent = labels[1..].join(".");
            (Some(parent.clone()), parent)
        } else {
            (None, domain.to_string())
        };

        // INVARIANT: Owner is always the first label of the root domain.
        let owner_user = root_domain
            .split('.')
            .next()
            .map(ToString::to_string)
            .unwrap_or_default();
        let home_dir = home_root.as_ref().join(&root_domain);

        Ok(Self {
            domain: domain.to_string(),
            parent_domain,
            owner_user,
            home_dir,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_subdomain(&self) -> bool {
        self.parent_domain.is_some()
    }

    pub fn parent_domain(&self) -> Option<&str> {
        self.parent_domain.as_deref()
    }

    /// Domain that owns the home directory.
    pub fn root_domain(&self) -> &str {
        self.parent_domain.as_deref().unwrap_or(&self.domain)
    }

    /// System user that owns every file of this deployment.
    pub fn owner_user(&self) -> &str {
        &self.owner_user
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// First label of the full domain, e.g., "blog" for `blog.example.com`.
    pub fn first_label(&self) -> &str {
        self.domain.split('.').next().unwrap_or(&self.domain)
    }

    /// Domain with dots replaced by underscores.
    pub fn domain_safe(&self) -> String {
        self.domain.replace('.', "_")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.home_dir.join("apps")
    }

    /// Directory holding every checkout of this domain.
    pub fn app_root(&self) -> PathBuf {
        self.apps_dir().join(&self.domain)
    }

    /// Final application directory for a given repository name.
    pub fn app_dir(&self, repo_name: impl AsRef<str>) -> PathBuf {
        self.app_root().join(repo_name.as_ref())
    }

    pub fn ssh_dir(&self) -> PathBuf {
        self.home_dir.join(".ssh")
    }

    /// Reverse-proxy configuration file of this domain.
    pub fn nginx_conf(&self) -> PathBuf {
        self.home_dir
            .join("nginx")
            .join(format!("{}.conf", self.domain))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn error_log(&self) -> PathBuf {
        self.logs_dir().join(format!("{}_error.log", self.domain))
    }

    pub fn output_log(&self) -> PathBuf {
        self.logs_dir().join(format!("{}_output.log", self.domain))
    }

    /// Process supervisor descriptor file.
    pub fn descriptor_path(&self) -> PathBuf {
        self.home_dir.join(format!("pm.{}.config.json", self.domain))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.home_dir.join("backups")
    }

    /// Public web root served for this domain.
    ///
    /// Root domains serve `public_html` directly, subdomains get their own
    /// directory inside of it.
    pub fn public_html(&self) -> PathBuf {
        let public_html = self.home_dir.join("public_html");
        if self.is_subdomain() {
            public_html.join(&self.domain)
        } else {
            public_html
        }
    }
}

/// Validate domain against strict label grammar.
///
/// Labels must be non-empty, contain only `[a-z0-9-]`, and must not start or
/// end with a hyphen. At least two labels are required.
///
/// # Errors
///
/// - Return [`ResolveError`] describing the first violation found.
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(ResolveError::Empty);
    }

    let labels = domain.split('.').collect::<Vec<_>>();
    for label in &labels {
        if label.is_empty() {
            return Err(ResolveError::EmptyLabel(domain.into()));
        }

        if let Some(bad) = label
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(ResolveError::InvalidCharacter {
                domain: domain.into(),
                character: bad,
            });
        }

        if label.starts_with('-') || label.ends_with('-') {
            return Err(ResolveError::HyphenBoundary {
                domain: domain.into(),
                label: label.to_string(),
            });
        }
    }

    if labels.len() < 2 {
        return Err(ResolveError::TooFewLabels(domain.into()));
    }

    Ok(())
}

/// Determine default absolute path to configuration file.
///
/// Uses `$XDG_CONFIG_HOME/sitemanager/config.toml`. Does not check if the path
/// returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf, NoWayHome> {
    dirs::config_dir()
        .map(|path| path.join("sitemanager").join("config.toml"))
        .ok_or(NoWayHome)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Domain validation failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("domain cannot be empty")]
    Empty,

    #[error("domain {0:?} contains an empty label")]
    EmptyLabel(String),

    #[error("domain {0:?} needs at least two labels")]
    TooFewLabels(String),

    #[error("domain {domain:?} contains invalid character {character:?}")]
    InvalidCharacter { domain: String, character: char },

    #[error("label {label:?} of domain {domain:?} cannot start or end with a hyphen")]
    HyphenBoundary { domain: String, label: String },
}

/// Friendly result alias :3
pub type Result<T, E = ResolveError> = std::result::Result<T, E>;
