// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Database provisioning.
//!
//! Idempotently ensure that a role and a database exist for a deployment. The
//! database is named after the domain with dots replaced by underscores, and
//! the role is named after the owning system user of the deployment.
//!
//! Provisioning is check-then-act: existing roles get their password reset
//! (or reused when asked to), and existing databases get privileges granted
//! instead of being recreated.
//!
//! An unreachable database server is not an error. It is reported as
//! [`Provisioning::Unavailable`] so callers can keep deploying without a
//! database, and tell the operator how to finish the job by hand.

use crate::{
    config::{DatabaseSettings, ServerSettings},
    detect::{DatabaseEngine, ProjectProfile},
    path::DeploymentTarget,
    system::{CommandRunner, Invocation, PrivilegeContext},
};

use rand::{distributions::Alphanumeric, Rng};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use url::Url;

/// Password written when provisioning fails, so ORM tooling has something to read.
pub const PLACEHOLDER_PASSWORD: &str = "dev_password_please_change";

/// Length of generated role passwords.
pub const PASSWORD_LENGTH: usize = 24;

/// Generate random alphanumeric secret.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Connection details of a provisioned database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredential {
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub schema: Option<String>,
}

impl DatabaseCredential {
    /// Credential skeleton for target, without a password.
    pub fn for_target(
        engine: DatabaseEngine,
        target: &DeploymentTarget,
        server: &ServerSettings,
        uses_orm: bool,
    ) -> Self {
        let user = match engine {
            DatabaseEngine::MySql => target.owner_user().replace('-', "_"),
            _ => target.owner_user().to_string(),
        };

        Self {
            engine,
            host: server.host.clone(),
            port: server.port,
            name: target.domain().replace('.', "_"),
            user,
            password: String::new(),
            schema: (uses_orm && engine == DatabaseEngine::PostgreSql).then(|| "public".into()),
        }
    }

    /// Build connection URL in the canonical scheme of the engine.
    pub fn url(&self) -> String {
        let scheme = match self.engine {
            DatabaseEngine::MySql => "mysql",
            DatabaseEngine::MongoDb => "mongodb",
            _ => "postgresql",
        };

        let mut url = format!(
            "{scheme}://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.name),
        );
        if let Some(schema) = &self.schema {
            url.push_str("?schema=");
            url.push_str(&urlencoding::encode(schema));
        }

        url
    }

    /// Parse connection URL back into its parts.
    ///
    /// # Errors
    ///
    /// - Return [`DatabaseError::InvalidUrl`] if the URL is malformed or names
    ///   an engine other than PostgreSQL or MySQL.
    pub fn parse_url(raw: &str) -> Result<Self> {
        let invalid = || DatabaseError::InvalidUrl(raw.into());
        let url = Url::parse(raw).map_err(|_| invalid())?;
        let (engine, default_port) = match url.scheme() {
            "postgresql" | "postgres" => (DatabaseEngine::PostgreSql, 5432),
            "mysql" => (DatabaseEngine::MySql, 3306),
            _ => return Err(invalid()),
        };

        let decode = |part: &str| {
            urlencoding::decode(part)
                .map(|part| part.into_owned())
                .map_err(|_| invalid())
        };

        let schema = url
            .query_pairs()
            .find(|(key, _)| key == "schema")
            .map(|(_, value)| value.into_owned());

        Ok(Self {
            engine,
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(default_port),
            name: decode(url.path().trim_start_matches('/'))?,
            user: decode(url.username())?,
            password: decode(url.password().unwrap_or_default())?,
            schema,
        })
    }

    /// Variables this credential contributes to the environment.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let connection = match self.engine {
            DatabaseEngine::MySql => "mysql",
            _ => "pgsql",
        };

        BTreeMap::from([
            ("DATABASE_URL".to_string(), self.url()),
            ("DB_CONNECTION".to_string(), connection.to_string()),
            ("DB_HOST".to_string(), self.host.clone()),
            ("DB_PORT".to_string(), self.port.to_string()),
            ("DB_DATABASE".to_string(), self.name.clone()),
            ("DB_USERNAME".to_string(), self.user.clone()),
            ("DB_PASSWORD".to_string(), self.password.clone()),
        ])
    }
}

/// What to do with the password of a role that already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPolicy {
    /// Generate a fresh password, resetting the existing one.
    Rotate,

    /// Keep using a known password.
    Reuse(String),
}

/// Outcome of a provisioning attempt that did not hard-fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioning {
    Ready(DatabaseCredential),

    /// Database server failed its readiness check.
    Unavailable { engine: DatabaseEngine, reason: String },

    /// Engine needs no provisioning, or cannot be provisioned here.
    Unsupported(DatabaseEngine),
}

/// Administrative operations of a database server.
pub trait EngineAdmin {
    /// Check that the server accepts connections.
    fn ready(&self) -> Result<()>;

    fn role_exists(&self, role: &str) -> Result<bool>;

    fn create_role(&self, role: &str, password: &str) -> Result<()>;

    fn reset_password(&self, role: &str, password: &str) -> Result<()>;

    fn database_exists(&self, name: &str) -> Result<bool>;

    fn create_database(&self, name: &str, owner: &str) -> Result<()>;

    fn grant_all(&self, name: &str, role: &str) -> Result<()>;
}

/// PostgreSQL administration through `psql` as the admin system user.
pub struct Postgres<'a, R: CommandRunner> {
    runner: &'a R,
    admin: &'a str,
}

impl<'a, R: CommandRunner> Postgres<'a, R> {
    pub fn new(runner: &'a R, server: &'a ServerSettings) -> Self {
        Self {
            runner,
            admin: &server.admin_user,
        }
    }

    fn query(&self, sql: &str) -> Result<String> {
        let output = self
            .runner
            .run_as(self.admin, Invocation::new("psql").args(["-tAc", sql]))?;
        Ok(output.stdout.trim().to_string())
    }

    fn execute(&self, sql: &str) -> Result<()> {
        self.runner
            .run_as(self.admin, Invocation::new("psql").args(["-c", sql]))?;
        Ok(())
    }
}

impl<R: CommandRunner> EngineAdmin for Postgres<'_, R> {
    fn ready(&self) -> Result<()> {
        self.runner
            .run_as(self.admin, Invocation::new("pg_isready"))?;
        Ok(())
    }

    fn role_exists(&self, role: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM pg_roles WHERE rolname={}", literal(role));
        Ok(self.query(&sql)? == "1")
    }

    fn create_role(&self, role: &str, password: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE USER {} WITH ENCRYPTED PASSWORD {};",
            pg_ident(role),
            literal(password)
        ))
    }

    fn reset_password(&self, role: &str, password: &str) -> Result<()> {
        self.execute(&format!(
            "ALTER USER {} WITH ENCRYPTED PASSWORD {};",
            pg_ident(role),
            literal(password)
        ))
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM pg_database WHERE datname={}", literal(name));
        Ok(self.query(&sql)? == "1")
    }

    fn create_database(&self, name: &str, owner: &str) -> Result<()> {
        self.execute(&format!(
            "CREATE DATABASE {} OWNER {};",
            pg_ident(name),
            pg_ident(owner)
        ))
    }

    fn grant_all(&self, name: &str, role: &str) -> Result<()> {
        self.execute(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {};",
            pg_ident(name),
            pg_ident(role)
        ))
    }
}

/// MySQL administration through the `mysql` client as the admin account.
pub struct MySql<'a, R: CommandRunner> {
    runner: &'a R,
    server: &'a ServerSettings,
}

impl<'a, R: CommandRunner> MySql<'a, R> {
    pub fn new(runner: &'a R, server: &'a ServerSettings) -> Self {
        Self { runner, server }
    }

    fn query(&self, sql: &str) -> Result<String> {
        let output = self.runner.run(
            &Invocation::new("mysql").args(["-u", self.server.admin_user.as_str(), "-N", "-B", "-e", sql]),
        )?;
        Ok(output.stdout.trim().to_string())
    }

    fn account(role: &str) -> String {
        format!("{}@'localhost'", literal(role))
    }
}

impl<R: CommandRunner> EngineAdmin for MySql<'_, R> {
    fn ready(&self) -> Result<()> {
        self.runner.run(
            &Invocation::new("mysqladmin").args(["-u", self.server.admin_user.as_str(), "ping"]),
        )?;
        Ok(())
    }

    fn role_exists(&self, role: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM mysql.user WHERE User={} AND Host='localhost'",
            literal(role)
        );
        Ok(self.query(&sql)? == "1")
    }

    fn create_role(&self, role: &str, password: &str) -> Result<()> {
        self.query(&format!(
            "CREATE USER {} IDENTIFIED BY {};",
            Self::account(role),
            literal(password)
        ))?;
        Ok(())
    }

    fn reset_password(&self, role: &str, password: &str) -> Result<()> {
        self.query(&format!(
            "ALTER USER {} IDENTIFIED BY {};",
            Self::account(role),
            literal(password)
        ))?;
        Ok(())
    }

    fn database_exists(&self, name: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME={}",
            literal(name)
        );
        Ok(self.query(&sql)? == "1")
    }

    fn create_database(&self, name: &str, owner: &str) -> Result<()> {
        let charset = self.server.charset.as_deref().unwrap_or("utf8mb4");
        let collation = self.server.collation.as_deref().unwrap_or("utf8mb4_unicode_ci");
        self.query(&format!(
            "CREATE DATABASE {} CHARACTER SET {charset} COLLATE {collation};",
            mysql_ident(name)
        ))?;
        self.grant_all(name, owner)
    }

    fn grant_all(&self, name: &str, role: &str) -> Result<()> {
        self.query(&format!(
            "GRANT ALL PRIVILEGES ON {}.* TO {}; FLUSH PRIVILEGES;",
            mysql_ident(name),
            Self::account(role)
        ))?;
        Ok(())
    }
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn mysql_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Provision databases for deployments.
pub struct Provisioner<'a, R: CommandRunner> {
    runner: &'a R,
    settings: &'a DatabaseSettings,
}

impl<'a, R: CommandRunner> Provisioner<'a, R> {
    pub fn new(runner: &'a R, settings: &'a DatabaseSettings) -> Self {
        Self { runner, settings }
    }

    /// Server settings for engine, if it is one we provision.
    pub fn server(&self, engine: DatabaseEngine) -> Option<&'a ServerSettings> {
        match engine {
            DatabaseEngine::PostgreSql => Some(&self.settings.postgresql),
            DatabaseEngine::MySql => Some(&self.settings.mysql),
            _ => None,
        }
    }

    /// Ensure role and database exist for target.
    ///
    /// # Errors
    ///
    /// - Return [`DatabaseError::Command`] if role or database creation fails.
    #[instrument(skip(self, profile, target, policy), level = "debug")]
    pub fn provision(
        &self,
        profile: &ProjectProfile,
        target: &DeploymentTarget,
        policy: &PasswordPolicy,
    ) -> Result<Provisioning> {
        let engine = profile.database_engine;
        let Some(server) = self.server(engine) else {
            info!("{engine} databases need no provisioning");
            return Ok(Provisioning::Unsupported(engine));
        };

        match engine {
            DatabaseEngine::PostgreSql => {
                self.provision_with(&Postgres::new(self.runner, server), profile, target, server, policy)
            }
            _ => self.provision_with(&MySql::new(self.runner, server), profile, target, server, policy),
        }
    }

    fn provision_with(
        &self,
        admin: &impl EngineAdmin,
        profile: &ProjectProfile,
        target: &DeploymentTarget,
        server: &ServerSettings,
        policy: &PasswordPolicy,
    ) -> Result<Provisioning> {
        let engine = profile.database_engine;
        if let Err(error) = admin.ready() {
            warn!("{engine} server is not ready: {error}");
            return Ok(Provisioning::Unavailable {
                engine,
                reason: error.to_string(),
            });
        }

        let mut credential = DatabaseCredential::for_target(engine, target, server, profile.has_orm);
        credential.password = match policy {
            PasswordPolicy::Reuse(password) => password.clone(),
            PasswordPolicy::Rotate => generate_password(PASSWORD_LENGTH),
        };

        if admin.role_exists(&credential.user)? {
            match policy {
                PasswordPolicy::Reuse(_) => {
                    info!("reuse {engine} role {} with its current password", credential.user)
                }
                PasswordPolicy::Rotate => {
                    info!("reuse {engine} role {}, resetting its password", credential.user);
                    admin.reset_password(&credential.user, &credential.password)?;
                }
            }
        } else {
            info!("create {engine} role {}", credential.user);
            admin.create_role(&credential.user, &credential.password)?;
        }

        if admin.database_exists(&credential.name)? {
            info!("reuse {engine} database {}", credential.name);
            admin.grant_all(&credential.name, &credential.user)?;
        } else {
            info!("create {engine} database {}", credential.name);
            admin.create_database(&credential.name, &credential.user)?;
        }

        Ok(Provisioning::Ready(credential))
    }
}

/// Placeholder credential written when provisioning could not finish.
pub fn placeholder(
    profile: &ProjectProfile,
    target: &DeploymentTarget,
    settings: &DatabaseSettings,
) -> Option<DatabaseCredential> {
    let server = match profile.database_engine {
        DatabaseEngine::PostgreSql => &settings.postgresql,
        DatabaseEngine::MySql => &settings.mysql,
        _ => return None,
    };

    let mut credential =
        DatabaseCredential::for_target(profile.database_engine, target, server, profile.has_orm);
    credential.password = PLACEHOLDER_PASSWORD.into();
    Some(credential)
}

/// Database provisioning error types.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("invalid database url {0:?}")]
    InvalidUrl(String),

    #[error(transparent)]
    Command(#[from] crate::system::CommandError),
}

/// Friendly result alias :3
pub type Result<T, E = DatabaseError> = std::result::Result<T, E>;
