// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Runtime detection.
//!
//! Inspect a checked-out project to classify it into a known runtime and
//! framework. Detection reads the manifest, lockfiles, ORM schema files, and
//! env files of the project, but never writes anything.
//!
//! # Detection Order
//!
//! Each category is decided independently, and the first match wins:
//!
//! 1. Framework: `@nestjs/core` > `next` > `express` > `react` > `vue` > `nuxt`.
//! 2. TypeScript: a `typescript` dependency, or a `tsconfig.json` file.
//! 3. Database: ORM schema provider > env `DATABASE_URL` scheme > driver
//!    dependency.
//! 4. Env file: `.env` takes precedence over `.env.example` as the source of
//!    example variables.

use crate::env::EnvFile;

use glob::glob;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Kind of application being deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Laravel,
    NodeJs,
}

impl AppKind {
    /// Guess application kind from marker files.
    ///
    /// An `artisan` file means Laravel, a `package.json` means Node.js.
    pub fn detect(app_dir: &Path) -> Option<Self> {
        if app_dir.join("artisan").is_file() {
            Some(Self::Laravel)
        } else if app_dir.join("package.json").is_file() {
            Some(Self::NodeJs)
        } else {
            None
        }
    }
}

impl FromStr for AppKind {
    type Err = DetectError;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind.to_ascii_lowercase().as_str() {
            "laravel" => Ok(Self::Laravel),
            "nodejs" | "node" => Ok(Self::NodeJs),
            _ => Err(DetectError::UnknownAppKind(kind.into())),
        }
    }
}

impl Display for AppKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Laravel => fmt.write_str("laravel"),
            Self::NodeJs => fmt.write_str("nodejs"),
        }
    }
}

/// Known web application frameworks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    #[default]
    Unknown,
    Express,
    NestJs,
    NextJs,
    React,
    Vue,
    Nuxt,
}

impl Framework {
    /// Signature packages in priority order.
    const SIGNATURES: [(&'static str, Framework); 6] = [
        ("@nestjs/core", Framework::NestJs),
        ("next", Framework::NextJs),
        ("express", Framework::Express),
        ("react", Framework::React),
        ("vue", Framework::Vue),
        ("nuxt", Framework::Nuxt),
    ];

    fn detect(manifest: &Manifest) -> Self {
        Self::SIGNATURES
            .iter()
            .find(|(package, _)| manifest.has_dependency(package))
            .map(|(_, framework)| *framework)
            .unwrap_or_default()
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Vue => 8080,
            _ => 3000,
        }
    }
}

impl Display for Framework {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Express => "express",
            Self::NestJs => "nestjs",
            Self::NextJs => "nextjs",
            Self::React => "react",
            Self::Vue => "vue",
            Self::Nuxt => "nuxt",
        };
        fmt.write_str(name)
    }
}

/// Database engines a project may require.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    #[default]
    None,
    PostgreSql,
    MySql,
    MongoDb,
    Sqlite,
}

impl DatabaseEngine {
    /// Engine named by an ORM schema provider string.
    pub fn from_provider(provider: &str) -> Self {
        match provider {
            "postgresql" | "postgres" => Self::PostgreSql,
            "mysql" => Self::MySql,
            "mongodb" => Self::MongoDb,
            "sqlite" => Self::Sqlite,
            _ => Self::None,
        }
    }

    /// Engine implied by the scheme of a connection URL.
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Self::PostgreSql
        } else if url.starts_with("mysql://") {
            Self::MySql
        } else if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
            Self::MongoDb
        } else if url.starts_with("file:") || url.starts_with("sqlite:") {
            Self::Sqlite
        } else {
            Self::None
        }
    }

    /// Engine implied by a driver package name.
    pub fn from_driver(package: &str) -> Self {
        match package {
            "pg" | "postgres" | "postgresql" => Self::PostgreSql,
            "mysql" | "mysql2" => Self::MySql,
            "sqlite" | "sqlite3" | "better-sqlite3" => Self::Sqlite,
            "mongodb" | "mongoose" => Self::MongoDb,
            _ => Self::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl FromStr for DatabaseEngine {
    type Err = DetectError;

    /// Parse engine name given by the operator.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Self::PostgreSql),
            "mysql" => Ok(Self::MySql),
            _ => Err(DetectError::UnknownEngine(name.into())),
        }
    }
}

impl Display for DatabaseEngine {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::None => "none",
            Self::PostgreSql => "postgresql",
            Self::MySql => "mysql",
            Self::MongoDb => "mongodb",
            Self::Sqlite => "sqlite",
        };
        fmt.write_str(name)
    }
}

/// Driver packages in the order they decide the database engine.
const DRIVER_PRIORITY: [&str; 10] = [
    "pg",
    "postgres",
    "postgresql",
    "mysql",
    "mysql2",
    "sqlite",
    "sqlite3",
    "better-sqlite3",
    "mongodb",
    "mongoose",
];

/// Subset of `package.json` that detection cares about.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub main: Option<String>,
    pub scripts: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, serde_json::Value>,

    #[serde(rename = "devDependencies")]
    pub dev_dependencies: BTreeMap<String, serde_json::Value>,

    pub prisma: Option<PrismaSettings>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct PrismaSettings {
    pub schema: Option<String>,
}

impl Manifest {
    pub fn has_dependency(&self, package: &str) -> bool {
        self.dependencies.contains_key(package) || self.dev_dependencies.contains_key(package)
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }

    /// Engine of the highest priority driver the manifest depends on.
    fn driver_engine(&self) -> DatabaseEngine {
        DRIVER_PRIORITY
            .iter()
            .find(|driver| self.has_dependency(driver))
            .map(|driver| DatabaseEngine::from_driver(driver))
            .unwrap_or_default()
    }
}

impl FromStr for Manifest {
    type Err = serde_json::Error;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(data)
    }
}

/// Everything downstream components need to know about a project.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProjectProfile {
    pub framework: Framework,
    pub uses_typescript: bool,
    pub has_orm: bool,
    pub default_port: u16,
    pub requires_env_file: bool,
    pub requires_database: bool,
    pub database_engine: DatabaseEngine,

    /// Variables read from `.env` or `.env.example`.
    pub example_env: BTreeMap<String, String>,

    pub main_file: Option<String>,
    pub has_start_script: bool,
    pub has_build_script: bool,
    pub has_lockfile: bool,
    pub has_migrations: bool,
}

impl ProjectProfile {
    /// Force database engine chosen by the operator.
    pub fn force_engine(&mut self, engine: DatabaseEngine) {
        self.database_engine = engine;
        self.requires_database = !engine.is_none();
    }

    /// Command that starts the application in production.
    ///
    /// A Next.js start command carries the port as a flag, since its start
    /// script ignores the `PORT` variable.
    pub fn start_command(&self, port: u16) -> String {
        let entry = self.main_file.as_deref().unwrap_or("index.js");
        match self.framework {
            Framework::NextJs if self.has_start_script => format!("npm run start -- -p {port}"),
            Framework::NextJs => format!("npx next start -p {port}"),
            _ if self.has_start_script => "npm run start".into(),
            Framework::NestJs if self.uses_typescript => "node dist/src/main.js".into(),
            Framework::NestJs => "node src/main.js".into(),
            Framework::React => "serve -s build".into(),
            Framework::Vue => "serve -s dist".into(),
            Framework::Nuxt => "node .output/server/index.mjs".into(),
            Framework::Express | Framework::Unknown => format!("node {entry}"),
        }
    }

    /// Command that builds the application, if it needs building.
    pub fn build_command(&self) -> Option<String> {
        if self.has_build_script {
            return Some("npm run build".into());
        }

        match self.framework {
            Framework::NestJs if self.uses_typescript => Some("npm run build".into()),
            Framework::NextJs => Some("npm run build".into()),
            Framework::React => Some("npx react-scripts build".into()),
            _ => None,
        }
    }

    /// Framework implies an env file is needed regardless of what the project ships.
    fn framework_requires_env(&self) -> bool {
        matches!(
            self.framework,
            Framework::NestJs | Framework::NextJs | Framework::Express
        )
    }
}

/// Inspect project at app_dir.
///
/// # Errors
///
/// - Return [`DetectError::MissingManifest`] if no `package.json` exists.
/// - Return [`DetectError::Manifest`] if `package.json` is malformed.
#[instrument(skip(app_dir), level = "debug")]
pub fn detect(app_dir: impl AsRef<Path>) -> Result<ProjectProfile> {
    let app_dir = app_dir.as_ref();
    let manifest_path = app_dir.join("package.json");
    if !manifest_path.is_file() {
        return Err(DetectError::MissingManifest(app_dir.to_path_buf()));
    }

    let manifest: Manifest = read_to_string(&manifest_path)
        .map_err(|err| DetectError::Io {
            source: err,
            path: manifest_path.clone(),
        })?
        .parse()
        .map_err(|err| DetectError::Manifest {
            source: err,
            path: manifest_path.clone(),
        })?;

    let framework = Framework::detect(&manifest);
    let mut profile = ProjectProfile {
        framework,
        uses_typescript: manifest.has_dependency("typescript")
            || app_dir.join("tsconfig.json").is_file(),
        default_port: framework.default_port(),
        main_file: manifest.main.clone(),
        has_start_script: manifest.has_script("start"),
        has_build_script: manifest.has_script("build"),
        has_lockfile: app_dir.join("package-lock.json").is_file()
            || app_dir.join("npm-shrinkwrap.json").is_file(),
        has_migrations: app_dir.join("prisma").join("migrations").is_dir(),
        ..Default::default()
    };

    // INVARIANT: ORM presence alone means a database is required.
    if manifest.dependencies.contains_key("@prisma/client")
        || manifest.dev_dependencies.contains_key("prisma")
    {
        profile.has_orm = true;
        profile.requires_database = true;
    }

    let schema_engine = schema_files(app_dir, &manifest)
        .iter()
        .filter_map(|path| read_to_string(path).ok())
        .filter_map(|schema| schema_provider(&schema))
        .map(|provider| DatabaseEngine::from_provider(&provider))
        .find(|engine| !engine.is_none());

    profile.database_engine = match schema_engine {
        Some(engine) => engine,
        None => {
            let url_engine = env_database_engine(app_dir);
            if url_engine.is_none() {
                manifest.driver_engine()
            } else {
                url_engine
            }
        }
    };
    if !profile.database_engine.is_none() {
        profile.requires_database = true;
    }

    let env_path = app_dir.join(".env");
    let example_path = app_dir.join(".env.example");
    let source = [&env_path, &example_path]
        .into_iter()
        .find(|path| path.is_file());
    if let Some(source) = source {
        let contents = read_to_string(source).map_err(|err| DetectError::Io {
            source: err,
            path: source.clone(),
        })?;
        profile.example_env = EnvFile::parse(&contents).into_map();
    }
    profile.requires_env_file = profile.framework_requires_env() || source.is_some();

    debug!("detected {profile:?}");
    Ok(profile)
}

fn schema_files(app_dir: &Path, manifest: &Manifest) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(custom) = manifest.prisma.as_ref().and_then(|p| p.schema.as_deref()) {
        files.push(app_dir.join(custom));
    }

    for pattern in ["prisma/schema.prisma", "prisma/schema/*.prisma", "schema.prisma"] {
        let pattern = app_dir.join(pattern);
        if let Ok(paths) = glob(&pattern.to_string_lossy()) {
            files.extend(paths.flatten());
        }
    }

    files.into_iter().filter(|path| path.is_file()).collect()
}

/// Extract `provider` of the `datasource` block of a Prisma-like schema.
pub fn schema_provider(schema: &str) -> Option<String> {
    let mut in_datasource = false;
    for line in schema.lines() {
        let line = line.split("//").next().unwrap_or_default().trim();
        if line.starts_with("datasource") && line.ends_with('{') {
            in_datasource = true;
            continue;
        }

        if in_datasource {
            if line.starts_with('}') {
                in_datasource = false;
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "provider" {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
    }

    None
}

fn env_database_engine(app_dir: &Path) -> DatabaseEngine {
    [".env.example", ".env"]
        .iter()
        .filter_map(|name| read_to_string(app_dir.join(name)).ok())
        .find_map(|contents| EnvFile::parse(&contents).get("DATABASE_URL").map(str::to_string))
        .map(|url| DatabaseEngine::from_url(&url))
        .unwrap_or_default()
}

/// Detection error types.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("no package.json found in {:?}", .0.display())]
    MissingManifest(PathBuf),

    #[error("failed to parse manifest {:?}", path.display())]
    Manifest {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },

    #[error("failed to read {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("unknown database engine {0:?}, expected postgresql or mysql")]
    UnknownEngine(String),

    #[error("unknown application type {0:?}, expected laravel or nodejs")]
    UnknownAppKind(String),
}

/// Friendly result alias :3
pub type Result<T, E = DetectError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::{create_dir_all, write};
    use tempfile::TempDir;

    fn project(files: &[(&str, &str)]) -> anyhow::Result<TempDir> {
        let dir = tempfile::tempdir()?;
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }
            write(path, contents)?;
        }
        Ok(dir)
    }

    #[test]
    fn detect_requires_manifest() -> anyhow::Result<()> {
        let dir = project(&[("README.md", "hi")])?;
        assert!(matches!(detect(dir.path()), Err(DetectError::MissingManifest(_))));
        Ok(())
    }

    #[test_case(r#"{"dependencies":{"@nestjs/core":"^10","react":"^18"}}"#, Framework::NestJs; "nestjs beats react")]
    #[test_case(r#"{"dependencies":{"next":"14","react":"^18"}}"#, Framework::NextJs; "next beats react")]
    #[test_case(r#"{"dependencies":{"express":"4","vue":"3"}}"#, Framework::Express; "express beats vue")]
    #[test_case(r#"{"devDependencies":{"vue":"3"}}"#, Framework::Vue; "dev dependency")]
    #[test_case(r#"{"dependencies":{"nuxt":"3"}}"#, Framework::Nuxt; "nuxt")]
    #[test_case(r#"{"dependencies":{"lodash":"4"}}"#, Framework::Unknown; "unknown")]
    #[test]
    fn detect_framework_priority(manifest: &str, expect: Framework) -> anyhow::Result<()> {
        let dir = project(&[("package.json", manifest)])?;
        pretty_assertions::assert_eq!(detect(dir.path())?.framework, expect);
        Ok(())
    }

    #[test]
    fn detect_nextjs_defaults() -> anyhow::Result<()> {
        let dir = project(&[("package.json", r#"{"dependencies":{"next":"14"}}"#)])?;
        let profile = detect(dir.path())?;
        assert_eq!(profile.framework, Framework::NextJs);
        assert_eq!(profile.default_port, 3000);
        assert!(profile.requires_env_file);
        assert!(!profile.requires_database);
        Ok(())
    }

    #[test]
    fn detect_engine_from_schema_provider() -> anyhow::Result<()> {
        let schema = indoc! {r#"
            generator client {
              provider = "prisma-client-js"
            }

            datasource db {
              provider = "mysql" // managed elsewhere
              url      = env("DATABASE_URL")
            }
        "#};
        let dir = project(&[
            ("package.json", r#"{"dependencies":{"@prisma/client":"5","pg":"8"}}"#),
            ("prisma/schema.prisma", schema),
            (".env.example", "DATABASE_URL=postgresql://u:p@h:5432/d\n"),
        ])?;

        let profile = detect(dir.path())?;
        assert!(profile.has_orm);
        assert!(profile.requires_database);
        assert_eq!(profile.database_engine, DatabaseEngine::MySql);
        Ok(())
    }

    #[test]
    fn detect_engine_from_env_url_without_orm() -> anyhow::Result<()> {
        let dir = project(&[
            ("package.json", r#"{"dependencies":{"express":"4"}}"#),
            (".env.example", "DATABASE_URL=postgresql://u:p@h:5432/d\n"),
        ])?;

        let profile = detect(dir.path())?;
        assert!(!profile.has_orm);
        assert!(profile.requires_database);
        assert_eq!(profile.database_engine, DatabaseEngine::PostgreSql);
        Ok(())
    }

    #[test_case(r#"{"dependencies":{"mysql2":"3"}}"#, DatabaseEngine::MySql; "mysql2")]
    #[test_case(r#"{"dependencies":{"mysql2":"3","pg":"8"}}"#, DatabaseEngine::PostgreSql; "pg beats mysql2")]
    #[test_case(r#"{"dependencies":{"mongoose":"8","sqlite3":"5"}}"#, DatabaseEngine::Sqlite; "sqlite3 beats mongoose")]
    #[test_case(r#"{"dependencies":{"mysql":"2"},"devDependencies":{"pg":"8"}}"#, DatabaseEngine::PostgreSql; "priority spans dev dependencies")]
    #[test]
    fn detect_engine_from_driver_dependency(manifest: &str, expect: DatabaseEngine) -> anyhow::Result<()> {
        let dir = project(&[("package.json", manifest)])?;
        let profile = detect(dir.path())?;
        assert!(profile.requires_database);
        pretty_assertions::assert_eq!(profile.database_engine, expect);
        Ok(())
    }

    #[test]
    fn detect_prefers_actual_env_over_example() -> anyhow::Result<()> {
        let dir = project(&[
            ("package.json", r#"{"dependencies":{}}"#),
            (".env.example", "API_KEY=example\n"),
            (".env", "# comment\n\nAPI_KEY=\"actual\"\nLOG_LEVEL='debug'\n"),
        ])?;

        let profile = detect(dir.path())?;
        assert!(profile.requires_env_file);
        assert_eq!(
            profile.example_env,
            BTreeMap::from([
                ("API_KEY".to_string(), "actual".to_string()),
                ("LOG_LEVEL".to_string(), "debug".to_string()),
            ])
        );
        Ok(())
    }

    #[test]
    fn detect_typescript_from_tsconfig() -> anyhow::Result<()> {
        let dir = project(&[
            ("package.json", r#"{"dependencies":{"@nestjs/core":"10"}}"#),
            ("tsconfig.json", "{}"),
        ])?;
        let profile = detect(dir.path())?;
        assert!(profile.uses_typescript);
        assert_eq!(profile.start_command(3100), "node dist/src/main.js");
        assert_eq!(profile.build_command().as_deref(), Some("npm run build"));
        Ok(())
    }

    #[test_case(Framework::NestJs, true, true, "npm run start"; "nest start script wins")]
    #[test_case(Framework::NextJs, true, false, "npm run start -- -p 3456"; "next embeds port")]
    #[test_case(Framework::NextJs, false, false, "npx next start -p 3456"; "next without script")]
    #[test_case(Framework::Express, false, false, "node server.js"; "express main file")]
    #[test_case(Framework::React, false, false, "serve -s build"; "react static")]
    #[test]
    fn start_command_by_framework(framework: Framework, start: bool, ts: bool, expect: &str) {
        let profile = ProjectProfile {
            framework,
            has_start_script: start,
            uses_typescript: ts,
            main_file: Some("server.js".into()),
            ..Default::default()
        };
        pretty_assertions::assert_eq!(profile.start_command(3456), expect);
    }

    #[test_case("postgresql", DatabaseEngine::PostgreSql; "full name")]
    #[test_case("postgres", DatabaseEngine::PostgreSql; "short name")]
    #[test_case("PG", DatabaseEngine::PostgreSql; "abbreviation")]
    #[test_case("mysql", DatabaseEngine::MySql; "mysql")]
    #[test]
    fn parse_operator_engine(name: &str, expect: DatabaseEngine) {
        pretty_assertions::assert_eq!(name.parse::<DatabaseEngine>().unwrap(), expect);
    }

    #[test]
    fn app_kind_from_marker_files() -> anyhow::Result<()> {
        let laravel = project(&[("artisan", ""), ("package.json", "{}")])?;
        let node = project(&[("package.json", "{}")])?;
        let empty = project(&[])?;
        assert_eq!(AppKind::detect(laravel.path()), Some(AppKind::Laravel));
        assert_eq!(AppKind::detect(node.path()), Some(AppKind::NodeJs));
        assert_eq!(AppKind::detect(empty.path()), None);
        Ok(())
    }
}
