// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Environment synthesis.
//!
//! Merge every source of environment variables into one deterministic `.env`
//! file for a deployment.
//!
//! # Merge Precedence
//!
//! From lowest to highest, a later layer wins on key collision:
//!
//! 1. `.env.example` defaults.
//! 2. Values of the pre-existing `.env`.
//! 3. Database provisioning output.
//! 4. Framework-derived values, e.g., `NODE_ENV`, `PORT`, `JWT_SECRET`.
//! 5. Operator overrides from the command line, or interactive editing.
//!
//! # Output Layout
//!
//! Keys are grouped into sections in a fixed order: database keys first, then
//! the public configuration block of Next.js-like frameworks, then every other
//! key sorted lexicographically. Rendering the same map twice always produces
//! byte-identical output.

use crate::{
    database::generate_password,
    detect::{Framework, ProjectProfile},
    path::DeploymentTarget,
    prompt::PromptSource,
    system::{CommandRunner, Invocation},
};

use std::{
    collections::BTreeMap,
    fs::{read_to_string, set_permissions, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

const HEADER: &str = "# Archivo generado por SiteManager";
const DATABASE_SECTION: &str = "# Configuración de base de datos";
const NEXTJS_SECTION: &str = "# Configuración de NextJS";
const OTHER_SECTION: &str = "# Otras configuraciones";

/// Keys rendered in the database section, in order.
pub const DATABASE_KEYS: [&str; 7] = [
    "DATABASE_URL",
    "DB_CONNECTION",
    "DB_HOST",
    "DB_PORT",
    "DB_DATABASE",
    "DB_USERNAME",
    "DB_PASSWORD",
];

/// Keys rendered in the Next.js public configuration section, in order.
pub const NEXTJS_KEYS: [&str; 5] = [
    "NEXT_PUBLIC_API_URL",
    "NEXT_PUBLIC_IMAGE_DOMAINS",
    "NEXT_PUBLIC_IMAGES_URL",
    "NEXT_PUBLIC_PWA_ENABLED",
    "NEXT_PUBLIC_BODY_SIZE_LIMIT",
];

/// Keys offered during interactive editing when no example file exists.
pub const FALLBACK_KEYS: [&str; 5] = ["NODE_ENV", "PORT", "DATABASE_URL", "JWT_SECRET", "JWT_EXPIRES_IN"];

/// Parsed env file.
///
/// Keeps entries in file order. A repeated key keeps its last value at the
/// position of its first occurrence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvFile {
    entries: Vec<(String, String)>,
}

impl EnvFile {
    /// Parse env file contents.
    ///
    /// Blank lines, comment lines, and lines without `=` are skipped. An
    /// `export ` prefix is allowed. Double-quoted values are unescaped,
    /// single-quoted values are taken literally, and unquoted values lose any
    /// trailing ` #` comment.
    pub fn parse(contents: &str) -> Self {
        let mut file = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                continue;
            }

            file.insert(key, parse_value(value.trim()));
        }

        file
    }

    /// Read and parse env file at path, if it exists.
    ///
    /// # Errors
    ///
    /// - Return [`EnvError::Io`] if the file exists but cannot be read.
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(None);
        }

        let contents = read_to_string(path).map_err(|err| EnvError::Io {
            source: err,
            path: path.to_path_buf(),
        })?;
        Ok(Some(Self::parse(&contents)))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.entries.into_iter().collect()
    }
}

fn parse_value(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = rest.chars();
        while let Some(c) = chars.next() {
            match c {
                '"' => return value,
                '\\' => match chars.next() {
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some('t') => value.push('\t'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                },
                c => value.push(c),
            }
        }

        // INVARIANT: Unterminated quotes are taken literally.
        return raw.to_string();
    }

    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_string();
    }

    match raw.find(" #").or_else(|| raw.find("\t#")) {
        Some(index) => raw[..index].trim_end().to_string(),
        None => raw.to_string(),
    }
}

/// Render value, quoting it if it contains whitespace, `#`, quotes or newlines.
pub fn format_value(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\''));
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str(r"\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str(r"\n"),
            '\r' => quoted.push_str(r"\r"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Render variables into sectioned env file contents.
pub fn render(vars: &BTreeMap<String, String>) -> String {
    let mut rest = vars.clone();
    let mut out = String::new();
    out.push_str(HEADER);
    out.push_str("\n\n");

    out.push_str(DATABASE_SECTION);
    out.push('\n');
    for key in DATABASE_KEYS {
        if let Some(value) = rest.remove(key) {
            push_line(&mut out, key, &value);
        }
    }
    out.push('\n');

    let nextjs = NEXTJS_KEYS
        .iter()
        .filter_map(|key| rest.remove(*key).map(|value| (*key, value)))
        .collect::<Vec<_>>();
    if !nextjs.is_empty() {
        out.push_str(NEXTJS_SECTION);
        out.push('\n');
        for (key, value) in nextjs {
            push_line(&mut out, key, &value);
        }
        out.push('\n');
    }

    // INVARIANT: BTreeMap iteration keeps remaining keys sorted.
    out.push_str(OTHER_SECTION);
    out.push('\n');
    for (key, value) in &rest {
        push_line(&mut out, key, value);
    }

    out
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(&format_value(value));
    out.push('\n');
}

/// Check if key names a value that should not be echoed.
pub fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["password", "secret", "key"]
        .iter()
        .any(|word| key.contains(word))
}

/// Mask value of sensitive key for display.
pub fn mask(key: &str, value: &str) -> String {
    if is_sensitive(key) && !value.is_empty() {
        "********".into()
    } else {
        value.to_string()
    }
}

/// Every source of variables for one synthesis, from lowest to highest precedence.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvLayers {
    pub example: BTreeMap<String, String>,
    pub existing: BTreeMap<String, String>,
    pub database: BTreeMap<String, String>,
    pub framework: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, String>,
}

impl EnvLayers {
    /// Load example and existing layers from application directory.
    ///
    /// # Errors
    ///
    /// - Return [`EnvError::Io`] if an env file exists but cannot be read.
    pub fn load(app_dir: &Path) -> Result<Self> {
        let example = EnvFile::read(app_dir.join(".env.example"))?.unwrap_or_default();
        let existing = EnvFile::read(app_dir.join(".env"))?.unwrap_or_default();
        Ok(Self {
            example: example.into_map(),
            existing: existing.into_map(),
            ..Default::default()
        })
    }

    /// Merge every layer, higher precedence winning on collision.
    pub fn merge(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for layer in [
            &self.example,
            &self.existing,
            &self.database,
            &self.framework,
            &self.overrides,
        ] {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    /// Keys offered during interactive editing.
    fn prompt_keys(&self) -> Vec<String> {
        if self.example.is_empty() {
            FALLBACK_KEYS.iter().map(ToString::to_string).collect()
        } else {
            self.example.keys().cloned().collect()
        }
    }
}

/// Framework-derived values for a deployment listening on port.
///
/// Secrets already present in `existing` are reused so repeated runs keep
/// sessions valid.
pub fn framework_defaults(
    profile: &ProjectProfile,
    target: &DeploymentTarget,
    port: u16,
    existing: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("NODE_ENV".to_string(), "production".to_string());
    vars.insert("PORT".to_string(), port.to_string());

    match profile.framework {
        Framework::NestJs => {
            if profile.example_env.contains_key("JWT_SECRET") {
                let secret = existing
                    .get("JWT_SECRET")
                    .filter(|secret| !secret.is_empty())
                    .cloned()
                    .unwrap_or_else(|| generate_password(48));
                vars.insert("JWT_SECRET".into(), secret);
            }
            if profile.example_env.contains_key("JWT_EXPIRES_IN") {
                vars.insert("JWT_EXPIRES_IN".into(), "7d".into());
            }
        }
        Framework::NextJs => {
            if profile.example_env.contains_key("NEXT_PUBLIC_API_URL") {
                vars.insert(
                    "NEXT_PUBLIC_API_URL".into(),
                    format!("https://api.{}", target.root_domain()),
                );
            }
            for key in [
                "NEXT_PUBLIC_IMAGE_DOMAINS",
                "NEXT_PUBLIC_IMAGES_URL",
                "NEXT_PUBLIC_BODY_SIZE_LIMIT",
            ] {
                if let Some(value) = profile.example_env.get(key) {
                    vars.insert(key.into(), value.clone());
                }
            }
            vars.insert("NEXT_PUBLIC_PWA_ENABLED".into(), "true".into());
        }
        _ => {}
    }

    vars
}

/// Parse `KEY=VALUE` override given on the command line.
///
/// # Errors
///
/// - Return [`EnvError::InvalidOverride`] if there is no `=` or the key is empty.
pub fn parse_override(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(EnvError::InvalidOverride(raw.into())),
    }
}

/// Write `.env` files for deployments.
pub struct Synthesizer<'a, R, P>
where
    R: CommandRunner,
    P: PromptSource,
{
    runner: &'a R,
    prompt: &'a P,
}

impl<'a, R, P> Synthesizer<'a, R, P>
where
    R: CommandRunner,
    P: PromptSource,
{
    pub fn new(runner: &'a R, prompt: &'a P) -> Self {
        Self { runner, prompt }
    }

    /// Merge layers, optionally edit them interactively, and write `.env`.
    ///
    /// The written file is owned by the owning user of target with mode 0600.
    ///
    /// # Errors
    ///
    /// - Return [`EnvError::Io`] if the file cannot be written.
    /// - Return [`EnvError::Command`] if ownership cannot be changed.
    /// - Return [`EnvError::Prompt`] if interactive editing fails.
    #[instrument(skip(self, target, app_dir, layers), level = "debug")]
    pub fn synthesize(
        &self,
        target: &DeploymentTarget,
        app_dir: &Path,
        layers: &EnvLayers,
        interactive: bool,
    ) -> Result<PathBuf> {
        let mut vars = layers.merge();
        if interactive {
            self.edit(&mut vars, &layers.prompt_keys())?;
        }

        let path = app_dir.join(".env");
        info!("write {} ({} variables)", path.display(), vars.len());
        for (key, value) in &vars {
            debug!("{key}={}", mask(key, value));
        }

        write_private(&path, render(&vars).as_bytes())?;
        let owner = target.owner_user();
        self.runner.run(&Invocation::chown(owner, &path))?;

        Ok(path)
    }

    /// Prompt for each key, then for extra pairs until an empty key is given.
    ///
    /// # Errors
    ///
    /// - Return [`EnvError::Prompt`] if input cannot be obtained.
    pub fn edit(&self, vars: &mut BTreeMap<String, String>, keys: &[String]) -> Result<()> {
        for key in keys {
            let current = vars.get(key).map(String::as_str);
            let value = if is_sensitive(key) {
                self.prompt.secret(key, current)?
            } else {
                self.prompt.text(key, current)?
            };
            vars.insert(key.clone(), value);
        }

        loop {
            let key = self
                .prompt
                .text("Additional variable name (empty to finish)", None)?;
            let key = key.trim();
            if key.is_empty() {
                break;
            }

            let value = if is_sensitive(key) {
                self.prompt.secret(key, None)?
            } else {
                self.prompt.text(key, None)?
            };
            vars.insert(key.to_string(), value);
        }

        Ok(())
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let io_error = |err| EnvError::Io {
        source: err,
        path: path.to_path_buf(),
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_error)?;
    file.write_all(contents).map_err(io_error)?;

    // INVARIANT: Pre-existing files keep their old mode unless reset.
    set_permissions(path, Permissions::from_mode(0o600)).map_err(io_error)?;

    Ok(())
}

/// Environment synthesis error types.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("failed to access env file {:?}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("invalid variable {0:?}, expected KEY=VALUE")]
    InvalidOverride(String),

    #[error(transparent)]
    Command(#[from] crate::system::CommandError),

    #[error(transparent)]
    Prompt(#[from] crate::prompt::PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = EnvError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        prompt::{NonInteractive, ScriptedPrompt},
        system::ScriptedRunner,
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::metadata;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_env_file() {
        let file = EnvFile::parse(indoc! {r#"
            # leading comment
            export NODE_ENV=production

            GREETING="hello \"world\"\nbye"
            LITERAL='a # b'
            TRAILING=value # comment
            EMPTY=
            not a pair
            NODE_ENV=staging
        "#});

        assert_eq!(
            file.iter().collect::<Vec<_>>(),
            vec![
                ("NODE_ENV", "staging"),
                ("GREETING", "hello \"world\"\nbye"),
                ("LITERAL", "a # b"),
                ("TRAILING", "value"),
                ("EMPTY", ""),
            ]
        );
    }

    #[test_case("simple", "simple"; "plain")]
    #[test_case("hello world", "\"hello world\""; "whitespace")]
    #[test_case("a#b", "\"a#b\""; "hash")]
    #[test_case("say \"hi\"", "\"say \\\"hi\\\"\""; "double quotes")]
    #[test_case("two\nlines", "\"two\\nlines\""; "newline")]
    #[test_case("", ""; "empty")]
    #[test]
    fn format_value_quoting(value: &str, expect: &str) {
        pretty_assertions::assert_eq!(format_value(value), expect);
    }

    #[test]
    fn quoted_values_survive_reparse() {
        let original = vars(&[("A", "x \"y\" # z\nw"), ("B", "back\\slash here")]);
        let reparsed = EnvFile::parse(&render(&original)).into_map();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn render_groups_sections() {
        let rendered = render(&vars(&[
            ("PORT", "3005"),
            ("DB_PASSWORD", "pw"),
            ("NEXT_PUBLIC_PWA_ENABLED", "true"),
            ("DATABASE_URL", "postgresql://u:pw@localhost:5432/d"),
            ("APP_NAME", "my shop"),
        ]));

        assert_eq!(
            rendered,
            indoc! {r#"
                # Archivo generado por SiteManager

                # Configuración de base de datos
                DATABASE_URL=postgresql://u:pw@localhost:5432/d
                DB_PASSWORD=pw

                # Configuración de NextJS
                NEXT_PUBLIC_PWA_ENABLED=true

                # Otras configuraciones
                APP_NAME="my shop"
                PORT=3005
            "#}
        );
    }

    #[test]
    fn render_is_deterministic() {
        let input = vars(&[("Z", "1"), ("A", "2"), ("DB_HOST", "localhost")]);
        assert_eq!(render(&input), render(&input.clone()));
    }

    #[test]
    fn merge_respects_precedence() {
        let layers = EnvLayers {
            example: vars(&[("PORT", "3000"), ("DATABASE_URL", "example"), ("A", "example")]),
            existing: vars(&[("DATABASE_URL", "existing"), ("B", "existing")]),
            database: vars(&[("DATABASE_URL", "database")]),
            framework: vars(&[("PORT", "3111")]),
            overrides: vars(&[("PORT", "4000")]),
        };

        assert_eq!(
            layers.merge(),
            vars(&[
                ("A", "example"),
                ("B", "existing"),
                ("DATABASE_URL", "database"),
                ("PORT", "4000"),
            ])
        );
    }

    #[test_case("DB_PASSWORD", true; "password")]
    #[test_case("jwt_secret", true; "secret lowercase")]
    #[test_case("STRIPE_API_KEY", true; "key")]
    #[test_case("NODE_ENV", false; "plain")]
    #[test]
    fn sensitive_keys(key: &str, expect: bool) {
        pretty_assertions::assert_eq!(is_sensitive(key), expect);
    }

    #[test]
    fn framework_defaults_for_nestjs_reuse_secret() -> anyhow::Result<()> {
        let target = DeploymentTarget::resolve("api.example.com", "/home")?;
        let profile = ProjectProfile {
            framework: Framework::NestJs,
            example_env: vars(&[("JWT_SECRET", "changeme"), ("JWT_EXPIRES_IN", "1d")]),
            ..Default::default()
        };

        let fresh = framework_defaults(&profile, &target, 3200, &BTreeMap::new());
        assert_eq!(fresh["NODE_ENV"], "production");
        assert_eq!(fresh["PORT"], "3200");
        assert_eq!(fresh["JWT_EXPIRES_IN"], "7d");
        assert_eq!(fresh["JWT_SECRET"].len(), 48);

        let reused = framework_defaults(&profile, &target, 3200, &vars(&[("JWT_SECRET", "kept")]));
        assert_eq!(reused["JWT_SECRET"], "kept");
        Ok(())
    }

    #[test]
    fn framework_defaults_for_nextjs_point_at_parent_api() -> anyhow::Result<()> {
        let target = DeploymentTarget::resolve("shop.example.com", "/home")?;
        let profile = ProjectProfile {
            framework: Framework::NextJs,
            example_env: vars(&[
                ("NEXT_PUBLIC_API_URL", "http://localhost:4000"),
                ("NEXT_PUBLIC_IMAGES_URL", "https://cdn.example.com"),
            ]),
            ..Default::default()
        };

        let defaults = framework_defaults(&profile, &target, 3300, &BTreeMap::new());
        assert_eq!(
            defaults,
            vars(&[
                ("NEXT_PUBLIC_API_URL", "https://api.example.com"),
                ("NEXT_PUBLIC_IMAGES_URL", "https://cdn.example.com"),
                ("NEXT_PUBLIC_PWA_ENABLED", "true"),
                ("NODE_ENV", "production"),
                ("PORT", "3300"),
            ])
        );
        Ok(())
    }

    #[test]
    fn synthesize_writes_private_file_and_chowns() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = DeploymentTarget::resolve("example.com", root.path())?;
        let app_dir = root.path().join("app");
        std::fs::create_dir_all(&app_dir)?;

        let layers = EnvLayers {
            overrides: vars(&[("KEY", "hello world"), ("OTHER", "simple")]),
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        let synthesizer = Synthesizer::new(&runner, &NonInteractive);

        let path = synthesizer.synthesize(&target, &app_dir, &layers, false)?;
        let first = read_to_string(&path)?;
        synthesizer.synthesize(&target, &app_dir, &layers, false)?;
        let second = read_to_string(&path)?;

        assert_eq!(first, second);
        assert!(first.contains("KEY=\"hello world\"\n"));
        assert!(first.contains("OTHER=simple\n"));
        assert_eq!(metadata(&path)?.permissions().mode() & 0o777, 0o600);
        assert!(runner.called(&format!("chown example:example {}", path.display())));
        Ok(())
    }

    #[test]
    fn edit_prompts_example_keys_then_extras() -> anyhow::Result<()> {
        let runner = ScriptedRunner::new();
        let prompt = ScriptedPrompt::new(["", "topsecret", "EXTRA", "1", ""]);
        let synthesizer = Synthesizer::new(&runner, &prompt);

        let mut current = vars(&[("NODE_ENV", "production"), ("JWT_SECRET", "old")]);
        synthesizer.edit(&mut current, &["NODE_ENV".to_string(), "JWT_SECRET".to_string()])?;

        assert_eq!(
            current,
            vars(&[("EXTRA", "1"), ("JWT_SECRET", "topsecret"), ("NODE_ENV", "production")])
        );
        assert_eq!(
            prompt.asked(),
            vec![
                "NODE_ENV",
                "JWT_SECRET",
                "Additional variable name (empty to finish)",
                "EXTRA",
                "Additional variable name (empty to finish)",
            ]
        );
        Ok(())
    }

    #[test]
    fn prompt_keys_fall_back_without_example() {
        assert_eq!(EnvLayers::default().prompt_keys(), FALLBACK_KEYS.map(String::from).to_vec());
    }

    #[test]
    fn parse_override_pairs() {
        assert_eq!(
            parse_override("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_override("=x").is_err());
        assert!(parse_override("novalue").is_err());
    }
}
