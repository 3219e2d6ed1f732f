// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reverse-proxy port patching.
//!
//! Every Node.js deployment listens on a port derived from its domain, and
//! the reverse-proxy configuration of that domain must point its upstream at
//! it. Configuration files may be hand-edited by the operator, partially
//! generated, or freshly scaffolded, so patching never assumes a rigid
//! structure. Instead, the text is tokenized into a flat list of
//! [`Directive`]s with byte spans, and one of three [`PatchStrategy`]s is
//! picked:
//!
//! 1. Replace the port of every existing local `proxy_pass` directive.
//! 2. Inject a `proxy_pass` directive into an existing `location /` block.
//! 3. Append a fresh `location /` block, inside the last `server` block if
//!    there is one.
//!
//! Only the bytes covered by the chosen strategy change. Everything else,
//! including comments and formatting, is preserved verbatim.

use crate::{
    config::{PortSettings, PortStrategy, Settings},
    path::DeploymentTarget,
    system::{CommandRunner, Invocation},
};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read_to_string, write},
    ops::Range,
    path::PathBuf,
};
use tracing::{info, instrument, warn};

const UPSTREAM_HOSTS: [&str; 2] = ["http://localhost:", "http://127.0.0.1:"];

/// Kind of token produced by [`tokenize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// Simple directive terminated by `;`.
    Statement,

    /// Block directive opened by `{`.
    BlockStart,

    /// Closing `}` of a block.
    BlockEnd,
}

/// Single directive of a reverse-proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub kind: DirectiveKind,
    pub name: String,
    pub value: String,

    /// Byte span of the value in the source text.
    pub value_span: Range<usize>,

    /// Byte offset just past the terminating `;`, `{`, or `}`.
    pub end: usize,

    /// Nesting depth the directive appears at.
    pub depth: usize,

    /// For block ends, index of the matching block start.
    pub opener: Option<usize>,

    /// Index of the innermost block start enclosing this directive.
    pub parent: Option<usize>,
}

/// Split configuration text into directives.
///
/// Comments are skipped, and quoted strings may contain terminators. Text
/// that never reaches a terminator is ignored.
pub fn tokenize(text: &str) -> Vec<Directive> {
    let mut directives = Vec::new();
    let mut openers = Vec::new();
    let mut start: Option<usize> = None;
    let mut quote: Option<char> = None;
    let mut comment = false;

    for (idx, ch) in text.char_indices() {
        if comment {
            comment = ch != '\n';
            continue;
        }

        if let Some(open) = quote {
            if ch == open {
                quote = None;
            }
            continue;
        }

        match ch {
            '#' => comment = true,
            '"' | '\'' => {
                quote = Some(ch);
                start.get_or_insert(idx);
            }
            ';' | '{' => {
                let kind = if ch == ';' {
                    DirectiveKind::Statement
                } else {
                    DirectiveKind::BlockStart
                };
                let from = start.take().unwrap_or(idx);
                let mut directive = statement(text, from..idx, kind, idx + 1, openers.len());
                directive.parent = openers.last().copied();
                directives.push(directive);
                if kind == DirectiveKind::BlockStart {
                    openers.push(directives.len() - 1);
                }
            }
            '}' => {
                start = None;
                let opener = openers.pop();
                directives.push(Directive {
                    kind: DirectiveKind::BlockEnd,
                    name: String::new(),
                    value: String::new(),
                    value_span: idx..idx,
                    end: idx + 1,
                    depth: openers.len(),
                    opener,
                    parent: openers.last().copied(),
                });
            }
            ch if ch.is_whitespace() => {}
            _ => {
                start.get_or_insert(idx);
            }
        }
    }

    directives
}

fn statement(
    text: &str,
    span: Range<usize>,
    kind: DirectiveKind,
    end: usize,
    depth: usize,
) -> Directive {
    let raw = &text[span.clone()];
    let name_len = raw.find(char::is_whitespace).unwrap_or(raw.len());
    let rest = &raw[name_len..];
    let value_start = span.start + name_len + (rest.len() - rest.trim_start().len());
    let value_end = (span.start + raw.trim_end().len()).max(value_start);

    Directive {
        kind,
        name: raw[..name_len].to_string(),
        value: text[value_start..value_end].to_string(),
        value_span: value_start..value_end,
        end,
        depth,
        opener: None,
        parent: None,
    }
}

/// Port of a local upstream target such as `http://localhost:3000`.
///
/// Returns the byte range of the port digits relative to value.
fn upstream_port(value: &str) -> Option<(Range<usize>, u16)> {
    UPSTREAM_HOSTS.iter().find_map(|host| {
        let rest = value.strip_prefix(host)?;
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let port = rest[..digits].parse().ok()?;
        Some((host.len()..host.len() + digits, port))
    })
}

/// Local `proxy_pass` upstream found in configuration text.
struct Upstream {
    /// Byte span of the port digits in the source text.
    digits: Range<usize>,
    port: u16,

    /// Whether the directive sits directly inside `location / { }`.
    in_root_location: bool,
}

fn local_upstreams(directives: &[Directive]) -> Vec<Upstream> {
    directives
        .iter()
        .filter(|d| d.kind == DirectiveKind::Statement && d.name == "proxy_pass")
        .filter_map(|d| {
            let (digits, port) = upstream_port(&d.value)?;
            let in_root_location = d
                .parent
                .and_then(|idx| directives.get(idx))
                .is_some_and(|block| block.name == "location" && block.value == "/");
            Some(Upstream {
                digits: d.value_span.start + digits.start..d.value_span.start + digits.end,
                port,
                in_root_location,
            })
        })
        .collect()
}

/// Port the application is served on, preferring the `location /` upstream.
fn application_port(upstreams: &[Upstream]) -> Option<u16> {
    upstreams
        .iter()
        .find(|upstream| upstream.in_root_location)
        .or_else(|| upstreams.first())
        .map(|upstream| upstream.port)
}

/// Read the application port from configuration text.
pub fn read_port(text: &str) -> Option<u16> {
    application_port(&local_upstreams(&tokenize(text)))
}

/// How an upstream directive was put in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    ReplacePort,
    InjectIntoLocation,
    AppendLocation,
}

/// Result of patching configuration text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub strategy: PatchStrategy,
    pub text: String,
    pub previous_port: Option<u16>,
}

/// Point the upstream of configuration text at port.
pub fn patch_upstream(text: &str, port: u16) -> Patch {
    let directives = tokenize(text);

    let upstreams = local_upstreams(&directives);

    // INVARIANT: Only upstreams on the application port move, others are left alone.
    if let Some(previous) = application_port(&upstreams) {
        let mut spans = upstreams
            .into_iter()
            .filter(|upstream| upstream.port == previous)
            .map(|upstream| upstream.digits)
            .collect::<Vec<_>>();
        spans.sort_by_key(|span| std::cmp::Reverse(span.start));

        let mut patched = text.to_string();
        for span in spans {
            patched.replace_range(span, &port.to_string());
        }

        return Patch {
            strategy: PatchStrategy::ReplacePort,
            text: patched,
            previous_port: Some(previous),
        };
    }

    let location = directives
        .iter()
        .find(|d| d.kind == DirectiveKind::BlockStart && d.name == "location" && d.value == "/");
    if let Some(location) = location {
        let mut patched = text.to_string();
        patched.insert_str(
            location.end,
            &format!("\n        proxy_pass http://localhost:{port};"),
        );
        return Patch {
            strategy: PatchStrategy::InjectIntoLocation,
            text: patched,
            previous_port: None,
        };
    }

    let block = format!("    location / {{\n        proxy_pass http://localhost:{port};\n    }}\n");
    let server_end = directives.iter().rev().find(|d| {
        d.kind == DirectiveKind::BlockEnd
            && d.opener
                .and_then(|idx| directives.get(idx))
                .is_some_and(|opener| opener.name == "server")
    });

    let mut patched = text.to_string();
    match server_end {
        Some(end) => {
            // INVARIANT: Closing brace of server block sits at end - 1.
            let at = end.end - 1;
            let line_start = patched[..at].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
            let insert_at = if patched[line_start..at].trim().is_empty() {
                line_start
            } else {
                at
            };
            patched.insert_str(insert_at, &block);
        }
        None => {
            if !patched.is_empty() && !patched.ends_with('\n') {
                patched.push('\n');
            }
            patched.push_str(&block);
        }
    }

    Patch {
        strategy: PatchStrategy::AppendLocation,
        text: patched,
        previous_port: None,
    }
}

/// FNV-1a hash of domain folded into the port range.
pub fn hash_port(domain: &str, start: u16, end: u16) -> u16 {
    let hash = domain.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    let width = u32::from(end - start) + 1;
    start + (hash % width) as u16
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
struct PortTable {
    #[serde(default)]
    ports: BTreeMap<String, u16>,
}

/// Hand out ports to domains.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    settings: PortSettings,
}

impl PortAllocator {
    pub fn new(settings: PortSettings) -> Self {
        Self { settings }
    }

    pub fn seed(&self, domain: &str) -> u16 {
        hash_port(domain, self.settings.start, self.settings.end)
    }

    /// Port of domain, recording it in the allocation table if needed.
    ///
    /// A domain already in the table keeps its port. A new domain takes its
    /// seed port, or the next free port after it, wrapping within range.
    ///
    /// # Errors
    ///
    /// - Return [`NginxError::PortsExhausted`] if every port is held.
    /// - Return [`NginxError::Io`] if the table cannot be accessed.
    #[instrument(skip(self), level = "debug")]
    pub fn allocate(&self, domain: &str) -> Result<u16> {
        let seed = self.seed(domain);
        if self.settings.strategy == PortStrategy::Hash {
            return Ok(seed);
        }

        let mut table = self.load()?;
        if let Some(port) = table.ports.get(domain) {
            return Ok(*port);
        }

        let (start, end) = (self.settings.start, self.settings.end);
        let width = u32::from(end - start) + 1;
        let offset = u32::from(seed - start);
        let port = (0..width)
            .filter_map(|step| u16::try_from(u32::from(start) + (offset + step) % width).ok())
            .find(|port| !table.ports.values().any(|held| held == port))
            .ok_or(NginxError::PortsExhausted { start, end })?;

        if port != seed {
            info!("port {seed} is taken, {domain} gets port {port}");
        }
        table.ports.insert(domain.to_string(), port);
        self.save(&table)?;

        Ok(port)
    }

    /// Drop domain from the allocation table.
    ///
    /// # Errors
    ///
    /// - Return [`NginxError::Io`] if the table cannot be accessed.
    pub fn release(&self, domain: &str) -> Result<()> {
        if self.settings.strategy == PortStrategy::Hash {
            return Ok(());
        }

        let mut table = self.load()?;
        if table.ports.remove(domain).is_some() {
            self.save(&table)?;
        }
        Ok(())
    }

    fn load(&self) -> Result<PortTable> {
        let path = &self.settings.table;
        if !path.exists() {
            return Ok(PortTable::default());
        }

        let data = read_to_string(path).map_err(|err| NginxError::Io {
            source: err,
            path: path.clone(),
        })?;
        Ok(toml::de::from_str(&data)?)
    }

    fn save(&self, table: &PortTable) -> Result<()> {
        let path = &self.settings.table;
        let io = |err| NginxError::Io {
            source: err,
            path: path.clone(),
        };
        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(io)?;
        }
        write(path, toml::ser::to_string_pretty(table)?).map_err(io)
    }
}

/// Patch reverse-proxy configuration of deployments.
pub struct Patcher<'a, R: CommandRunner> {
    runner: &'a R,
    sites_enabled: PathBuf,
}

impl<'a, R: CommandRunner> Patcher<'a, R> {
    pub fn new(runner: &'a R, settings: &Settings) -> Self {
        Self {
            runner,
            sites_enabled: settings.sites_enabled.clone(),
        }
    }

    /// Port currently configured for target, if any.
    pub fn current_port(&self, target: &DeploymentTarget) -> Option<u16> {
        read_to_string(target.nginx_conf())
            .ok()
            .and_then(|text| read_port(&text))
    }

    /// Check that nginx serves the configuration of target.
    pub fn is_enabled(&self, target: &DeploymentTarget) -> bool {
        let domain = target.domain();
        [format!("{domain}.conf"), domain.to_string()]
            .iter()
            .any(|name| self.sites_enabled.join(name).exists())
    }

    /// Point upstream of target at port.
    ///
    /// Returns `None` if target has no reverse-proxy configuration yet.
    ///
    /// # Errors
    ///
    /// - Return [`NginxError::Io`] if configuration cannot be read or written.
    /// - Return [`NginxError::Command`] if ownership cannot be fixed.
    #[instrument(skip(self, target), level = "debug")]
    pub fn patch(&self, target: &DeploymentTarget, port: u16) -> Result<Option<PatchStrategy>> {
        let path = target.nginx_conf();
        if !path.exists() {
            info!("no nginx configuration at {}, skip port patch", path.display());
            return Ok(None);
        }

        let io = |err| NginxError::Io {
            source: err,
            path: path.clone(),
        };
        let text = read_to_string(&path).map_err(io)?;
        let patch = patch_upstream(&text, port);
        info!(
            "point {} upstream at port {port} ({:?})",
            target.domain(),
            patch.strategy
        );
        write(&path, &patch.text).map_err(io)?;

        self.runner
            .run(&Invocation::chown(target.owner_user(), &path))?;

        if !self.is_enabled(target) {
            warn!(
                "{} is not linked into {}",
                path.display(),
                self.sites_enabled.display()
            );
        }

        Ok(Some(patch.strategy))
    }

    /// Ask nginx to reload its configuration.
    ///
    /// # Errors
    ///
    /// - Return [`NginxError::Command`] if the reload fails.
    pub fn reload(&self) -> Result<()> {
        self.runner
            .run(&Invocation::new("systemctl").args(["reload", "nginx"]))?;
        Ok(())
    }
}

/// Reverse-proxy error types.
#[derive(Debug, thiserror::Error)]
pub enum NginxError {
    #[error("no free port left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

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
pub type Result<T, E = NginxError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::ScriptedRunner;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn tokenize_tracks_blocks_and_skips_comments() {
        let text = indoc! {r#"
            # proxy_pass http://localhost:1;
            server {
                server_name "a;b" example.com;
                location / {
                    proxy_pass http://localhost:3000;
                }
            }
        "#};

        let directives = tokenize(text);
        let names = directives.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["server", "server_name", "location", "proxy_pass", "", ""]);
        assert_eq!(directives[1].value, "\"a;b\" example.com");
        assert_eq!(directives[3].depth, 2);
        assert_eq!(directives[5].opener, Some(0));
        assert_eq!(&text[directives[3].value_span.clone()], "http://localhost:3000");
    }

    #[test]
    fn replace_port_keeps_everything_else() {
        let text = indoc! {"
            server {
                listen 80; # public
                location / {
                    proxy_pass http://localhost:3000;
                }
                location /api {
                    proxy_pass http://127.0.0.1:3000/api;
                }
            }
        "};

        let patch = patch_upstream(text, 3456);
        assert_eq!(patch.strategy, PatchStrategy::ReplacePort);
        assert_eq!(patch.previous_port, Some(3000));
        assert_eq!(
            patch.text,
            text.replace("localhost:3000", "localhost:3456")
                .replace("127.0.0.1:3000", "127.0.0.1:3456")
        );
        assert_eq!(read_port(&patch.text), Some(3456));
    }

    #[test]
    fn replace_port_leaves_unrelated_upstreams() {
        let text = indoc! {"
            server {
                location /metrics {
                    proxy_pass http://localhost:9100;
                }
                location / {
                    proxy_pass http://localhost:3000;
                }
                location /ws {
                    proxy_pass http://127.0.0.1:3000;
                }
            }
        "};

        let patch = patch_upstream(text, 3456);
        assert_eq!(patch.strategy, PatchStrategy::ReplacePort);
        assert_eq!(patch.previous_port, Some(3000));
        assert_eq!(
            patch.text,
            text.replace("localhost:3000", "localhost:3456")
                .replace("127.0.0.1:3000", "127.0.0.1:3456")
        );
        assert!(patch.text.contains("http://localhost:9100;"));
        assert_eq!(read_port(&patch.text), Some(3456));
        assert_eq!(read_port(text), Some(3000));
    }

    #[test]
    fn inject_into_existing_location() {
        let text = indoc! {"
            server {
                location / {
                    try_files $uri $uri/ =404;
                }
            }
        "};

        let patch = patch_upstream(text, 3100);
        assert_eq!(patch.strategy, PatchStrategy::InjectIntoLocation);
        assert_eq!(
            patch.text,
            indoc! {"
                server {
                    location / {
                        proxy_pass http://localhost:3100;
                        try_files $uri $uri/ =404;
                    }
                }
            "}
        );
    }

    #[test]
    fn append_location_inside_last_server() {
        let text = indoc! {"
            server {
                listen 80;
                server_name example.com;
            }
        "};

        let patch = patch_upstream(text, 3200);
        assert_eq!(patch.strategy, PatchStrategy::AppendLocation);
        assert_eq!(
            patch.text,
            indoc! {"
                server {
                    listen 80;
                    server_name example.com;
                    location / {
                        proxy_pass http://localhost:3200;
                    }
                }
            "}
        );
    }

    #[test]
    fn append_location_to_bare_file() {
        let patch = patch_upstream("listen 80;", 3300);
        assert_eq!(patch.strategy, PatchStrategy::AppendLocation);
        assert_eq!(
            patch.text,
            "listen 80;\n    location / {\n        proxy_pass http://localhost:3300;\n    }\n"
        );
    }

    #[test]
    fn hash_port_matches_default_range() {
        let port = hash_port("example.com", 3001, 3999);
        assert!((3001..=3999).contains(&port));
        assert_eq!(port, hash_port("example.com", 3001, 3999));
    }

    #[test]
    fn allocator_probes_past_taken_ports() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = PortSettings {
            start: 4000,
            end: 4001,
            strategy: PortStrategy::Table,
            table: dir.path().join("ports.toml"),
        };
        let allocator = PortAllocator::new(settings);

        let first = allocator.allocate("a.com")?;
        let second = allocator.allocate("b.com")?;
        assert_ne!(first, second);
        assert_eq!(allocator.allocate("a.com")?, first);
        assert!(matches!(
            allocator.allocate("c.com"),
            Err(NginxError::PortsExhausted { .. })
        ));

        allocator.release("a.com")?;
        assert_eq!(allocator.allocate("c.com")?, first);
        Ok(())
    }

    #[test]
    fn patcher_skips_missing_configuration() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let target = DeploymentTarget::resolve("example.com", home.path())?;
        let runner = ScriptedRunner::new();
        let patcher = Patcher::new(&runner, &Settings::default());

        assert_eq!(patcher.patch(&target, 3001)?, None);
        assert!(runner.calls().is_empty());
        Ok(())
    }

    #[test]
    fn patcher_rewrites_and_chowns() -> anyhow::Result<()> {
        let home = tempfile::tempdir()?;
        let target = DeploymentTarget::resolve("example.com", home.path())?;
        let conf = target.nginx_conf();
        create_dir_all(conf.parent().unwrap())?;
        write(&conf, "server {\n    location / {\n        proxy_pass http://localhost:3000;\n    }\n}\n")?;

        let runner = ScriptedRunner::new();
        let patcher = Patcher::new(&runner, &Settings::default());
        assert_eq!(patcher.patch(&target, 3555)?, Some(PatchStrategy::ReplacePort));
        assert_eq!(patcher.current_port(&target), Some(3555));
        assert!(runner.called("chown example:example"));
        Ok(())
    }
}
