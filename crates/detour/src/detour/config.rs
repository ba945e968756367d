use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::detour::net;

pub const DEFAULT_PASSWORD: &str = "password";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    /// Paths the operator named on purpose get a template when missing.
    pub fn is_explicit(self) -> bool {
        matches!(self, Self::Flag | Self::Env)
    }
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("DETOUR_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("detour.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["detour.toml", "detour.yaml", "detour.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no detour.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/detour/detour.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("org", "detour", "detour")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("detour.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    let cfg = Config::from_file_config(fc);
    cfg.validate()?;
    Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub password: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `tcp://host:port`, `host:port` or `:port`.
    pub listen: String,
    /// Empty disables the admin HTTP surface.
    pub admin_addr: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub listen: String,
    pub remotes: Vec<String>,
    /// `socks5` or `forward`.
    pub protocol: String,
    pub forward_target: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Deadline for handing remote data to a client.
    pub io_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_file_config(FileConfig::default())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    password: Option<String>,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    local: Option<FileLocal>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen: Option<String>,
    admin_addr: Option<String>,
    connect_timeout_ms: Option<i64>,
    io_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    housekeeping_interval_ms: Option<i64>,
    buffer_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLocal {
    listen: Option<String>,
    remote: Option<StringOrVec>,
    remotes: Option<StringOrVec>,
    protocol: Option<String>,
    forward_target: Option<String>,
    dial_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    io_timeout_ms: Option<i64>,
    max_reconnects: Option<i64>,
    reconnect_backoff_ms: Option<i64>,
    buffer_size: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    /// A single string may itself be a comma-separated list.
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => net::split_list(&s),
            StringOrVec::Many(v) => v
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn positive(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

fn trimmed(v: Option<&String>, default: &str) -> String {
    match v.map(|s| s.trim()) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Config {
        let logging = match &fc.logging {
            Some(l) => LoggingConfig {
                level: trimmed(l.level.as_ref(), "info"),
                format: trimmed(l.format.as_ref(), "text").to_ascii_lowercase(),
                output: trimmed(l.output.as_ref(), "stderr"),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };
        let s = fc.server.as_ref();
        let server = ServerConfig {
            listen: trimmed(s.and_then(|s| s.listen.as_ref()), "tcp://0.0.0.0:3811"),
            admin_addr: s
                .and_then(|s| s.admin_addr.as_deref())
                .unwrap_or("")
                .trim()
                .to_string(),
            connect_timeout: millis(s.and_then(|s| s.connect_timeout_ms), 3_000),
            io_timeout: millis(s.and_then(|s| s.io_timeout_ms), 60_000),
            idle_timeout: millis(s.and_then(|s| s.idle_timeout_ms), 60_000),
            housekeeping_interval: millis(s.and_then(|s| s.housekeeping_interval_ms), 10_000),
            buffer_size: positive(s.and_then(|s| s.buffer_size), 32 * 1024),
        };

        let l = fc.local.as_ref();
        let mut remotes = Vec::new();
        if let Some(l) = l {
            for v in [&l.remote, &l.remotes].into_iter().flatten() {
                remotes.extend(v.clone().into_vec());
            }
        }
        if remotes.is_empty() {
            remotes.push("tcp://127.0.0.1:3811".into());
        }
        let local = LocalConfig {
            listen: trimmed(l.and_then(|l| l.listen.as_ref()), "tcp://0.0.0.0:3810"),
            remotes,
            protocol: trimmed(l.and_then(|l| l.protocol.as_ref()), "socks5").to_ascii_lowercase(),
            forward_target: l
                .and_then(|l| l.forward_target.as_deref())
                .unwrap_or("")
                .trim()
                .to_string(),
            dial_timeout: millis(l.and_then(|l| l.dial_timeout_ms), 5_000),
            handshake_timeout: millis(l.and_then(|l| l.handshake_timeout_ms), 10_000),
            io_timeout: millis(l.and_then(|l| l.io_timeout_ms), 60_000),
            max_reconnects: match l.and_then(|l| l.max_reconnects) {
                Some(n) if n >= 0 => n.min(u32::MAX as i64) as u32,
                _ => 3,
            },
            reconnect_backoff: millis(l.and_then(|l| l.reconnect_backoff_ms), 200),
            buffer_size: positive(l.and_then(|l| l.buffer_size), 32 * 1024),
        };

        Config {
            password: fc.password.unwrap_or_else(|| DEFAULT_PASSWORD.to_string()),
            logging,
            server,
            local,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.password.is_empty() {
            anyhow::bail!("config: password must not be empty");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "config: logging.format must be text or json (got {:?})",
                self.logging.format
            );
        }
        Ok(())
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub password: Option<String>,
    pub listen: Option<String>,
    pub remotes: Option<String>,
    pub protocol: Option<String>,
    pub forward_target: Option<String>,
    pub admin_addr: Option<String>,
}

impl Overrides {
    pub fn apply_server(&self, cfg: &mut Config) {
        if let Some(p) = &self.password {
            cfg.password = p.clone();
        }
        if let Some(l) = &self.listen {
            cfg.server.listen = l.trim().to_string();
        }
        if let Some(a) = &self.admin_addr {
            cfg.server.admin_addr = a.trim().to_string();
        }
    }

    pub fn apply_local(&self, cfg: &mut Config) {
        if let Some(p) = &self.password {
            cfg.password = p.clone();
        }
        if let Some(l) = &self.listen {
            cfg.local.listen = l.trim().to_string();
        }
        if let Some(r) = &self.remotes {
            let remotes = net::split_list(r);
            if !remotes.is_empty() {
                cfg.local.remotes = remotes;
            }
        }
        if let Some(t) = &self.protocol {
            cfg.local.protocol = t.trim().to_ascii_lowercase();
        }
        if let Some(f) = &self.forward_target {
            cfg.local.forward_target = f.trim().to_string();
        }
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# detour configuration (auto-generated)
#
# Both modes read this file: `detour server` uses [server], `detour local` uses
# [local]. Command-line flags override the values here.

# Shared secret; both ends must agree. Change it.
password = "password"

[server]
listen = "tcp://0.0.0.0:3811"
# admin_addr = "127.0.0.1:9811"
connect_timeout_ms = 3000
io_timeout_ms = 60000
idle_timeout_ms = 60000
housekeeping_interval_ms = 10000

[local]
listen = "tcp://0.0.0.0:3810"
remotes = ["tcp://127.0.0.1:3811"]
protocol = "socks5" # socks5 | forward
# forward_target = "127.0.0.1:22"
dial_timeout_ms = 5000
handshake_timeout_ms = 10000
io_timeout_ms = 60000
max_reconnects = 3
reconnect_backoff_ms = 200

[logging]
level = "info"
format = "text" # text | json
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# detour configuration (auto-generated)
#
# Both modes read this file: `detour server` uses `server`, `detour local` uses
# `local`. Command-line flags override the values here.

# Shared secret; both ends must agree. Change it.
password: "password"

server:
  listen: "tcp://0.0.0.0:3811"
  # admin_addr: "127.0.0.1:9811"
  connect_timeout_ms: 3000
  io_timeout_ms: 60000
  idle_timeout_ms: 60000
  housekeeping_interval_ms: 10000

local:
  listen: "tcp://0.0.0.0:3810"
  remotes:
    - "tcp://127.0.0.1:3811"
  protocol: "socks5" # socks5 | forward
  # forward_target: "127.0.0.1:22"
  dial_timeout_ms: 5000
  handshake_timeout_ms: 10000
  io_timeout_ms: 60000
  max_reconnects: 3
  reconnect_backoff_ms: 200

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr"
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "detour_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn defaults_match_cli_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.password, DEFAULT_PASSWORD);
        assert_eq!(cfg.server.listen, "tcp://0.0.0.0:3811");
        assert_eq!(cfg.server.connect_timeout, Duration::from_secs(3));
        assert_eq!(cfg.server.io_timeout, Duration::from_secs(60));
        assert_eq!(cfg.server.housekeeping_interval, Duration::from_secs(10));
        assert_eq!(cfg.local.listen, "tcp://0.0.0.0:3810");
        assert_eq!(cfg.local.remotes, vec!["tcp://127.0.0.1:3811".to_string()]);
        assert_eq!(cfg.local.protocol, "socks5");
        assert_eq!(cfg.local.max_reconnects, 3);
        assert!(cfg.server.admin_addr.is_empty());
    }

    #[test]
    fn generated_templates_load() {
        for name in ["detour.toml", "detour.yaml"] {
            let dir = temp_dir("tmpl");
            let path = dir.join("sub").join(name);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());
            let cfg = load_config(&path).unwrap();
            assert_eq!(cfg.local.remotes, vec!["tcp://127.0.0.1:3811".to_string()]);
            assert_eq!(cfg.local.reconnect_backoff, Duration::from_millis(200));
            assert_eq!(cfg.local.io_timeout, Duration::from_secs(60));
        }
    }

    #[test]
    fn toml_values_override_defaults() {
        let dir = temp_dir("toml");
        let path = dir.join("detour.toml");
        std::fs::write(
            &path,
            r#"
password = "s3cret"

[server]
listen = ":4000"
admin_addr = "127.0.0.1:9811"
idle_timeout_ms = 1500

[local]
remote = "tcp://a:1, b:2"
protocol = "Forward"
forward_target = " 10.0.0.1:22 "

[logging]
format = "json"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.server.listen, ":4000");
        assert_eq!(cfg.server.admin_addr, "127.0.0.1:9811");
        assert_eq!(cfg.server.idle_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.local.remotes, vec!["tcp://a:1".to_string(), "b:2".to_string()]);
        assert_eq!(cfg.local.protocol, "forward");
        assert_eq!(cfg.local.forward_target, "10.0.0.1:22");
        assert_eq!(cfg.logging.format, "json");
    }

    #[test]
    fn yaml_remote_list() {
        let dir = temp_dir("yaml");
        let path = dir.join("detour.yml");
        std::fs::write(
            &path,
            "local:\n  remotes:\n    - tcp://r1:3811\n    - tcp://r2:3811\n  max_reconnects: 0\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.local.remotes.len(), 2);
        assert_eq!(cfg.local.max_reconnects, 0);
    }

    #[test]
    fn unknown_fields_and_bad_format_are_rejected() {
        let dir = temp_dir("reject");
        let path = dir.join("detour.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \":1\"\n").unwrap();
        assert!(load_config(&path).is_err());

        std::fs::write(&path, "[logging]\nformat = \"xml\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("logging.format"));

        let bad_ext = dir.join("detour.ini");
        std::fs::write(&bad_ext, "").unwrap();
        assert!(load_config(&bad_ext).is_err());
    }

    #[test]
    fn explicit_paths_are_normalized() {
        let dir = temp_dir("explicit");
        assert_eq!(
            normalize_explicit_path(&dir).unwrap(),
            dir.join("detour.toml")
        );
        std::fs::write(dir.join("detour.yaml"), "").unwrap();
        assert_eq!(
            normalize_explicit_path(&dir).unwrap(),
            dir.join("detour.yaml")
        );
        assert_eq!(
            normalize_explicit_path(&dir.join("custom")).unwrap(),
            dir.join("custom.toml")
        );
        assert!(normalize_explicit_path(Path::new("")).is_err());

        let resolved = resolve_config_path(Some(dir.join("x.yml"))).unwrap();
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert!(resolved.source.is_explicit());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut cfg = Config::default();
        let ov = Overrides {
            password: Some("pw".into()),
            listen: Some(" :9000 ".into()),
            remotes: Some("tcp://x:1,tcp://y:2".into()),
            protocol: Some("FORWARD".into()),
            forward_target: Some("db:5432".into()),
            admin_addr: None,
        };
        ov.apply_local(&mut cfg);
        assert_eq!(cfg.password, "pw");
        assert_eq!(cfg.local.listen, ":9000");
        assert_eq!(cfg.local.remotes.len(), 2);
        assert_eq!(cfg.local.protocol, "forward");
        assert_eq!(cfg.local.forward_target, "db:5432");
        assert_eq!(cfg.server.listen, "tcp://0.0.0.0:3811");

        ov.apply_server(&mut cfg);
        assert_eq!(cfg.server.listen, ":9000");

        cfg.password.clear();
        assert!(cfg.validate().is_err());
    }
}
