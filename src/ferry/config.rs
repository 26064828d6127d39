use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::ferry::{buffer, engine, net, protocol};

pub const CONFIG_ENV: &str = "FERRY_CONFIG";

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
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps FERRY_CONFIG onto the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
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
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("ferry.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["ferry.toml", "ferry.yaml", "ferry.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/ferry/ferry.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "ferry", "ferry")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("ferry.toml"))
    }
}

/// Writes the default template to `path` unless a file is already there.
/// Returns true when the file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
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

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            // An all-comment YAML document parses as null rather than an empty map.
            if s.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with('#')) {
                FileConfig::default()
            } else {
                serde_yaml::from_str(&s)
                    .with_context(|| format!("parse yaml {}", path.display()))?
            }
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    Config::from_file_config(fc, path)
}

/// Like [`load_config`], but a missing file yields the defaults (paths still
/// resolve against the file's directory) instead of an error.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    Config::from_file_config(FileConfig::default(), path)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub tcp_port: u16,
    pub tls_port: u16,
    pub max_header_bytes: usize,
    pub require_websocket_upgrade: bool,
    pub buffer_size: usize,
    pub max_pooled_buffers: usize,
    pub timeouts: Timeouts,
    pub tls: TlsConfig,
    pub ssh: SshConfig,
    pub users: UsersConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub header_read: Duration,
    pub dial: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host_key_file: PathBuf,
    pub server_version: String,
    pub banner: String,
    pub auth_rejection_time: Duration,
}

#[derive(Debug, Clone)]
pub struct UsersConfig {
    pub db_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

impl Config {
    pub fn upgrade_policy(&self) -> protocol::UpgradePolicy {
        if self.require_websocket_upgrade {
            protocol::UpgradePolicy::WebSocketOnly
        } else {
            protocol::UpgradePolicy::AnyNonEmpty
        }
    }

    pub fn buffer_pool_config(&self) -> buffer::BufferPoolConfig {
        buffer::BufferPoolConfig {
            buffer_size: self.buffer_size,
            max_pooled: self.max_pooled_buffers,
        }
    }

    pub fn host_key(&self) -> engine::HostKeyFile {
        engine::HostKeyFile {
            path: self.ssh.host_key_file.clone(),
            server_version: self.ssh.server_version.clone(),
            banner: self.ssh.banner.clone(),
            auth_rejection_time: self.ssh.auth_rejection_time,
        }
    }

    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let base = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let rel = |p: Option<String>, default: &str| -> PathBuf {
            let p = p
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| default.to_string());
            let p = PathBuf::from(p);
            if p.is_absolute() { p } else { base.join(p) }
        };
        let ms = |v: Option<i64>, default: u64| Duration::from_millis(v.map_or(default, |v| v.max(0) as u64));

        let timeouts = fc.timeouts.unwrap_or_default();
        let tls = fc.tls.unwrap_or_default();
        let ssh = fc.ssh.unwrap_or_default();
        let users = fc.users.unwrap_or_default();
        let logging = fc.logging.unwrap_or_default();
        let logging_defaults = LoggingConfig::default();

        let cfg = Config {
            listen_host: net::normalize_bind_host(fc.listen_host.as_deref().unwrap_or("").trim())
                .into_owned(),
            tcp_port: fc.tcp_port.unwrap_or(80),
            tls_port: fc.tls_port.unwrap_or(443),
            max_header_bytes: positive_or(fc.max_header_bytes, protocol::DEFAULT_MAX_HEADER_BYTES),
            require_websocket_upgrade: fc.require_websocket_upgrade.unwrap_or(false),
            buffer_size: positive_or(fc.buffer_size, buffer::DEFAULT_BUFFER_SIZE),
            max_pooled_buffers: positive_or(fc.max_pooled_buffers, buffer::DEFAULT_MAX_POOLED),
            timeouts: Timeouts {
                header_read: ms(
                    timeouts.header_read_timeout_ms,
                    protocol::DEFAULT_HEADER_READ_TIMEOUT.as_millis() as u64,
                ),
                dial: ms(timeouts.dial_timeout_ms, 10_000),
                shutdown_grace: ms(timeouts.shutdown_grace_ms, 5_000),
            },
            tls: TlsConfig {
                cert_file: rel(tls.cert_file, "cert.pem"),
                key_file: rel(tls.key_file, "key.pem"),
            },
            ssh: SshConfig {
                host_key_file: rel(ssh.host_key_file, "host_key"),
                server_version: ssh
                    .server_version
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| engine::DEFAULT_SERVER_VERSION.to_string()),
                banner: ssh
                    .banner
                    .unwrap_or_else(|| engine::DEFAULT_BANNER.to_string()),
                auth_rejection_time: ms(ssh.auth_rejection_time_ms, 1_000),
            },
            users: UsersConfig {
                db_file: rel(users.db_file, "users.json"),
            },
            logging: LoggingConfig {
                level: logging.level.unwrap_or(logging_defaults.level),
                format: logging.format.unwrap_or(logging_defaults.format),
                output: match logging.output.map(|s| s.trim().to_string()) {
                    None => logging_defaults.output,
                    Some(o) if o.is_empty() => logging_defaults.output,
                    Some(o) if matches!(o.as_str(), "stderr" | "stdout" | "discard") => o,
                    Some(o) => rel(Some(o), "").display().to_string(),
                },
                add_source: logging.add_source,
            },
        };

        if cfg.tcp_port == 0 && cfg.tls_port == 0 {
            anyhow::bail!("config: nothing to run (tcp_port and tls_port are both 0)");
        }
        if !cfg.ssh.server_version.starts_with("SSH-2.0-") {
            anyhow::bail!(
                "config: ssh.server_version must start with SSH-2.0- (got {:?})",
                cfg.ssh.server_version
            );
        }
        match cfg.logging.format.trim().to_ascii_lowercase().as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("config: logging.format must be json or text (got {other:?})"),
        }

        Ok(cfg)
    }
}

fn positive_or(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(v) if v > 0 => v as usize,
        _ => default,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_host: Option<String>,
    tcp_port: Option<u16>,
    tls_port: Option<u16>,
    max_header_bytes: Option<i64>,
    require_websocket_upgrade: Option<bool>,
    buffer_size: Option<i64>,
    max_pooled_buffers: Option<i64>,
    timeouts: Option<FileTimeouts>,
    tls: Option<FileTls>,
    ssh: Option<FileSsh>,
    users: Option<FileUsers>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTimeouts {
    header_read_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    shutdown_grace_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTls {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSsh {
    host_key_file: Option<String>,
    server_version: Option<String>,
    banner: Option<String>,
    auth_rejection_time_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileUsers {
    db_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# ferry configuration (auto-generated)
#
# Relative paths below resolve against the directory holding this file.

listen_host = "0.0.0.0"
tcp_port = 80   # 0 disables the plain listener
tls_port = 443  # 0 disables the TLS listener

max_header_bytes = 16384
# Only open the tunnel for "Upgrade: websocket" instead of any non-empty value.
require_websocket_upgrade = false

buffer_size = 32768
max_pooled_buffers = 256

[timeouts]
header_read_timeout_ms = 60000
dial_timeout_ms = 10000
shutdown_grace_ms = 5000

[tls]
# Generated (self-signed, localhost) when missing.
cert_file = "cert.pem"
key_file = "key.pem"

[ssh]
# Generated (ed25519) when missing.
host_key_file = "host_key"
server_version = "SSH-2.0-ferry_1.0"
banner = "Welcome to ferry.\n"
auth_rejection_time_ms = 1000

[users]
# Manage with `ferry users add|remove|list|passwd|enable|disable|backup`.
db_file = "users.json"

[logging]
level = "info"    # debug | info | warn | error
format = "text"   # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# ferry configuration (auto-generated)
#
# Relative paths below resolve against the directory holding this file.

listen_host: "0.0.0.0"
tcp_port: 80   # 0 disables the plain listener
tls_port: 443  # 0 disables the TLS listener

max_header_bytes: 16384
# Only open the tunnel for "Upgrade: websocket" instead of any non-empty value.
require_websocket_upgrade: false

buffer_size: 32768
max_pooled_buffers: 256

timeouts:
  header_read_timeout_ms: 60000
  dial_timeout_ms: 10000
  shutdown_grace_ms: 5000

tls:
  # Generated (self-signed, localhost) when missing.
  cert_file: "cert.pem"
  key_file: "key.pem"

ssh:
  # Generated (ed25519) when missing.
  host_key_file: "host_key"
  server_version: "SSH-2.0-ferry_1.0"
  banner: "Welcome to ferry.\n"
  auth_rejection_time_ms: 1000

users:
  # Manage with `ferry users add|remove|list|passwd|enable|disable|backup`.
  db_file: "users.json"

logging:
  level: "info"    # debug | info | warn | error
  format: "text"   # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ferry::files::temp_dir;

    #[test]
    fn empty_file_gets_defaults() {
        let dir = temp_dir("defaults");
        let cfg_path = dir.join("ferry.toml");
        std::fs::write(&cfg_path, "").expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_host, "0.0.0.0");
        assert_eq!(cfg.tcp_port, 80);
        assert_eq!(cfg.tls_port, 443);
        assert_eq!(cfg.max_header_bytes, 16 * 1024);
        assert_eq!(cfg.buffer_size, 32 * 1024);
        assert_eq!(cfg.timeouts.header_read, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.dial, Duration::from_secs(10));
        assert_eq!(cfg.upgrade_policy(), protocol::UpgradePolicy::AnyNonEmpty);
        assert_eq!(cfg.users.db_file, dir.join("users.json"));
        assert_eq!(cfg.ssh.host_key_file, dir.join("host_key"));
        assert_eq!(cfg.ssh.server_version, "SSH-2.0-ferry_1.0");
        assert_eq!(cfg.logging.format, "text");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn generated_templates_load_cleanly() {
        let dir = temp_dir("templates");
        for name in ["ferry.toml", "ferry.yaml"] {
            let p = dir.join("nested").join(name);
            assert!(ensure_config_file(&p).expect("create"));
            assert!(!ensure_config_file(&p).expect("exists"));
            let cfg = load_config(&p).expect("load template");
            assert_eq!(cfg.tls.cert_file, dir.join("nested").join("cert.pem"));
            assert_eq!(cfg.ssh.banner, "Welcome to ferry.\n");
            assert_eq!(cfg.timeouts.shutdown_grace, Duration::from_secs(5));
        }
        assert!(ensure_config_file(&dir.join("ferry.ini")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_overrides_and_absolute_paths() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("ferry.yml");
        let yaml = r#"
listen_host: ":"
tcp_port: 8080
tls_port: 0
require_websocket_upgrade: true
timeouts:
  header_read_timeout_ms: 250
users:
  db_file: "/var/lib/ferry/users.json"
logging:
  output: "logs/ferry.log"
"#;
        std::fs::write(&cfg_path, yaml).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.listen_host, "0.0.0.0");
        assert_eq!(cfg.tcp_port, 8080);
        assert_eq!(cfg.tls_port, 0);
        assert_eq!(cfg.upgrade_policy(), protocol::UpgradePolicy::WebSocketOnly);
        assert_eq!(cfg.timeouts.header_read, Duration::from_millis(250));
        assert_eq!(cfg.users.db_file, PathBuf::from("/var/lib/ferry/users.json"));
        assert_eq!(
            cfg.logging.output,
            dir.join("logs/ferry.log").display().to_string()
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("ferry.toml");
        std::fs::write(&cfg_path, "admin_addr = \":8080\"\n").expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("admin_addr"), "got: {msg}");

        std::fs::write(&cfg_path, "[ssh]\nmethods = [\"publickey\"]\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = temp_dir("invalid");
        let cfg_path = dir.join("ferry.toml");

        std::fs::write(&cfg_path, "tcp_port = 0\ntls_port = 0\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(&cfg_path, "[ssh]\nserver_version = \"OpenSSH\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        std::fs::write(&cfg_path, "[logging]\nformat = \"xml\"\n").expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = temp_dir("missing");
        let cfg = load_config_or_default(&dir.join("ferry.toml")).expect("defaults");
        assert_eq!(cfg.users.db_file, dir.join("users.json"));
        assert!(!dir.join("ferry.toml").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_is_searched() {
        let dir = temp_dir("explicit");
        assert_eq!(
            normalize_explicit_path(&dir).unwrap(),
            dir.join("ferry.toml")
        );
        std::fs::write(dir.join("ferry.yaml"), "tcp_port: 81\n").expect("write");
        assert_eq!(
            normalize_explicit_path(&dir).unwrap(),
            dir.join("ferry.yaml")
        );
        assert_eq!(
            normalize_explicit_path(&dir.join("custom")).unwrap(),
            dir.join("custom.toml")
        );

        let resolved = resolve_config_path(Some(dir.join("ferry.yaml"))).unwrap();
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.source.to_string(), "flag");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
