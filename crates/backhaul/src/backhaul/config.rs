use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::backhaul::tunnel::registry::PortRange;

const CONFIG_CANDIDATES: [&str; 4] = ["backhaul.yaml", "backhaul.yml", "backhaul.toml", "config.yaml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

/// Flag, then `BACKHAUL_CONFIG`, then a well-known file in the working directory,
/// then the OS default location.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        if p.as_os_str().is_empty() {
            anyhow::bail!("config: empty config path");
        }
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("BACKHAUL_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
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

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/backhaul/backhaul.yaml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "backhaul", "backhaul")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("backhaul.yaml"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub web: WebConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Default)]
pub struct WebConfig {
    /// 0 disables the dashboard.
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub control_port: u16,
    pub token: String,
    pub port_range: Option<PortRange>,
    pub bind_host: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub server_addr: String,
    pub token: String,
    pub tunnels: Vec<TunnelConfig>,
}

/// A tunnel as configured on the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    pub local_addr: String,
    pub remote_port: u16,
}

impl TunnelConfig {
    pub fn normalize(mut self) -> Option<Self> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return None;
        }
        self.protocol = self.protocol.trim().to_ascii_lowercase();
        if self.protocol.is_empty() {
            self.protocol = "tcp".into();
        }
        self.local_addr = self.local_addr.trim().to_string();
        Some(self)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub pending: Duration,
    pub heartbeat: Duration,
    pub retry_backoff: Duration,
    pub dial: Duration,
    pub response: Duration,
    pub handshake: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pending: Duration::from_secs(10),
            heartbeat: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(5),
            dial: Duration::from_secs(5),
            response: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);
    let fc = match Format::of(path)? {
        Format::Toml => {
            toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?
        }
        Format::Yaml => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
    };
    Config::from_file_config(fc)
}

/// Writes `cfg` back in the format implied by the path's extension.
pub fn save_config(path: &Path, cfg: &Config) -> anyhow::Result<()> {
    let fc = FileConfig::from(cfg);
    let out = match Format::of(path)? {
        Format::Toml => toml::to_string_pretty(&fc).context("encode toml")?,
        Format::Yaml => serde_yaml::to_string(&fc).context("encode yaml")?,
    };

    // Write-then-rename so a crash never leaves a truncated config behind.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, out).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {}", path.display()))?;
    Ok(())
}

enum Format {
    Toml,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> anyhow::Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Ok(Format::Toml),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => anyhow::bail!(
                "config: unsupported config extension {ext:?} (expected .toml or .yaml/.yml)"
            ),
        }
    }
}

const REDACTED: &str = "********";

impl Config {
    /// The config as a JSON document with secrets masked.
    pub fn redacted(&self) -> serde_json::Value {
        let mut fc = FileConfig::from(self);
        let mask = |s: &mut Option<String>| {
            if s.as_deref().is_some_and(|v| !v.is_empty()) {
                *s = Some(REDACTED.into());
            }
        };
        if let Some(w) = fc.web.as_mut() {
            mask(&mut w.password);
        }
        if let Some(s) = fc.server.as_mut() {
            mask(&mut s.token);
        }
        if let Some(c) = fc.client.as_mut() {
            mask(&mut c.token);
        }
        serde_json::to_value(&fc).unwrap_or(serde_json::Value::Null)
    }

    /// Validates a full replacement document in the shape [`Config::redacted`] returns.
    /// Secrets still masked keep their current values.
    pub fn replaced_by(&self, doc: serde_json::Value) -> anyhow::Result<Config> {
        let mut fc: FileConfig =
            serde_json::from_value(doc).context("config: decode replacement")?;
        let keep = |s: &mut Option<String>, current: &str| {
            if s.as_deref() == Some(REDACTED) {
                *s = Some(current.to_string());
            }
        };
        if let Some(w) = fc.web.as_mut() {
            keep(&mut w.password, &self.web.password);
        }
        if let Some(sv) = fc.server.as_mut() {
            keep(&mut sv.token, &self.server.token);
        }
        if let Some(c) = fc.client.as_mut() {
            keep(&mut c.token, &self.client.token);
        }
        Config::from_file_config(fc)
    }

    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mode = match fc.mode.trim().to_ascii_lowercase().as_str() {
            "server" => Mode::Server,
            "client" => Mode::Client,
            other => anyhow::bail!("config: invalid mode {other:?} (expected server|client)"),
        };

        let web = fc.web.unwrap_or_default();
        let server = fc.server.unwrap_or_default();
        let client = fc.client.unwrap_or_default();
        let logging = fc.logging.unwrap_or_default();
        let timeouts = fc.timeouts.unwrap_or_default();

        let port_range = match server.port_range.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(r) => Some(r.parse::<PortRange>().context("config: server.port_range")?),
        };

        let mut tunnels: Vec<TunnelConfig> = Vec::new();
        for (i, t) in client.tunnels.unwrap_or_default().into_iter().enumerate() {
            let Some(t) = t.normalize() else {
                anyhow::bail!("config: client.tunnels[{i}]: empty name");
            };
            if t.local_addr.is_empty() {
                anyhow::bail!("config: client.tunnels[{i}] ({}): empty local_addr", t.name);
            }
            if tunnels.iter().any(|x| x.name == t.name) {
                anyhow::bail!("config: client.tunnels[{i}]: duplicate name {:?}", t.name);
            }
            tunnels.push(t);
        }

        let defaults = Timeouts::default();
        let ms = |v: Option<u64>, d: Duration| match v {
            Some(0) | None => d,
            Some(n) => Duration::from_millis(n),
        };

        let cfg = Config {
            mode,
            web: WebConfig {
                port: web.port.unwrap_or(0),
                username: web.username.unwrap_or_default(),
                password: web.password.unwrap_or_default(),
            },
            server: ServerConfig {
                control_port: server.control_port.unwrap_or(0),
                token: server.token.unwrap_or_default(),
                port_range,
                bind_host: server
                    .bind_host
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| "0.0.0.0".into()),
            },
            client: ClientConfig {
                server_addr: client.server_addr.unwrap_or_default().trim().to_string(),
                token: client.token.unwrap_or_default(),
                tunnels,
            },
            logging: LoggingConfig {
                level: logging.level.unwrap_or_else(|| "info".into()),
                format: logging.format.unwrap_or_else(|| "text".into()),
                output: logging.output.unwrap_or_else(|| "stderr".into()),
                add_source: logging.add_source,
            },
            timeouts: Timeouts {
                pending: ms(timeouts.pending_ms, defaults.pending),
                heartbeat: ms(timeouts.heartbeat_ms, defaults.heartbeat),
                retry_backoff: ms(timeouts.retry_backoff_ms, defaults.retry_backoff),
                dial: ms(timeouts.dial_ms, defaults.dial),
                response: ms(timeouts.response_ms, defaults.response),
                handshake: ms(timeouts.handshake_ms, defaults.handshake),
            },
        };

        match cfg.mode {
            Mode::Server if cfg.server.control_port == 0 => {
                anyhow::bail!("config: server.control_port is required in server mode")
            }
            Mode::Client if cfg.client.server_addr.is_empty() => {
                anyhow::bail!("config: client.server_addr is required in client mode")
            }
            _ => {}
        }

        Ok(cfg)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    web: Option<FileWeb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server: Option<FileServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client: Option<FileClient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logging: Option<FileLogging>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeouts: Option<FileTimeouts>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileWeb {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    control_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bind_host: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileClient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tunnels: Option<Vec<TunnelConfig>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileLogging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    heartbeat_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dial_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handshake_ms: Option<u64>,
}

impl From<&Config> for FileConfig {
    fn from(cfg: &Config) -> Self {
        let some = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let millis = |d: Duration| Some(d.as_millis() as u64);
        FileConfig {
            mode: cfg.mode.to_string(),
            web: Some(FileWeb {
                port: Some(cfg.web.port),
                username: some(&cfg.web.username),
                password: some(&cfg.web.password),
            }),
            server: Some(FileServer {
                control_port: (cfg.server.control_port != 0).then_some(cfg.server.control_port),
                token: some(&cfg.server.token),
                port_range: cfg.server.port_range.map(|r| r.to_string()),
                bind_host: some(&cfg.server.bind_host),
            }),
            client: Some(FileClient {
                server_addr: some(&cfg.client.server_addr),
                token: some(&cfg.client.token),
                tunnels: Some(cfg.client.tunnels.clone()),
            }),
            logging: Some(FileLogging {
                level: some(&cfg.logging.level),
                format: some(&cfg.logging.format),
                output: some(&cfg.logging.output),
                add_source: cfg.logging.add_source,
            }),
            timeouts: Some(FileTimeouts {
                pending_ms: millis(cfg.timeouts.pending),
                heartbeat_ms: millis(cfg.timeouts.heartbeat),
                retry_backoff_ms: millis(cfg.timeouts.retry_backoff),
                dial_ms: millis(cfg.timeouts.dial),
                response_ms: millis(cfg.timeouts.response),
                handshake_ms: millis(cfg.timeouts.handshake),
            }),
        }
    }
}

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
            "backhaul_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn loads_client_yaml_with_defaults() {
        let dir = temp_dir("client_yaml");
        let cfg_path = dir.join("backhaul.yaml");

        let yaml = r#"
mode: client
web:
  port: 8080
  username: admin
  password: secret
client:
  server_addr: " relay.example.com:7000 "
  token: T
  tunnels:
    - name: " web "
      local_addr: 127.0.0.1:80
      remote_port: 10080
    - name: ssh
      protocol: TCP
      local_addr: 127.0.0.1:22
      remote_port: 10022
"#;
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.mode, Mode::Client);
        assert_eq!(cfg.client.server_addr, "relay.example.com:7000");
        assert_eq!(cfg.client.tunnels.len(), 2);
        assert_eq!(cfg.client.tunnels[0].name, "web");
        assert_eq!(cfg.client.tunnels[0].protocol, "tcp");
        assert_eq!(cfg.client.tunnels[1].protocol, "tcp");
        assert_eq!(cfg.timeouts.pending, Duration::from_secs(10));
        assert_eq!(cfg.timeouts.retry_backoff, Duration::from_secs(5));
        assert_eq!(cfg.logging.level, "info");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_server_toml_with_port_range() {
        let dir = temp_dir("server_toml");
        let cfg_path = dir.join("backhaul.toml");

        let toml = r#"
mode = "server"

[server]
control_port = 7000
token = "T"
port_range = "10000-10100"

[timeouts]
pending_ms = 2500
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");

        assert_eq!(cfg.mode, Mode::Server);
        assert_eq!(cfg.server.control_port, 7000);
        assert_eq!(
            cfg.server.port_range,
            Some(PortRange {
                min: 10000,
                max: 10100
            })
        );
        assert_eq!(cfg.server.bind_host, "0.0.0.0");
        assert_eq!(cfg.timeouts.pending, Duration::from_millis(2500));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_bad_documents() {
        let dir = temp_dir("bad");
        let cfg_path = dir.join("backhaul.yaml");

        let cases = [
            ("mode: relay\n", "invalid mode"),
            ("mode: server\nserver:\n  control_port: 7000\n  port_range: \"20-10\"\n", "port_range"),
            ("mode: server\n", "control_port"),
            ("mode: client\n", "server_addr"),
            (
                "mode: client\nclient:\n  server_addr: r:1\n  tunnels:\n    - {name: a, local_addr: x, remote_port: 1}\n    - {name: a, local_addr: y, remote_port: 2}\n",
                "duplicate name",
            ),
            ("mode: server\nlisteners: []\n", "listeners"),
        ];
        for (doc, needle) in cases {
            std::fs::write(&cfg_path, doc).expect("write");
            let err = load_config(&cfg_path).unwrap_err();
            let msg = format!("{err:#}");
            assert!(msg.contains(needle), "expected {needle:?} in {msg:?}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn save_then_load_keeps_tunnels() {
        let dir = temp_dir("save");
        let docs = [
            (
                "backhaul.yaml",
                "mode: client\nclient:\n  server_addr: r:7000\n  token: T\n",
            ),
            (
                "backhaul.toml",
                "mode = \"client\"\n[client]\nserver_addr = \"r:7000\"\ntoken = \"T\"\n",
            ),
        ];
        for (name, doc) in docs {
            let cfg_path = dir.join(name);
            std::fs::write(&cfg_path, doc).expect("write");

            let mut cfg = load_config(&cfg_path).expect("load");
            cfg.client.tunnels.push(TunnelConfig {
                name: "web".into(),
                protocol: "tcp".into(),
                local_addr: "127.0.0.1:80".into(),
                remote_port: 10080,
            });
            save_config(&cfg_path, &cfg).expect("save");

            let back = load_config(&cfg_path).expect("reload");
            assert_eq!(back.client.tunnels, cfg.client.tunnels);
            assert_eq!(back.client.token, "T");
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn redacted_masks_secrets() {
        let cfg = Config {
            mode: Mode::Server,
            web: WebConfig {
                port: 8080,
                username: "admin".into(),
                password: "pw".into(),
            },
            server: ServerConfig {
                control_port: 7000,
                token: "T".into(),
                port_range: None,
                bind_host: "0.0.0.0".into(),
            },
            client: ClientConfig::default(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            timeouts: Timeouts::default(),
        };
        let v = cfg.redacted();
        assert_eq!(v["web"]["username"], "admin");
        assert_eq!(v["web"]["password"], "********");
        assert_eq!(v["server"]["token"], "********");
        assert_eq!(v["server"]["control_port"], 7000);
    }

    #[test]
    fn replacement_keeps_masked_secrets() {
        let dir = temp_dir("replace");
        let cfg_path = dir.join("backhaul.yaml");
        std::fs::write(
            &cfg_path,
            "mode: server
web:
  port: 8080
  username: admin
  password: pw
server:
  control_port: 7000
  token: T
",
        )
        .expect("write");
        let cfg = load_config(&cfg_path).expect("load");

        let mut doc = cfg.redacted();
        doc["server"]["control_port"] = serde_json::json!(7100);
        doc["server"]["port_range"] = serde_json::json!("10000-10100");
        let next = cfg.replaced_by(doc).expect("replace");
        assert_eq!(next.server.control_port, 7100);
        assert_eq!(next.server.token, "T");
        assert_eq!(next.web.password, "pw");
        assert!(next.server.port_range.is_some());

        // A new secret replaces the old one.
        let mut doc = cfg.redacted();
        doc["server"]["token"] = serde_json::json!("T2");
        assert_eq!(cfg.replaced_by(doc).expect("replace").server.token, "T2");

        for bad in [
            serde_json::json!({"mode": "relay"}),
            serde_json::json!({"mode": "server"}),
            serde_json::json!({"mode": "server", "listeners": []}),
            serde_json::json!([1, 2]),
        ] {
            assert!(cfg.replaced_by(bad).is_err());
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
