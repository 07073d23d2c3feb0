use std::{
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

use crate::backhaul::{
    net,
    tunnel::{client::LocalTunnel, protocol::Protocol},
};

pub const DEFAULT_SERVER: &str = "127.0.0.1";
pub const DEFAULT_CONTROL_PORT: u16 = 5000;
pub const DEFAULT_SECRET: &str = "changeme";
pub const CONFIG_ENV: &str = "BACKHAUL_CONFIG";

const CANDIDATES: [&str; 5] = [
    "backhaul.json",
    "config.json",
    "backhaul.toml",
    "backhaul.yaml",
    "backhaul.yml",
];

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
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
        }
    }
}

/// Locate the client config: explicit flag, then `BACKHAUL_CONFIG`, then the
/// first known file name in the working directory.
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

    // clap maps the env var into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: PathBuf::from(p),
                source: ConfigPathSource::Env,
            });
        }
    }

    let path = discover_config_path(Path::new("."))?;
    Ok(ResolvedConfigPath {
        path,
        source: ConfigPathSource::Cwd,
    })
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CANDIDATES {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!(
        "config: no client config found in {} (tried {})",
        dir.display(),
        CANDIDATES.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
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

impl LoggingConfig {
    /// Overlay the fields a config file sets.
    pub fn apply(&mut self, o: &LoggingOverrides) {
        if let Some(v) = &o.level {
            self.level = v.clone();
        }
        if let Some(v) = &o.format {
            self.format = v.clone();
        }
        if let Some(v) = &o.output {
            self.output = v.clone();
        }
        if let Some(v) = o.add_source {
            self.add_source = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoggingOverrides {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub add_source: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub control_port: u16,
    pub secret: String,
    pub tunnels: Vec<LocalTunnel>,
    pub logging: Option<LoggingOverrides>,
}

impl ClientConfig {
    pub fn server_addr(&self) -> String {
        net::join_host_port(&self.server, self.control_port)
    }

    pub fn uses_default_secret(&self) -> bool {
        self.secret == DEFAULT_SECRET
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct FileConfig {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    control_port: Option<u16>,
    #[serde(default)]
    secret: Option<String>,
    tunnels: Vec<FileTunnel>,
    #[serde(default)]
    logging: Option<LoggingOverrides>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    #[serde(default)]
    protocol: Option<String>,
    local: u16,
    #[serde(default)]
    remote: u16,
    #[serde(default)]
    host: Option<String>,
}

pub fn load_client_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("json")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "json" => serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?,
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    ClientConfig::from_file_config(fc)
}

impl ClientConfig {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Self> {
        let server = match fc.server.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => DEFAULT_SERVER.to_string(),
        };
        let control_port = fc.control_port.unwrap_or(DEFAULT_CONTROL_PORT);
        if control_port == 0 {
            anyhow::bail!("config: controlPort must be non-zero");
        }

        let tunnels = fc
            .tunnels
            .iter()
            .enumerate()
            .map(|(i, t)| parse_tunnel(t).with_context(|| format!("config: tunnels[{i}]")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            server,
            control_port,
            secret: fc.secret.unwrap_or_else(|| DEFAULT_SECRET.to_string()),
            tunnels,
            logging: fc.logging,
        })
    }
}

fn parse_tunnel(t: &FileTunnel) -> anyhow::Result<LocalTunnel> {
    let protocol = match t
        .protocol
        .as_deref()
        .map(|p| p.trim().to_ascii_lowercase())
        .as_deref()
    {
        None | Some("tcp") => Protocol::Tcp,
        Some("udp") => Protocol::Udp,
        Some(other) => anyhow::bail!("unsupported protocol {other:?} (expected tcp or udp)"),
    };

    if t.local == 0 {
        anyhow::bail!("local port must be non-zero");
    }

    let host = match t.host.as_deref().map(str::trim) {
        None | Some("") => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Some(h) => h
            .parse::<IpAddr>()
            .with_context(|| format!("host {h:?} is not an IP address"))?,
    };

    Ok(LocalTunnel {
        protocol,
        target: SocketAddr::new(host, t.local),
        remote: t.remote,
    })
}
