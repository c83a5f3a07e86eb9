use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub api_key: Option<String>,
    pub default_table: String,
    pub schema_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub translator: TranslatorSettings,
}

/// Knobs consumed by the aggregation compiler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorSettings {
    /// Upper bound on synthetic empty buckets added by histogram gap filling.
    pub max_empty_buckets: usize,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            max_empty_buckets: default_max_empty_buckets(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    aggql_listen_addr: Option<String>,
    #[serde(default)]
    aggql_listen_host: Option<String>,
    #[serde(default)]
    aggql_listen_port: Option<u16>,
    #[serde(default)]
    aggql_api_key: Option<String>,
    #[serde(default = "default_table")]
    aggql_default_table: String,
    #[serde(default)]
    aggql_schema_path: Option<String>,
    #[serde(default = "default_timeout_secs")]
    aggql_request_timeout_secs: u64,
    #[serde(default = "default_max_empty_buckets")]
    aggql_max_empty_buckets: usize,
}

fn default_table() -> String {
    "logs".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_empty_buckets() -> usize {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse AGGQL_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.aggql_listen_addr,
            raw.aggql_listen_host,
            raw.aggql_listen_port,
        )?;

        let default_table = raw.aggql_default_table.trim().to_string();
        if default_table.is_empty() {
            anyhow::bail!("AGGQL_DEFAULT_TABLE must not be empty");
        }

        let schema_path = raw
            .aggql_schema_path
            .map(|path| path.trim().to_string())
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            listen_addr,
            api_key: raw.aggql_api_key.filter(|key| !key.is_empty()),
            default_table,
            schema_path,
            request_timeout: Duration::from_secs(raw.aggql_request_timeout_secs.max(1)),
            translator: TranslatorSettings {
                max_empty_buckets: raw.aggql_max_empty_buckets,
            },
        })
    }

    /// Configuration used by tests and embedders that never touch the environment.
    pub fn embedded(default_table: impl Into<String>) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            api_key: None,
            default_table: default_table.into(),
            schema_path: None,
            request_timeout: Duration::from_secs(default_timeout_secs()),
            translator: TranslatorSettings::default(),
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid AGGQL_LISTEN_ADDR value")?
            .next()
            .context("AGGQL_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8481);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid aggql listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_host_and_port() {
        let addr = resolve_addr(None, Some("127.0.0.1".into()), Some(9000)).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
    }

    #[test]
    fn explicit_addr_wins() {
        let addr = resolve_addr(
            Some("127.0.0.1:7000".into()),
            Some("10.0.0.1".into()),
            Some(9000),
        )
        .unwrap();
        assert_eq!(addr.port(), 7000);
    }

    #[test]
    fn defaults_to_wildcard_listener() {
        let addr = resolve_addr(None, None, None).unwrap();
        assert_eq!(addr.port(), 8481);
    }
}
