//! Service configuration: a TOML file merged with environment/CLI overrides.
//!
//! Lookup order for the file is an explicit `--config` path, then
//! `$XDG_CONFIG_HOME/fabricview/config.toml`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{FabricError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub graph: GraphConfig,
    pub columnar: ColumnarConfig,
    pub cache: CacheConfig,
    pub timeline: TimelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Whole-request deadline shared by all sub-queries.
    pub request_timeout_secs: u64,
    pub allow_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Deadline for a single graph call.
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ColumnarConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Refresh interval for precomputed composites, in seconds.
    pub refresh_interval_secs: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Owner pubkeys hidden from the user CDC stream unless a request opts
    /// in with `include_internal`.
    pub internal_owner_pubkeys: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            graph: GraphConfig::default(),
            columnar: ColumnarConfig::default(),
            cache: CacheConfig::default(),
            timeline: TimelineConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            request_timeout_secs: 15,
            allow_origins: Vec::new(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            query_timeout_secs: 10,
        }
    }
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            query_timeout_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            enabled: true,
        }
    }
}

impl Config {
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            FabricError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|err| FabricError::Config(format!("cannot parse {}: {err}", path.display())))
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fabricview").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_local() {
        let config = Config::default();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.graph.uri, "bolt://localhost:7687");
        assert_eq!(config.cache.refresh_interval_secs, 60);
        assert!(config.cache.enabled);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [http]
            port = 9090

            [cache]
            refresh_interval_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.cache.refresh_interval_secs, 30);
        // untouched sections keep their defaults
        assert_eq!(config.columnar.database, "default");
    }
}
