//! Engine configuration loaded from TOML.
//!
//! ```toml
//! [query]
//! max_filter_nodes = 100
//! default_page_max_size = 50
//!
//! [render]
//! links = true
//! url_prefix = "/api"
//!
//! [store]
//! backend = "redis"
//! redis_url = "${REDIS_URL}"
//! namespace = "chinook"
//! ```
//!
//! Every section and key is optional. `${NAME}` in string values expands to
//! the environment variable (empty when unset).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::RenderOptions;
use crate::query::{DEFAULT_MAX_FILTER_NODES, ParserOptions};

static ENV_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env pattern should compile"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub query: QueryConfig,
    pub render: RenderOptions,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Ceiling on filter nodes per request, flat and structured combined.
    pub max_filter_nodes: usize,
    /// Page size for resources without their own `page_max_size`.
    pub default_page_max_size: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_filter_nodes: DEFAULT_MAX_FILTER_NODES,
            default_page_max_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub redis_url: String,
    /// Prefix of every Redis key.
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "${REDIS_URL}".to_string(),
            namespace: "nestql".to_string(),
        }
    }
}

impl StoreConfig {
    /// The Redis URL with environment references expanded; `None` when empty.
    pub fn resolved_redis_url(&self) -> Option<String> {
        let url = expand_env(&self.redis_url);
        let url = url.trim();
        (!url.is_empty()).then(|| url.to_string())
    }
}

impl EngineConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("config `{}` not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = toml::from_str(raw)?;
        config.render.url_prefix = expand_env(&config.render.url_prefix);
        config.store.namespace = expand_env(&config.store.namespace);
        Ok(config)
    }

    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            max_filter_nodes: self.query.max_filter_nodes,
            default_page_max_size: self.query.default_page_max_size,
        }
    }
}

/// Replaces `${NAME}` with the value of the environment variable `NAME`.
pub fn expand_env(raw: &str) -> String {
    ENV_PATTERN
        .replace_all(raw, |captures: &Captures<'_>| std::env::var(&captures[1]).unwrap_or_default())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = EngineConfig::from_toml_str("[render]\nlinks = true\n").unwrap();
        assert!(config.render.links);
        assert_eq!(config.render.url_prefix, "");
        assert_eq!(config.query.max_filter_nodes, DEFAULT_MAX_FILTER_NODES);
        assert_eq!(config.store.backend, Backend::Memory);
        assert_eq!(config.store.namespace, "nestql");
    }

    #[test]
    fn loads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[query]\nmax_filter_nodes = 12\ndefault_page_max_size = 25\n\n[store]\nbackend = \"redis\"\nredis_url = \"redis://127.0.0.1:6379/3\"\nnamespace = \"chinook\""
        )
        .unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(
            config.parser_options(),
            ParserOptions {
                max_filter_nodes: 12,
                default_page_max_size: Some(25),
            }
        );
        assert_eq!(config.store.backend, Backend::Redis);
        assert_eq!(
            config.store.resolved_redis_url().as_deref(),
            Some("redis://127.0.0.1:6379/3")
        );
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn malformed_files_are_errors() {
        assert!(matches!(
            EngineConfig::from_toml_str("[query]\nmax_filter_nodes = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn expands_environment_references() {
        let expanded = expand_env("${NESTQL_CONFIG_TEST_SURELY_UNSET}/api");
        assert_eq!(expanded, "/api");
        let path = std::env::var("PATH").unwrap_or_default();
        assert_eq!(expand_env("${PATH}"), path);
    }
}
