use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use receiptgate_store::StoreOptions;

/// Immutable configuration snapshot, captured once at boot from
/// `RECEIPTGATE_*` environment variables. Nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind: SocketAddr,
    pub service_name: String,
    pub default_tenant_id: String,
    pub api_key: Option<String>,
    pub allow_insecure_dev: bool,
    pub auto_migrate_on_startup: bool,
    pub receipt_body_max_bytes: usize,
    pub enable_graph_layer: bool,
    pub enable_semantic_layer: bool,
    pub chain_max_depth: usize,
    pub search_default_limit: usize,
    pub search_max_limit: usize,
    pub request_timeout: Duration,
    pub db_pool_max_connections: u32,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    /// Returns a configuration error (exit code 1 territory) for malformed
    /// values or a missing API key outside insecure-dev mode.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |suffix: &str| lookup(&format!("RECEIPTGATE_{suffix}"));

        let database_url = get("DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .unwrap_or_else(|| "sqlite:///./receiptgate.db".to_string());

        let bind: SocketAddr = match get("BIND") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("RECEIPTGATE_BIND is not a socket address: {raw}"))?,
            None => SocketAddr::from(([127, 0, 0, 1], 8000)),
        };

        let allow_insecure_dev = parse_bool(get("ALLOW_INSECURE_DEV").as_deref())?;
        let api_key = get("API_KEY").filter(|key| !key.is_empty());
        if api_key.is_none() && !allow_insecure_dev {
            bail!(
                "RECEIPTGATE_API_KEY is required unless RECEIPTGATE_ALLOW_INSECURE_DEV=true"
            );
        }

        let auto_migrate_on_startup = match get("AUTO_MIGRATE_ON_STARTUP") {
            Some(raw) => parse_bool(Some(&raw))?,
            None => true,
        };

        let receipt_body_max_bytes =
            parse_positive(get("RECEIPT_BODY_MAX_BYTES").as_deref(), 262_144)
                .context("RECEIPTGATE_RECEIPT_BODY_MAX_BYTES")?;
        let chain_max_depth = parse_positive(
            get("CHAIN_MAX_DEPTH").as_deref(),
            receiptgate_store::DEFAULT_CHAIN_DEPTH,
        )
        .context("RECEIPTGATE_CHAIN_MAX_DEPTH")?;
        if chain_max_depth > receiptgate_store::MAX_CHAIN_DEPTH {
            bail!(
                "RECEIPTGATE_CHAIN_MAX_DEPTH may not exceed {}",
                receiptgate_store::MAX_CHAIN_DEPTH
            );
        }
        let search_default_limit = parse_positive(get("SEARCH_DEFAULT_LIMIT").as_deref(), 50)
            .context("RECEIPTGATE_SEARCH_DEFAULT_LIMIT")?;
        let search_max_limit = parse_positive(get("SEARCH_MAX_LIMIT").as_deref(), 500)
            .context("RECEIPTGATE_SEARCH_MAX_LIMIT")?;
        if search_max_limit < search_default_limit {
            bail!("RECEIPTGATE_SEARCH_MAX_LIMIT must be >= RECEIPTGATE_SEARCH_DEFAULT_LIMIT");
        }

        let request_timeout_secs = parse_positive(get("REQUEST_TIMEOUT_SECS").as_deref(), 30)
            .context("RECEIPTGATE_REQUEST_TIMEOUT_SECS")?;
        let db_pool_max_connections = parse_positive(get("DB_POOL_MAX_CONNECTIONS").as_deref(), 5)
            .context("RECEIPTGATE_DB_POOL_MAX_CONNECTIONS")? as u32;

        Ok(Self {
            database_url,
            bind,
            service_name: get("SERVICE_NAME").unwrap_or_else(|| "receiptgate".to_string()),
            default_tenant_id: get("DEFAULT_TENANT_ID").unwrap_or_else(|| "default".to_string()),
            api_key,
            allow_insecure_dev,
            auto_migrate_on_startup,
            receipt_body_max_bytes,
            enable_graph_layer: parse_bool(get("ENABLE_GRAPH_LAYER").as_deref())?,
            enable_semantic_layer: parse_bool(get("ENABLE_SEMANTIC_LAYER").as_deref())?,
            chain_max_depth,
            search_default_limit,
            search_max_limit,
            request_timeout: Duration::from_secs(request_timeout_secs as u64),
            db_pool_max_connections,
        })
    }

    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            tenant_id: self.default_tenant_id.clone(),
            enable_graph_layer: self.enable_graph_layer,
            enable_semantic_layer: self.enable_semantic_layer,
            pool_max_connections: self.db_pool_max_connections,
        }
    }
}

fn parse_bool(raw: Option<&str>) -> Result<bool> {
    match raw {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("expected a boolean, got {other:?}"),
        },
    }
}

fn parse_positive(raw: Option<&str>, default: usize) -> Result<usize> {
    match raw {
        None => Ok(default),
        Some(value) => {
            let parsed: usize = value
                .parse()
                .with_context(|| format!("expected a positive integer, got {value:?}"))?;
            if parsed == 0 {
                bail!("value must be positive");
            }
            Ok(parsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn api_key_is_required_outside_insecure_dev() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("RECEIPTGATE_API_KEY"));

        let config = config_from(&[("RECEIPTGATE_ALLOW_INSECURE_DEV", "true")]).unwrap();
        assert!(config.api_key.is_none());
        assert!(config.allow_insecure_dev);

        let config = config_from(&[("RECEIPTGATE_API_KEY", "rg_secret")]).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("rg_secret"));
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = config_from(&[("RECEIPTGATE_ALLOW_INSECURE_DEV", "true")]).unwrap();
        assert_eq!(config.database_url, "sqlite:///./receiptgate.db");
        assert_eq!(config.receipt_body_max_bytes, 262_144);
        assert_eq!(config.chain_max_depth, 64);
        assert_eq!(config.search_default_limit, 50);
        assert_eq!(config.search_max_limit, 500);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.auto_migrate_on_startup);
        assert!(!config.enable_graph_layer);
    }

    #[test]
    fn global_database_url_is_a_fallback_only() {
        let config = config_from(&[
            ("RECEIPTGATE_ALLOW_INSECURE_DEV", "true"),
            ("DATABASE_URL", "postgres://global/db"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "postgres://global/db");

        let config = config_from(&[
            ("RECEIPTGATE_ALLOW_INSECURE_DEV", "true"),
            ("RECEIPTGATE_DATABASE_URL", "sqlite::memory:"),
            ("DATABASE_URL", "postgres://global/db"),
        ])
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn limit_ordering_is_validated() {
        let err = config_from(&[
            ("RECEIPTGATE_ALLOW_INSECURE_DEV", "true"),
            ("RECEIPTGATE_SEARCH_DEFAULT_LIMIT", "100"),
            ("RECEIPTGATE_SEARCH_MAX_LIMIT", "10"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("SEARCH_MAX_LIMIT"));
    }

    #[test]
    fn malformed_numbers_and_bools_are_rejected() {
        assert!(config_from(&[
            ("RECEIPTGATE_ALLOW_INSECURE_DEV", "true"),
            ("RECEIPTGATE_RECEIPT_BODY_MAX_BYTES", "lots"),
        ])
        .is_err());
        assert!(config_from(&[("RECEIPTGATE_ALLOW_INSECURE_DEV", "maybe")]).is_err());
        assert!(config_from(&[
            ("RECEIPTGATE_ALLOW_INSECURE_DEV", "true"),
            ("RECEIPTGATE_CHAIN_MAX_DEPTH", "0"),
        ])
        .is_err());
    }
}
