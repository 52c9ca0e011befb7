use std::env;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::ingest::{CommitMode, FailurePolicy, IngestOptions};
use crate::sheet::DEFAULT_SHEET;

pub const DEFAULT_DGRAPH_URL: &str = "http://localhost:8080";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Dgraph,
    Postgres,
    Memory,
}

impl StoreBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Dgraph => "dgraph",
            StoreBackend::Postgres => "postgres",
            StoreBackend::Memory => "memory",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreBackend {
    type Err = LibError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dgraph" => Ok(StoreBackend::Dgraph),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(LibError::invalid(
                "Unknown graph store backend",
                anyhow!("IMEI_GRAPH_STORE={other:?}; expected dgraph, postgres or memory"),
            )),
        }
    }
}

/// Runtime settings for one ingestion run.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub backend: StoreBackend,
    pub dgraph_url: String,
    pub database_url: Option<String>,
    /// gRPC file server; `None` reads the input path from the local filesystem.
    pub file_server: Option<String>,
    pub sheet: String,
    pub max_connections: u32,
    pub options: IngestOptions,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            dgraph_url: DEFAULT_DGRAPH_URL.to_string(),
            database_url: None,
            file_server: None,
            sheet: DEFAULT_SHEET.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            options: IngestOptions::default(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let backend = match value("IMEI_GRAPH_STORE") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::default(),
        };
        let database_url = value("DATABASE_URL");
        if backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(LibError::invalid(
                "DATABASE_URL is required for the postgres store",
                anyhow!("IMEI_GRAPH_STORE=postgres without DATABASE_URL"),
            ));
        }
        let max_connections = match value("IMEI_GRAPH_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|max| *max > 0)
                .ok_or_else(|| {
                    LibError::invalid(
                        "Invalid connection pool size",
                        anyhow!("IMEI_GRAPH_MAX_CONNECTIONS={raw:?}"),
                    )
                })?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let failure_policy = if is_flag_set(value("IMEI_GRAPH_SKIP_FAILED")) {
            FailurePolicy::SkipFailed
        } else {
            FailurePolicy::FailFast
        };
        let commit_mode = if is_flag_set(value("IMEI_GRAPH_ATOMIC")) {
            CommitMode::Atomic
        } else {
            CommitMode::PerStep
        };

        Ok(Self {
            backend,
            dgraph_url: value("IMEI_GRAPH_DGRAPH_URL")
                .unwrap_or_else(|| DEFAULT_DGRAPH_URL.to_string()),
            database_url,
            file_server: value("IMEI_GRAPH_FILE_SERVER"),
            sheet: value("IMEI_GRAPH_SHEET").unwrap_or_else(|| DEFAULT_SHEET.to_string()),
            max_connections,
            options: IngestOptions {
                failure_policy,
                commit_mode,
            },
        })
    }
}

fn is_flag_set(value: Option<String>) -> bool {
    match value {
        Some(value) => {
            let normalized = value.to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;

    fn config(vars: &[(&str, &str)]) -> Result<IngestConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IngestConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        assert_eq!(config(&[]).unwrap(), IngestConfig::default());
        let defaults = IngestConfig::default();
        assert_eq!(defaults.backend, StoreBackend::Dgraph);
        assert_eq!(defaults.sheet, "Sheet1");
        assert_eq!(defaults.options.failure_policy, FailurePolicy::FailFast);
        assert_eq!(defaults.options.commit_mode, CommitMode::PerStep);
    }

    #[test]
    fn flags_accept_common_spellings() {
        for raw in ["1", "true", "YES", " True "] {
            let cfg = config(&[("IMEI_GRAPH_SKIP_FAILED", raw), ("IMEI_GRAPH_ATOMIC", raw)])
                .unwrap();
            assert_eq!(cfg.options.failure_policy, FailurePolicy::SkipFailed);
            assert_eq!(cfg.options.commit_mode, CommitMode::Atomic);
        }
        let cfg = config(&[("IMEI_GRAPH_SKIP_FAILED", "no")]).unwrap();
        assert_eq!(cfg.options.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = config(&[("IMEI_GRAPH_STORE", "postgres")]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let cfg = config(&[
            ("IMEI_GRAPH_STORE", "Postgres"),
            ("DATABASE_URL", "postgres://localhost/calls"),
            ("IMEI_GRAPH_MAX_CONNECTIONS", "12"),
        ])
        .unwrap();
        assert_eq!(cfg.backend, StoreBackend::Postgres);
        assert_eq!(cfg.max_connections, 12);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(config(&[("IMEI_GRAPH_STORE", "neo4j")]).is_err());
        assert!(config(&[("IMEI_GRAPH_MAX_CONNECTIONS", "0")]).is_err());
        assert!(config(&[("IMEI_GRAPH_MAX_CONNECTIONS", "many")]).is_err());
    }

    #[test]
    fn file_server_and_sheet_are_read() {
        let cfg = config(&[
            ("IMEI_GRAPH_FILE_SERVER", "http://files:50051"),
            ("IMEI_GRAPH_SHEET", "Calls"),
            ("IMEI_GRAPH_DGRAPH_URL", "http://alpha:8080"),
        ])
        .unwrap();
        assert_eq!(cfg.file_server.as_deref(), Some("http://files:50051"));
        assert_eq!(cfg.sheet, "Calls");
        assert_eq!(cfg.dgraph_url, "http://alpha:8080");
    }
}
