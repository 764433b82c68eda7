//! Configuration loaded from environment variables.

use std::env;

use anyhow::{Context, Result};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL connection URL. Optional: only the Postgres storage
    /// adapter needs it; tests and in-memory stores do not.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// URL prefix for resource links (default: /api).
    pub public_url: String,

    /// Maximum page size a client may request (default: 100).
    pub max_page_size: u32,

    /// Default page size when the client does not specify one (default: 20).
    pub default_page_size: u32,

    /// Expose internal error detail in error documents (default: false).
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            public_url: "/api".to_string(),
            max_page_size: 100,
            default_page_size: 20,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").ok();

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let public_url = env::var("PUBLIC_URL").unwrap_or_else(|_| "/api".to_string());

        let max_page_size = env::var("MAX_PAGE_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .context("MAX_PAGE_SIZE must be a valid u32")?;

        let default_page_size = env::var("DEFAULT_PAGE_SIZE")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .context("DEFAULT_PAGE_SIZE must be a valid u32")?;

        let debug = env::var("DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            database_max_connections,
            public_url: public_url.trim_end_matches('/').to_string(),
            max_page_size,
            default_page_size,
            debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.public_url, "/api");
        assert_eq!(config.max_page_size, 100);
        assert_eq!(config.default_page_size, 20);
        assert!(!config.debug);
    }
}
