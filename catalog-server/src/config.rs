use axum::http::HeaderValue;
use catalog_core::{CatalogError, CatalogStoreOptions, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration.
///
/// Layered as built-in defaults, then the optional config file, then
/// `CATALOG_*` environment variables. `FRONT_URL` wins over all of them for
/// the permitted browser origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub image_dir: PathBuf,
    pub default_image: String,
    pub front_url: String,
    pub request_timeout_ms: u64,
    pub pool_max_size: u32,
    pub max_upload_bytes: usize,
}

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";
const DEFAULT_DATABASE_PATH: &str = "db/catalog.sqlite3";
const DEFAULT_IMAGE_DIR: &str = "images";
const DEFAULT_IMAGE: &str = "default.jpg";
const DEFAULT_FRONT_URL: &str = "http://localhost:3000";
const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 10_000;
const DEFAULT_POOL_MAX_SIZE: i64 = 8;
const DEFAULT_MAX_UPLOAD_BYTES: i64 = 10 * 1024 * 1024;

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let front_url = std::env::var("FRONT_URL")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let settings = ::config::Config::builder()
            .set_default("bind_addr", DEFAULT_BIND_ADDR)
            .and_then(|b| b.set_default("database_path", DEFAULT_DATABASE_PATH))
            .and_then(|b| b.set_default("image_dir", DEFAULT_IMAGE_DIR))
            .and_then(|b| b.set_default("default_image", DEFAULT_IMAGE))
            .and_then(|b| b.set_default("front_url", DEFAULT_FRONT_URL))
            .and_then(|b| b.set_default("request_timeout_ms", DEFAULT_REQUEST_TIMEOUT_MS))
            .and_then(|b| b.set_default("pool_max_size", DEFAULT_POOL_MAX_SIZE))
            .and_then(|b| b.set_default("max_upload_bytes", DEFAULT_MAX_UPLOAD_BYTES))
            .map_err(|e| CatalogError::Config(e.to_string()))?
            .add_source(::config::File::with_name(path).required(false))
            .add_source(::config::Environment::with_prefix("CATALOG").try_parsing(true))
            .set_override_option("front_url", front_url)
            .map_err(|e| CatalogError::Config(e.to_string()))?
            .build()
            .map_err(|e| CatalogError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CatalogError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(CatalogError::Config("bind_addr cannot be empty".to_string()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(CatalogError::Config("database_path cannot be empty".to_string()));
        }
        if self.image_dir.as_os_str().is_empty() {
            return Err(CatalogError::Config("image_dir cannot be empty".to_string()));
        }
        if self.default_image.trim().is_empty() || self.default_image.contains(['/', '\\']) {
            return Err(CatalogError::Config(format!(
                "default_image must be a plain file name, got '{}'",
                self.default_image
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(CatalogError::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.pool_max_size == 0 {
            return Err(CatalogError::Config("pool_max_size must be positive".to_string()));
        }
        self.cors_origin()?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cors_origin(&self) -> Result<HeaderValue> {
        HeaderValue::from_str(self.front_url.trim_end_matches('/')).map_err(|e| {
            CatalogError::Config(format!("invalid front_url '{}': {}", self.front_url, e))
        })
    }

    pub fn store_options(&self) -> CatalogStoreOptions {
        CatalogStoreOptions {
            max_connections: self.pool_max_size,
            ..CatalogStoreOptions::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            default_image: DEFAULT_IMAGE.to_string(),
            front_url: DEFAULT_FRONT_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS as u64,
            pool_max_size: DEFAULT_POOL_MAX_SIZE as u32,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");

        let config = Config::from_file(path.to_str().unwrap()).unwrap();

        assert_eq!(config.image_dir, PathBuf::from("images"));
        assert_eq!(config.default_image, "default.jpg");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.pool_max_size, 8);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            "image_dir: /srv/images\nrequest_timeout_ms: 2500\npool_max_size: 2\n",
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();

        assert_eq!(config.image_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.store_options().max_connections, 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.request_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(CatalogError::Config(_))));

        let mut config = Config::default();
        config.default_image = "../default.jpg".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.front_url = "http://bad\norigin".to_string();
        assert!(config.validate().is_err());
    }
}
