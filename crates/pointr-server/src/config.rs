// Configuration loading and validation (config/pointr.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use pointr_core::feed::DEFAULT_FEED_CAPACITY;

const CONFIG_FILE: &str = "pointr.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// pointr.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:` for a throwaway store.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Events buffered per subscriber before it is told it lagged.
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is
    /// unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load `config/pointr.toml` relative to `base_dir`, without copying
/// defaults. Prefer `load_config()` for normal startup.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    validate(&config)?;

    Ok(config)
}

/// Copy `defaults/pointr.toml` to `config/pointr.toml` if the latter does
/// not exist yet. Returns the path written, if any.
pub fn ensure_config_files(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let config_dir = base_dir.join("config");
    let target = config_dir.join(CONFIG_FILE);

    if target.exists() {
        return Ok(None);
    }
    if !source.exists() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither defaults/{CONFIG_FILE} nor config/{CONFIG_FILE} found in {}",
                base_dir.display()
            ),
        });
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;
    std::fs::copy(&source, &target).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to copy {}: {e}", source.display()),
    })?;

    Ok(Some(target))
}

/// Convenience wrapper: loads config relative to the current working
/// directory, seeding it from the shipped defaults first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.bind.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "server.bind".into(),
            message: "must not be empty".into(),
        });
    }

    if config.database.path.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }

    if config.feed.capacity == 0 {
        return Err(ConfigError::ValidationError {
            field: "feed.capacity".into(),
            message: "must be greater than 0".into(),
        });
    }

    if let Err(e) = tracing_subscriber::EnvFilter::try_new(&config.logging.filter) {
        return Err(ConfigError::ValidationError {
            field: "logging.filter".into(),
            message: e.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// The crate root, where `defaults/` lives; `cargo test` runs here.
    fn crate_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    }

    fn write_config(dir: &Path, text: &str) {
        fs::create_dir_all(dir.join("config")).unwrap();
        fs::write(dir.join("config").join(CONFIG_FILE), text).unwrap();
    }

    #[test]
    fn shipped_defaults_load() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("defaults")).unwrap();
        fs::copy(
            crate_root().join("defaults").join(CONFIG_FILE),
            tmp.path().join("defaults").join(CONFIG_FILE),
        )
        .unwrap();

        let copied = ensure_config_files(tmp.path()).unwrap();
        assert!(copied.is_some());
        let config = load_config_from(tmp.path()).unwrap();

        assert_eq!(config.server.address(), "127.0.0.1:9017");
        assert_eq!(config.database.path, "pointr.db");
        assert_eq!(config.feed.capacity, 256);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn optional_sections_fall_back() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            "[server]\nbind = \"0.0.0.0\"\nport = 8080\n\n[database]\npath = \":memory:\"\n",
        );

        let config = load_config_from(tmp.path()).unwrap();
        assert_eq!(config.feed.capacity, DEFAULT_FEED_CAPACITY);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn ensure_config_files_keeps_existing() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "# custom\n");

        assert_eq!(ensure_config_files(tmp.path()).unwrap(), None);
        let content = fs::read_to_string(tmp.path().join("config").join(CONFIG_FILE)).unwrap();
        assert_eq!(content, "# custom\n");
    }

    #[test]
    fn ensure_config_files_errors_without_any_source() {
        let tmp = tempfile::tempdir().unwrap();
        match ensure_config_files(tmp.path()).unwrap_err() {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("neither defaults/"));
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }
    }

    #[test]
    fn missing_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        match load_config_from(tmp.path()).unwrap_err() {
            ConfigError::FileNotFound { path } => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected FileNotFound, got: {other}"),
        }
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "this is not valid [[[ toml");
        match load_config_from(tmp.path()).unwrap_err() {
            ConfigError::ParseError { path, .. } => assert!(path.ends_with(CONFIG_FILE)),
            other => panic!("expected ParseError, got: {other}"),
        }
    }

    #[test]
    fn rejects_zero_feed_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            "[server]\nbind = \"127.0.0.1\"\nport = 1\n\n[database]\npath = \"x.db\"\n\n[feed]\ncapacity = 0\n",
        );
        match load_config_from(tmp.path()).unwrap_err() {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "feed.capacity"),
            other => panic!("expected ValidationError, got: {other}"),
        }
    }

    #[test]
    fn rejects_empty_database_path() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            "[server]\nbind = \"127.0.0.1\"\nport = 1\n\n[database]\npath = \"  \"\n",
        );
        match load_config_from(tmp.path()).unwrap_err() {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, "database.path"),
            other => panic!("expected ValidationError, got: {other}"),
        }
    }
}
