//! Configuration for the stitcher.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STITCHER_HOME, STITCHER_DB, STITCHER_MODE)
//! 2. Config file (.stitcher/config.yaml)
//! 3. Defaults (~/.stitcher)
//!
//! Config file discovery:
//! - Searches current directory and parents for .stitcher/config.yaml
//! - Paths in the config file are relative to the config file's directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub stitching: StitchingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StitchingConfig {
    /// Dispatch mode: "immediate" or "deferred". Anything else falls back
    /// to immediate.
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path (relative to the config file)
    pub path: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to the stitcher home (engine state)
    pub home: PathBuf,
    /// Absolute path to the SQLite database
    pub database: PathBuf,
    /// Configured stitching mode, if any
    pub stitching_mode: Option<String>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".stitcher").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".stitcher");

    let config_file = find_config_file();

    let (home, database, stitching_mode) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let stitcher_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("STITCHER_HOME") {
            PathBuf::from(env_home)
        } else {
            default_home.clone()
        };

        let database = if let Ok(env_db) = std::env::var("STITCHER_DB") {
            PathBuf::from(env_db)
        } else if let Some(ref db_path) = config.database.path {
            resolve_path(stitcher_dir, db_path)
        } else {
            home.join("stitcher.db")
        };

        let mode = std::env::var("STITCHER_MODE")
            .ok()
            .or(config.stitching.mode);

        (home, database, mode)
    } else {
        let home = std::env::var("STITCHER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let database = std::env::var("STITCHER_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("stitcher.db"));

        let mode = std::env::var("STITCHER_MODE").ok();

        (home, database, mode)
    };

    Ok(ResolvedConfig {
        home,
        database,
        stitching_mode,
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let stitcher_dir = temp.path().join(".stitcher");
        std::fs::create_dir_all(&stitcher_dir).unwrap();

        let config_path = stitcher_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
stitching:
  mode: deferred
database:
  path: ./stitcher.db
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.stitching.mode, Some("deferred".to_string()));
        assert_eq!(config.database.path, Some("./stitcher.db".to_string()));
    }

    #[test]
    fn test_config_file_defaults_sections() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("config.yaml");
        std::fs::write(&config_path, "version: \"1.0\"\n").unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert!(config.stitching.mode.is_none());
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
