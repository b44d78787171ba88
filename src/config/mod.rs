mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use crate::scheduler::DEFAULT_SYNC_INTERVAL;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const STATE_DB_FILE: &str = "state.db";
pub const DEFAULT_RECORDS_DB_FILE: &str = "records.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub records_db: Option<PathBuf>,
    pub metrics_port: u16,
    pub log_level: Option<String>,
    pub sync_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub records_db: PathBuf,
    /// 0 disables the metrics server.
    pub metrics_port: u16,
    pub log_level: String,
    pub sync_interval: Duration,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        // Relative record store paths live next to the state db.
        let records_db = file
            .records_db
            .map(PathBuf::from)
            .or_else(|| cli.records_db.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDS_DB_FILE));
        let records_db = if records_db.is_absolute() {
            records_db
        } else {
            db_dir.join(records_db)
        };

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let log_level = file
            .log_level
            .or_else(|| cli.log_level.clone())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
            .to_ascii_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            bail!(
                "Invalid log_level '{}', expected one of: {}",
                log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let sync_interval_secs = file
            .scheduler
            .unwrap_or_default()
            .sync_interval_secs
            .or(cli.sync_interval_secs)
            .unwrap_or(DEFAULT_SYNC_INTERVAL.as_secs());
        if sync_interval_secs == 0 {
            bail!("scheduler.sync_interval_secs must be greater than 0");
        }

        Ok(Self {
            db_dir,
            records_db,
            metrics_port,
            log_level,
            sync_interval: Duration::from_secs(sync_interval_secs),
        })
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.db_dir.join(STATE_DB_FILE)
    }

    pub fn records_db_path(&self) -> PathBuf {
        self.records_db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            records_db: Some(PathBuf::from("/srv/site/records.db")),
            metrics_port: 9091,
            log_level: Some("debug".to_string()),
            sync_interval_secs: Some(15),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.records_db_path(), PathBuf::from("/srv/site/records.db"));
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sync_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_resolve_defaults() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.state_db_path(), temp_dir.path().join("state.db"));
        assert_eq!(config.records_db_path(), temp_dir.path().join("records.db"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(config.metrics_port, 0);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            metrics_port: 9091,
            log_level: Some("warn".to_string()),
            sync_interval_secs: Some(30),
            ..Default::default()
        };

        let file_config: FileConfig = toml::from_str(&format!(
            r#"
            db_dir = "{}"
            records_db = "site.db"
            log_level = "TRACE"

            [scheduler]
            sync_interval_secs = 5
            "#,
            temp_dir.path().display()
        ))
        .unwrap();

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.records_db_path(), temp_dir.path().join("site.db"));
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None)
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));

        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            sync_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, None).is_err());
    }

    #[test]
    fn test_file_config_load() {
        let temp_dir = make_temp_db_dir();
        let path = temp_dir.path().join("refresher.toml");
        std::fs::write(&path, "metrics_port = 9100\n").unwrap();
        let loaded = FileConfig::load(&path).unwrap();
        assert_eq!(loaded.metrics_port, Some(9100));
        assert!(loaded.scheduler.is_none());

        std::fs::write(&path, "metrics_port = \"many\"\n").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }
}
