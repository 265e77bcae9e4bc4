mod file_config;

pub use file_config::{FileConfig, JobsConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY: usize = 10;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub metrics_port: u16,
    pub enabled: bool,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub job_retention_days: u32,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            metrics_port: 9092,
            enabled: false,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval_ms: 1000,
            job_retention_days: 30,
        }
    }
}

/// `JOBS_ENABLED` / `JOBS_CONCURRENCY` as read from the environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub enabled: Option<String>,
    pub concurrency: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("JOBS_ENABLED").ok(),
            concurrency: std::env::var("JOBS_CONCURRENCY").ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// 0 disables the metrics endpoint.
    pub metrics_port: u16,
    pub jobs: JobsSettings,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub enabled: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_retention_days: u32,
    pub max_backoff_secs: Option<u64>,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_millis(1000),
            job_retention_days: 30,
            max_backoff_secs: None,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments, an optional TOML file and the
    /// environment. TOML values override CLI values, environment overrides both.
    pub fn resolve(
        cli: &CliConfig,
        file_config: Option<FileConfig>,
        env: &EnvOverrides,
    ) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;
        if db_path.is_dir() {
            bail!("db_path is a directory: {:?}", db_path);
        }
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let jobs_file = file.jobs.unwrap_or_default();
        let enabled = match &env.enabled {
            Some(value) => value == "true",
            None => jobs_file.enabled.unwrap_or(cli.enabled),
        };
        let concurrency = match &env.concurrency {
            Some(value) => parse_concurrency(value),
            None => sanitize_concurrency(jobs_file.concurrency.unwrap_or(cli.concurrency)),
        };
        let poll_interval_ms = jobs_file.poll_interval_ms.unwrap_or(cli.poll_interval_ms);
        if poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than 0");
        }

        Ok(Self {
            db_path,
            metrics_port,
            jobs: JobsSettings {
                enabled,
                concurrency,
                poll_interval: Duration::from_millis(poll_interval_ms),
                job_retention_days: jobs_file
                    .job_retention_days
                    .unwrap_or(cli.job_retention_days),
                max_backoff_secs: jobs_file.max_backoff_secs,
            },
        })
    }
}

/// Concurrency outside 1..=10 falls back to the default.
fn sanitize_concurrency(concurrency: usize) -> usize {
    if (1..=MAX_CONCURRENCY).contains(&concurrency) {
        concurrency
    } else {
        warn!(
            "Concurrency {} out of range 1..={}, using {}",
            concurrency, MAX_CONCURRENCY, DEFAULT_CONCURRENCY
        );
        DEFAULT_CONCURRENCY
    }
}

fn parse_concurrency(value: &str) -> usize {
    match value.trim().parse::<usize>() {
        Ok(concurrency) => sanitize_concurrency(concurrency),
        Err(_) => {
            warn!(
                "Invalid JOBS_CONCURRENCY '{}', using {}",
                value, DEFAULT_CONCURRENCY
            );
            DEFAULT_CONCURRENCY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cli_with_db(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().join("jobs.db")),
            metrics_port: 9100,
            enabled: true,
            concurrency: 4,
            poll_interval_ms: 500,
            job_retention_days: 14,
        };

        let config = AppConfig::resolve(&cli, None, &EnvOverrides::default()).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("jobs.db"));
        assert_eq!(config.metrics_port, 9100);
        assert!(config.jobs.enabled);
        assert_eq!(config.jobs.concurrency, 4);
        assert_eq!(config.jobs.poll_interval, Duration::from_millis(500));
        assert_eq!(config.jobs.job_retention_days, 14);
        assert!(config.jobs.max_backoff_secs.is_none());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/should/be/overridden/jobs.db")),
            metrics_port: 9100,
            ..Default::default()
        };
        let file_config = FileConfig {
            db_path: Some(temp_dir.path().join("toml.db").to_string_lossy().to_string()),
            jobs: Some(JobsConfig {
                enabled: Some(true),
                concurrency: Some(6),
                max_backoff_secs: Some(600),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config =
            AppConfig::resolve(&cli, Some(file_config), &EnvOverrides::default()).unwrap();

        assert_eq!(config.db_path, temp_dir.path().join("toml.db"));
        assert!(config.jobs.enabled);
        assert_eq!(config.jobs.concurrency, 6);
        assert_eq!(config.jobs.max_backoff_secs, Some(600));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.jobs.poll_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_env_overrides_everything() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            enabled: true,
            ..cli_with_db(&temp_dir)
        };
        let file_config = FileConfig {
            jobs: Some(JobsConfig {
                concurrency: Some(6),
                ..Default::default()
            }),
            ..Default::default()
        };
        let env = EnvOverrides {
            enabled: Some("false".to_string()),
            concurrency: Some("3".to_string()),
        };

        let config = AppConfig::resolve(&cli, Some(file_config), &env).unwrap();
        assert!(!config.jobs.enabled);
        assert_eq!(config.jobs.concurrency, 3);
    }

    #[test]
    fn test_jobs_enabled_requires_exact_true() {
        let temp_dir = TempDir::new().unwrap();
        for (value, expected) in [("true", true), ("TRUE", false), ("1", false), ("", false)] {
            let env = EnvOverrides {
                enabled: Some(value.to_string()),
                concurrency: None,
            };
            let config = AppConfig::resolve(&cli_with_db(&temp_dir), None, &env).unwrap();
            assert_eq!(config.jobs.enabled, expected, "JOBS_ENABLED={:?}", value);
        }
    }

    #[test]
    fn test_concurrency_out_of_range_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        for value in ["0", "11", "-1", "many"] {
            let env = EnvOverrides {
                enabled: None,
                concurrency: Some(value.to_string()),
            };
            let config = AppConfig::resolve(&cli_with_db(&temp_dir), None, &env).unwrap();
            assert_eq!(config.jobs.concurrency, DEFAULT_CONCURRENCY, "{}", value);
        }

        let cli = CliConfig {
            concurrency: 50,
            ..cli_with_db(&temp_dir)
        };
        let config = AppConfig::resolve(&cli, None, &EnvOverrides::default()).unwrap();
        assert_eq!(config.jobs.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_resolve_missing_db_path_error() {
        let result = AppConfig::resolve(&CliConfig::default(), None, &EnvOverrides::default());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_path must be specified"));
    }

    #[test]
    fn test_resolve_missing_parent_dir_error() {
        let cli = CliConfig {
            db_path: Some(PathBuf::from("/nonexistent/path/that/should/not/exist/jobs.db")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None, &EnvOverrides::default());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_path_is_directory_error() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            db_path: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None, &EnvOverrides::default());
        assert!(result.unwrap_err().to_string().contains("is a directory"));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let cli = CliConfig {
            poll_interval_ms: 0,
            ..cli_with_db(&temp_dir)
        };
        assert!(AppConfig::resolve(&cli, None, &EnvOverrides::default()).is_err());
    }
}
