use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::DEFAULT_BUFFER_SIZE;
use crate::error::ConfigError;

const DEFAULT_CONFIG_PATH: &str = "/etc/rawlink.conf";
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Runtime settings for the dispatcher and its ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on one `poll(2)` wait in the dispatcher loop.
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
            verbose: false,
        }
    }
}

impl Config {
    /// Load settings from `path`, or from `RAWLINK_CONFIG` / the default path
    /// when `None`. A missing file leaves the defaults in place; `RAWLINK_*`
    /// environment variables override whatever the file set.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("RAWLINK_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let mut config = Config::default();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            config.apply_file(&content)?;
        } else if path.is_some() {
            return Err(ConfigError::Invalid(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        // Allow environment variable overrides
        if let Ok(val) = std::env::var("RAWLINK_POLL_INTERVAL_MS") {
            config.poll_interval = parse_millis("RAWLINK_POLL_INTERVAL_MS", &val)?;
        }
        if let Ok(val) = std::env::var("RAWLINK_READ_TIMEOUT_MS") {
            config.read_timeout = parse_millis("RAWLINK_READ_TIMEOUT_MS", &val)?;
        }
        if let Ok(val) = std::env::var("RAWLINK_BUFFER_SIZE") {
            config.buffer_size = parse_buffer_size("RAWLINK_BUFFER_SIZE", &val)?;
        }
        if let Ok(val) = std::env::var("RAWLINK_VERBOSE") {
            config.verbose = parse_bool("RAWLINK_VERBOSE", &val)?;
        }

        Ok(config)
    }

    fn apply_file(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "poll_interval_ms" => self.poll_interval = parse_millis(key, value)?,
                    "read_timeout_ms" => self.read_timeout = parse_millis(key, value)?,
                    "buffer_size" => self.buffer_size = parse_buffer_size(key, value)?,
                    "verbose" => self.verbose = parse_bool(key, value)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    match value.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid(format!("Invalid {}: {}", key, value))),
    }
}

fn parse_buffer_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        // Room for at least a minimum-size frame plus a VLAN tag
        Ok(size) if size >= 64 => Ok(size),
        _ => Err(ConfigError::Invalid(format!("Invalid {}: {}", key, value))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("Invalid {}: {}", key, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 5] = [
        "RAWLINK_CONFIG",
        "RAWLINK_POLL_INTERVAL_MS",
        "RAWLINK_READ_TIMEOUT_MS",
        "RAWLINK_BUFFER_SIZE",
        "RAWLINK_VERBOSE",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("rawlink.conf");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.read_timeout, Duration::from_millis(100));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!config.verbose);
    }

    #[test]
    #[serial]
    fn test_load_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "# rawlink settings\n\
             poll_interval_ms = 250\n\
             \n\
             read_timeout_ms=50\n\
             buffer_size = 9018\n\
             verbose = yes\n\
             unknown_key = ignored\n",
        );

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.read_timeout, Duration::from_millis(50));
        assert_eq!(config.buffer_size, 9018);
        assert!(config.verbose);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "poll_interval_ms = 250\nverbose = true\n");

        env::set_var("RAWLINK_POLL_INTERVAL_MS", "20");
        env::set_var("RAWLINK_VERBOSE", "0");
        let config = Config::load(Some(&path));
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert!(!config.verbose);
    }

    #[test]
    #[serial]
    fn test_config_path_from_env() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "buffer_size = 2048\n");

        env::set_var("RAWLINK_CONFIG", &path);
        let config = Config::load(None);
        clear_env();

        assert_eq!(config.unwrap().buffer_size, 2048);
    }

    #[test]
    #[serial]
    fn test_missing_default_file_uses_defaults() {
        clear_env();
        let dir = TempDir::new().unwrap();
        env::set_var("RAWLINK_CONFIG", dir.path().join("absent.conf"));
        let config = Config::load(None);
        clear_env();

        assert_eq!(config.unwrap(), Config::default());
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.conf")));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_invalid_values() {
        clear_env();
        let dir = TempDir::new().unwrap();
        for content in [
            "poll_interval_ms = soon",
            "poll_interval_ms = 0",
            "buffer_size = 10",
            "verbose = maybe",
        ] {
            let path = write_config(&dir, content);
            assert!(
                matches!(Config::load(Some(&path)), Err(ConfigError::Invalid(_))),
                "{} should be rejected",
                content
            );
        }

        env::set_var("RAWLINK_READ_TIMEOUT_MS", "-1");
        let result = Config::load(Some(&write_config(&dir, "")));
        clear_env();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
