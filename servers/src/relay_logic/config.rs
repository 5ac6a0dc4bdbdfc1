use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Geo-aware occupancy relay server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port of the HTTP control plane.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_REDIS_URL", help = "Redis URL; in-memory collaborators are used when absent.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "RELAY_POLLING_TIME_SECS", help = "Long-poll wait of one inbound receive call.")]
    pub polling_time_secs: Option<u64>,

    #[clap(long, env = "RELAY_MAX_RECEIVE_MESSAGES", help = "Maximum messages fetched per receive call.")]
    pub max_receive_messages: Option<usize>,

    #[clap(long, env = "RELAY_VISIBILITY_TIMEOUT_SECS", help = "Seconds before an unacknowledged message is redelivered.")]
    pub visibility_timeout_secs: Option<u64>,

    #[clap(long, env = "RELAY_REGISTRATION_ATTEMPTS", help = "Id collisions tolerated by one registration.")]
    pub registration_attempts: Option<u32>,
}

impl Config {
    fn defaults() -> Config {
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            polling_time_secs: Some(20),
            max_receive_messages: Some(10),
            visibility_timeout_secs: Some(30),
            registration_attempts: Some(3),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            polling_time_secs: other.polling_time_secs.or(self.polling_time_secs),
            max_receive_messages: other.max_receive_messages.or(self.max_receive_messages),
            visibility_timeout_secs: other.visibility_timeout_secs.or(self.visibility_timeout_secs),
            registration_attempts: other.registration_attempts.or(self.registration_attempts),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn polling_time(&self) -> Duration {
        Duration::from_secs(self.polling_time_secs.unwrap_or(20))
    }

    pub fn max_receive_messages(&self) -> usize {
        self.max_receive_messages.unwrap_or(10).max(1)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.unwrap_or(30))
    }

    pub fn registration_attempts(&self) -> u32 {
        self.registration_attempts.unwrap_or(3)
    }
}

/// Reads a JSON config file. Missing or invalid files yield `None` with a warning.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Precedence: defaults < config file < environment / CLI.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_apply_without_file() {
        let cli = Config {
            config_path: Some(PathBuf::from("/definitely/not/here.conf")),
            ..Default::default()
        };
        let config = resolve(cli);
        assert_eq!(config.port(), 8080);
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.polling_time(), Duration::from_secs(20));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_file_then_cli_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9100, "logLevel": "debug", "redisUrl": "redis://127.0.0.1/"}}"#).unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(9200),
            ..Default::default()
        };
        let config = resolve(cli);
        assert_eq!(config.port(), 9200);
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.registration_attempts(), 3);
    }

    #[test]
    fn test_invalid_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let config = resolve(Config { config_path: Some(file.path().to_path_buf()), ..Default::default() });
        assert_eq!(config.port(), 8080);
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = Config::try_parse_from(["server_relay", "--port", "7000", "--max-receive-messages", "4"]).unwrap();
        assert_eq!(cli.port, Some(7000));
        assert_eq!(cli.max_receive_messages, Some(4));
    }
}
