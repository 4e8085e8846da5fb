//! Daemon configuration.
//!
//! Precedence: CLI flags (applied by the daemon binary) > environment
//! variables > `--config` file (key=value format) > defaults. See
//! Section 6 of the specification for the recognized options.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Daemon configuration (Section 6 table, Section 10 ambient stack).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub database_path: PathBuf,

    pub http_port: u16,
    pub auth_token: Option<String>,

    pub run_soft_timeout_secs: u64,
    pub local_command_timeout_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    pub scheduler_tick_secs: u64,

    pub aws_default_region: Option<String>,
    pub aws_security_group_id: Option<String>,
    pub aws_subnet_id: Option<String>,
    pub aws_ami_id: Option<String>,
    pub aws_ec2_key_name: Option<String>,

    pub default_retention_days: u32,
    pub default_deploy_path: String,
    pub default_deploy_user: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/tmp/lightci/workspaces"),
            artifacts_root: PathBuf::from("/tmp/lightci/artifacts"),
            database_path: PathBuf::from("/tmp/lightci/lightci.db"),
            http_port: 8420,
            auth_token: None,
            run_soft_timeout_secs: 2 * 60 * 60,
            local_command_timeout_secs: 30 * 60,
            ssh_connect_timeout_secs: 10,
            scheduler_tick_secs: 30,
            aws_default_region: None,
            aws_security_group_id: None,
            aws_subnet_id: None,
            aws_ami_id: None,
            aws_ec2_key_name: None,
            default_retention_days: 30,
            default_deploy_path: "/home/ec2-user/app".to_string(),
            default_deploy_user: "ec2-user".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a `key=value` config file.
    pub fn load_file(&mut self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Overlay recognized environment variables (Section 6 table).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARTIFACTS_ROOT").or_else(|_| std::env::var("ARTIFACTS_PATH")) {
            self.artifacts_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.http_port = port;
            }
        }
        if let Ok(v) = std::env::var("AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("RUN_SOFT_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.run_soft_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SCHEDULER_TICK_SECS") {
            if let Ok(secs) = v.parse() {
                self.scheduler_tick_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("AWS_DEFAULT_REGION") {
            self.aws_default_region = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SECURITY_GROUP_ID") {
            self.aws_security_group_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_SUBNET_ID") {
            self.aws_subnet_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_AMI_ID") {
            self.aws_ami_id = Some(v);
        }
        if let Ok(v) = std::env::var("AWS_EC2_KEY_NAME") {
            self.aws_ec2_key_name = Some(v);
        }
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "artifacts_root" => self.artifacts_root = PathBuf::from(value),
            "database_path" => self.database_path = PathBuf::from(value),
            "http_port" => {
                self.http_port = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "auth_token" => {
                self.auth_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "run_soft_timeout_secs" => {
                self.run_soft_timeout_secs = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "local_command_timeout_secs" => {
                self.local_command_timeout_secs =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "ssh_connect_timeout_secs" => {
                self.ssh_connect_timeout_secs =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "scheduler_tick_secs" => {
                self.scheduler_tick_secs = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "aws_default_region" => self.aws_default_region = Some(value.to_string()),
            "aws_security_group_id" => self.aws_security_group_id = Some(value.to_string()),
            "aws_subnet_id" => self.aws_subnet_id = Some(value.to_string()),
            "aws_ami_id" => self.aws_ami_id = Some(value.to_string()),
            "aws_ec2_key_name" => self.aws_ec2_key_name = Some(value.to_string()),
            "default_retention_days" => {
                self.default_retention_days =
                    value.parse().map_err(|_| ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
            }
            "default_deploy_path" => self.default_deploy_path = value.to_string(),
            "default_deploy_user" => self.default_deploy_user = value.to_string(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_6() {
        let config = Config::default();
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/lightci/workspaces"));
        assert_eq!(config.artifacts_root, PathBuf::from("/tmp/lightci/artifacts"));
        assert_eq!(config.run_soft_timeout_secs, 2 * 60 * 60);
        assert_eq!(config.local_command_timeout_secs, 30 * 60);
    }

    #[test]
    fn parses_key_value_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "http_port=9000\nauth_token=\"secret\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "not_a_real_key=1\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn env_overlay_takes_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "http_port=9000\n").unwrap();
        let mut config = Config::from_file(&path).unwrap();
        std::env::set_var("HTTP_PORT", "9100");
        config.apply_env();
        std::env::remove_var("HTTP_PORT");
        assert_eq!(config.http_port, 9100);
    }
}
