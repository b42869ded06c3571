use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "INTERVIEW";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    /// sqlite connection string. Absent means documents live in memory only.
    pub database_url: Option<String>,
    pub compaction_threshold: usize,
    pub executor_url: String,
    pub executor_timeout_secs: u64,
    pub auth_verify_url: String,
    /// Absent means every session identifier is accepted.
    pub session_directory_url: Option<String>,
}

impl Settings {
    /// Defaults, then `interview.toml` if present, then `INTERVIEW__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(
            Config::builder()
                .add_source(File::with_name("interview").required(false))
                .add_source(Environment::with_prefix(ENV_PREFIX).separator("__")),
        )
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder
            .set_default("bind_addr", "127.0.0.1:8080")?
            .set_default("compaction_threshold", 500_i64)?
            .set_default("executor_url", "http://127.0.0.1:2358")?
            .set_default("executor_timeout_secs", 30_i64)?
            .set_default("auth_verify_url", "http://127.0.0.1:4000/auth/verify")?
            .build()?
            .try_deserialize()?;
        settings.validate()
    }

    fn validate(mut self) -> Result<Self, ConfigError> {
        if self.compaction_threshold == 0 {
            return Err(ConfigError::Invalid(
                "compaction_threshold must be at least 1".into(),
            ));
        }
        if self.executor_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor_timeout_secs must be at least 1".into(),
            ));
        }
        self.database_url = self.database_url.filter(|s| !s.trim().is_empty());
        self.session_directory_url = self.session_directory_url.filter(|s| !s.trim().is_empty());
        Ok(self)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_fills_in_defaults() {
        let settings = Settings::build(Config::builder()).expect("defaults are valid");
        assert_eq!(settings.bind_addr, "127.0.0.1:8080");
        assert_eq!(settings.compaction_threshold, 500);
        assert_eq!(settings.executor_timeout(), Duration::from_secs(30));
        assert!(settings.database_url.is_none());
        assert!(settings.session_directory_url.is_none());
    }

    #[test]
    fn it_treats_blank_database_url_as_absent() {
        let builder = Config::builder()
            .set_override("database_url", "  ")
            .expect("override");
        let settings = Settings::build(builder).expect("valid");
        assert!(settings.database_url.is_none());
    }

    #[test]
    fn it_rejects_zero_threshold() {
        let builder = Config::builder()
            .set_override("compaction_threshold", 0_i64)
            .expect("override");
        assert!(matches!(
            Settings::build(builder),
            Err(ConfigError::Invalid(_))
        ));
    }
}
