use std::path::{Path, PathBuf};

use anyhow::Context;
use log::LevelFilter;

use crate::service::RW_DATA_SIZE_MAX;

pub const CONFIG_FILE_NAME: &str = "procpatch_config.json";

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct PatcherConfig {
    /// Log level, one of "off", "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// The helper library injected into targets. A bare file name is resolved
    /// next to the config file; an absolute path is used as-is.
    pub service_library: PathBuf,
    /// How often the backtrace gate is retried before giving up.
    pub suspend_retries: u32,
    /// Delay between backtrace gate retries, in milliseconds.
    pub suspend_retry_delay_ms: u64,
    /// Transfers larger than this go through the helper service when it is
    /// available; everything else uses the ptrace path.
    pub service_threshold: usize,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            service_library: "libprocpatch_service.so".into(),
            suspend_retries: 10,
            suspend_retry_delay_ms: 10,
            service_threshold: 64,
        }
    }
}

impl PatcherConfig {
    pub fn level_filter(&self) -> LevelFilter {
        match self.log_level.as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        }
    }
}

pub fn load_config(directory: impl AsRef<Path>) -> anyhow::Result<PatcherConfig> {
    let file = std::fs::read(directory.as_ref().join(CONFIG_FILE_NAME))?;
    let conf: PatcherConfig =
        serde_json::from_slice(&file).context("Failed to read config file, is it valid?")?;

    validate_config(&conf)?;

    Ok(conf)
}

pub fn create_initial_config(directory: impl AsRef<Path>) -> anyhow::Result<()> {
    let default_conf = PatcherConfig::default();
    let path = directory.as_ref().join(CONFIG_FILE_NAME);

    if !path.exists() {
        let mut file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(&mut file, &default_conf)?;
    }

    Ok(())
}

fn validate_config(config: &PatcherConfig) -> anyhow::Result<()> {
    let mut errors = Vec::new();

    if config.suspend_retries == 0 {
        errors.push("suspend_retries must be at least 1".to_string());
    }
    if config.service_threshold > RW_DATA_SIZE_MAX {
        errors.push(format!(
            "service_threshold {} exceeds the service transfer cap {}",
            config.service_threshold, RW_DATA_SIZE_MAX
        ));
    }

    let error = errors.join("\n");

    if error.is_empty() {
        Ok(())
    } else {
        Err(anyhow::Error::msg(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        validate_config(&PatcherConfig::default()).unwrap();
    }

    #[test]
    fn zero_retries_rejected() {
        let conf = PatcherConfig {
            suspend_retries: 0,
            ..Default::default()
        };
        assert!(validate_config(&conf).is_err());
    }
}
