//! Configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use steadylink::provider::ClientConfig;

pub const ENV_URL: &str = "STEADYLINK_URL";
pub const ENV_PORT: &str = "STEADYLINK_PORT";
pub const ENV_DATA_DIR: &str = "STEADYLINK_DATA_DIR";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Client configuration, every field optional
    pub client: ClientConfig,
    /// Where calibration and cached endpoints are kept
    pub data_dir: Option<PathBuf>,
}

impl CliConfig {
    /// Load `path`, or the per-user config file when it exists, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))?;
        config
            .client
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Apply `STEADYLINK_*` variables as returned by `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_URL).filter(|v| !v.is_empty()) {
            self.client.discovery.explicit_url = Some(url);
        }
        if let Some(port) = lookup(ENV_PORT).filter(|v| !v.is_empty()) {
            self.client.discovery.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port: {port}"))?;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Apply command-line flags, which win over everything else
    pub fn apply_flags(&mut self, url: Option<String>, port: Option<u16>) {
        if let Some(url) = url {
            self.client.discovery.explicit_url = Some(url);
        }
        if let Some(port) = port {
            self.client.discovery.port = port;
        }
    }

    /// Data directory in force
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("steadylink"))
                .unwrap_or_else(|| PathBuf::from(".steadylink"))
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("steadylink").join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"client": {"discovery": {"port": 9100, "platform": "android_emulator"},
                           "calibrator": {"min_timeout": 2000}},
                "data_dir": "/var/lib/steadylink"}"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.client.discovery.port, 9100);
        assert_eq!(config.client.calibrator.min_timeout, Duration::from_secs(2));
        assert_eq!(config.client.calibrator.max_timeout, Duration::from_secs(120));
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/steadylink"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("nope.json"))).is_err());
    }

    #[test]
    fn test_inverted_timeout_bounds_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"client": {"calibrator": {"min_timeout": 200000}}}"#).unwrap();

        let err = CliConfig::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("min_timeout"));
    }

    #[test]
    fn test_env_then_flags() {
        let mut config = CliConfig::default();
        config
            .apply_env(env(&[(ENV_URL, "http://10.0.0.5:8000"), (ENV_PORT, "8080"), (ENV_DATA_DIR, "/tmp/sl")]))
            .unwrap();
        assert_eq!(config.client.discovery.explicit_url.as_deref(), Some("http://10.0.0.5:8000"));
        assert_eq!(config.client.discovery.port, 8080);
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/sl"));

        config.apply_flags(Some("http://localhost:9000".into()), None);
        assert_eq!(config.client.discovery.explicit_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.client.discovery.port, 8080);
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut config = CliConfig::default();
        assert!(config.apply_env(env(&[(ENV_PORT, "eighty")])).is_err());
    }
}
