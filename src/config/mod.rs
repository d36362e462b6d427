//! Panel bootstrap configuration
//!
//! Read once at startup from YAML. Everything a running panel can change
//! (active core, templates, multi-node mode) lives in the store instead.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::model::CoreType;
use crate::{Error, Result};

/// What this process serves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control plane: runs the local core, the jobs and the panel API
    #[default]
    Panel,
    /// Worker that runs configs pushed by a panel
    Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PanelConfig {
    /// Core binaries and their config files
    pub bin_folder: PathBuf,

    /// Core log files
    pub log_folder: PathBuf,

    /// Hub listen address
    pub listen: String,

    /// Bearer token required by the hub; empty disables auth
    pub secret: Option<String>,

    /// JSON snapshot of the store. In-memory only when unset.
    pub state_file: Option<PathBuf>,

    pub role: Role,

    /// Active core to force at startup
    pub core: Option<CoreType>,

    pub traffic_interval_secs: u64,

    pub health_interval_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        PanelConfig {
            bin_folder: PathBuf::from("bin"),
            log_folder: PathBuf::from("log"),
            listen: "127.0.0.1:2053".to_string(),
            secret: None,
            state_file: None,
            role: Role::Panel,
            core: None,
            traffic_interval_secs: 10,
            health_interval_secs: 5,
        }
    }
}

impl PanelConfig {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: PanelConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.traffic_interval_secs == 0 || self.health_interval_secs == 0 {
            return Err(Error::config("job intervals must be at least one second"));
        }
        if self.role == Role::Node && self.secret().is_empty() {
            return Err(Error::config("a node requires a secret"));
        }
        Ok(())
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::config(format!("invalid listen address {:?}: {}", self.listen, e)))
    }

    pub fn secret(&self) -> &str {
        self.secret.as_deref().unwrap_or_default()
    }

    pub fn traffic_interval(&self) -> Duration {
        Duration::from_secs(self.traffic_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Resolve relative folders against `home`.
    pub fn with_home(mut self, home: &Path) -> Self {
        for folder in [&mut self.bin_folder, &mut self.log_folder] {
            if folder.is_relative() {
                *folder = home.join(&*folder);
            }
        }
        if let Some(state) = self.state_file.as_mut().filter(|p| p.is_relative()) {
            *state = home.join(&*state);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PanelConfig::default();
        assert_eq!(config.role, Role::Panel);
        assert_eq!(config.listen_addr().unwrap().port(), 2053);
        assert_eq!(config.traffic_interval(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
bin-folder: /usr/local/corepanel/bin
listen: "0.0.0.0:2054"
secret: s3cret
role: node
core: sing-box
health-interval-secs: 3
"#;
        let config = PanelConfig::from_str(yaml).unwrap();
        assert_eq!(config.bin_folder, PathBuf::from("/usr/local/corepanel/bin"));
        assert_eq!(config.log_folder, PathBuf::from("log"));
        assert_eq!(config.role, Role::Node);
        assert_eq!(config.core, Some(CoreType::SingBox));
        assert_eq!(config.health_interval(), Duration::from_secs(3));
        assert_eq!(config.secret(), "s3cret");
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(PanelConfig::from_str("listen: nowhere").is_err());
        assert!(PanelConfig::from_str("role: node").is_err());
        assert!(PanelConfig::from_str("traffic-interval-secs: 0").is_err());
        assert!(PanelConfig::from_str("core: v2ray").is_err());
    }

    #[test]
    fn test_with_home() {
        let config = PanelConfig {
            state_file: Some(PathBuf::from("state.json")),
            log_folder: PathBuf::from("/var/log/corepanel"),
            ..Default::default()
        }
        .with_home(Path::new("/opt/corepanel"));
        assert_eq!(config.bin_folder, PathBuf::from("/opt/corepanel/bin"));
        assert_eq!(config.log_folder, PathBuf::from("/var/log/corepanel"));
        assert_eq!(config.state_file, Some(PathBuf::from("/opt/corepanel/state.json")));
    }
}
