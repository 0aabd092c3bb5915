use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for summon
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SummonConfig {
    /// Target system layout and provisioning settings
    pub system: SystemSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Passwords, since summon never prompts
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Directory under which `<name>` is mounted
    pub mount_root: String,
    /// How long to wait for new partitions to show up
    pub device_wait_ms: u64,
    /// Poll interval while waiting for partitions
    pub device_poll_ms: u64,
    /// Packages installed before the `<name>-system` meta package
    pub packages: Vec<String>,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            mount_root: "/mnt".to_string(),
            device_wait_ms: 2000,
            device_poll_ms: 50,
            packages: vec![
                "lib32-mesa-libgl".to_string(),
                "ttf-dejavu".to_string(),
                "mesa-libgl".to_string(),
                "libreoffice-en-US".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level; RUST_LOG overrides it
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Credentials {
    /// LUKS passphrase for the root disk
    pub disk_password: Option<String>,
    /// Password set for root and the optional user
    pub user_password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("Credentials")
            .field("disk_password", &redact(&self.disk_password))
            .field("user_password", &redact(&self.user_password))
            .finish()
    }
}

impl Credentials {
    pub fn disk_password(&self) -> Result<&str> {
        self.disk_password.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "disk password not configured (set credentials.disk_password or SUMMON_CREDENTIALS__DISK_PASSWORD)"
            )
        })
    }

    pub fn user_password(&self) -> Result<&str> {
        self.user_password.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "user password not configured (set credentials.user_password or SUMMON_CREDENTIALS__USER_PASSWORD)"
            )
        })
    }
}

impl SummonConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`summon.toml`, or `path` when given)
    /// 3. Environment variables (prefixed with SUMMON_, `__` between levels)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("summon.toml").exists() {
                    builder = builder.add_source(File::with_name("summon"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SUMMON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
        }
        Ok(())
    }
}
