use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Deployment environment; controls how much error detail reaches users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(anyhow!("Unknown environment '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub region: String,
    pub environment: Environment,
    pub workspace_root: Option<PathBuf>,
    pub action_ttl_secs: u64,
    pub verify_duration_secs: u32,
    pub apply_duration_secs: u32,
    pub tool_timeout_secs: u64,
    pub workspace_max_age_minutes: u64,
    pub janitor_interval_secs: u64,
    pub terraform_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            environment: Environment::Production,
            workspace_root: None,
            action_ttl_secs: 600,
            verify_duration_secs: 900,
            apply_duration_secs: 3600,
            tool_timeout_secs: 300,
            workspace_max_age_minutes: 60,
            janitor_interval_secs: 300,
            terraform_binary: "terraform".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment variables, or create default
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| {
            info!("No config file found, using defaults");
            Self::default()
        });

        config.apply_env_overrides();
        Ok(config)
    }

    // Environment variables override config file
    fn apply_env_overrides(&mut self) {
        if let Ok(region) = std::env::var("SKYWARD_REGION").or_else(|_| std::env::var("AWS_REGION")) {
            self.region = region;
        }

        if let Ok(env) = std::env::var("SKYWARD_ENV") {
            match env.parse() {
                Ok(environment) => self.environment = environment,
                Err(e) => warn!("Ignoring SKYWARD_ENV: {}", e),
            }
        }

        if let Ok(root) = std::env::var("SKYWARD_WORKSPACE_ROOT") {
            self.workspace_root = Some(PathBuf::from(root));
        }
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            info!("Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            Err(anyhow!("Config file not found"))
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join("config.toml"))
    }

    pub fn get_config_dir() -> Result<PathBuf> {
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(".skyward"))
    }

    /// Directory that holds per-apply workspaces.
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("skyward").join("workspaces"))
    }

    pub fn action_ttl(&self) -> Duration {
        Duration::from_secs(self.action_ttl_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn workspace_max_age(&self) -> Duration {
        Duration::from_secs(self.workspace_max_age_minutes * 60)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn show_config_info() -> Result<()> {
        let config_path = Self::get_config_path()?;
        println!("Configuration file: {}", config_path.display());

        if config_path.exists() {
            println!("Status: Found");
        } else {
            println!("Status: Not found (using defaults)");
        }

        let config = Self::load()?;
        println!("Region: {}", config.region);
        println!("Environment: {:?}", config.environment);
        println!("Workspace root: {}", config.workspace_root().display());
        println!("Action TTL: {}s", config.action_ttl_secs);
        println!("Provisioning timeout: {}s", config.tool_timeout_secs);
        println!("Workspace max age: {} min", config.workspace_max_age_minutes);
        println!("Terraform binary: {}", config.terraform_binary);

        println!("\nOverrides:");
        println!("  export SKYWARD_REGION=<region>");
        println!("  export SKYWARD_ENV=development");
        println!("  export SKYWARD_WORKSPACE_ROOT=<dir>");

        Ok(())
    }
}
