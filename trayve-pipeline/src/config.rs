//! trayve-pipeline configuration
//!
//! Extends the shared [`TomlConfig`] with pricing, worker pool, storage,
//! provider backends and optional per-tier step chain overrides. Every
//! section has defaults, so an absent config file yields a working service.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use trayve_common::config::TomlConfig;

use crate::models::Tier;
use crate::services::step_chain::StepChain;

/// Full configuration file of the pipeline service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub base: TomlConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Per-tier overrides of the built-in step chain table
    #[serde(default)]
    pub tiers: HashMap<Tier, StepChain>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Cost of one generated image
    #[serde(default = "default_credits_per_image")]
    pub credits_per_image: i64,

    /// Maximum poses per execution
    #[serde(default = "default_max_poses")]
    pub max_poses: usize,

    /// Credits granted when an account is first created
    #[serde(default)]
    pub welcome_credits: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            credits_per_image: default_credits_per_image(),
            max_poses: default_max_poses(),
            welcome_credits: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Executions processed concurrently; further executions queue
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent_executions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Public URL prefix of `/artifacts`; derived from the bind address when unset
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// Backend lists per capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub compose: CapabilityConfig,
    #[serde(default)]
    pub upscale: CapabilityConfig,
    #[serde(default)]
    pub enhance: CapabilityConfig,
    #[serde(default)]
    pub watermark: CapabilityConfig,
}

/// Wire protocol spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendApi {
    /// `POST /predictions`, poll `GET /predictions/{id}`
    Prediction,
    /// `POST /run`, poll `GET /status/{id}`
    Job,
    /// Synchronous `POST /watermark` returning image bytes
    Render,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Defaults to the capability's native protocol
    #[serde(default)]
    pub api: Option<BackendApi>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Ordered fallback chain; the first success wins
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_credits_per_image() -> i64 {
    1000
}

fn default_max_poses() -> usize {
    10
}

fn default_max_concurrent_executions() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_timeout_secs() -> u64 {
    240
}

impl PipelineConfig {
    /// Load from an explicit path, the platform config file, or defaults
    pub fn load(explicit: Option<&Path>) -> trayve_common::Result<Self> {
        let mut config: PipelineConfig = match explicit {
            Some(path) => trayve_common::config::load_toml(path)?,
            None => match trayve_common::config::find_config_file() {
                Ok(path) => trayve_common::config::load_toml(&path)?,
                Err(_) => PipelineConfig::default(),
            },
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRAYVE_<CAPABILITY>_API_KEY` to every backend of that capability
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let capabilities = [
            ("TRAYVE_COMPOSE_API_KEY", &mut self.providers.compose),
            ("TRAYVE_UPSCALE_API_KEY", &mut self.providers.upscale),
            ("TRAYVE_ENHANCE_API_KEY", &mut self.providers.enhance),
            ("TRAYVE_WATERMARK_API_KEY", &mut self.providers.watermark),
        ];

        for (var, capability) in capabilities {
            if let Some(key) = lookup(var).filter(|k| !k.trim().is_empty()) {
                for backend in &mut capability.backends {
                    backend.api_key = Some(key.clone());
                }
            }
        }
    }

    pub fn validate(&self) -> trayve_common::Result<()> {
        use trayve_common::Error;

        if self.pricing.credits_per_image <= 0 {
            return Err(Error::Config(
                "pricing.credits_per_image must be positive".to_string(),
            ));
        }
        if self.pricing.max_poses == 0 {
            return Err(Error::Config("pricing.max_poses must be at least 1".to_string()));
        }
        if self.pricing.welcome_credits < 0 {
            return Err(Error::Config(
                "pricing.welcome_credits must not be negative".to_string(),
            ));
        }
        if self.worker.max_concurrent_executions == 0 {
            return Err(Error::Config(
                "worker.max_concurrent_executions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Public artifact URL prefix
    pub fn public_base_url(&self) -> String {
        match &self.storage.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}/artifacts", self.base.bind_address()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quality, StepType};

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.pricing.credits_per_image, 1000);
        assert_eq!(config.pricing.max_poses, 10);
        assert_eq!(config.providers.enhance.poll_interval_ms, 2000);
        assert_eq!(config.providers.enhance.timeout_secs, 240);
        assert_eq!(
            config.public_base_url(),
            "http://127.0.0.1:5740/artifacts"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_file() {
        let toml_text = r#"
            root_folder = "/srv/trayve"
            bind_address = "0.0.0.0:8080"

            [logging]
            level = "debug"

            [pricing]
            credits_per_image = 500
            max_poses = 4
            welcome_credits = 2000

            [worker]
            max_concurrent_executions = 2

            [storage]
            public_base_url = "https://cdn.example.com/artifacts/"

            [providers.compose]
            max_attempts = 2
            [[providers.compose.backends]]
            name = "primary"
            base_url = "https://tryon.example.com"
            api_key = "k1"
            [[providers.compose.backends]]
            name = "secondary"
            api = "prediction"
            base_url = "https://predict.example.com/v1"
            model = "tryon-v2"

            [tiers.starter]
            steps = ["try-on", "enhanced-upscale"]
            quality = "premium"
        "#;

        let config: PipelineConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.base.root_folder.as_deref(), Some("/srv/trayve"));
        assert_eq!(config.base.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.base.logging.level, "debug");
        assert_eq!(config.pricing.credits_per_image, 500);
        assert_eq!(config.pricing.welcome_credits, 2000);
        assert_eq!(config.worker.max_concurrent_executions, 2);
        assert_eq!(config.public_base_url(), "https://cdn.example.com/artifacts");

        let compose = &config.providers.compose;
        assert_eq!(compose.max_attempts, 2);
        assert_eq!(compose.timeout_secs, 240);
        assert_eq!(compose.backends.len(), 2);
        assert_eq!(compose.backends[0].api, None);
        assert_eq!(compose.backends[1].api, Some(BackendApi::Prediction));

        let starter = &config.tiers[&Tier::Starter];
        assert_eq!(starter.steps, vec![StepType::TryOn, StepType::EnhancedUpscale]);
        assert_eq!(starter.quality, Quality::Premium);
    }

    #[test]
    fn test_env_override_replaces_api_keys() {
        let mut config: PipelineConfig = toml::from_str(
            r#"
            [[providers.upscale.backends]]
            name = "a"
            api_key = "from-file"
            [[providers.upscale.backends]]
            name = "b"
            "#,
        )
        .unwrap();

        config.apply_env_overrides(|name| {
            (name == "TRAYVE_UPSCALE_API_KEY").then(|| "from-env".to_string())
        });

        for backend in &config.providers.upscale.backends {
            assert_eq!(backend.api_key.as_deref(), Some("from-env"));
        }
    }

    #[test]
    fn test_validate_rejects_bad_pricing() {
        let mut config = PipelineConfig::default();
        config.pricing.credits_per_image = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.worker.max_concurrent_executions = 0;
        assert!(config.validate().is_err());
    }
}
