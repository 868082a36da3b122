//! Configuration System
//!
//! Layered configuration: built-in defaults, then the workspace file
//! (`chartsmith.toml`), then `CHARTSMITH_*` environment variables. Every
//! field has a serde default so a partial file is always valid.

use crate::error::EngineError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Generative-text service settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Retry behavior for generative calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// External terminology and validator endpoints
    #[serde(default)]
    pub services: ServiceConfig,

    /// Validate-refine loop tuning
    #[serde(default)]
    pub refine: RefineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Generative service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Bearer token for the endpoint, if it needs one.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum concurrent outbound generative calls.
    #[serde(default = "default_pool_limit")]
    pub pool_limit: usize,
}

fn default_endpoint() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_pool_limit() -> usize {
    4
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            pool_limit: default_pool_limit(),
        }
    }
}

/// Retry configuration for generative calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    4_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> crate::generate::RetryPolicy {
        crate::generate::RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: std::time::Duration::from_millis(self.base_delay_ms),
            max_delay: std::time::Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// External collaborator endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_terminology_endpoint")]
    pub terminology_endpoint: String,

    #[serde(default = "default_validator_endpoint")]
    pub validator_endpoint: String,
}

fn default_terminology_endpoint() -> String {
    "http://localhost:8081/terminology".to_string()
}

fn default_validator_endpoint() -> String {
    "http://localhost:8082/fhir".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            terminology_endpoint: default_terminology_endpoint(),
            validator_endpoint: default_validator_endpoint(),
        }
    }
}

/// Validate-refine loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    #[serde(default = "default_turn_budget")]
    pub turn_budget: usize,

    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

fn default_turn_budget() -> usize {
    12
}

fn default_fan_out() -> usize {
    3
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            turn_budget: default_turn_budget(),
            fan_out: default_fan_out(),
        }
    }
}

impl RefineConfig {
    pub fn to_settings(&self) -> crate::refine::RefineSettings {
        crate::refine::RefineSettings {
            turn_budget: self.turn_budget,
            fan_out: self.fan_out,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then an optional file, then
    /// `CHARTSMITH_*` environment variables (`__` separates nesting, e.g.
    /// `CHARTSMITH_PROVIDER__MODEL`).
    pub fn load(file: Option<&Path>) -> Result<Self, EngineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        } else {
            builder = builder.add_source(
                config::File::with_name("chartsmith").required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CHARTSMITH").separator("__"),
        );
        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}
