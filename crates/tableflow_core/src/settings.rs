//! Runtime settings loaded from TOML.
//!
//! Covers the knobs of the shared services (cache, metrics), the plugin set a
//! runner should install, and logging output.

use crate::cache::{CacheConfig, EvictionStrategy};
use crate::metrics::MetricsConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

fn default_max_size() -> usize {
    500
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_flush_interval() -> u64 {
    60_000
}

fn default_max_samples() -> usize {
    1000
}

fn default_debounce() -> u64 {
    300
}

fn default_enabled_plugins() -> Vec<String> {
    ["sort", "filter", "edit", "validation", "hide"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub plugins: PluginSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Shared cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum entries, 0 for unbounded
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Default TTL in milliseconds, 0 for no expiry
    #[serde(default)]
    pub default_ttl_ms: u64,
    #[serde(default)]
    pub strategy: EvictionStrategy,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl_ms: 0,
            strategy: EvictionStrategy::Lru,
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            flush_interval_ms: default_flush_interval(),
            max_samples: default_max_samples(),
        }
    }
}

/// A per-column validation rule, as consumed by the validation plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Validator type name, e.g. `email` or `integer`
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub required: bool,
}

/// Plugin selection and shared plugin options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Plugins the runner installs, by name
    #[serde(default = "default_enabled_plugins")]
    pub enabled: Vec<String>,
    /// Quiet period of the filter input debouncer
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// Column name (or index) to validation rule
    #[serde(default)]
    pub validation_rules: BTreeMap<String, ValidationRule>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled_plugins(),
            debounce_ms: default_debounce(),
            validation_rules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl RuntimeSettings {
    /// Loads settings from a TOML file.
    ///
    /// If the file doesn't exist, writes the default settings to `path` and
    /// returns them.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let settings: RuntimeSettings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let defaults = RuntimeSettings::default();
            let toml_content = toml::to_string_pretty(&defaults)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default settings file: {}", path.display());
            Ok(defaults)
        }
    }

    /// Checks the settings for values the runtime cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.metrics.sample_rate) {
            return Err(format!(
                "Invalid metrics sample_rate: {}. Must be between 0 and 1",
                self.metrics.sample_rate
            ));
        }

        if self.metrics.flush_interval_ms == 0 {
            return Err("Metrics flush_interval_ms must be greater than 0".to_string());
        }

        if self.cache.sweep_interval_ms == 0 {
            return Err("Cache sweep_interval_ms must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for name in &self.plugins.enabled {
            if name.trim().is_empty() {
                return Err("Plugin names cannot be empty".to_string());
            }
            if !seen.insert(name.as_str()) {
                return Err(format!("Plugin listed twice: {}", name));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache.max_size,
            default_ttl: Duration::from_millis(self.cache.default_ttl_ms),
            strategy: self.cache.strategy,
            sweep_interval: Duration::from_millis(self.cache.sweep_interval_ms),
        }
    }

    pub fn metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            sample_rate: self.metrics.sample_rate,
            flush_interval: Duration::from_millis(self.metrics.flush_interval_ms),
            max_samples_per_metric: self.metrics.max_samples,
        }
    }

    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.plugins.enabled.iter().any(|enabled| enabled == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_runtime_settings_default() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.cache.max_size, 500);
        assert_eq!(settings.cache.strategy, EvictionStrategy::Lru);
        assert_eq!(settings.metrics.sample_rate, 1.0);
        assert_eq!(settings.plugins.debounce_ms, 300);
        assert!(settings.is_plugin_enabled("validation"));
        assert_eq!(settings.logging.level, "info");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: RuntimeSettings = toml::from_str(
            r#"
            [cache]
            max_size = 10
            strategy = "lfu"

            [plugins]
            enabled = ["sort", "edit", "validation"]

            [plugins.validation_rules]
            email = { type = "email", required = true }
            "#,
        )
        .unwrap();

        assert_eq!(settings.cache.max_size, 10);
        assert_eq!(settings.cache.strategy, EvictionStrategy::Lfu);
        assert_eq!(settings.cache.sweep_interval_ms, 60_000);
        assert!(!settings.is_plugin_enabled("hide"));
        let rule = &settings.plugins.validation_rules["email"];
        assert_eq!(rule.rule_type, "email");
        assert!(rule.required);
        assert_eq!(settings.logging, LoggingSettings::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = RuntimeSettings::default();
        settings.metrics.sample_rate = 1.5;
        assert!(settings.validate().unwrap_err().contains("sample_rate"));

        let mut settings = RuntimeSettings::default();
        settings.plugins.enabled.push("sort".to_string());
        assert!(settings.validate().unwrap_err().contains("listed twice"));

        let mut settings = RuntimeSettings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_conversions() {
        let mut settings = RuntimeSettings::default();
        settings.cache.default_ttl_ms = 250;
        settings.metrics.max_samples = 5;

        assert_eq!(
            settings.cache_config().default_ttl,
            Duration::from_millis(250)
        );
        assert_eq!(settings.metrics_config().max_samples_per_metric, 5);
    }

    #[tokio::test]
    async fn test_load_from_file_creates_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tableflow.toml");

        let settings = RuntimeSettings::load_from_file(&path).await.unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert!(path.exists());

        let reloaded = RuntimeSettings::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, settings);
    }

    #[tokio::test]
    async fn test_load_from_file_reads_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        tokio::fs::write(&path, "[logging]\nlevel = \"debug\"\njson_format = true\n")
            .await
            .unwrap();

        let settings = RuntimeSettings::load_from_file(&path).await.unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json_format);
        assert_eq!(settings.cache, CacheSettings::default());
    }
}
