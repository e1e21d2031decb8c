//! Server configuration (§6, §10): YAML-loaded, with sensitive-field
//! masking for the `CONFIG_GET`/`CONFIG_SET` management events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MASK: &str = "******";

static SENSITIVE_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)api.?key|secret|password|token|credential|auth|private.?key").unwrap()
});

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModuleConfig {
    pub adapter_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self).context("failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "voicebridge")
            .context("could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Produce a masked snapshot suitable for `CONFIG_SNAPSHOT` (§6, §8 L3):
    /// every sensitive-looking field is replaced with `******`.
    pub fn masked_snapshot(&self) -> serde_yaml::Value {
        let value = serde_yaml::to_value(self).expect("Config always serializes");
        mask_value(value, false)
    }

    /// Apply a `CONFIG_SET` patch: fields left as `******` keep the current
    /// value from `self` rather than being overwritten with the sentinel.
    pub fn apply_masked_patch(&mut self, patch: serde_yaml::Value) -> Result<()> {
        let current = serde_yaml::to_value(&*self).expect("Config always serializes");
        let unmasked_patch = restore_masked_fields(patch, &current, false);
        *self = serde_yaml::from_value(unmasked_patch).context("invalid config patch")?;
        Ok(())
    }
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_FIELD.is_match(key)
}

fn mask_value(value: serde_yaml::Value, parent_is_sensitive: bool) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in map {
                let key_str = k.as_str().unwrap_or_default();
                let sensitive = parent_is_sensitive || is_sensitive_key(key_str);
                let masked_v = if sensitive && !matches!(v, serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_)) {
                    serde_yaml::Value::String(MASK.to_string())
                } else {
                    mask_value(v, false)
                };
                out.insert(k, masked_v);
            }
            serde_yaml::Value::Mapping(out)
        }
        other => other,
    }
}

/// Walk `patch` alongside `current`; wherever `patch` holds the mask
/// sentinel, substitute the value from `current` at the same path instead.
fn restore_masked_fields(patch: serde_yaml::Value, current: &serde_yaml::Value, parent_is_sensitive: bool) -> serde_yaml::Value {
    match (patch, current) {
        (serde_yaml::Value::Mapping(patch_map), serde_yaml::Value::Mapping(current_map)) => {
            let mut out = serde_yaml::Mapping::new();
            for (k, v) in patch_map {
                let key_str = k.as_str().unwrap_or_default();
                let sensitive = parent_is_sensitive || is_sensitive_key(key_str);
                let current_v = current_map.get(&k).cloned().unwrap_or(serde_yaml::Value::Null);
                let resolved = if sensitive && v.as_str() == Some(MASK) {
                    current_v
                } else {
                    restore_masked_fields(v, &current_v, false)
                };
                out.insert(k, resolved);
            }
            serde_yaml::Value::Mapping(out)
        }
        (patch_value, _) => patch_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_replaces_sensitive_scalar_fields_only() {
        let mut config = Config::default();
        config.modules.insert(
            "llm".into(),
            ModuleConfig {
                adapter_type: "openai".into(),
                enabled: true,
                config: serde_yaml::from_str("api_key: sk-12345\nbase_url: http://localhost").unwrap(),
            },
        );

        let snapshot = config.masked_snapshot();
        let llm_cfg = snapshot["modules"]["llm"]["config"].clone();
        assert_eq!(llm_cfg["api_key"].as_str(), Some(MASK));
        assert_eq!(llm_cfg["base_url"].as_str(), Some("http://localhost"));
    }

    #[test]
    fn load_round_trips_through_a_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.server.port = 9090;
        config.modules.insert(
            "asr".into(),
            ModuleConfig { adapter_type: "whisper_http".into(), enabled: true, config: serde_yaml::Value::Null },
        );
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9090);
        assert_eq!(loaded.modules["asr"].adapter_type, "whisper_http");
    }

    #[test]
    fn config_set_with_mask_sentinel_keeps_current_value() {
        let mut config = Config::default();
        config.modules.insert(
            "llm".into(),
            ModuleConfig {
                adapter_type: "openai".into(),
                enabled: true,
                config: serde_yaml::from_str("api_key: sk-real-value").unwrap(),
            },
        );

        let mut patch = serde_yaml::to_value(&config).unwrap();
        patch["modules"]["llm"]["config"]["api_key"] = serde_yaml::Value::String(MASK.to_string());
        patch["modules"]["llm"]["adapter_type"] = serde_yaml::Value::String("openai-v2".into());

        config.apply_masked_patch(patch).unwrap();

        assert_eq!(
            config.modules["llm"].config["api_key"].as_str(),
            Some("sk-real-value")
        );
        assert_eq!(config.modules["llm"].adapter_type, "openai-v2");
    }

    #[test]
    fn roundtrip_config_set_then_get_preserves_prior_value_l3() {
        let mut config = Config::default();
        config.modules.insert(
            "tts".into(),
            ModuleConfig {
                adapter_type: "http".into(),
                enabled: true,
                config: serde_yaml::from_str("secret_token: tok-abc").unwrap(),
            },
        );
        let before = config.modules["tts"].config["secret_token"].as_str().unwrap().to_string();

        let masked = config.masked_snapshot();
        let mut patch = masked;
        // client resends the snapshot unchanged (masked) as a no-op CONFIG_SET
        patch["modules"]["tts"]["adapter_type"] = serde_yaml::Value::String("http".into());
        config.apply_masked_patch(patch).unwrap();

        assert_eq!(config.modules["tts"].config["secret_token"].as_str().unwrap(), before);
    }
}
