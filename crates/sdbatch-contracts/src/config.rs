use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:7860";
pub const CONFIG_PATH_ENV: &str = "SDBATCH_CONFIG";
pub const ENDPOINT_ENV: &str = "SDBATCH_ENDPOINT";

const DEFAULT_CUTOFF_TOKENS: &[&str] = &[
    "white", "black", "grey", "gray", "red", "orange", "yellow", "green", "blue", "cyan",
    "purple", "violet", "pink", "magenta", "brown", "gold", "golden", "silver", "blonde",
];

/// Persisted user configuration. Every field has a default so partial files
/// load cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub endpoint: String,
    pub auto_cutoff: bool,
    pub auto_lcm: bool,
    pub auto_tiled_diffusion: bool,
    pub auto_tiled_vae: bool,
    pub cutoff_tokens: Vec<String>,
    pub cutoff_weight: f64,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auto_cutoff: false,
            auto_lcm: false,
            auto_tiled_diffusion: false,
            auto_tiled_vae: false,
            cutoff_tokens: DEFAULT_CUTOFF_TOKENS
                .iter()
                .map(|token| (*token).to_string())
                .collect(),
            cutoff_weight: 0.5,
            request_timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn compiler_options(&self) -> CompilerOptions {
        CompilerOptions {
            auto_cutoff: self.auto_cutoff,
            auto_lcm: self.auto_lcm,
            auto_tiled_diffusion: self.auto_tiled_diffusion,
            auto_tiled_vae: self.auto_tiled_vae,
            cutoff_tokens: self.cutoff_tokens.clone(),
            cutoff_weight: self.cutoff_weight,
        }
    }

    /// Endpoint with the `SDBATCH_ENDPOINT` override applied.
    pub fn effective_endpoint(&self) -> String {
        env::var(ENDPOINT_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.endpoint.clone())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Global switches consulted by the query compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerOptions {
    pub auto_cutoff: bool,
    pub auto_lcm: bool,
    pub auto_tiled_diffusion: bool,
    pub auto_tiled_vae: bool,
    pub cutoff_tokens: Vec<String>,
    pub cutoff_weight: f64,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Config::default().compiler_options()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    /// Loads the config at `path`; a missing or unreadable file yields defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let config = match read_json_object(&path) {
            Some(payload) => match serde_json::from_value::<Config>(Value::Object(payload)) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring invalid config");
                    Config::default()
                }
            },
            None => Config::default(),
        };
        Self { path, config }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let payload = serde_json::to_value(&self.config).ok()?;
        payload.get(key).cloned()
    }

    /// Sets one key. `raw` is parsed as JSON when possible and kept as a string
    /// otherwise; the result must still deserialize as a [`Config`].
    pub fn set(&mut self, key: &str, raw: &str) -> anyhow::Result<()> {
        let known = serde_json::to_value(Config::default())?;
        if known.get(key).is_none() {
            anyhow::bail!("unknown config key '{key}'");
        }
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        on_disk.insert(key.to_string(), value);
        let config = serde_json::from_value::<Config>(Value::Object(on_disk.clone()))
            .with_context(|| format!("invalid value for config key '{key}'"))?;
        write_json_object(&self.path, &on_disk)?;
        self.config = config;
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sdbatch.json")
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ConfigStore::open(temp.path().join("absent.json"));
        assert_eq!(store.config(), &Config::default());
        assert_eq!(store.get("endpoint"), Some(json!(DEFAULT_ENDPOINT)));
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"autoCutoff": true, "cutoffTokens": ["red"]}"#)?;
        let store = ConfigStore::open(&path);
        assert!(store.config().auto_cutoff);
        assert_eq!(store.config().cutoff_tokens, vec!["red".to_string()]);
        assert_eq!(store.config().cutoff_weight, 0.5);
        Ok(())
    }

    #[test]
    fn mistyped_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"cutoffWeight": "heavy"}"#)?;
        let store = ConfigStore::open(&path);
        assert_eq!(store.config(), &Config::default());
        Ok(())
    }

    #[test]
    fn set_persists_and_merges_with_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("config.json");
        let mut store_a = ConfigStore::open(&path);
        let mut store_b = ConfigStore::open(&path);

        store_a.set("autoLcm", "true")?;
        store_b.set("endpoint", "http://gpu-box:7860")?;

        let reloaded = ConfigStore::open(&path);
        assert!(reloaded.config().auto_lcm);
        assert_eq!(reloaded.config().endpoint, "http://gpu-box:7860");
        Ok(())
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_types() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.json");
        let mut store = ConfigStore::open(&path);
        assert!(store.set("bogus", "1").is_err());
        assert!(store.set("autoCutoff", "not-a-bool").is_err());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn compiler_options_mirror_config_flags() {
        let config = Config {
            auto_tiled_vae: true,
            cutoff_weight: 1.0,
            ..Config::default()
        };
        let options = config.compiler_options();
        assert!(options.auto_tiled_vae);
        assert!(!options.auto_cutoff);
        assert_eq!(options.cutoff_weight, 1.0);
        assert!(options.cutoff_tokens.iter().any(|token| token == "red"));
    }
}
