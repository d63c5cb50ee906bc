use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use sdbatch_contracts::models::{
    CatalogSnapshot, CheckpointEntry, CheckpointSpec, StaticCatalog, StylePreset,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::compile::CompiledQuery;
use crate::extensions::CONTROLNET_SCRIPT;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub payload: Map<String, Value>,
    pub images: usize,
    pub seed: Option<i64>,
    pub warnings: Vec<String>,
}

/// Sends one compiled query to a backend and waits for the result.
pub trait Transport {
    fn name(&self) -> &str;

    fn submit(&self, query: &CompiledQuery) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    api_base: String,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let api_base = endpoint.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            bail!("backend endpoint is empty");
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { api_base, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("GET {url} failed"))?;
        response_json_or_error(&url, response)
    }

    fn get_optional(&self, path: &str) -> Option<Value> {
        match self.get_json(path) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(
                    path,
                    error = %error_chain_text(&err, 256),
                    "optional catalog endpoint unavailable"
                );
                None
            }
        }
    }

    /// Reads the backend's models, samplers, styles and extension models.
    /// Extension endpoints are optional and yield empty lists when missing.
    pub fn fetch_catalog(&self) -> Result<StaticCatalog> {
        let models = self.get_json("/sdapi/v1/sd-models")?;
        let samplers = self.get_json("/sdapi/v1/samplers")?;
        let upscalers = self.get_json("/sdapi/v1/upscalers")?;

        let snapshot = CatalogSnapshot {
            checkpoints: checkpoint_entries(&models),
            vaes: self
                .get_optional("/sdapi/v1/sd-vae")
                .map(|value| names_from(&value, "model_name"))
                .unwrap_or_default(),
            upscalers: names_from(&upscalers, "name"),
            samplers: names_from(&samplers, "name"),
            controlnet_models: self
                .get_optional("/controlnet/model_list")
                .map(|value| names_from(&value, "model_list"))
                .unwrap_or_default(),
            controlnet_modules: self
                .get_optional("/controlnet/module_list")
                .map(|value| names_from(&value, "module_list"))
                .unwrap_or_default(),
            adetailer_models: self
                .get_optional("/adetailer/v1/ad_model")
                .map(|value| names_from(&value, "ad_model"))
                .unwrap_or_default(),
            styles: self
                .get_optional("/sdapi/v1/prompt-styles")
                .map(|value| style_presets(&value))
                .unwrap_or_default(),
        };
        info!(
            endpoint = %self.api_base,
            checkpoints = snapshot.checkpoints.len(),
            samplers = snapshot.samplers.len(),
            styles = snapshot.styles.len(),
            "fetched backend catalog"
        );
        let catalog = StaticCatalog::from_snapshot(snapshot);
        if catalog.is_empty() {
            warn!(endpoint = %self.api_base, "backend reported no checkpoints or samplers");
        }
        Ok(catalog)
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn submit(&self, query: &CompiledQuery) -> Result<TransportResponse> {
        let body = request_payload(query)?;
        let url = self.url(&format!("/sdapi/v1/{}", query.kind.endpoint()));
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("POST {url} failed"))?;
        let parsed = response_json_or_error(&url, response)?;
        parse_generation_response(parsed)
    }
}

/// Echoes queries without contacting a backend.
#[derive(Debug, Default)]
pub struct DryrunTransport;

impl Transport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn submit(&self, query: &CompiledQuery) -> Result<TransportResponse> {
        let mut payload = Map::new();
        payload.insert("dryrun".to_string(), Value::Bool(true));
        payload.insert(
            "endpoint".to_string(),
            Value::String(query.kind.endpoint().to_string()),
        );
        Ok(TransportResponse {
            payload,
            images: 0,
            seed: Some(query.seed).filter(|seed| *seed >= 0),
            warnings: Vec::new(),
        })
    }
}

/// Request body for `query` with init and ControlNet image paths replaced by
/// their base64 contents.
pub fn request_payload(query: &CompiledQuery) -> Result<Value> {
    let mut body = serde_json::to_value(query).context("failed to serialize query")?;
    if let Some(images) = body.get_mut("init_images").and_then(Value::as_array_mut) {
        for image in images.iter_mut() {
            encode_image_value(image)?;
        }
    }
    let units = body
        .get_mut("alwayson_scripts")
        .and_then(|scripts| scripts.get_mut(CONTROLNET_SCRIPT))
        .and_then(|script| script.get_mut("args"))
        .and_then(Value::as_array_mut);
    if let Some(units) = units {
        for unit in units.iter_mut() {
            if let Some(image) = unit.get_mut("image") {
                encode_image_value(image)?;
            }
        }
    }
    Ok(body)
}

fn encode_image_value(value: &mut Value) -> Result<()> {
    let Some(raw) = value.as_str() else {
        return Ok(());
    };
    let encoded = coerce_image_value(raw)?;
    *value = Value::String(encoded);
    Ok(())
}

/// URLs and data URLs pass through; anything else must be a readable file.
pub fn coerce_image_value(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        return Ok(trimmed.to_string());
    }
    let path = Path::new(trimmed);
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

fn parse_generation_response(value: Value) -> Result<TransportResponse> {
    let Value::Object(mut payload) = value else {
        bail!("backend returned a non-object response");
    };
    let images = payload
        .get("images")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    let info = payload
        .get("info")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    if let Some(info) = info {
        payload.insert("info".to_string(), info);
    }
    let seed = payload
        .get("info")
        .and_then(|info| info.get("seed"))
        .and_then(Value::as_i64);

    let mut warnings = Vec::new();
    if images == 0 {
        push_unique_warning(&mut warnings, "backend returned no images".to_string());
    }
    Ok(TransportResponse {
        payload,
        images,
        seed,
        warnings,
    })
}

fn checkpoint_entries(models: &Value) -> Vec<CheckpointEntry> {
    models
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let title = row.get("title").and_then(Value::as_str)?;
                    let hash = row
                        .get("hash")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Some(CheckpointEntry::Spec(CheckpointSpec::detect(title, hash)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Names from either an array of objects carrying `key`, or an object whose
/// `key` holds a list of strings.
fn names_from(value: &Value, key: &str) -> Vec<String> {
    let rows = match value {
        Value::Array(rows) => rows.iter().collect::<Vec<&Value>>(),
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_array)
            .map(|rows| rows.iter().collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    rows.into_iter()
        .filter_map(|row| match row {
            Value::String(name) => Some(name.clone()),
            Value::Object(map) => map.get(key).and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .filter(|name| !name.trim().is_empty())
        .collect()
}

fn style_presets(value: &Value) -> Vec<StylePreset> {
    value
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let name = row.get("name").and_then(Value::as_str)?;
                    let text = |key: &str| {
                        row.get(key)
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string()
                    };
                    Some(StylePreset {
                        name: name.to_string(),
                        prompt: text("prompt"),
                        negative_prompt: text("negative_prompt"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn response_json_or_error(url: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{url} response body read failed"))?;
    if !status.is_success() {
        bail!("{url} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value =
        serde_json::from_str(&body).with_context(|| format!("{url} returned invalid JSON"))?;
    Ok(parsed)
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}
