use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiValueMethod {
    #[default]
    Permutation,
    RandomSelection,
}

/// Top-level input of one run: prompt templates plus the overlays applied to
/// every record they produce.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSpec {
    #[serde(default)]
    pub multi_value_method: MultiValueMethod,
    #[serde(default)]
    pub permutations: Vec<VariantOverlay>,
    pub prompts: Vec<PromptTemplate>,
}

impl BatchSpec {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading batch spec {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid batch spec {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let spec: Self = serde_json::from_str(raw)?;
        if spec.prompts.is_empty() {
            anyhow::bail!("batch spec has no prompts");
        }
        Ok(spec)
    }
}

/// A field that is either a single value or a list of candidates to vary over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        Self::One(value)
    }
}

/// Boolean that also accepts the keyword `"both"`. Any other text is kept as
/// written and interpreted leniently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriState {
    Bool(bool),
    Text(String),
}

impl TriState {
    pub fn is_both(&self) -> bool {
        matches!(self, Self::Text(text) if text.trim().eq_ignore_ascii_case("both"))
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(text) => matches!(
                text.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedSpec {
    Number(i64),
    Text(String),
    List(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointRef {
    Named(String),
    WithOverrides(CheckpointOverrides),
}

impl CheckpointRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(name) => name,
            Self::WithOverrides(overrides) => &overrides.checkpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOverrides {
    pub checkpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_before_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_after_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_before_negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_after_negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_before_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_after_filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TiledDiffusionSetting {
    Toggle(bool),
    Custom(TiledDiffusion),
}

impl TiledDiffusionSetting {
    pub fn into_config(self) -> Option<TiledDiffusion> {
        match self {
            Self::Toggle(true) => Some(TiledDiffusion::default()),
            Self::Toggle(false) => None,
            Self::Custom(config) => Some(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiledDiffusion {
    #[serde(default = "default_tiled_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_overlap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscaler: Option<String>,
}

impl Default for TiledDiffusion {
    fn default() -> Self {
        Self {
            method: default_tiled_method(),
            scale_factor: None,
            tile_width: None,
            tile_height: None,
            tile_overlap: None,
            tile_batch_size: None,
            upscaler: None,
        }
    }
}

fn default_tiled_method() -> String {
    "MultiDiffusion".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMode {
    Balanced,
    Prompt,
    Controlnet,
}

impl ControlMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Balanced => "Balanced",
            Self::Prompt => "My prompt is more important",
            Self::Controlnet => "ControlNet is more important",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeMode {
    JustResize,
    InnerFit,
    Envelope,
}

impl ResizeMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::JustResize => "Just Resize",
            Self::InnerFit => "Crop and Resize",
            Self::Envelope => "Resize and Fill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNetUnit {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_mode: Option<ControlMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize_mode: Option<ResizeMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_perfect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_vram: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdetailerUnit {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoising: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_blur: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inpaint_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inpaint_height: Option<u32>,
}

/// One entry of `prompts`. Omitted varying fields fall back to the
/// checkpoint family's defaults at compile time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub prompt: OneOrMany<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub negative_prompt: Option<OneOrMany<String>>,
    #[serde(default)]
    pub seed: Option<SeedSpec>,
    #[serde(default)]
    pub checkpoints: Option<OneOrMany<CheckpointRef>>,
    #[serde(default)]
    pub vae: Option<OneOrMany<String>>,
    #[serde(default)]
    pub upscaler: Option<OneOrMany<String>>,
    #[serde(default)]
    pub sampler: Option<OneOrMany<String>>,
    #[serde(default)]
    pub cfg: Option<OneOrMany<f64>>,
    #[serde(default)]
    pub steps: Option<OneOrMany<u32>>,
    #[serde(default)]
    pub width: Option<OneOrMany<u32>>,
    #[serde(default)]
    pub height: Option<OneOrMany<u32>>,
    #[serde(default)]
    pub clip_skip: Option<OneOrMany<u32>>,
    #[serde(default)]
    pub denoising: Option<OneOrMany<f64>>,
    #[serde(default)]
    pub scale_factor: Option<OneOrMany<f64>>,
    #[serde(default)]
    pub enable_high_res: Option<TriState>,
    #[serde(default)]
    pub restore_faces: Option<TriState>,
    #[serde(default)]
    pub cutoff: Option<TriState>,
    #[serde(default)]
    pub lcm: Option<TriState>,
    #[serde(default, rename = "tiledVAE")]
    pub tiled_vae: Option<TriState>,
    #[serde(default)]
    pub ultimate_sd_upscale: Option<TriState>,
    #[serde(default)]
    pub init_image_or_folder: Option<OneOrMany<String>>,
    #[serde(default)]
    pub styles_sets: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub tiled_diffusion: Option<OneOrMany<TiledDiffusionSetting>>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub high_res_prompt: Option<String>,
    #[serde(default)]
    pub high_res_negative_prompt: Option<String>,
    #[serde(default)]
    pub high_res_steps: Option<u32>,
    #[serde(default)]
    pub control_net: Vec<ControlNetUnit>,
    #[serde(default)]
    pub adetailer: Vec<AdetailerUnit>,
}

impl PromptTemplate {
    pub fn repeat_count(&self) -> u32 {
        self.count.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

/// Named delta applied to every synthesized record, producing one extra record
/// per base record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantOverlay {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub overwrite: Map<String, Value>,
    #[serde(default)]
    pub prompt_replace: Vec<Replacement>,
    #[serde(default)]
    pub negative_prompt_replace: Vec<Replacement>,
    #[serde(default)]
    pub before_filename: Option<String>,
    #[serde(default)]
    pub after_filename: Option<String>,
    #[serde(default)]
    pub before_prompt: Option<String>,
    #[serde(default)]
    pub after_prompt: Option<String>,
}

impl VariantOverlay {
    pub fn label(&self, index: usize) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("permutation #{}", index + 1))
    }
}
