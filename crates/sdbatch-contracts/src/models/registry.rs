use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::family::{detect_accelerator, detect_family, Accelerator, DefaultBundle, ModelFamily};
use super::selectors::{resolve_name, NameMatch};

const BUILTIN_VAES: &[&str] = &["Automatic", "None"];
const BUILTIN_UPSCALERS: &[&str] = &[
    "None",
    "Latent",
    "Latent (antialiased)",
    "Latent (bicubic)",
    "Latent (bicubic antialiased)",
    "Latent (nearest)",
    "Latent (nearest-exact)",
];
const BUILTIN_CONTROLNET_MODULES: &[&str] = &["none"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Checkpoint,
    Vae,
    Upscaler,
    Sampler,
    ControlNetModel,
    ControlNetModule,
    AdetailerModel,
    Style,
}

impl ModelKind {
    pub fn field(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Vae => "vae",
            Self::Upscaler => "upscaler",
            Self::Sampler => "sampler",
            Self::ControlNetModel => "controlNet.model",
            Self::ControlNetModule => "controlNet.module",
            Self::AdetailerModel => "adetailer.model",
            Self::Style => "styles",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSpec {
    pub name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub family: ModelFamily,
    #[serde(default)]
    pub accelerator: Option<Accelerator>,
}

impl CheckpointSpec {
    /// Builds a spec whose family and accelerator are inferred from the name.
    pub fn detect(name: &str, hash: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            hash,
            family: detect_family(name),
            accelerator: detect_accelerator(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePreset {
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
}

/// Read-only view of the backend's models and presets used while compiling.
pub trait ModelCatalog {
    fn resolve(&self, kind: ModelKind, requested: &str) -> Option<NameMatch>;

    fn checkpoint(&self, canonical: &str) -> Option<CheckpointSpec>;

    fn style(&self, canonical: &str) -> Option<StylePreset>;

    fn upscaler_index(&self, canonical: &str) -> Option<usize>;

    fn defaults(&self, checkpoint: Option<&CheckpointSpec>) -> DefaultBundle {
        match checkpoint {
            Some(spec) => DefaultBundle::for_model(spec.family, spec.accelerator),
            None => DefaultBundle::for_model(ModelFamily::Unknown, None),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    checkpoints: IndexMap<String, CheckpointSpec>,
    vaes: Vec<String>,
    upscalers: Vec<String>,
    samplers: Vec<String>,
    controlnet_models: Vec<String>,
    controlnet_modules: Vec<String>,
    adetailer_models: Vec<String>,
    styles: IndexMap<String, StylePreset>,
}

/// On-disk shape of a catalog snapshot (`--catalog` files).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSnapshot {
    pub checkpoints: Vec<CheckpointEntry>,
    pub vaes: Vec<String>,
    pub upscalers: Vec<String>,
    pub samplers: Vec<String>,
    pub controlnet_models: Vec<String>,
    pub controlnet_modules: Vec<String>,
    pub adetailer_models: Vec<String>,
    pub styles: Vec<StylePreset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointEntry {
    Name(String),
    Spec(CheckpointSpec),
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let mut catalog = Self::new();
        for entry in snapshot.checkpoints {
            let spec = match entry {
                CheckpointEntry::Name(name) => CheckpointSpec::detect(&name, None),
                CheckpointEntry::Spec(spec) => spec,
            };
            catalog.add_checkpoint(spec);
        }
        catalog.vaes = snapshot.vaes;
        catalog.upscalers = snapshot.upscalers;
        catalog.samplers = snapshot.samplers;
        catalog.controlnet_models = snapshot.controlnet_models;
        catalog.controlnet_modules = snapshot.controlnet_modules;
        catalog.adetailer_models = snapshot.adetailer_models;
        for style in snapshot.styles {
            catalog.add_style(style);
        }
        catalog
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading catalog {}", path.display()))?;
        let snapshot: CatalogSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("invalid catalog {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn add_checkpoint(&mut self, spec: CheckpointSpec) {
        self.checkpoints.insert(spec.name.clone(), spec);
    }

    pub fn add_style(&mut self, style: StylePreset) {
        self.styles.insert(style.name.clone(), style);
    }

    pub fn add(&mut self, kind: ModelKind, name: impl Into<String>) {
        let name = name.into();
        match kind {
            ModelKind::Checkpoint => self.add_checkpoint(CheckpointSpec::detect(&name, None)),
            ModelKind::Style => self.add_style(StylePreset {
                name,
                ..StylePreset::default()
            }),
            other => {
                if let Some(list) = self.list_mut(other) {
                    if !list.contains(&name) {
                        list.push(name);
                    }
                }
            }
        }
    }

    pub fn with(mut self, kind: ModelKind, names: &[&str]) -> Self {
        for name in names {
            self.add(kind, *name);
        }
        self
    }

    pub fn names(&self, kind: ModelKind) -> Vec<&str> {
        let builtins: &[&str] = match kind {
            ModelKind::Vae => BUILTIN_VAES,
            ModelKind::Upscaler => BUILTIN_UPSCALERS,
            ModelKind::ControlNetModule => BUILTIN_CONTROLNET_MODULES,
            _ => &[],
        };
        let listed: Vec<&str> = match kind {
            ModelKind::Checkpoint => self.checkpoints.keys().map(String::as_str).collect(),
            ModelKind::Style => self.styles.keys().map(String::as_str).collect(),
            ModelKind::Vae => self.vaes.iter().map(String::as_str).collect(),
            ModelKind::Upscaler => self.upscalers.iter().map(String::as_str).collect(),
            ModelKind::Sampler => self.samplers.iter().map(String::as_str).collect(),
            ModelKind::ControlNetModel => {
                self.controlnet_models.iter().map(String::as_str).collect()
            }
            ModelKind::ControlNetModule => {
                self.controlnet_modules.iter().map(String::as_str).collect()
            }
            ModelKind::AdetailerModel => {
                self.adetailer_models.iter().map(String::as_str).collect()
            }
        };
        let mut names = listed;
        for builtin in builtins {
            if !names.contains(builtin) {
                names.push(*builtin);
            }
        }
        names
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty() && self.samplers.is_empty()
    }

    fn list_mut(&mut self, kind: ModelKind) -> Option<&mut Vec<String>> {
        match kind {
            ModelKind::Vae => Some(&mut self.vaes),
            ModelKind::Upscaler => Some(&mut self.upscalers),
            ModelKind::Sampler => Some(&mut self.samplers),
            ModelKind::ControlNetModel => Some(&mut self.controlnet_models),
            ModelKind::ControlNetModule => Some(&mut self.controlnet_modules),
            ModelKind::AdetailerModel => Some(&mut self.adetailer_models),
            ModelKind::Checkpoint | ModelKind::Style => None,
        }
    }
}

impl ModelCatalog for StaticCatalog {
    fn resolve(&self, kind: ModelKind, requested: &str) -> Option<NameMatch> {
        resolve_name(self.names(kind), requested)
    }

    fn checkpoint(&self, canonical: &str) -> Option<CheckpointSpec> {
        self.checkpoints.get(canonical).cloned()
    }

    fn style(&self, canonical: &str) -> Option<StylePreset> {
        self.styles.get(canonical).cloned()
    }

    fn upscaler_index(&self, canonical: &str) -> Option<usize> {
        self.upscalers.iter().position(|name| name == canonical)
    }
}
