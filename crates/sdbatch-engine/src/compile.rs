use sdbatch_contracts::batch::TiledDiffusion;
use sdbatch_contracts::config::CompilerOptions;
use sdbatch_contracts::models::{CheckpointSpec, ModelCatalog, ModelFamily, ModelKind};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::extensions::{
    adetailer_script, apply_lcm, controlnet_script, cutoff_script, cutoff_targets,
    tiled_diffusion_script, tiled_vae_script, ultimate_upscale_args, ADETAILER_SCRIPT,
    CONTROLNET_SCRIPT, CUTOFF_SCRIPT, DEFAULT_ULTIMATE_SCALE, TILED_DIFFUSION_SCRIPT,
    TILED_VAE_SCRIPT, ULTIMATE_UPSCALE_SCRIPT,
};
use crate::normalize::SeedValue;
use crate::pattern::{filename_pattern, PatternValues};
use crate::synthesize::{join_prompt, scale_dimension, QueryRecord};

pub const DEFAULT_HR_UPSCALER: &str = "Latent";
pub const DEFAULT_HR_SCALE: f64 = 2.0;
pub const DEFAULT_HR_DENOISING: f64 = 0.5;
pub const RANDOM_SEED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Txt2img,
    Img2img,
}

impl QueryKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Txt2img => "txt2img",
            Self::Img2img => "img2img",
        }
    }
}

/// Backend-ready generation request. Serializes to the backend's request body;
/// `kind` picks the endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    #[serde(skip)]
    pub kind: QueryKind,
    pub prompt: String,
    pub negative_prompt: String,
    pub sampler_name: String,
    pub cfg_scale: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub restore_faces: bool,
    pub enable_hr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_upscaler: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_second_pass_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hr_negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub init_images: Vec<String>,
    pub override_settings: Map<String, Value>,
    pub override_settings_restore_afterwards: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub alwayson_scripts: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub script_args: Vec<Value>,
}

impl CompiledQuery {
    pub fn checkpoint(&self) -> Option<&str> {
        self.override_settings
            .get("sd_model_checkpoint")
            .and_then(Value::as_str)
    }
}

/// Resolves `requested` against the catalog, logging non-exact matches.
pub(crate) fn resolve_reference(
    catalog: &dyn ModelCatalog,
    kind: ModelKind,
    requested: &str,
) -> Result<String, ValidationError> {
    let Some(found) = catalog.resolve(kind, requested) else {
        return Err(ValidationError::unknown_model(kind.field(), requested));
    };
    if let Some(reason) = found.fallback_reason() {
        debug!(field = kind.field(), %reason, "model reference resolved by fallback");
    }
    Ok(found.name)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

pub struct QueryCompiler<'a> {
    catalog: &'a dyn ModelCatalog,
    options: &'a CompilerOptions,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(catalog: &'a dyn ModelCatalog, options: &'a CompilerOptions) -> Self {
        Self { catalog, options }
    }

    pub fn compile(&self, record: &QueryRecord) -> Result<CompiledQuery, ValidationError> {
        let checkpoint = match non_empty(record.checkpoint.as_deref()) {
            Some(requested) => Some(self.checkpoint(requested)?),
            None => None,
        };
        let family = checkpoint
            .as_ref()
            .map(|spec| spec.family)
            .unwrap_or(ModelFamily::Unknown);
        let defaults = self.catalog.defaults(checkpoint.as_ref());

        let sampler = match non_empty(record.sampler.as_deref()) {
            Some(requested) => self.resolve(ModelKind::Sampler, requested)?,
            None => self
                .catalog
                .resolve(ModelKind::Sampler, &defaults.sampler)
                .map(|found| found.name)
                .unwrap_or_else(|| defaults.sampler.clone()),
        };
        let seed = match &record.seed {
            None => RANDOM_SEED,
            Some(SeedValue::Fixed(seed)) => *seed,
            Some(SeedValue::Literal(raw)) => {
                return Err(ValidationError::invalid_value("seed", raw.as_str()))
            }
        };
        let vae = non_empty(record.vae.as_deref())
            .map(|requested| self.resolve(ModelKind::Vae, requested))
            .transpose()?;
        let upscaler = non_empty(record.upscaler.as_deref())
            .map(|requested| self.resolve(ModelKind::Upscaler, requested))
            .transpose()?;

        let mut width = record.width.unwrap_or(defaults.width);
        let mut height = record.height.unwrap_or(defaults.height);
        let mut tiled = record.tiled_diffusion.clone();
        if tiled.is_none() && self.options.auto_tiled_diffusion {
            tiled = Some(TiledDiffusion::default());
        }
        // Tiled diffusion consumes its own factor, else the template's.
        let mut scale_factor = record.scale_factor;
        if let Some(config) = tiled.as_mut() {
            if let Some(scale) = config.scale_factor.take().or_else(|| scale_factor.take()) {
                width = scale_dimension(width, scale);
                height = scale_dimension(height, scale);
            }
        }

        let kind = if record.init_image.is_some() {
            QueryKind::Img2img
        } else {
            QueryKind::Txt2img
        };
        let mut query = CompiledQuery {
            kind,
            prompt: record.prompt.clone(),
            negative_prompt: record.negative_prompt.clone().unwrap_or_default(),
            sampler_name: sampler,
            cfg_scale: record.cfg.unwrap_or(defaults.cfg),
            steps: record.steps.unwrap_or(defaults.steps),
            width,
            height,
            seed,
            restore_faces: record.restore_faces,
            enable_hr: false,
            hr_upscaler: None,
            hr_scale: None,
            hr_second_pass_steps: None,
            hr_prompt: None,
            hr_negative_prompt: None,
            denoising_strength: None,
            init_images: record.init_image.iter().cloned().collect(),
            override_settings: Map::new(),
            override_settings_restore_afterwards: true,
            alwayson_scripts: Map::new(),
            script_name: None,
            script_args: Vec::new(),
        };
        if let Some(spec) = &checkpoint {
            query.override_settings.insert(
                "sd_model_checkpoint".to_string(),
                Value::String(spec.name.clone()),
            );
        }
        if let Some(vae) = vae {
            query
                .override_settings
                .insert("sd_vae".to_string(), Value::String(vae));
        }
        if let Some(clip_skip) = record.clip_skip {
            query.override_settings.insert(
                "CLIP_stop_at_last_layers".to_string(),
                Value::from(clip_skip),
            );
        }

        self.apply_high_res(&mut query, record, upscaler.as_deref(), scale_factor);
        self.apply_extensions(
            &mut query,
            record,
            tiled.as_ref(),
            upscaler.as_deref(),
            scale_factor,
        )?;

        let wants_lcm = record.lcm
            || (self.options.auto_lcm
                && checkpoint
                    .as_ref()
                    .map_or(true, |spec| spec.accelerator.is_none()));
        if wants_lcm {
            apply_lcm(&mut query, family);
        }
        if let Some(forced) = &defaults.forced_sampler {
            if !query.sampler_name.eq_ignore_ascii_case(forced) {
                return Err(ValidationError::InvalidSamplerForModel {
                    checkpoint: checkpoint
                        .as_ref()
                        .map(|spec| spec.name.clone())
                        .unwrap_or_default(),
                    sampler: query.sampler_name,
                    forced: forced.clone(),
                });
            }
        }

        self.apply_styles(&mut query, &record.styles)?;

        let values = PatternValues {
            filename: record.filename.clone(),
            cfg: query.cfg_scale,
            clip_skip: record.clip_skip,
            denoising: query.denoising_strength,
            enable_high_res: query.enable_hr,
            height: query.height,
            restore_faces: query.restore_faces,
            scale_factor: scale_factor.or(query.hr_scale),
            seed: Some(query.seed),
            steps: query.steps,
            width: query.width,
        };
        if let Some(pattern) =
            filename_pattern(record.filename.as_deref(), record.pattern.as_deref(), &values)?
        {
            query
                .override_settings
                .insert("samples_filename_pattern".to_string(), Value::String(pattern));
        }

        debug!(
            endpoint = kind.endpoint(),
            checkpoint = query.checkpoint().unwrap_or("-"),
            sampler = %query.sampler_name,
            steps = query.steps,
            width = query.width,
            height = query.height,
            "compiled query"
        );
        Ok(query)
    }

    fn resolve(&self, kind: ModelKind, requested: &str) -> Result<String, ValidationError> {
        resolve_reference(self.catalog, kind, requested)
    }

    fn checkpoint(&self, requested: &str) -> Result<CheckpointSpec, ValidationError> {
        let name = self.resolve(ModelKind::Checkpoint, requested)?;
        Ok(self
            .catalog
            .checkpoint(&name)
            .unwrap_or_else(|| CheckpointSpec::detect(&name, None)))
    }

    fn apply_high_res(
        &self,
        query: &mut CompiledQuery,
        record: &QueryRecord,
        upscaler: Option<&str>,
        scale_factor: Option<f64>,
    ) {
        if query.kind == QueryKind::Img2img {
            query.enable_hr = false;
            query.denoising_strength = record.denoising;
            return;
        }
        let wants_high_res = record.enable_high_res
            || record.denoising.is_some()
            || upscaler.is_some()
            || record.high_res_prompt.is_some()
            || record.high_res_negative_prompt.is_some();
        if !wants_high_res {
            return;
        }
        query.enable_hr = true;
        query.hr_upscaler = Some(upscaler.unwrap_or(DEFAULT_HR_UPSCALER).to_string());
        query.hr_scale = Some(scale_factor.unwrap_or(DEFAULT_HR_SCALE));
        query.denoising_strength = Some(record.denoising.unwrap_or(DEFAULT_HR_DENOISING));
        query.hr_second_pass_steps = record.high_res_steps;
        query.hr_prompt = Some(record.high_res_prompt.clone().unwrap_or_default());
        query.hr_negative_prompt =
            Some(record.high_res_negative_prompt.clone().unwrap_or_default());
    }

    fn apply_extensions(
        &self,
        query: &mut CompiledQuery,
        record: &QueryRecord,
        tiled: Option<&TiledDiffusion>,
        upscaler: Option<&str>,
        scale_factor: Option<f64>,
    ) -> Result<(), ValidationError> {
        if let Some(script) = controlnet_script(&record.control_net, self.catalog)? {
            query
                .alwayson_scripts
                .insert(CONTROLNET_SCRIPT.to_string(), script);
        }
        if let Some(script) =
            adetailer_script(&record.adetailer, self.catalog, query.width, query.height)?
        {
            query
                .alwayson_scripts
                .insert(ADETAILER_SCRIPT.to_string(), script);
        }

        if record.cutoff || self.options.auto_cutoff {
            let targets = cutoff_targets(&query.prompt, &self.options.cutoff_tokens);
            if targets.is_empty() {
                debug!(prompt = %query.prompt, "cutoff skipped: no color fragments");
            } else {
                query.alwayson_scripts.insert(
                    CUTOFF_SCRIPT.to_string(),
                    cutoff_script(&targets, self.options.cutoff_weight),
                );
            }
        }

        if let Some(config) = tiled {
            let tiled_upscaler = match non_empty(config.upscaler.as_deref()) {
                Some(requested) => self.resolve(ModelKind::Upscaler, requested)?,
                None => "None".to_string(),
            };
            query.alwayson_scripts.insert(
                TILED_DIFFUSION_SCRIPT.to_string(),
                tiled_diffusion_script(config, query.width, query.height, &tiled_upscaler),
            );
        }
        if record.tiled_vae || self.options.auto_tiled_vae {
            query
                .alwayson_scripts
                .insert(TILED_VAE_SCRIPT.to_string(), tiled_vae_script());
        }

        if record.ultimate_sd_upscale {
            if query.kind != QueryKind::Img2img {
                warn!(prompt = %query.prompt, "ultimate sd upscale needs an init image; skipped");
                return Ok(());
            }
            if tiled.is_some() {
                warn!(
                    prompt = %query.prompt,
                    "tiled diffusion and ultimate sd upscale are both enabled"
                );
            }
            let upscaler_index = upscaler
                .and_then(|name| self.catalog.upscaler_index(name))
                .unwrap_or(0);
            query.script_name = Some(ULTIMATE_UPSCALE_SCRIPT.to_string());
            query.script_args = ultimate_upscale_args(
                query.width,
                query.height,
                scale_factor.unwrap_or(DEFAULT_ULTIMATE_SCALE),
                upscaler_index,
            );
        }
        Ok(())
    }

    fn apply_styles(
        &self,
        query: &mut CompiledQuery,
        styles: &[String],
    ) -> Result<(), ValidationError> {
        for requested in styles {
            let Some(requested) = non_empty(Some(requested.as_str())) else {
                continue;
            };
            let name = self.resolve(ModelKind::Style, requested)?;
            let Some(style) = self.catalog.style(&name) else {
                continue;
            };
            query.prompt = apply_style_text(&query.prompt, &style.prompt);
            query.negative_prompt =
                apply_style_text(&query.negative_prompt, &style.negative_prompt);
        }
        Ok(())
    }
}

/// Merges a style into a prompt: `{prompt}` in the style is replaced by the
/// prompt, otherwise the style is appended.
pub fn apply_style_text(base: &str, style: &str) -> String {
    if style.trim().is_empty() {
        return base.to_string();
    }
    if style.contains("{prompt}") {
        return style.replace("{prompt}", base);
    }
    join_prompt(base, style)
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::batch::{AdetailerUnit, TiledDiffusion};
    use sdbatch_contracts::models::{StaticCatalog, StylePreset};
    use serde_json::json;

    use super::*;

    fn catalog() -> StaticCatalog {
        let mut catalog = StaticCatalog::new()
            .with(
                ModelKind::Checkpoint,
                &[
                    "dreamshaper_8.safetensors [879db523c3]",
                    "juggernautXL_lightning.safetensors",
                    "sdxl_turbo.safetensors",
                ],
            )
            .with(
                ModelKind::Sampler,
                &["Euler a", "Euler", "DPM++ 2M Karras", "DPM++ SDE Karras", "LCM"],
            )
            .with(ModelKind::Upscaler, &["None", "Lanczos", "R-ESRGAN 4x+"])
            .with(ModelKind::Vae, &["sdxl_vae.safetensors"])
            .with(ModelKind::AdetailerModel, &["face_yolov8n.pt"]);
        catalog.add_style(StylePreset {
            name: "cinematic".to_string(),
            prompt: "cinematic still of {prompt}, film grain".to_string(),
            negative_prompt: "cartoon".to_string(),
        });
        catalog
    }

    fn record(prompt: &str) -> QueryRecord {
        QueryRecord {
            prompt: prompt.to_string(),
            ..QueryRecord::default()
        }
    }

    fn compile(record: &QueryRecord) -> Result<CompiledQuery, ValidationError> {
        let catalog = catalog();
        let options = CompilerOptions::default();
        QueryCompiler::new(&catalog, &options).compile(record)
    }

    #[test]
    fn family_defaults_fill_unset_fields() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            checkpoint: Some("dreamshaper_8".to_string()),
            ..record("cat")
        })?;
        assert_eq!(query.kind, QueryKind::Txt2img);
        assert_eq!(query.checkpoint(), Some("dreamshaper_8.safetensors [879db523c3]"));
        assert_eq!(query.sampler_name, "DPM++ 2M Karras");
        assert_eq!(query.cfg_scale, 7.0);
        assert_eq!((query.width, query.height), (512, 512));
        assert_eq!(query.seed, RANDOM_SEED);
        assert!(!query.enable_hr);
        Ok(())
    }

    #[test]
    fn forced_sampler_mismatch_is_rejected() {
        let err = compile(&QueryRecord {
            checkpoint: Some("juggernautXL_lightning".to_string()),
            sampler: Some("Euler a".to_string()),
            ..record("cat")
        })
        .err();
        assert_eq!(
            err,
            Some(ValidationError::InvalidSamplerForModel {
                checkpoint: "juggernautXL_lightning.safetensors".to_string(),
                sampler: "Euler a".to_string(),
                forced: "DPM++ SDE Karras".to_string(),
            })
        );
    }

    #[test]
    fn forced_sampler_is_the_default() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            checkpoint: Some("juggernautXL_lightning".to_string()),
            ..record("cat")
        })?;
        assert_eq!(query.sampler_name, "DPM++ SDE Karras");
        assert_eq!((query.width, query.height), (1024, 1024));
        Ok(())
    }

    #[test]
    fn unknown_references_name_the_field() {
        let err = compile(&QueryRecord {
            vae: Some("missing_vae".to_string()),
            ..record("cat")
        })
        .err();
        assert_eq!(err, Some(ValidationError::unknown_model("vae", "missing_vae")));

        let err = compile(&QueryRecord {
            checkpoint: Some("nothing_like_it".to_string()),
            ..record("cat")
        })
        .err();
        assert_eq!(
            err,
            Some(ValidationError::unknown_model("checkpoint", "nothing_like_it"))
        );
    }

    #[test]
    fn malformed_seed_is_rejected() {
        let err = compile(&QueryRecord {
            seed: Some(SeedValue::Literal("lucky".to_string())),
            ..record("cat")
        })
        .err();
        assert_eq!(err, Some(ValidationError::invalid_value("seed", "lucky")));
    }

    #[test]
    fn high_res_defaults_on_txt2img() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            enable_high_res: true,
            ..record("cat")
        })?;
        assert!(query.enable_hr);
        assert_eq!(query.hr_upscaler.as_deref(), Some("Latent"));
        assert_eq!(query.hr_scale, Some(2.0));
        assert_eq!(query.denoising_strength, Some(0.5));
        assert_eq!(query.hr_prompt.as_deref(), Some(""));

        let query = compile(&QueryRecord {
            upscaler: Some("lanczos".to_string()),
            ..record("cat")
        })?;
        assert!(query.enable_hr);
        assert_eq!(query.hr_upscaler.as_deref(), Some("Lanczos"));
        Ok(())
    }

    #[test]
    fn img2img_uses_denoising_as_strength() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            init_image: Some("input.png".to_string()),
            denoising: Some(0.35),
            enable_high_res: true,
            ..record("cat")
        })?;
        assert_eq!(query.kind, QueryKind::Img2img);
        assert!(!query.enable_hr);
        assert_eq!(query.denoising_strength, Some(0.35));
        assert_eq!(query.init_images, vec!["input.png".to_string()]);
        let body = serde_json::to_value(&query)?;
        assert!(body.get("hr_upscaler").is_none());
        assert!(body.get("kind").is_none());
        Ok(())
    }

    #[test]
    fn lcm_overrides_sampling_and_prepends_lora() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            checkpoint: Some("dreamshaper_8".to_string()),
            lcm: true,
            ..record("cat")
        })?;
        assert_eq!(query.prompt, "<lora:lcm-lora-sdv1-5:1>, cat");
        assert_eq!(query.sampler_name, "LCM");
        assert_eq!(query.steps, 6);
        assert_eq!(query.cfg_scale, 1.5);
        Ok(())
    }

    #[test]
    fn auto_lcm_skips_accelerated_checkpoints() -> anyhow::Result<()> {
        let catalog = catalog();
        let options = CompilerOptions {
            auto_lcm: true,
            ..CompilerOptions::default()
        };
        let compiler = QueryCompiler::new(&catalog, &options);
        let turbo = compiler.compile(&QueryRecord {
            checkpoint: Some("sdxl_turbo".to_string()),
            ..record("cat")
        })?;
        assert_eq!(turbo.prompt, "cat");
        let plain = compiler.compile(&QueryRecord {
            checkpoint: Some("dreamshaper_8".to_string()),
            ..record("cat")
        })?;
        assert!(plain.prompt.starts_with("<lora:lcm-lora-sdv1-5:1>"));
        Ok(())
    }

    #[test]
    fn lcm_cannot_replace_a_forced_sampler() {
        let err = compile(&QueryRecord {
            checkpoint: Some("juggernautXL_lightning".to_string()),
            lcm: true,
            ..record("cat")
        })
        .err();
        assert_eq!(
            err,
            Some(ValidationError::InvalidSamplerForModel {
                checkpoint: "juggernautXL_lightning.safetensors".to_string(),
                sampler: "LCM".to_string(),
                forced: "DPM++ SDE Karras".to_string(),
            })
        );
    }

    #[test]
    fn styles_wrap_prompt_and_append_negative() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            negative_prompt: Some("blurry".to_string()),
            styles: vec!["Cinematic".to_string()],
            ..record("cat")
        })?;
        assert_eq!(query.prompt, "cinematic still of cat, film grain");
        assert_eq!(query.negative_prompt, "blurry, cartoon");

        let err = compile(&QueryRecord {
            styles: vec!["watercolor".to_string()],
            ..record("cat")
        })
        .err();
        assert_eq!(err, Some(ValidationError::unknown_model("styles", "watercolor")));
        Ok(())
    }

    #[test]
    fn filename_pattern_is_expanded_into_override_settings() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            filename: Some("cat".to_string()),
            pattern: Some("{filename}-{cfg}-{seed}-[model_name]".to_string()),
            seed: Some(SeedValue::Fixed(42)),
            cfg: Some(6.5),
            ..record("cat")
        })?;
        assert_eq!(
            query.override_settings["samples_filename_pattern"],
            json!("cat-6.5-42-[model_name]")
        );

        let query = compile(&QueryRecord {
            filename: Some("cat".to_string()),
            ..record("cat")
        })?;
        assert_eq!(
            query.override_settings["samples_filename_pattern"],
            json!("cat-[datetime]")
        );
        Ok(())
    }

    #[test]
    fn bogus_pattern_token_fails() {
        let err = compile(&QueryRecord {
            pattern: Some("{bogus}".to_string()),
            ..record("cat")
        })
        .err();
        assert!(matches!(err, Some(ValidationError::UnknownPatternToken { .. })));
    }

    #[test]
    fn tiled_diffusion_consumes_scale_after_defaults() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            checkpoint: Some("dreamshaper_8".to_string()),
            tiled_diffusion: Some(TiledDiffusion {
                scale_factor: Some(1.5),
                upscaler: Some("R-ESRGAN 4x+".to_string()),
                ..TiledDiffusion::default()
            }),
            tiled_vae: true,
            ..record("cat")
        })?;
        assert_eq!((query.width, query.height), (768, 768));
        let args = &query.alwayson_scripts["Tiled Diffusion"]["args"];
        assert_eq!(args[1], json!("MultiDiffusion"));
        assert_eq!(args[4], json!(768));
        assert_eq!(args[10], json!("R-ESRGAN 4x+"));
        assert!(query.alwayson_scripts.contains_key("Tiled VAE"));
        Ok(())
    }

    #[test]
    fn tiled_diffusion_uses_template_scale_and_hides_it_from_high_res() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            checkpoint: Some("dreamshaper_8".to_string()),
            scale_factor: Some(1.5),
            enable_high_res: true,
            tiled_diffusion: Some(TiledDiffusion::default()),
            ..record("cat")
        })?;
        assert_eq!((query.width, query.height), (768, 768));
        assert_eq!(query.hr_scale, Some(DEFAULT_HR_SCALE));
        assert!(query.alwayson_scripts.contains_key("Tiled Diffusion"));
        Ok(())
    }

    #[test]
    fn ultimate_upscale_only_on_img2img() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            init_image: Some("input.png".to_string()),
            ultimate_sd_upscale: true,
            upscaler: Some("R-ESRGAN 4x+".to_string()),
            width: Some(512),
            height: Some(512),
            ..record("cat")
        })?;
        assert_eq!(query.script_name.as_deref(), Some("ultimate sd upscale"));
        assert_eq!(query.script_args[8], json!(2));
        assert_eq!(query.script_args[15], json!(1024));
        assert_eq!((query.width, query.height), (512, 512));

        let txt2img = compile(&QueryRecord {
            ultimate_sd_upscale: true,
            ..record("cat")
        })?;
        assert!(txt2img.script_name.is_none());
        Ok(())
    }

    #[test]
    fn auto_cutoff_uses_configured_colors() -> anyhow::Result<()> {
        let catalog = catalog();
        let options = CompilerOptions {
            auto_cutoff: true,
            cutoff_tokens: vec!["red".to_string()],
            ..CompilerOptions::default()
        };
        let query = QueryCompiler::new(&catalog, &options)
            .compile(&record("a cat, red scarf, green eyes"))?;
        assert_eq!(query.alwayson_scripts["Cutoff"]["args"][1], json!("red scarf"));

        let plain = QueryCompiler::new(&catalog, &options).compile(&record("a cat"))?;
        assert!(!plain.alwayson_scripts.contains_key("Cutoff"));
        Ok(())
    }

    #[test]
    fn adetailer_defaults_to_query_size() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            adetailer: vec![AdetailerUnit {
                model: "face_yolov8n".to_string(),
                inpaint_height: Some(640),
                ..AdetailerUnit::default()
            }],
            ..record("cat")
        })?;
        let unit = &query.alwayson_scripts["ADetailer"]["args"][2];
        assert_eq!(unit["ad_model"], json!("face_yolov8n.pt"));
        assert_eq!(unit["ad_inpaint_width"], json!(512));
        assert_eq!(unit["ad_inpaint_height"], json!(640));
        Ok(())
    }

    #[test]
    fn overrides_carry_vae_and_clip_skip() -> anyhow::Result<()> {
        let query = compile(&QueryRecord {
            vae: Some("sdxl_vae".to_string()),
            clip_skip: Some(2),
            ..record("cat")
        })?;
        assert_eq!(query.override_settings["sd_vae"], json!("sdxl_vae.safetensors"));
        assert_eq!(query.override_settings["CLIP_stop_at_last_layers"], json!(2));
        Ok(())
    }
}
