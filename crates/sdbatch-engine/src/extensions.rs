//! Payload builders for the backend extensions a record can switch on.
//!
//! Each builder is independent. `alwayson_scripts` entries are keyed by the
//! extension's script title; Ultimate SD Upscale is a regular img2img script
//! and goes through `script_name` / `script_args` instead.

use std::sync::OnceLock;

use regex::Regex;
use sdbatch_contracts::batch::{
    AdetailerUnit, ControlMode, ControlNetUnit, ResizeMode, TiledDiffusion,
};
use sdbatch_contracts::models::{
    lcm_lora_token, ModelCatalog, ModelFamily, ModelKind, LCM_CFG, LCM_SAMPLER, LCM_STEPS,
};
use serde_json::{json, Value};

use crate::compile::{resolve_reference, CompiledQuery};
use crate::error::ValidationError;
use crate::synthesize::{join_prompt, scale_dimension};

pub const CONTROLNET_SCRIPT: &str = "controlnet";
pub const ADETAILER_SCRIPT: &str = "ADetailer";
pub const CUTOFF_SCRIPT: &str = "Cutoff";
pub const TILED_DIFFUSION_SCRIPT: &str = "Tiled Diffusion";
pub const TILED_VAE_SCRIPT: &str = "Tiled VAE";
pub const ULTIMATE_UPSCALE_SCRIPT: &str = "ultimate sd upscale";

pub const DEFAULT_ULTIMATE_SCALE: f64 = 2.0;

const ADETAILER_CONFIDENCE: f64 = 0.3;
const ADETAILER_DENOISING: f64 = 0.4;
const ADETAILER_MASK_BLUR: u32 = 4;

const TILED_DIFFUSION_TILE_SIZE: u32 = 96;
const TILED_DIFFUSION_OVERLAP: u32 = 48;
const TILED_DIFFUSION_BATCH_SIZE: u32 = 4;

const TILED_VAE_ENCODER_TILE: u32 = 1024;
const TILED_VAE_DECODER_TILE: u32 = 128;

pub fn controlnet_script(
    units: &[ControlNetUnit],
    catalog: &dyn ModelCatalog,
) -> Result<Option<Value>, ValidationError> {
    if units.is_empty() {
        return Ok(None);
    }
    let mut args = Vec::with_capacity(units.len());
    for unit in units {
        let model = resolve_reference(catalog, ModelKind::ControlNetModel, &unit.model)?;
        let module = match unit.module.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(module) => resolve_reference(catalog, ModelKind::ControlNetModule, module)?,
            None => "none".to_string(),
        };
        let mut row = json!({
            "enabled": true,
            "module": module,
            "model": model,
            "weight": unit.weight.unwrap_or(1.0),
            "resize_mode": unit.resize_mode.unwrap_or(ResizeMode::Envelope).label(),
            "control_mode": unit.control_mode.unwrap_or(ControlMode::Balanced).label(),
            "pixel_perfect": unit.pixel_perfect.unwrap_or(false),
            "guidance_start": unit.guidance_start.unwrap_or(0.0),
            "guidance_end": unit.guidance_end.unwrap_or(1.0),
            "low_vram": unit.low_vram.unwrap_or(false),
        });
        if let (Some(image), Some(map)) = (unit.image.as_ref(), row.as_object_mut()) {
            map.insert("image".to_string(), Value::String(image.clone()));
        }
        args.push(row);
    }
    Ok(Some(json!({ "args": args })))
}

/// ADetailer units. An explicit inpaint size on either side turns on
/// `ad_use_inpaint_width_height`; the missing side falls back to the query size.
pub fn adetailer_script(
    units: &[AdetailerUnit],
    catalog: &dyn ModelCatalog,
    width: u32,
    height: u32,
) -> Result<Option<Value>, ValidationError> {
    if units.is_empty() {
        return Ok(None);
    }
    let mut args = vec![Value::Bool(true), Value::Bool(false)];
    for unit in units {
        let model = resolve_reference(catalog, ModelKind::AdetailerModel, &unit.model)?;
        let explicit_size = unit.inpaint_width.is_some() || unit.inpaint_height.is_some();
        args.push(json!({
            "ad_model": model,
            "ad_prompt": unit.prompt.clone().unwrap_or_default(),
            "ad_negative_prompt": unit.negative_prompt.clone().unwrap_or_default(),
            "ad_confidence": unit.confidence.unwrap_or(ADETAILER_CONFIDENCE),
            "ad_denoising_strength": unit.denoising.unwrap_or(ADETAILER_DENOISING),
            "ad_mask_blur": unit.mask_blur.unwrap_or(ADETAILER_MASK_BLUR),
            "ad_use_inpaint_width_height": explicit_size,
            "ad_inpaint_width": unit.inpaint_width.unwrap_or(width),
            "ad_inpaint_height": unit.inpaint_height.unwrap_or(height),
        }));
    }
    Ok(Some(json!({ "args": args })))
}

fn cutoff_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s*(?:,|\bBREAK\b|\bSEP\b|\bSKIP\b)\s*").expect("valid cutoff separator")
    })
}

/// Prompt fragments that mention one of `colors`: the fragment starts or ends
/// with the color, or contains it as a whole word.
pub fn cutoff_targets(prompt: &str, colors: &[String]) -> Vec<String> {
    let colors = colors
        .iter()
        .map(|color| color.trim().to_ascii_lowercase())
        .filter(|color| !color.is_empty())
        .collect::<Vec<String>>();
    let mut targets: Vec<String> = Vec::new();
    for part in cutoff_separator().split(prompt) {
        let part = part.trim();
        if part.is_empty() || targets.iter().any(|existing| existing == part) {
            continue;
        }
        let lowered = part.to_ascii_lowercase();
        let mentions_color = colors.iter().any(|color| {
            lowered.starts_with(color.as_str())
                || lowered.ends_with(color.as_str())
                || lowered
                    .split(|c: char| !c.is_alphanumeric())
                    .any(|word| word == color)
        });
        if mentions_color {
            targets.push(part.to_string());
        }
    }
    targets
}

pub fn cutoff_script(targets: &[String], weight: f64) -> Value {
    json!({
        "args": [true, targets.join(", "), weight, true, false, "", "Lerp"]
    })
}

pub fn tiled_diffusion_script(
    config: &TiledDiffusion,
    width: u32,
    height: u32,
    upscaler: &str,
) -> Value {
    json!({
        "args": [
            true,
            config.method,
            true,
            false,
            width,
            height,
            config.tile_width.unwrap_or(TILED_DIFFUSION_TILE_SIZE),
            config.tile_height.unwrap_or(TILED_DIFFUSION_TILE_SIZE),
            config.tile_overlap.unwrap_or(TILED_DIFFUSION_OVERLAP),
            config.tile_batch_size.unwrap_or(TILED_DIFFUSION_BATCH_SIZE),
            upscaler,
            1.0,
        ]
    })
}

pub fn tiled_vae_script() -> Value {
    json!({
        "args": [
            true,
            TILED_VAE_ENCODER_TILE,
            TILED_VAE_DECODER_TILE,
            true,
            true,
            true,
            false,
        ]
    })
}

/// `script_args` for Ultimate SD Upscale with a custom target size of
/// `width`x`height` times `scale`.
pub fn ultimate_upscale_args(
    width: u32,
    height: u32,
    scale: f64,
    upscaler_index: usize,
) -> Vec<Value> {
    vec![
        Value::Null,
        json!(512),
        json!(0),
        json!(8),
        json!(32),
        json!(64),
        json!(0.35),
        json!(32),
        json!(upscaler_index),
        json!(true),
        json!(1),
        json!(false),
        json!(4),
        json!(0),
        json!(1),
        json!(scale_dimension(width, scale)),
        json!(scale_dimension(height, scale)),
        json!(scale),
    ]
}

/// Switches the query to the low-step LCM configuration.
pub fn apply_lcm(query: &mut CompiledQuery, family: ModelFamily) {
    query.prompt = join_prompt(lcm_lora_token(family), &query.prompt);
    query.sampler_name = LCM_SAMPLER.to_string();
    query.cfg_scale = LCM_CFG;
    query.steps = LCM_STEPS;
}

#[cfg(test)]
mod tests {
    use sdbatch_contracts::models::StaticCatalog;

    use super::*;

    fn colors() -> Vec<String> {
        ["red", "blue", "white"]
            .iter()
            .map(|color| color.to_string())
            .collect()
    }

    #[test]
    fn cutoff_picks_fragments_mentioning_colors() {
        let targets = cutoff_targets(
            "a girl, red hair BREAK blue eyes, bored expression, dress in white, reddish glow",
            &colors(),
        );
        assert_eq!(
            targets,
            vec!["red hair", "blue eyes", "dress in white", "reddish glow"]
        );
    }

    #[test]
    fn cutoff_ignores_colors_inside_other_words() {
        let targets = cutoff_targets("a bored cat, colorful sky", &colors());
        assert!(targets.is_empty());
    }

    #[test]
    fn cutoff_script_layout() {
        let script = cutoff_script(&["red hair".to_string(), "blue eyes".to_string()], 0.5);
        assert_eq!(
            script,
            json!({"args": [true, "red hair, blue eyes", 0.5, true, false, "", "Lerp"]})
        );
    }

    #[test]
    fn controlnet_units_get_defaults_and_resolved_names() -> anyhow::Result<()> {
        let catalog = StaticCatalog::new()
            .with(ModelKind::ControlNetModel, &["control_v11p_sd15_canny [d14c016b]"])
            .with(ModelKind::ControlNetModule, &["canny"]);
        let units = vec![ControlNetUnit {
            model: "control_v11p_sd15_canny".to_string(),
            module: Some("canny".to_string()),
            image: Some("pose.png".to_string()),
            ..ControlNetUnit::default()
        }];
        let script = controlnet_script(&units, &catalog)?.unwrap_or(Value::Null);
        let unit = &script["args"][0];
        assert_eq!(unit["model"], json!("control_v11p_sd15_canny [d14c016b]"));
        assert_eq!(unit["module"], json!("canny"));
        assert_eq!(unit["control_mode"], json!("Balanced"));
        assert_eq!(unit["resize_mode"], json!("Resize and Fill"));
        assert_eq!(unit["image"], json!("pose.png"));
        Ok(())
    }

    #[test]
    fn unknown_controlnet_model_is_rejected() {
        let units = vec![ControlNetUnit {
            model: "missing".to_string(),
            ..ControlNetUnit::default()
        }];
        let err = controlnet_script(&units, &StaticCatalog::new()).err();
        assert_eq!(
            err,
            Some(ValidationError::unknown_model("controlNet.model", "missing"))
        );
    }

    #[test]
    fn adetailer_explicit_size_fills_missing_side() -> anyhow::Result<()> {
        let catalog = StaticCatalog::new().with(ModelKind::AdetailerModel, &["face_yolov8n.pt"]);
        let units = vec![
            AdetailerUnit {
                model: "face_yolov8n.pt".to_string(),
                inpaint_width: Some(768),
                ..AdetailerUnit::default()
            },
            AdetailerUnit {
                model: "face_yolov8n.pt".to_string(),
                ..AdetailerUnit::default()
            },
        ];
        let script = adetailer_script(&units, &catalog, 512, 640)?.unwrap_or(Value::Null);
        assert_eq!(script["args"][0], json!(true));
        assert_eq!(script["args"][1], json!(false));
        assert_eq!(script["args"][2]["ad_use_inpaint_width_height"], json!(true));
        assert_eq!(script["args"][2]["ad_inpaint_width"], json!(768));
        assert_eq!(script["args"][2]["ad_inpaint_height"], json!(640));
        assert_eq!(script["args"][3]["ad_use_inpaint_width_height"], json!(false));
        Ok(())
    }

    #[test]
    fn ultimate_upscale_targets_scaled_size() {
        let args = ultimate_upscale_args(512, 768, 2.0, 3);
        assert_eq!(args[8], json!(3));
        assert_eq!(args[15], json!(1024));
        assert_eq!(args[16], json!(1536));
    }
}
