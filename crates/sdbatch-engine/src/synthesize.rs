use std::ops::Range;

use sdbatch_contracts::batch::{
    AdetailerUnit, CheckpointRef, ControlNetUnit, PromptTemplate, TiledDiffusion, VariantOverlay,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::expand::ResolvedSelection;
use crate::normalize::SeedValue;

/// A fully merged, not yet compiled query. Its serde form is also the dedup
/// projection and the surface that overlay `overwrite` maps write into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRecord {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: Option<SeedValue>,
    pub checkpoint: Option<String>,
    pub vae: Option<String>,
    pub upscaler: Option<String>,
    pub sampler: Option<String>,
    pub cfg: Option<f64>,
    pub steps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub clip_skip: Option<u32>,
    pub denoising: Option<f64>,
    pub scale_factor: Option<f64>,
    pub enable_high_res: bool,
    pub restore_faces: bool,
    pub cutoff: bool,
    pub lcm: bool,
    #[serde(rename = "tiledVAE")]
    pub tiled_vae: bool,
    pub ultimate_sd_upscale: bool,
    pub init_image: Option<String>,
    pub styles: Vec<String>,
    pub tiled_diffusion: Option<TiledDiffusion>,
    pub filename: Option<String>,
    pub pattern: Option<String>,
    pub high_res_prompt: Option<String>,
    pub high_res_negative_prompt: Option<String>,
    pub high_res_steps: Option<u32>,
    pub control_net: Vec<ControlNetUnit>,
    pub adetailer: Vec<AdetailerUnit>,
}

/// Ordering and identity of a record within a batch. Field order is the
/// comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey {
    pub checkpoint: String,
    pub vae: String,
    pub upscaler: String,
    pub projection: String,
    pub index: u32,
}

impl DedupKey {
    pub fn for_record(record: &QueryRecord, index: u32) -> Self {
        Self {
            checkpoint: record.checkpoint.clone().unwrap_or_default(),
            vae: record.vae.clone().unwrap_or_default(),
            upscaler: record.upscaler.clone().unwrap_or_default(),
            projection: serde_json::to_string(record).unwrap_or_default(),
            index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub key: DedupKey,
    pub record: QueryRecord,
}

/// Builds the records of one selection for every repeat index in `repeats`,
/// followed by one extra record per overlay for each of them.
pub fn synthesize(
    template: &PromptTemplate,
    selection: &ResolvedSelection,
    repeats: Range<u32>,
    overlays: &[VariantOverlay],
) -> Result<Vec<CandidateQuery>, ValidationError> {
    let mut out = Vec::new();
    for index in repeats {
        let mut record = merge(template, selection);
        record.seed = record.seed.map(|seed| seed.offset(index));
        if let Some(checkpoint) = &selection.checkpoint {
            apply_checkpoint(&mut record, checkpoint);
        }
        premultiply_tiled_size(&mut record);

        let variants = overlays
            .iter()
            .enumerate()
            .map(|(position, overlay)| apply_overlay(&record, overlay, position))
            .collect::<Result<Vec<QueryRecord>, ValidationError>>()?;
        out.push(CandidateQuery {
            key: DedupKey::for_record(&record, index),
            record,
        });
        for variant in variants {
            out.push(CandidateQuery {
                key: DedupKey::for_record(&variant, index),
                record: variant,
            });
        }
    }
    Ok(out)
}

fn merge(template: &PromptTemplate, selection: &ResolvedSelection) -> QueryRecord {
    QueryRecord {
        prompt: selection.prompt.clone(),
        negative_prompt: selection.negative_prompt.clone(),
        seed: selection.seed.clone(),
        checkpoint: selection
            .checkpoint
            .as_ref()
            .map(|checkpoint| checkpoint.name().to_string()),
        vae: selection.vae.clone(),
        upscaler: selection.upscaler.clone(),
        sampler: selection.sampler.clone(),
        cfg: selection.cfg,
        steps: selection.steps,
        width: selection.width,
        height: selection.height,
        clip_skip: selection.clip_skip,
        denoising: selection.denoising,
        scale_factor: selection.scale_factor,
        enable_high_res: selection.enable_high_res,
        restore_faces: selection.restore_faces,
        cutoff: selection.cutoff,
        lcm: selection.lcm,
        tiled_vae: selection.tiled_vae,
        ultimate_sd_upscale: selection.ultimate_sd_upscale,
        init_image: selection.init_image.clone(),
        styles: selection.styles.clone(),
        tiled_diffusion: selection.tiled_diffusion.clone(),
        filename: template.filename.clone(),
        pattern: template.pattern.clone(),
        high_res_prompt: template.high_res_prompt.clone(),
        high_res_negative_prompt: template.high_res_negative_prompt.clone(),
        high_res_steps: template.high_res_steps,
        control_net: template.control_net.clone(),
        adetailer: template.adetailer.clone(),
    }
}

fn apply_checkpoint(record: &mut QueryRecord, checkpoint: &CheckpointRef) {
    let CheckpointRef::WithOverrides(overrides) = checkpoint else {
        return;
    };
    if let Some(vae) = &overrides.vae {
        record.vae = Some(vae.clone());
    }
    record.prompt = surround(
        &record.prompt,
        overrides.add_before_prompt.as_deref(),
        overrides.add_after_prompt.as_deref(),
    );
    if overrides.add_before_negative_prompt.is_some()
        || overrides.add_after_negative_prompt.is_some()
    {
        let negative = surround(
            record.negative_prompt.as_deref().unwrap_or_default(),
            overrides.add_before_negative_prompt.as_deref(),
            overrides.add_after_negative_prompt.as_deref(),
        );
        record.negative_prompt = Some(negative);
    }
    record.filename = splice_filename(
        record.filename.as_deref(),
        overrides.add_before_filename.as_deref(),
        overrides.add_after_filename.as_deref(),
    );
}

/// Multiplies a known size by the tiled diffusion scale factor and consumes
/// the factor: the tiled setting's own factor if it has one, else the
/// template's `scaleFactor`. Unknown sizes are left for the compiler.
fn premultiply_tiled_size(record: &mut QueryRecord) {
    let (Some(width), Some(height)) = (record.width, record.height) else {
        return;
    };
    let Some(tiled) = record.tiled_diffusion.as_mut() else {
        return;
    };
    if let Some(scale) = tiled.scale_factor.take().or_else(|| record.scale_factor.take()) {
        record.width = Some(scale_dimension(width, scale));
        record.height = Some(scale_dimension(height, scale));
    }
}

pub(crate) fn scale_dimension(value: u32, scale: f64) -> u32 {
    (f64::from(value) * scale).round().max(0.0) as u32
}

/// Applies one overlay to a copy of `record`.
pub fn apply_overlay(
    record: &QueryRecord,
    overlay: &VariantOverlay,
    position: usize,
) -> Result<QueryRecord, ValidationError> {
    let mut variant = if overlay.overwrite.is_empty() {
        record.clone()
    } else {
        overwrite_fields(record, &overlay.overwrite).map_err(|reason| {
            ValidationError::InvalidOverlay {
                overlay: overlay.label(position),
                reason,
            }
        })?
    };

    for replacement in &overlay.prompt_replace {
        if replacement.from.is_empty() {
            continue;
        }
        variant.prompt = variant.prompt.replace(&replacement.from, &replacement.to);
    }
    if let Some(negative) = variant.negative_prompt.as_mut() {
        for replacement in &overlay.negative_prompt_replace {
            if replacement.from.is_empty() {
                continue;
            }
            *negative = negative.replace(&replacement.from, &replacement.to);
        }
    }

    if let Some(after) = overlay.after_filename.as_deref() {
        variant.filename = splice_filename(variant.filename.as_deref(), None, Some(after));
    }
    if let Some(before) = overlay.before_filename.as_deref() {
        variant.filename = splice_filename(variant.filename.as_deref(), Some(before), None);
    }
    if let Some(after) = overlay.after_prompt.as_deref() {
        variant.prompt = join_prompt(&variant.prompt, after);
    }
    if let Some(before) = overlay.before_prompt.as_deref() {
        variant.prompt = join_prompt(before, &variant.prompt);
    }
    Ok(variant)
}

fn overwrite_fields(
    record: &QueryRecord,
    overwrite: &Map<String, Value>,
) -> Result<QueryRecord, String> {
    let mut fields = match serde_json::to_value(record).map_err(|err| err.to_string())? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, value) in overwrite {
        let key = match key.as_str() {
            "checkpoints" => "checkpoint",
            "initImageOrFolder" => "initImage",
            "stylesSets" => "styles",
            other => other,
        };
        if !fields.contains_key(key) {
            return Err(format!("unknown field '{key}'"));
        }
        fields.insert(key.to_string(), value.clone());
    }
    serde_json::from_value(Value::Object(fields)).map_err(|err| err.to_string())
}

/// Comma-joins two prompt fragments, dropping empty sides.
pub(crate) fn join_prompt(left: &str, right: &str) -> String {
    let left = left.trim();
    let right = right.trim();
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{left}, {right}"),
    }
}

fn surround(base: &str, before: Option<&str>, after: Option<&str>) -> String {
    let mut out = base.to_string();
    if let Some(after) = after {
        out = join_prompt(&out, after);
    }
    if let Some(before) = before {
        out = join_prompt(before, &out);
    }
    out
}

fn splice_filename(
    base: Option<&str>,
    before: Option<&str>,
    after: Option<&str>,
) -> Option<String> {
    if before.is_none() && after.is_none() {
        return base.map(str::to_string);
    }
    let spliced = format!(
        "{}{}{}",
        before.unwrap_or_default(),
        base.unwrap_or_default(),
        after.unwrap_or_default()
    );
    if spliced.is_empty() {
        None
    } else {
        Some(spliced)
    }
}
