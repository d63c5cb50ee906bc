use std::fs;
use std::path::Path;

use sdbatch_contracts::batch::{
    OneOrMany, SeedSpec, TiledDiffusion, TiledDiffusionSetting, TriState,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

const INIT_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// A seed candidate. Text that is neither a number nor a range is carried
/// through untouched so the compiler can report it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SeedValue {
    Fixed(i64),
    Literal(String),
}

impl SeedValue {
    /// Seed for repeat `index`; `-1` asks the backend for a random seed and is
    /// never offset.
    pub fn offset(&self, index: u32) -> Self {
        match self {
            Self::Fixed(seed) if *seed >= 0 => {
                Self::Fixed(seed.saturating_add(i64::from(index)))
            }
            other => other.clone(),
        }
    }
}

/// Candidate list for a scalar-or-array field. An omitted field, or an empty
/// array, yields the single `default` candidate.
pub fn normalize<T: Clone>(value: Option<&OneOrMany<T>>, default: Option<T>) -> Vec<Option<T>> {
    let values = value.map(OneOrMany::to_vec).unwrap_or_default();
    if values.is_empty() {
        return vec![default];
    }
    values.into_iter().map(Some).collect()
}

pub fn normalize_flag(value: Option<&TriState>) -> Vec<bool> {
    match value {
        Some(state) if state.is_both() => vec![true, false],
        Some(state) => vec![state.as_bool()],
        None => vec![false],
    }
}

pub fn normalize_seed(value: Option<&SeedSpec>) -> Vec<Option<SeedValue>> {
    match value {
        None => vec![None],
        Some(SeedSpec::Number(seed)) => vec![Some(SeedValue::Fixed(*seed))],
        Some(SeedSpec::List(seeds)) if seeds.is_empty() => vec![None],
        Some(SeedSpec::List(seeds)) => seeds
            .iter()
            .map(|seed| Some(SeedValue::Fixed(*seed)))
            .collect(),
        Some(SeedSpec::Text(raw)) => parse_seed_text(raw).into_iter().map(Some).collect(),
    }
}

fn parse_seed_text(raw: &str) -> Vec<SeedValue> {
    let trimmed = raw.trim();
    if let Ok(seed) = trimmed.parse::<i64>() {
        return vec![SeedValue::Fixed(seed)];
    }
    let bounds = trimmed.split_once('-').and_then(|(start, end)| {
        let start = start.trim().parse::<i64>().ok()?;
        let end = end.trim().parse::<i64>().ok()?;
        Some((start, end))
    });
    match bounds {
        Some((start, end)) => {
            let (low, high) = if start <= end { (start, end) } else { (end, start) };
            (low..=high).map(SeedValue::Fixed).collect()
        }
        None => vec![SeedValue::Literal(raw.to_string())],
    }
}

/// Expands every entry that names a directory into the sorted image files it
/// contains. Plain paths pass through unchanged. When nothing is left the
/// field falls back to unset, so the template still yields txt2img records.
pub fn normalize_init_images(value: Option<&OneOrMany<String>>) -> Vec<Option<String>> {
    let entries = value.map(OneOrMany::to_vec).unwrap_or_default();
    if entries.is_empty() {
        return vec![None];
    }
    let mut out = Vec::new();
    for entry in entries {
        let path = Path::new(&entry);
        if path.is_dir() {
            let images = list_images(path);
            if images.is_empty() {
                warn!(folder = %path.display(), "init image folder has no images");
            }
            out.extend(images.into_iter().map(Some));
        } else {
            out.push(Some(entry));
        }
    }
    if out.is_empty() {
        warn!("no init images found, generating without one");
        return vec![None];
    }
    out
}

fn list_images(dir: &Path) -> Vec<String> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(folder = %dir.display(), error = %err, "failed listing init image folder");
            return Vec::new();
        }
    };
    let mut images = reader
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| INIT_IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|path| path.to_string_lossy().to_string())
        .collect::<Vec<String>>();
    images.sort();
    images
}

pub fn normalize_styles(value: Option<&Vec<Vec<String>>>) -> Vec<Vec<String>> {
    match value {
        Some(sets) if !sets.is_empty() => sets.clone(),
        _ => vec![Vec::new()],
    }
}

pub fn normalize_tiled_diffusion(
    value: Option<&OneOrMany<TiledDiffusionSetting>>,
) -> Vec<Option<TiledDiffusion>> {
    normalize(value, None)
        .into_iter()
        .map(|setting| setting.and_then(TiledDiffusionSetting::into_config))
        .collect()
}
