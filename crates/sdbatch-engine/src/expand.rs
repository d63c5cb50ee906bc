use rand::Rng;
use sdbatch_contracts::batch::{CheckpointRef, PromptTemplate, TiledDiffusion};

use crate::normalize::{
    normalize, normalize_flag, normalize_init_images, normalize_seed, normalize_styles,
    normalize_tiled_diffusion, SeedValue,
};

/// One concrete choice for every field of a template that may vary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSelection {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: Option<SeedValue>,
    pub enable_high_res: bool,
    pub restore_faces: bool,
    pub cutoff: bool,
    pub lcm: bool,
    pub tiled_vae: bool,
    pub ultimate_sd_upscale: bool,
    pub cfg: Option<f64>,
    pub steps: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub clip_skip: Option<u32>,
    pub denoising: Option<f64>,
    pub scale_factor: Option<f64>,
    pub sampler: Option<String>,
    pub checkpoint: Option<CheckpointRef>,
    pub vae: Option<String>,
    pub upscaler: Option<String>,
    pub init_image: Option<String>,
    pub styles: Vec<String>,
    pub tiled_diffusion: Option<TiledDiffusion>,
}

type Setter = Box<dyn Fn(&mut ResolvedSelection, usize)>;

/// The normalized candidates of one template field.
pub struct Axis {
    field: &'static str,
    len: usize,
    apply: Setter,
}

impl Axis {
    pub fn new<T: Clone + 'static>(
        field: &'static str,
        candidates: Vec<T>,
        assign: fn(&mut ResolvedSelection, T),
    ) -> Self {
        let len = candidates.len();
        Self {
            field,
            len,
            apply: Box::new(move |selection, index| {
                if let Some(value) = candidates.get(index) {
                    assign(selection, value.clone());
                }
            }),
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn apply(&self, selection: &mut ResolvedSelection, index: usize) {
        (self.apply)(selection, index);
    }
}

/// Axes of `template` in expansion order. The prompt comes first so
/// accumulators start as one per base prompt.
pub fn template_axes(template: &PromptTemplate) -> Vec<Axis> {
    let prompts = template.prompt.to_vec();
    let prompts = if prompts.is_empty() {
        vec![String::new()]
    } else {
        prompts
    };
    vec![
        Axis::new("prompt", prompts, |s, v| s.prompt = v),
        Axis::new(
            "negativePrompt",
            normalize(template.negative_prompt.as_ref(), None),
            |s, v| s.negative_prompt = v,
        ),
        Axis::new("seed", normalize_seed(template.seed.as_ref()), |s, v| {
            s.seed = v
        }),
        Axis::new(
            "enableHighRes",
            normalize_flag(template.enable_high_res.as_ref()),
            |s, v| s.enable_high_res = v,
        ),
        Axis::new(
            "restoreFaces",
            normalize_flag(template.restore_faces.as_ref()),
            |s, v| s.restore_faces = v,
        ),
        Axis::new("cutoff", normalize_flag(template.cutoff.as_ref()), |s, v| {
            s.cutoff = v
        }),
        Axis::new("lcm", normalize_flag(template.lcm.as_ref()), |s, v| {
            s.lcm = v
        }),
        Axis::new(
            "tiledVAE",
            normalize_flag(template.tiled_vae.as_ref()),
            |s, v| s.tiled_vae = v,
        ),
        Axis::new(
            "ultimateSdUpscale",
            normalize_flag(template.ultimate_sd_upscale.as_ref()),
            |s, v| s.ultimate_sd_upscale = v,
        ),
        Axis::new("cfg", normalize(template.cfg.as_ref(), None), |s, v| {
            s.cfg = v
        }),
        Axis::new("steps", normalize(template.steps.as_ref(), None), |s, v| {
            s.steps = v
        }),
        Axis::new("width", normalize(template.width.as_ref(), None), |s, v| {
            s.width = v
        }),
        Axis::new("height", normalize(template.height.as_ref(), None), |s, v| {
            s.height = v
        }),
        Axis::new(
            "clipSkip",
            normalize(template.clip_skip.as_ref(), None),
            |s, v| s.clip_skip = v,
        ),
        Axis::new(
            "denoising",
            normalize(template.denoising.as_ref(), None),
            |s, v| s.denoising = v,
        ),
        Axis::new(
            "scaleFactor",
            normalize(template.scale_factor.as_ref(), None),
            |s, v| s.scale_factor = v,
        ),
        Axis::new(
            "sampler",
            normalize(template.sampler.as_ref(), None),
            |s, v| s.sampler = v,
        ),
        Axis::new(
            "checkpoints",
            normalize(template.checkpoints.as_ref(), None),
            |s, v| s.checkpoint = v,
        ),
        Axis::new("vae", normalize(template.vae.as_ref(), None), |s, v| {
            s.vae = v
        }),
        Axis::new(
            "upscaler",
            normalize(template.upscaler.as_ref(), None),
            |s, v| s.upscaler = v,
        ),
        Axis::new(
            "initImageOrFolder",
            normalize_init_images(template.init_image_or_folder.as_ref()),
            |s, v| s.init_image = v,
        ),
        Axis::new(
            "stylesSets",
            normalize_styles(template.styles_sets.as_ref()),
            |s, v| s.styles = v,
        ),
        Axis::new(
            "tiledDiffusion",
            normalize_tiled_diffusion(template.tiled_diffusion.as_ref()),
            |s, v| s.tiled_diffusion = v,
        ),
    ]
}

/// Cross product of `accumulators` with every candidate of `axis`.
pub fn expand(accumulators: Vec<ResolvedSelection>, axis: &Axis) -> Vec<ResolvedSelection> {
    let mut out = Vec::with_capacity(accumulators.len().saturating_mul(axis.len()));
    for accumulator in accumulators {
        for index in 0..axis.len() {
            let mut next = accumulator.clone();
            axis.apply(&mut next, index);
            out.push(next);
        }
    }
    out
}

/// Every combination of candidates across `axes`, folded in axis order.
pub fn permute(axes: &[Axis]) -> Vec<ResolvedSelection> {
    axes.iter()
        .fold(vec![ResolvedSelection::default()], |accumulators, axis| {
            expand(accumulators, axis)
        })
}

/// Picks one candidate per axis uniformly at random.
pub fn select<R: Rng + ?Sized>(axes: &[Axis], rng: &mut R) -> ResolvedSelection {
    let mut selection = ResolvedSelection::default();
    for axis in axes {
        if axis.is_empty() {
            continue;
        }
        let index = rng.gen_range(0..axis.len());
        axis.apply(&mut selection, index);
    }
    selection
}

/// Number of selections `permute` would produce.
pub fn combination_count(axes: &[Axis]) -> usize {
    axes.iter()
        .fold(1usize, |total, axis| total.saturating_mul(axis.len()))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use sdbatch_contracts::batch::{OneOrMany, TriState};

    use super::*;

    fn template() -> PromptTemplate {
        PromptTemplate {
            prompt: OneOrMany::Many(vec!["cat".to_string(), "dog".to_string()]),
            cfg: Some(OneOrMany::Many(vec![5.0, 7.0])),
            enable_high_res: Some(TriState::Text("both".to_string())),
            ..PromptTemplate::default()
        }
    }

    #[test]
    fn permutation_count_is_product_of_candidate_lengths() {
        let axes = template_axes(&template());
        let selections = permute(&axes);
        assert_eq!(selections.len(), 8);
        assert_eq!(combination_count(&axes), 8);
    }

    #[test]
    fn permutation_keeps_prompt_as_outermost_axis() {
        let selections = permute(&template_axes(&template()));
        let prompts = selections
            .iter()
            .map(|row| row.prompt.as_str())
            .collect::<Vec<&str>>();
        assert_eq!(&prompts[..4], &["cat"; 4]);
        assert_eq!(&prompts[4..], &["dog"; 4]);
        assert!(selections[0].enable_high_res);
        assert!(selections[1].enable_high_res);
        assert!(!selections[2].enable_high_res);
        assert_eq!(selections[0].cfg, Some(5.0));
        assert_eq!(selections[1].cfg, Some(7.0));
    }

    #[test]
    fn axes_follow_fixed_field_order() {
        let fields = template_axes(&template())
            .iter()
            .map(Axis::field)
            .collect::<Vec<&str>>();
        assert_eq!(fields.first().copied(), Some("prompt"));
        assert_eq!(fields.last().copied(), Some("tiledDiffusion"));
        let cfg = fields.iter().position(|field| *field == "cfg");
        let checkpoints = fields.iter().position(|field| *field == "checkpoints");
        assert!(cfg < checkpoints);
    }

    #[test]
    fn random_selection_is_reproducible_with_seeded_rng() {
        let axes = template_axes(&template());
        let first = select(&axes, &mut StdRng::seed_from_u64(7));
        let second = select(&axes, &mut StdRng::seed_from_u64(7));
        assert_eq!(first, second);
        assert!(["cat", "dog"].contains(&first.prompt.as_str()));
        assert!(matches!(first.cfg, Some(value) if value == 5.0 || value == 7.0));
    }

    #[test]
    fn omitted_fields_stay_unset() {
        let template = PromptTemplate {
            prompt: OneOrMany::One("cat".to_string()),
            ..PromptTemplate::default()
        };
        let selections = permute(&template_axes(&template));
        assert_eq!(selections.len(), 1);
        assert_eq!(selections[0].prompt, "cat");
        assert_eq!(selections[0].cfg, None);
        assert!(selections[0].styles.is_empty());
        assert!(!selections[0].lcm);
    }
}
