mod family;
mod registry;
mod selectors;

pub use family::{
    detect_accelerator, detect_family, lcm_lora_token, Accelerator, DefaultBundle, ModelFamily,
    LCM_CFG, LCM_SAMPLER, LCM_STEPS,
};
pub use registry::{
    CatalogSnapshot, CheckpointEntry, CheckpointSpec, ModelCatalog, ModelKind, StaticCatalog,
    StylePreset,
};
pub use selectors::{
    normalize_model_key, resolve_name, NameMatch, FUZZY_MATCH_THRESHOLD, MIN_PARTIAL_MATCH_CHARS,
};
