use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Sd15,
    Sd2,
    Sdxl,
    Sd3,
    Flux,
    #[default]
    Unknown,
}

/// Distilled / few-step variants that change the usable sampler and step range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Lcm,
    Turbo,
    Lightning,
    Hyper,
}

pub const LCM_SAMPLER: &str = "LCM";
pub const LCM_CFG: f64 = 1.5;
pub const LCM_STEPS: u32 = 6;

pub fn detect_family(name: &str) -> ModelFamily {
    let lowered = name.to_ascii_lowercase();
    let tokens = lowered
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect::<Vec<&str>>();

    if lowered.contains("flux") {
        return ModelFamily::Flux;
    }
    if lowered.contains("sd3") || tokens.windows(2).any(|pair| pair == ["sd", "3"]) {
        return ModelFamily::Sd3;
    }
    if lowered.contains("sdxl")
        || lowered.contains("pony")
        || lowered.contains("illustrious")
        || tokens.iter().any(|token| token.ends_with("xl"))
    {
        return ModelFamily::Sdxl;
    }
    if lowered.contains("sd2")
        || lowered.contains("v2-")
        || tokens.iter().any(|token| *token == "768")
    {
        return ModelFamily::Sd2;
    }
    ModelFamily::Sd15
}

pub fn detect_accelerator(name: &str) -> Option<Accelerator> {
    let lowered = name.to_ascii_lowercase();
    if lowered.contains("lightning") {
        Some(Accelerator::Lightning)
    } else if lowered.contains("turbo") {
        Some(Accelerator::Turbo)
    } else if lowered.contains("hyper") {
        Some(Accelerator::Hyper)
    } else if lowered.contains("lcm") {
        Some(Accelerator::Lcm)
    } else {
        None
    }
}

pub fn lcm_lora_token(family: ModelFamily) -> &'static str {
    match family {
        ModelFamily::Sdxl => "<lora:lcm-lora-sdxl:1>",
        _ => "<lora:lcm-lora-sdv1-5:1>",
    }
}

/// Baseline generation settings for a model. Record fields always win over
/// these, except that `forced_sampler` must match the effective sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultBundle {
    pub sampler: String,
    pub cfg: f64,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub forced_sampler: Option<String>,
}

impl DefaultBundle {
    pub fn for_model(family: ModelFamily, accelerator: Option<Accelerator>) -> Self {
        let (sampler, cfg, steps, size) = match family {
            ModelFamily::Sd15 | ModelFamily::Unknown => ("DPM++ 2M Karras", 7.0, 20, 512),
            ModelFamily::Sd2 => ("DPM++ 2M Karras", 7.0, 20, 768),
            ModelFamily::Sdxl => ("DPM++ 2M Karras", 7.0, 30, 1024),
            ModelFamily::Sd3 => ("Euler", 5.0, 28, 1024),
            ModelFamily::Flux => ("Euler", 1.0, 20, 1024),
        };
        let mut bundle = Self {
            sampler: sampler.to_string(),
            cfg,
            steps,
            width: size,
            height: size,
            forced_sampler: None,
        };

        match accelerator {
            Some(Accelerator::Lcm) => {
                bundle.sampler = LCM_SAMPLER.to_string();
                bundle.cfg = LCM_CFG;
                bundle.steps = LCM_STEPS;
                bundle.forced_sampler = Some(LCM_SAMPLER.to_string());
            }
            Some(Accelerator::Turbo) => {
                bundle.sampler = "Euler a".to_string();
                bundle.cfg = 2.0;
                bundle.steps = 6;
            }
            Some(Accelerator::Lightning) => {
                bundle.sampler = "DPM++ SDE Karras".to_string();
                bundle.cfg = 2.0;
                bundle.steps = 6;
                bundle.forced_sampler = Some("DPM++ SDE Karras".to_string());
            }
            Some(Accelerator::Hyper) => {
                bundle.sampler = "DPM++ SDE Karras".to_string();
                bundle.cfg = 2.0;
                bundle.steps = 8;
            }
            None => {}
        }
        bundle
    }
}
