use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::ValidationError;

/// `{token}`s the engine substitutes itself.
pub const ENGINE_TOKENS: &[&str] = &[
    "filename",
    "cfg",
    "clipSkip",
    "denoising",
    "enableHighRes",
    "height",
    "restoreFaces",
    "scaleFactor",
    "seed",
    "steps",
    "width",
];

/// `[token]`s understood by the backend's own filename pattern.
pub const BACKEND_TOKENS: &[&str] = &[
    "seed",
    "seed_first",
    "seed_last",
    "steps",
    "cfg",
    "sampler",
    "model_name",
    "model_hash",
    "width",
    "height",
    "styles",
    "date",
    "datetime",
    "job_timestamp",
    "prompt",
    "prompt_hash",
    "prompt_no_styles",
    "prompt_spaces",
    "prompt_words",
    "negative_prompt_hash",
    "full_prompt_hash",
    "clip_skip",
    "denoising",
    "batch_number",
    "generation_number",
    "user",
    "vae_filename",
    "image_hash",
    "none",
];

pub const DEFAULT_FILENAME_SUFFIX: &str = "-[datetime]";

fn engine_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("valid engine token regex"))
}

fn backend_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\[\]]*)\]").expect("valid backend token regex"))
}

/// Checks every `{token}` and `[token]` of `pattern` against the known sets.
/// Backend tokens may carry an argument, as in `[datetime<%Y%m%d>]`.
pub fn validate(pattern: &str) -> Result<(), ValidationError> {
    for caps in engine_token_regex().captures_iter(pattern) {
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if !ENGINE_TOKENS.contains(&token) {
            return Err(unknown_token(&format!("{{{token}}}"), pattern));
        }
    }
    for caps in backend_token_regex().captures_iter(pattern) {
        let token = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let name = token.split('<').next().unwrap_or_default();
        if !BACKEND_TOKENS.contains(&name) {
            return Err(unknown_token(&format!("[{token}]"), pattern));
        }
    }
    Ok(())
}

fn unknown_token(token: &str, pattern: &str) -> ValidationError {
    ValidationError::UnknownPatternToken {
        token: token.to_string(),
        pattern: pattern.to_string(),
    }
}

/// Values substituted into `{token}`s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternValues {
    pub filename: Option<String>,
    pub cfg: f64,
    pub clip_skip: Option<u32>,
    pub denoising: Option<f64>,
    pub enable_high_res: bool,
    pub height: u32,
    pub restore_faces: bool,
    pub scale_factor: Option<f64>,
    pub seed: Option<i64>,
    pub steps: u32,
    pub width: u32,
}

impl PatternValues {
    fn token(&self, token: &str) -> String {
        match token {
            "filename" => self.filename.clone().unwrap_or_default(),
            "cfg" => format!("{:.1}", self.cfg),
            "clipSkip" => self
                .clip_skip
                .map(|value| value.to_string())
                .unwrap_or_else(|| "[clip_skip]".to_string()),
            "denoising" => self
                .denoising
                .map(|value| format!("{value:.2}"))
                .unwrap_or_else(|| "[denoising]".to_string()),
            "enableHighRes" => self.enable_high_res.to_string(),
            "height" => self.height.to_string(),
            "restoreFaces" => self.restore_faces.to_string(),
            "scaleFactor" => self
                .scale_factor
                .map(|value| format!("{value:.2}"))
                .unwrap_or_default(),
            "seed" => self
                .seed
                .filter(|seed| *seed >= 0)
                .map(|seed| seed.to_string())
                .unwrap_or_else(|| "[seed]".to_string()),
            "steps" => self.steps.to_string(),
            "width" => self.width.to_string(),
            other => format!("{{{other}}}"),
        }
    }
}

/// Substitutes engine tokens in a single pass; backend tokens are left alone.
pub fn expand(pattern: &str, values: &PatternValues) -> String {
    engine_token_regex()
        .replace_all(pattern, |caps: &Captures| {
            values.token(caps.get(1).map(|m| m.as_str()).unwrap_or_default())
        })
        .into_owned()
}

/// Backend filename pattern for a record, if it asked for one.
pub fn filename_pattern(
    filename: Option<&str>,
    pattern: Option<&str>,
    values: &PatternValues,
) -> Result<Option<String>, ValidationError> {
    let pattern = match (pattern, filename) {
        (Some(pattern), _) => pattern.to_string(),
        (None, Some(_)) => format!("{{filename}}{DEFAULT_FILENAME_SUFFIX}"),
        (None, None) => return Ok(None),
    };
    validate(&pattern)?;
    Ok(Some(expand(&pattern, values)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> PatternValues {
        PatternValues {
            filename: Some("cat".to_string()),
            cfg: 7.0,
            enable_high_res: true,
            height: 768,
            seed: Some(42),
            steps: 30,
            width: 512,
            ..PatternValues::default()
        }
    }

    #[test]
    fn unknown_engine_token_fails() {
        let err = validate("{filename}-{bogus}").err();
        assert_eq!(
            err,
            Some(ValidationError::UnknownPatternToken {
                token: "{bogus}".to_string(),
                pattern: "{filename}-{bogus}".to_string(),
            })
        );
    }

    #[test]
    fn backend_tokens_allow_arguments() {
        assert!(validate("[datetime<%Y%m%d_%H%M%S>]-[seed]-[model_name]").is_ok());
        assert!(validate("[prompt_words]-[unheard_of]").is_err());
    }

    #[test]
    fn expand_formats_numbers_and_falls_back_to_backend_tokens() {
        let out = expand(
            "{filename}_{cfg}_{steps}_{width}x{height}_{seed}_{clipSkip}_{denoising}",
            &values(),
        );
        assert_eq!(out, "cat_7.0_30_512x768_42_[clip_skip]_[denoising]");

        let with_denoising = PatternValues {
            denoising: Some(0.5),
            scale_factor: Some(1.5),
            seed: None,
            ..values()
        };
        assert_eq!(
            expand("{denoising}-{scaleFactor}-{seed}", &with_denoising),
            "0.50-1.50-[seed]"
        );
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let tricky = PatternValues {
            filename: Some("{seed}".to_string()),
            ..values()
        };
        assert_eq!(expand("{filename}", &tricky), "{seed}");
    }

    #[test]
    fn bare_filename_gets_datetime_suffix() -> anyhow::Result<()> {
        let pattern = filename_pattern(Some("cat"), None, &values())?;
        assert_eq!(pattern.as_deref(), Some("cat-[datetime]"));
        assert_eq!(filename_pattern(None, None, &values())?, None);
        Ok(())
    }
}
