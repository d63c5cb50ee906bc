use similar::TextDiff;

pub const FUZZY_MATCH_THRESHOLD: f32 = 0.82;
/// Shorter requests only match exactly or after normalization.
pub const MIN_PARTIAL_MATCH_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct NameMatch {
    pub name: String,
    pub requested: String,
    pub score: f32,
}

impl NameMatch {
    pub fn is_exact(&self) -> bool {
        self.name == self.requested
    }

    pub fn fallback_reason(&self) -> Option<String> {
        if self.is_exact() {
            return None;
        }
        Some(format!(
            "Requested '{}' resolved to '{}' (score {:.2}).",
            self.requested, self.name, self.score
        ))
    }
}

/// Resolves a user-written name against the backend's canonical names.
///
/// Tries, in order: exact match, normalized match (case, extension, `[hash]`
/// suffix and directory prefix ignored), the shortest candidate containing the
/// normalized request, and finally the closest candidate by character
/// similarity above [`FUZZY_MATCH_THRESHOLD`]. The last two steps need at
/// least [`MIN_PARTIAL_MATCH_CHARS`] characters.
pub fn resolve_name<'a, I>(candidates: I, requested: &str) -> Option<NameMatch>
where
    I: IntoIterator<Item = &'a str>,
{
    let requested_trimmed = requested.trim();
    if requested_trimmed.is_empty() {
        return None;
    }
    let candidates = candidates.into_iter().collect::<Vec<&str>>();
    let matched = |name: &str, score: f32| NameMatch {
        name: name.to_string(),
        requested: requested_trimmed.to_string(),
        score,
    };

    if let Some(name) = candidates.iter().find(|name| **name == requested_trimmed) {
        return Some(matched(name, 1.0));
    }

    let wanted = normalize_model_key(requested_trimmed);
    if wanted.is_empty() {
        return None;
    }
    if let Some(name) = candidates
        .iter()
        .find(|name| normalize_model_key(name) == wanted)
    {
        return Some(matched(name, 1.0));
    }
    if wanted.chars().count() < MIN_PARTIAL_MATCH_CHARS {
        return None;
    }

    if let Some(name) = candidates
        .iter()
        .filter(|name| normalize_model_key(name).contains(&wanted))
        .min_by_key(|name| name.len())
    {
        return Some(matched(name, 0.9));
    }

    candidates
        .iter()
        .map(|name| {
            let score = TextDiff::from_chars(wanted.as_str(), normalize_model_key(name).as_str())
                .ratio();
            (*name, score)
        })
        .filter(|(_, score)| *score >= FUZZY_MATCH_THRESHOLD)
        .max_by(|left, right| left.1.total_cmp(&right.1))
        .map(|(name, score)| matched(name, score))
}

pub fn normalize_model_key(raw: &str) -> String {
    let mut value = raw.trim();
    if let Some((head, tail)) = value.rsplit_once(" [") {
        if tail.ends_with(']') {
            value = head;
        }
    }
    if let Some((_, file)) = value.rsplit_once(['/', '\\']) {
        value = file;
    }
    let lowered = value.to_ascii_lowercase();
    for ext in [".safetensors", ".ckpt", ".pt", ".pth", ".bin"] {
        if let Some(stem) = lowered.strip_suffix(ext) {
            return stem.trim().to_string();
        }
    }
    lowered.trim().to_string()
}
