pub mod collect;
pub mod compile;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod extensions;
pub mod normalize;
pub mod pattern;
pub mod synthesize;
pub mod transport;

use rand::Rng;
use sdbatch_contracts::batch::{BatchSpec, MultiValueMethod};
use sdbatch_contracts::config::CompilerOptions;
use sdbatch_contracts::models::ModelCatalog;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub use compile::{CompiledQuery, QueryCompiler, QueryKind};
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::ValidationError;
pub use synthesize::{CandidateQuery, DedupKey, QueryRecord};
pub use transport::{DryrunTransport, HttpTransport, Transport, TransportResponse};

/// Permutation counts above this are logged; expansion itself is uncapped.
const LARGE_EXPANSION_WARNING: usize = 1_000;

/// Every candidate record of `spec`, before deduplication.
///
/// Permutation mode takes the full cross product of each template's
/// candidates; random mode draws one selection per repeat from `rng`.
pub fn synthesize_batch<R: Rng + ?Sized>(
    spec: &BatchSpec,
    rng: &mut R,
) -> Result<Vec<CandidateQuery>, ValidationError> {
    let mut candidates = Vec::new();
    for (position, template) in spec.prompts.iter().enumerate() {
        let axes = expand::template_axes(template);
        let repeats = template.repeat_count();
        match spec.multi_value_method {
            MultiValueMethod::Permutation => {
                let combinations = expand::combination_count(&axes);
                if combinations > LARGE_EXPANSION_WARNING {
                    warn!(
                        template = position + 1,
                        combinations,
                        repeats,
                        overlays = spec.permutations.len(),
                        "large permutation expansion"
                    );
                }
                for selection in expand::permute(&axes) {
                    candidates.extend(synthesize::synthesize(
                        template,
                        &selection,
                        0..repeats,
                        &spec.permutations,
                    )?);
                }
            }
            MultiValueMethod::RandomSelection => {
                for index in 0..repeats {
                    let selection = expand::select(&axes, rng);
                    candidates.extend(synthesize::synthesize(
                        template,
                        &selection,
                        index..index + 1,
                        &spec.permutations,
                    )?);
                }
            }
        }
    }
    Ok(candidates)
}

/// Compiles `spec` into backend-ready queries in dedup-key order. Any invalid
/// record rejects the whole batch.
pub fn compile_batch<R: Rng + ?Sized>(
    spec: &BatchSpec,
    catalog: &dyn ModelCatalog,
    options: &CompilerOptions,
    rng: &mut R,
) -> Result<Vec<CompiledQuery>, ValidationError> {
    let candidates = synthesize_batch(spec, rng)?;
    let candidate_count = candidates.len();
    let records = collect::collect(candidates);
    let compiler = QueryCompiler::new(catalog, options);
    let queries = records
        .iter()
        .map(|record| compiler.compile(record))
        .collect::<Result<Vec<CompiledQuery>, ValidationError>>()?;
    info!(
        templates = spec.prompts.len(),
        candidates = candidate_count,
        queries = queries.len(),
        "batch compiled"
    );
    Ok(queries)
}

/// sha256 of the serialized query list.
pub fn batch_digest(queries: &[CompiledQuery]) -> String {
    let bytes = serde_json::to_vec(queries).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
