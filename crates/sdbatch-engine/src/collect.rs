use std::collections::BTreeMap;

use crate::synthesize::{CandidateQuery, DedupKey, QueryRecord};

/// Keeps the last record seen for each key and returns them in key order.
pub fn collect_keyed(
    candidates: impl IntoIterator<Item = CandidateQuery>,
) -> Vec<(DedupKey, QueryRecord)> {
    let mut by_key = BTreeMap::new();
    for candidate in candidates {
        by_key.insert(candidate.key, candidate.record);
    }
    by_key.into_iter().collect()
}

pub fn collect(candidates: impl IntoIterator<Item = CandidateQuery>) -> Vec<QueryRecord> {
    collect_keyed(candidates)
        .into_iter()
        .map(|(_, record)| record)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(checkpoint: &str, prompt: &str, index: u32) -> CandidateQuery {
        let record = QueryRecord {
            prompt: prompt.to_string(),
            checkpoint: Some(checkpoint.to_string()),
            ..QueryRecord::default()
        };
        CandidateQuery {
            key: DedupKey::for_record(&record, index),
            record,
        }
    }

    #[test]
    fn duplicates_collapse_and_order_follows_keys() {
        let records = collect(vec![
            candidate("zeta", "cat", 0),
            candidate("alpha", "dog", 0),
            candidate("zeta", "cat", 0),
            candidate("alpha", "cat", 0),
        ]);
        let order = records
            .iter()
            .map(|row| {
                format!(
                    "{}:{}",
                    row.checkpoint.as_deref().unwrap_or_default(),
                    row.prompt
                )
            })
            .collect::<Vec<String>>();
        assert_eq!(order, vec!["alpha:cat", "alpha:dog", "zeta:cat"]);
    }

    #[test]
    fn repeat_index_keeps_identical_records_apart() {
        let records = collect(vec![candidate("alpha", "cat", 1), candidate("alpha", "cat", 0)]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn last_write_wins_for_equal_keys() {
        let first = candidate("alpha", "cat", 0);
        let mut second = first.clone();
        second.record.filename = Some("later".to_string());
        let keyed = collect_keyed(vec![first, second]);
        assert_eq!(keyed.len(), 1);
        assert_eq!(keyed[0].1.filename.as_deref(), Some("later"));
    }

    #[test]
    fn ordering_is_independent_of_input_order() {
        let forward = vec![
            candidate("b", "x", 0),
            candidate("a", "y", 0),
            candidate("a", "x", 2),
        ];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(collect(forward), collect(backward));
    }
}
