// Horadus — Vector Similarity
//
// In-process nearest-neighbor ranking over embedding BLOBs. Ordering is
// deterministic: lowest cosine distance first, lexicographic entity id as
// the tie-break, so retrieval results are stable across runs.

use crate::atoms::error::{EngineError, EngineResult};

/// Nearest-neighbor candidate with similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborResult {
    pub entity_id: String,
    pub similarity: f64,
}

/// Convert a cosine-similarity threshold into a cosine-distance upper bound.
pub fn max_distance_for_similarity(similarity_threshold: f64) -> EngineResult<f64> {
    if !(0.0..=1.0).contains(&similarity_threshold) {
        return Err(EngineError::validation(
            "similarity_threshold must be between 0 and 1",
        ));
    }
    Ok(1.0 - similarity_threshold)
}

/// Cosine similarity between two vectors. Returns 0.0 for zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

/// Rank candidates by similarity to the query, keeping those at or above
/// the threshold, best first (ties broken by entity id ascending).
pub fn nearest_neighbors(
    query: &[f32],
    candidates: &[(String, Vec<f32>)],
    similarity_threshold: f64,
    limit: usize,
) -> EngineResult<Vec<NeighborResult>> {
    if limit == 0 {
        return Err(EngineError::validation("limit must be >= 1"));
    }
    max_distance_for_similarity(similarity_threshold)?;

    let mut rows: Vec<NeighborResult> = candidates
        .iter()
        .filter_map(|(entity_id, embedding)| {
            let similarity = cosine_similarity(query, embedding);
            if similarity < similarity_threshold {
                None
            } else {
                Some(NeighborResult {
                    entity_id: entity_id.clone(),
                    similarity,
                })
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    rows.truncate(limit);
    Ok(rows)
}
