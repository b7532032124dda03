//! Validation and batching rules for session-bound vector operations.
//!
//! Everything here runs before any frame is sent.

use crate::error::EngineError;
use meterlink_config::RagConfig;
use meterlink_protocol::{SessionId, VectorRecord, VectorSearchHit};

/// One `uploadVectors` frame worth of vectors.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UploadBatch {
    pub vectors: Vec<VectorRecord>,
    pub replace: bool,
}

/// Fail on the first vector whose width differs from `dimension`.
pub(crate) fn validate_vectors(
    vectors: &[VectorRecord],
    dimension: usize,
) -> Result<(), EngineError> {
    match vectors.iter().find(|record| record.vector.len() != dimension) {
        Some(record) => Err(EngineError::DimensionMismatch {
            vector_id: record.id.clone(),
            expected: dimension,
            actual: record.vector.len(),
        }),
        None => Ok(()),
    }
}

/// Split into batches of `batch_size`; only the first may replace.
pub(crate) fn plan_batches(
    vectors: Vec<VectorRecord>,
    batch_size: usize,
    replace: bool,
) -> Vec<UploadBatch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(vectors.len().div_ceil(batch_size));
    let mut remaining = vectors.into_iter().peekable();
    while remaining.peek().is_some() {
        let chunk: Vec<VectorRecord> = remaining.by_ref().take(batch_size).collect();
        batches.push(UploadBatch {
            vectors: chunk,
            replace: replace && batches.is_empty(),
        });
    }
    batches
}

pub(crate) fn validate_search(
    query_vector: &[f32],
    k: usize,
    threshold: f32,
    config: &RagConfig,
) -> Result<(), EngineError> {
    if k == 0 || k > config.max_top_k {
        return Err(EngineError::InvalidTopK {
            k,
            max: config.max_top_k,
        });
    }
    if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
        return Err(EngineError::InvalidThreshold(threshold));
    }
    if query_vector.len() != config.vector_dimension {
        return Err(EngineError::DimensionMismatch {
            vector_id: "query".to_string(),
            expected: config.vector_dimension,
            actual: query_vector.len(),
        });
    }
    Ok(())
}

pub(crate) fn validate_web_query(
    query: &str,
    num_results: usize,
    max_results: usize,
) -> Result<(), EngineError> {
    if query.trim().is_empty() {
        return Err(EngineError::InvalidQuery("query must not be empty".to_string()));
    }
    if num_results == 0 || num_results > max_results {
        return Err(EngineError::InvalidTopK {
            k: num_results,
            max: max_results,
        });
    }
    Ok(())
}

/// Highest score first, at most `k` hits.
pub(crate) fn rank_hits(mut hits: Vec<VectorSearchHit>, k: usize) -> Vec<VectorSearchHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(k);
    hits
}

/// Handle bound to a session by its first successful upload.
pub(crate) fn default_vector_db_id(session_id: SessionId) -> String {
    format!("session-{session_id}")
}
