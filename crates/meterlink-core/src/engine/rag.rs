use super::SessionEngine;
use crate::error::EngineError;
use crate::pending::PendingKind;
use crate::rag::{
    default_vector_db_id, plan_batches, rank_hits, validate_search, validate_vectors,
    validate_web_query,
};
use crate::transport::Connection;
use crate::types::{SearchResults, UploadSummary};
use log::{debug, info, warn};
use meterlink_protocol::{
    ClientMessage, HostMessage, RequestId, SessionId, VectorRecord, WebSearchHit,
};

impl SessionEngine {
    /// Upload vectors in batches; only the first batch may replace.
    ///
    /// Every vector is checked before anything is sent. The first upload that
    /// stores at least one vector binds the session's default database.
    pub async fn upload_vectors(
        &self,
        session_id: SessionId,
        vectors: Vec<VectorRecord>,
        replace: bool,
    ) -> Result<UploadSummary, EngineError> {
        validate_vectors(&vectors, self.config.rag.vector_dimension)?;
        self.store.require_operable(session_id)?;
        if vectors.is_empty() {
            return Ok(UploadSummary::default());
        }
        let batches = plan_batches(vectors, self.config.rag.upload_batch_size, replace);
        let (record, lease) = self.prepare(session_id).await?;

        let mut summary = UploadSummary::default();
        for batch in batches {
            let request_id = RequestId::new();
            let size = batch.vectors.len();
            let message = ClientMessage::UploadVectors {
                request_id: request_id.clone(),
                session_id,
                vectors: batch.vectors,
                replace: batch.replace,
            };
            let response = self
                .exchange(&lease, PendingKind::UploadVectors, request_id, &message)
                .await?;
            let (status, uploaded, rejected, errors) = match response {
                HostMessage::UploadVectorsResponse {
                    status,
                    uploaded,
                    rejected,
                    errors,
                    ..
                } => (status, uploaded, rejected, errors),
                other => {
                    return Err(EngineError::UnexpectedResponse(
                        other.type_name().to_string(),
                    ));
                }
            };
            if status.eq_ignore_ascii_case("error") {
                warn!(
                    "vector batch rejected (session_id={}, batch={}, size={})",
                    session_id, summary.batches, size
                );
            }
            summary.batches += 1;
            summary.uploaded += uploaded;
            summary.rejected += rejected;
            summary.errors.extend(errors);
        }
        drop(lease);

        if summary.uploaded > 0 && record.rag_context.is_none() {
            self.store
                .attach_rag(session_id, &default_vector_db_id(session_id))?;
        }
        info!(
            "vectors uploaded (session_id={}, batches={}, uploaded={}, rejected={})",
            session_id, summary.batches, summary.uploaded, summary.rejected
        );
        Ok(summary)
    }

    /// Similarity search against the session's vector database.
    pub async fn search_vectors(
        &self,
        session_id: SessionId,
        query_vector: Vec<f32>,
        k: usize,
        threshold: f32,
    ) -> Result<SearchResults, EngineError> {
        let record = self.store.require_operable(session_id)?;
        if record.rag_context.is_none() {
            return Err(EngineError::RagNotConfigured(session_id));
        }
        validate_search(&query_vector, k, threshold, &self.config.rag)?;
        let (_, lease) = self.prepare(session_id).await?;

        let request_id = RequestId::new();
        let message = ClientMessage::SearchVectors {
            request_id: request_id.clone(),
            session_id,
            query_vector,
            k,
            threshold,
        };
        let response = self
            .exchange(&lease, PendingKind::SearchVectors, request_id, &message)
            .await?;
        drop(lease);
        match response {
            HostMessage::SearchVectorsResponse {
                error: Some(error), ..
            } => Err(EngineError::Host {
                code: "SEARCH_FAILED".to_string(),
                message: error,
            }),
            HostMessage::SearchVectorsResponse {
                results,
                total_results,
                search_time_ms,
                ..
            } => {
                let hits = rank_hits(results, k);
                debug!(
                    "vector search answered (session_id={}, hits={}, total={})",
                    session_id,
                    hits.len(),
                    total_results
                );
                Ok(SearchResults {
                    total_results: total_results.max(hits.len()),
                    hits,
                    search_time_ms,
                })
            }
            other => Err(EngineError::UnexpectedResponse(
                other.type_name().to_string(),
            )),
        }
    }

    /// Bind an existing vector database to the session.
    pub fn set_vector_database(
        &self,
        session_id: SessionId,
        vector_db_id: &str,
    ) -> Result<(), EngineError> {
        if vector_db_id.trim().is_empty() {
            return Err(EngineError::InvalidQuery(
                "vector database id must not be empty".to_string(),
            ));
        }
        self.store.attach_rag(session_id, vector_db_id)
    }

    /// Web search performed by the host on the session's behalf.
    pub async fn search_web(
        &self,
        session_id: SessionId,
        query: &str,
        num_results: usize,
    ) -> Result<Vec<WebSearchHit>, EngineError> {
        validate_web_query(query, num_results, self.config.rag.max_top_k)?;
        let (_, lease) = self.prepare(session_id).await?;

        let request_id = RequestId::new();
        let message = ClientMessage::SearchWeb {
            request_id: request_id.clone(),
            session_id,
            query: query.to_string(),
            num_results,
        };
        let response = self
            .exchange(&lease, PendingKind::SearchWeb, request_id, &message)
            .await?;
        drop(lease);
        match response {
            HostMessage::SearchWebResponse {
                error: Some(error), ..
            } => Err(EngineError::Host {
                code: "SEARCH_FAILED".to_string(),
                message: error,
            }),
            HostMessage::SearchWebResponse { mut results, .. } => {
                results.truncate(num_results);
                Ok(results)
            }
            other => Err(EngineError::UnexpectedResponse(
                other.type_name().to_string(),
            )),
        }
    }

    /// Register, send, and wait. The entry exists before the frame leaves.
    async fn exchange(
        &self,
        connection: &Connection,
        kind: PendingKind,
        request_id: RequestId,
        message: &ClientMessage,
    ) -> Result<HostMessage, EngineError> {
        let ticket = self
            .pending
            .register(connection.session_id(), kind, request_id);
        if let Err(err) = connection.send(message) {
            self.pending.cancel(ticket.request_id());
            return Err(err);
        }
        self.pending
            .wait(ticket, self.config.timeouts.request())
            .await
    }
}
