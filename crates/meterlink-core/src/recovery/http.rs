use super::{CheckpointSource, SignedCheckpointIndex};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use log::debug;
use meterlink_protocol::SessionId;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Reads checkpoint indexes from `GET {host}/v1/checkpoints/{session_id}`.
#[derive(Debug, Clone)]
pub struct HttpCheckpointSource {
    client: Client,
}

impl HttpCheckpointSource {
    pub fn new(timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CollaboratorError::new(format!("http client: {err}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CheckpointSource for HttpCheckpointSource {
    async fn fetch_index(
        &self,
        host_url: &str,
        session_id: SessionId,
    ) -> Result<Option<SignedCheckpointIndex>, CollaboratorError> {
        let url = format!(
            "{}/v1/checkpoints/{}",
            host_url.trim_end_matches('/'),
            session_id
        );
        debug!("fetching checkpoint index (url={})", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| CollaboratorError::new(format!("GET {url}: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CollaboratorError::new(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }
        response
            .json::<SignedCheckpointIndex>()
            .await
            .map(Some)
            .map_err(|err| CollaboratorError::new(format!("decode checkpoint index: {err}")))
    }
}
