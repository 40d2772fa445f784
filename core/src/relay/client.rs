// HTTP client for the relay: deposit, pickup, ack, register, lookup.

use std::time::Duration;
use thiserror::Error;

use super::protocol::{
    AckRequest, AckResponse, DepositRequest, HeldMessage, PickupResponse, RegisterRequest,
    RegistryEntry,
};

/// Directory operations are small and should answer fast.
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);
/// Message transfer can carry real payloads.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay returned status {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn deposit(&self, req: &DepositRequest) -> Result<(), RelayClientError> {
        let url = format!("{}/v0/deposit", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(TRANSFER_TIMEOUT)
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RelayClientError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    pub async fn pickup(
        &self,
        fingerprint: &str,
        since: f64,
    ) -> Result<Vec<HeldMessage>, RelayClientError> {
        let url = format!("{}/v0/pickup/{}", self.base_url, fingerprint);
        let resp = self
            .http
            .get(&url)
            .query(&[("since", since)])
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RelayClientError::Status(resp.status().as_u16()));
        }
        let body: PickupResponse = resp.json().await?;
        Ok(body.messages)
    }

    pub async fn ack(
        &self,
        fingerprint: &str,
        msg_ids: &[String],
    ) -> Result<u64, RelayClientError> {
        let url = format!("{}/v0/ack/{}", self.base_url, fingerprint);
        let resp = self
            .http
            .post(&url)
            .timeout(TRANSFER_TIMEOUT)
            .json(&AckRequest {
                msg_ids: msg_ids.to_vec(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RelayClientError::Status(resp.status().as_u16()));
        }
        let body: AckResponse = resp.json().await?;
        Ok(body.removed)
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<(), RelayClientError> {
        let url = format!("{}/v0/register", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(DIRECTORY_TIMEOUT)
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RelayClientError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    /// Directory lookup; an unknown name is `None`, not an error.
    pub async fn lookup(&self, name: &str) -> Result<Option<RegistryEntry>, RelayClientError> {
        let url = format!("{}/v0/lookup/{}", self.base_url, name);
        let resp = self
            .http
            .get(&url)
            .timeout(DIRECTORY_TIMEOUT)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(RelayClientError::Status(resp.status().as_u16()));
        }
        Ok(Some(resp.json().await?))
    }
}
