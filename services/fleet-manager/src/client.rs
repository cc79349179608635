//! Process manager API client used by the fleet manager.

use std::time::Duration;

use async_trait::async_trait;
use fleet_protocol::process::{ProcessParams, ShutdownResponse, StartProcessResponse};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MachineClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("process manager returned status {0}")]
    Status(u16),
}

/// Calls the fleet manager makes against a machine's process manager.
#[async_trait]
pub trait MachineApi: Send + Sync {
    async fn start_process(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<StartProcessResponse, MachineClientError>;

    async fn request_shutdown(&self, endpoint: &str)
        -> Result<ShutdownResponse, MachineClientError>;
}

/// [`MachineApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMachineApi {
    client: reqwest::Client,
}

impl HttpMachineApi {
    pub fn new(timeout: Duration) -> Result<Self, MachineClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post<B, T>(&self, url: String, body: Option<&B>) -> Result<T, MachineClientError>
    where
        B: serde::Serialize + Sync + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        debug!(url = %url, "Calling process manager");
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MachineClientError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

fn url(endpoint: &str, path: &str) -> String {
    format!("{}{path}", endpoint.trim_end_matches('/'))
}

#[async_trait]
impl MachineApi for HttpMachineApi {
    async fn start_process(
        &self,
        endpoint: &str,
        params: &serde_json::Value,
    ) -> Result<StartProcessResponse, MachineClientError> {
        let body = ProcessParams {
            params: params.clone(),
        };
        self.post(url(endpoint, "/processes"), Some(&body)).await
    }

    async fn request_shutdown(
        &self,
        endpoint: &str,
    ) -> Result<ShutdownResponse, MachineClientError> {
        self.post::<(), _>(url(endpoint, "/shutdown"), None).await
    }
}
