use std::sync::Arc;

use azure_core::auth::TokenCredential;
use azure_core::authority_hosts::AZURE_PUBLIC_CLOUD;
use azure_core::new_http_client;
use azure_identity::ClientSecretCredential;
use thiserror::Error;

use crate::runtime::block_on;

const ARM_BASE_URL: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";

#[derive(Error, Debug)]
pub enum ArmClientError {
    #[error("Cannot acquire ARM token: {raw_error_message:?}")]
    CannotAcquireToken { raw_error_message: String },

    #[error("ARM resource not found: {path:?}")]
    NotFound { path: String },

    #[error("ARM request failed with status {status}: {raw_error_message:?}")]
    RequestFailed { status: u16, raw_error_message: String },

    #[error("ARM transport error: {raw_error_message:?}")]
    Transport { raw_error_message: String },
}

/// Thin Azure Resource Manager REST client used where the generated
/// management SDKs have no coverage yet.
pub struct ArmClient {
    http: reqwest::Client,
    credential: Arc<ClientSecretCredential>,
}

impl ArmClient {
    pub fn new(tenant_id: &str, client_id: &str, client_secret: &str) -> ArmClient {
        let credential = Arc::new(ClientSecretCredential::new(
            new_http_client(),
            AZURE_PUBLIC_CLOUD.clone(),
            tenant_id.to_string(),
            client_id.to_string(),
            client_secret.to_string(),
        ));
        ArmClient {
            http: reqwest::Client::new(),
            credential,
        }
    }

    fn bearer_token(&self) -> Result<String, ArmClientError> {
        let token = block_on(self.credential.get_token(&[ARM_SCOPE])).map_err(|e| {
            ArmClientError::CannotAcquireToken {
                raw_error_message: e.to_string(),
            }
        })?;
        Ok(token.token.secret().to_string())
    }

    fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, ArmClientError> {
        let token = self.bearer_token()?;
        let url = format!("{ARM_BASE_URL}{path}");
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = block_on(request.send()).map_err(|e| ArmClientError::Transport {
            raw_error_message: e.to_string(),
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArmClientError::NotFound { path: path.to_string() });
        }
        let text = block_on(response.text()).map_err(|e| ArmClientError::Transport {
            raw_error_message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(ArmClientError::RequestFailed {
                status: status.as_u16(),
                raw_error_message: text,
            });
        }
        if text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ArmClientError::Transport {
                raw_error_message: format!("Cannot parse ARM response: {e}"),
            })
    }

    pub fn get(&self, path: &str) -> Result<serde_json::Value, ArmClientError> {
        self.execute(reqwest::Method::GET, path, None)?
            .ok_or_else(|| ArmClientError::Transport {
                raw_error_message: "Empty ARM response".to_string(),
            })
    }

    pub fn put(&self, path: &str, body: &serde_json::Value) -> Result<Option<serde_json::Value>, ArmClientError> {
        self.execute(reqwest::Method::PUT, path, Some(body))
    }

    pub fn patch(&self, path: &str, body: &serde_json::Value) -> Result<Option<serde_json::Value>, ArmClientError> {
        self.execute(reqwest::Method::PATCH, path, Some(body))
    }

    pub fn post(&self, path: &str, body: Option<&serde_json::Value>) -> Result<Option<serde_json::Value>, ArmClientError> {
        self.execute(reqwest::Method::POST, path, body)
    }

    pub fn delete(&self, path: &str) -> Result<(), ArmClientError> {
        match self.execute(reqwest::Method::DELETE, path, None) {
            Ok(_) => Ok(()),
            Err(ArmClientError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
