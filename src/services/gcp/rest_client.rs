use google_cloud_auth::project::Config;
use google_cloud_auth::token::DefaultTokenSourceProvider;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use thiserror::Error;

use crate::runtime::block_on;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Error, Debug)]
pub enum GcpRestError {
    #[error("Cannot acquire Google token: {raw_error_message:?}")]
    CannotAcquireToken { raw_error_message: String },

    #[error("Resource not found: {url:?}")]
    NotFound { url: String },

    #[error("Request failed with status {status}: {raw_error_message:?}")]
    RequestFailed { status: u16, raw_error_message: String },

    #[error("Transport error: {raw_error_message:?}")]
    Transport { raw_error_message: String },
}

/// Thin REST client over Google APIs the gRPC crates do not cover, using
/// application default credentials.
pub struct GcpRestClient {
    http: reqwest::Client,
    token_source: Box<dyn TokenSource>,
}

impl GcpRestClient {
    pub fn new() -> Result<GcpRestClient, GcpRestError> {
        let scopes = [CLOUD_PLATFORM_SCOPE];
        let provider = block_on(DefaultTokenSourceProvider::new(
            Config::default().with_scopes(&scopes),
        ))
        .map_err(|e| GcpRestError::CannotAcquireToken {
            raw_error_message: e.to_string(),
        })?;
        Ok(GcpRestClient {
            http: reqwest::Client::new(),
            token_source: provider.token_source(),
        })
    }

    fn auth_header(&self) -> Result<String, GcpRestError> {
        block_on(self.token_source.token()).map_err(|e| GcpRestError::CannotAcquireToken {
            raw_error_message: e.to_string(),
        })
    }

    fn execute(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, GcpRestError> {
        let auth = self.auth_header()?;
        let mut request = self.http.request(method, url).header("Authorization", auth);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = block_on(request.send()).map_err(|e| GcpRestError::Transport {
            raw_error_message: e.to_string(),
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GcpRestError::NotFound { url: url.to_string() });
        }
        let text = block_on(response.text()).map_err(|e| GcpRestError::Transport {
            raw_error_message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(GcpRestError::RequestFailed {
                status: status.as_u16(),
                raw_error_message: text,
            });
        }
        if text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| GcpRestError::Transport {
                raw_error_message: format!("Cannot parse response: {e}"),
            })
    }

    pub fn get(&self, url: &str) -> Result<serde_json::Value, GcpRestError> {
        self.execute(reqwest::Method::GET, url, None)?
            .ok_or_else(|| GcpRestError::Transport {
                raw_error_message: "Empty response".to_string(),
            })
    }

    pub fn post(&self, url: &str, body: &serde_json::Value) -> Result<Option<serde_json::Value>, GcpRestError> {
        self.execute(reqwest::Method::POST, url, Some(body))
    }

    pub fn patch(&self, url: &str, body: &serde_json::Value) -> Result<Option<serde_json::Value>, GcpRestError> {
        self.execute(reqwest::Method::PATCH, url, Some(body))
    }

    pub fn delete(&self, url: &str) -> Result<(), GcpRestError> {
        match self.execute(reqwest::Method::DELETE, url, None) {
            Ok(_) => Ok(()),
            Err(GcpRestError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
