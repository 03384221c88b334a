//! GitHub Fetch Module
//! Authenticated retrieval of raw files from the application repository

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::engine::config::RemoteConfig;
use crate::engine::keystore::Token;

const USER_AGENT: &str = "FindBetter-Updater";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Token rejected by the remote host")]
    Unauthorized,
    #[error("Resource not found")]
    NotFound,
    #[error("Network error: {0}")]
    Network(String),
}

pub trait RemoteFetcher {
    /// Fetch one resource, identified by its path inside the versioned tree
    fn fetch(&self, resource: &str, token: &Token) -> Result<Vec<u8>, FetchError>;

    /// Check that the token grants access to the repository
    fn verify(&self, token: &Token) -> Result<(), FetchError>;
}

/// Map an HTTP status onto the fetch taxonomy
pub fn classify_status(status: StatusCode) -> Result<(), FetchError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized),
        StatusCode::NOT_FOUND => Err(FetchError::NotFound),
        s => Err(FetchError::Network(format!("HTTP {}", s))),
    }
}

pub struct GitHubFetcher {
    client: Client,
    content_base: String,
    repo_url: String,
}

impl GitHubFetcher {
    pub fn new(remote: &RemoteConfig) -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(remote.timeout_secs))
            .build()
            .unwrap_or_default();
        Self::with_client(remote, client)
    }

    pub fn with_client(remote: &RemoteConfig, client: Client) -> Self {
        Self {
            client,
            content_base: remote.content_base(),
            repo_url: format!(
                "{}/repos/{}",
                remote.api_base_url.trim_end_matches('/'),
                remote.repo
            ),
        }
    }

    pub fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.content_base, resource.trim_start_matches('/'))
    }

    fn get(&self, url: &str, token: &Token, accept: &str) -> Result<Vec<u8>, FetchError> {
        // A blank token can never authorize; answer before the host can say 404
        if token.is_blank() {
            return Err(FetchError::Unauthorized);
        }

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token.value()))
            .header(ACCEPT, accept)
            .send()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        debug!(url = %url, status = %response.status(), "GET");
        classify_status(response.status())?;

        let body = response
            .bytes()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

impl RemoteFetcher for GitHubFetcher {
    fn fetch(&self, resource: &str, token: &Token) -> Result<Vec<u8>, FetchError> {
        self.get(&self.resource_url(resource), token, "application/octet-stream")
    }

    fn verify(&self, token: &Token) -> Result<(), FetchError> {
        self.get(&self.repo_url, token, "application/vnd.github+json")
            .map(|_| ())
    }
}
