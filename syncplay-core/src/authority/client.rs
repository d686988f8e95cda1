//! Authority HTTP Client

use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::types::{JoinGroupRequest, NewGroupRequest};
use crate::config::SyncConfig;
use crate::sync::{self, GroupInfoWire, GroupSnapshot, OutboundIntent, OutboundRequest};

/// Errors that can occur when talking to the authority
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authority rejected the credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Unexpected response (HTTP {0})")]
    Status(u16),
}

impl AuthorityError {
    /// 401/403: retrying with the same credentials will not help
    pub fn is_authorization(&self) -> bool {
        matches!(self, AuthorityError::Unauthorized(_))
    }

    /// Timeouts, resets and server-side hiccups
    pub fn is_transient(&self) -> bool {
        match self {
            AuthorityError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            AuthorityError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

/// Client for the authority's REST surface
#[derive(Debug, Clone)]
pub struct AuthorityClient {
    http: Client,
    base_url: String,
    authorization: String,
}

impl AuthorityClient {
    pub fn new(config: &SyncConfig) -> Result<Self, AuthorityError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(2)
            .build()?;

        let mut authorization = format!(
            "MediaBrowser Client=\"{}\", Device=\"{}\", DeviceId=\"{}\", Version=\"{}\"",
            config.client_name, config.device_name, config.device_id, config.client_version
        );
        if let Some(token) = &config.access_token {
            authorization.push_str(&format!(", Token=\"{}\"", token));
        }

        Ok(Self {
            http,
            base_url: config.rest_base().to_string(),
            authorization,
        })
    }

    /// Build a request with the authorization header
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http
            .request(method, &url)
            .header("Authorization", &self.authorization)
    }

    /// Map the response status onto the error taxonomy
    fn check(resp: Response) -> Result<Response, AuthorityError> {
        let status = resp.status().as_u16();
        match status {
            200..=299 => Ok(resp),
            401 | 403 => {
                warn!("Authority refused authorization (HTTP {})", status);
                Err(AuthorityError::Unauthorized(status))
            }
            404 => Err(AuthorityError::GroupNotFound),
            _ => Err(AuthorityError::Status(status)),
        }
    }

    /// Create a new group; the authority confirms it over the push channel
    #[instrument(skip(self))]
    pub async fn create_group(&self, group_name: &str) -> Result<(), AuthorityError> {
        let resp = self
            .request(Method::POST, "/SyncPlay/New")
            .json(&NewGroupRequest {
                group_name: group_name.to_string(),
            })
            .send()
            .await?;
        Self::check(resp)?;
        Ok(())
    }

    /// Join an existing group
    #[instrument(skip(self))]
    pub async fn join_group(&self, group_id: &str) -> Result<(), AuthorityError> {
        let resp = self
            .request(Method::POST, "/SyncPlay/Join")
            .json(&JoinGroupRequest {
                group_id: group_id.to_string(),
            })
            .send()
            .await?;
        Self::check(resp)?;
        Ok(())
    }

    /// Leave the current group
    #[instrument(skip(self))]
    pub async fn leave_group(&self) -> Result<(), AuthorityError> {
        let resp = self.request(Method::POST, "/SyncPlay/Leave").send().await?;
        Self::check(resp)?;
        Ok(())
    }

    /// List group snapshots visible to this client
    #[instrument(skip(self))]
    pub async fn list_groups(&self) -> Result<Vec<GroupSnapshot>, AuthorityError> {
        let resp = self.request(Method::GET, "/SyncPlay/List").send().await?;
        let groups: Vec<GroupInfoWire> = Self::check(resp)?.json().await?;
        debug!("Authority listed {} groups", groups.len());
        Ok(groups.into_iter().map(sync::snapshot_from_wire).collect())
    }

    /// Send an encoded request
    pub async fn send(&self, request: &OutboundRequest) -> Result<(), AuthorityError> {
        let mut builder = self.request(Method::POST, request.path);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let resp = builder.send().await?;
        Self::check(resp)?;
        Ok(())
    }

    /// Encode and send an intent
    #[instrument(skip(self), fields(intent = intent.name()))]
    pub async fn send_intent(&self, intent: &OutboundIntent) -> Result<(), AuthorityError> {
        let request = sync::encode(intent, Utc::now())?;
        self.send(&request).await
    }
}
