//! HTTP client for peer instances.
//!
//! The [`PeerClient`] trait covers the peer-to-peer surface; the reqwest
//! implementation speaks it over HTTPS with bearer authentication. Status
//! mapping follows the error taxonomy: 4xx becomes `ClientError` (one
//! retry after a token refresh), 5xx becomes `InternalServerError`
//! (retried with backoff by the caller), and transport failures are
//! treated like a 5xx.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use url::Url;

use nimbus_core::config::HttpConfig;
use nimbus_core::protocol::{
    AnswerPayload, BulkDocsRequest, CreateSharingRequest, FileMetadataPayload, MetadataOutcome,
    RevsDiffRequest, RevsDiffResponse, UploadKeyResponse,
};
use nimbus_core::{Error, Result};

use crate::sharing::Sharing;

/// One peer instance, seen through the sharing protocol.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `PUT /sharings/{sid}`
    async fn create_sharing(&self, sid: &str, req: &CreateSharingRequest) -> Result<()>;

    /// `POST /sharings/{sid}/answer`
    async fn answer(&self, sid: &str, payload: &AnswerPayload) -> Result<()>;

    /// `POST /sharings/{sid}/revs_diff`
    async fn revs_diff(&self, sid: &str, req: &RevsDiffRequest) -> Result<RevsDiffResponse>;

    /// `POST /sharings/{sid}/bulk_docs`
    async fn bulk_docs(&self, sid: &str, req: &BulkDocsRequest) -> Result<()>;

    /// `PUT /sharings/{sid}/io.cozy.files/{xoredId}/metadata`
    async fn put_file_metadata(
        &self,
        sid: &str,
        xored_id: &str,
        payload: &FileMetadataPayload,
    ) -> Result<MetadataOutcome>;

    /// `PUT /sharings/{sid}/io.cozy.files/{key}`
    async fn put_file_body(&self, sid: &str, key: &str, body: bytes::Bytes) -> Result<()>;

    /// `DELETE /sharings/{sid}`
    async fn revoke_sharing(&self, sid: &str) -> Result<()>;

    /// `DELETE /sharings/{sid}/recipients/{id}`
    async fn revoke_recipient(&self, sid: &str, member_id: &str) -> Result<()>;

    /// Exchange the refresh token for a fresh access token.
    async fn refresh_token(&self) -> Result<()>;
}

/// Builds peer clients from a sharing's members and credentials.
pub trait PeerFactory: Send + Sync {
    /// Client for an established link (credentials required).
    fn client_for(&self, sharing: &Sharing, member_index: usize) -> Result<Arc<dyn PeerClient>>;

    /// Client for a first contact, before any credentials exist.
    fn invite_client(&self, instance: &str) -> Result<Arc<dyn PeerClient>>;
}

// === reqwest implementation ===

pub struct HttpPeerClient {
    http: reqwest::Client,
    base: Url,
    access_token: RwLock<String>,
    refresh_token: String,
}

impl HttpPeerClient {
    pub fn new(
        config: &HttpConfig,
        instance: &str,
        access_token: String,
        refresh_token: String,
    ) -> Result<Self> {
        let base = Url::parse(instance).map_err(|_| Error::InvalidUrl(instance.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Store(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base,
            access_token: RwLock::new(access_token),
            refresh_token,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|_| Error::InvalidUrl(format!("{}{}", self.base, path)))
    }

    fn bearer(&self) -> String {
        self.access_token.read().clone()
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = req
            .bearer_auth(self.bearer())
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(Error::ClientError {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(Error::InternalServerError {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    // Connection and timeout failures follow the 5xx retry path.
    Error::InternalServerError {
        status: 0,
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn create_sharing(&self, sid: &str, req: &CreateSharingRequest) -> Result<()> {
        let url = self.url(&format!("/sharings/{}", sid))?;
        self.send(self.http.put(url).json(req)).await?;
        Ok(())
    }

    async fn answer(&self, sid: &str, payload: &AnswerPayload) -> Result<()> {
        let url = self.url(&format!("/sharings/{}/answer", sid))?;
        self.send(self.http.post(url).json(payload)).await?;
        Ok(())
    }

    async fn revs_diff(&self, sid: &str, req: &RevsDiffRequest) -> Result<RevsDiffResponse> {
        let url = self.url(&format!("/sharings/{}/revs_diff", sid))?;
        let response = self.send(self.http.post(url).json(req)).await?;
        response.json().await.map_err(transport_error)
    }

    async fn bulk_docs(&self, sid: &str, req: &BulkDocsRequest) -> Result<()> {
        let url = self.url(&format!("/sharings/{}/bulk_docs", sid))?;
        self.send(self.http.post(url).json(req)).await?;
        Ok(())
    }

    async fn put_file_metadata(
        &self,
        sid: &str,
        xored_id: &str,
        payload: &FileMetadataPayload,
    ) -> Result<MetadataOutcome> {
        let url = self.url(&format!("/sharings/{}/io.cozy.files/{}/metadata", sid, xored_id))?;
        let response = self.send(self.http.put(url).json(payload)).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(MetadataOutcome::InSync);
        }
        let key: UploadKeyResponse = response.json().await.map_err(transport_error)?;
        Ok(MetadataOutcome::NeedsContent(key.key))
    }

    async fn put_file_body(&self, sid: &str, key: &str, body: bytes::Bytes) -> Result<()> {
        let url = self.url(&format!("/sharings/{}/io.cozy.files/{}", sid, key))?;
        self.send(
            self.http
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn revoke_sharing(&self, sid: &str) -> Result<()> {
        let url = self.url(&format!("/sharings/{}", sid))?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn revoke_recipient(&self, sid: &str, member_id: &str) -> Result<()> {
        let url = self.url(&format!("/sharings/{}/recipients/{}", sid, member_id))?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn refresh_token(&self) -> Result<()> {
        let url = self.url("/auth/access_token")?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", &self.refresh_token),
            ])
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Error::NoOAuthClient);
        }
        let token: TokenResponse = response.json().await.map_err(transport_error)?;
        *self.access_token.write() = token.access_token;
        Ok(())
    }
}

/// [`PeerFactory`] producing reqwest clients.
pub struct HttpPeerFactory {
    config: HttpConfig,
}

impl HttpPeerFactory {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl PeerFactory for HttpPeerFactory {
    fn client_for(&self, sharing: &Sharing, member_index: usize) -> Result<Arc<dyn PeerClient>> {
        let member = sharing
            .members
            .get(member_index)
            .ok_or(Error::InvalidSharing)?;
        let credentials = sharing
            .credentials_for(member_index)
            .ok_or(Error::NoOAuthClient)?;
        if !credentials.usable() {
            return Err(Error::NoOAuthClient);
        }
        let client = HttpPeerClient::new(
            &self.config,
            &member.instance,
            credentials.access_token.clone(),
            credentials.refresh_token.clone(),
        )?;
        Ok(Arc::new(client))
    }

    fn invite_client(&self, instance: &str) -> Result<Arc<dyn PeerClient>> {
        let client = HttpPeerClient::new(&self.config, instance, String::new(), String::new())?;
        Ok(Arc::new(client))
    }
}
