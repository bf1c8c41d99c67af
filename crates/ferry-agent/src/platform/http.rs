//! HTTP client for the remote data platform

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::{
    FilePage, FileRegistration, Platform, PlatformError, PlatformResult, RemoteFileStatus,
    SyncResponse,
};
use crate::models::Manifest;

#[derive(Debug, Serialize)]
struct CreateManifestRequest<'a> {
    user_id: &'a str,
    org_id: &'a str,
    dataset_id: &'a str,
    local_manifest_id: i64,
}

#[derive(Debug, Deserialize)]
struct CreateManifestResponse {
    node_id: String,
}

#[derive(Debug, Serialize)]
struct SyncFilesRequest<'a> {
    files: &'a [FileRegistration],
}

fn manifest_url(base_url: &str) -> String {
    format!("{}/manifest", base_url.trim_end_matches('/'))
}

fn manifest_files_url(base_url: &str, node_id: &str) -> String {
    format!("{}/manifest/{}/files", base_url.trim_end_matches('/'), node_id)
}

pub struct HttpPlatform {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPlatform {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> PlatformResult<Self> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(PlatformError::Config("platform base url is empty".to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Turn non-2xx responses into [`PlatformError::Api`] with the body as message
    async fn check(response: Response) -> PlatformResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(PlatformError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    async fn create_manifest(&self, manifest: &Manifest) -> PlatformResult<String> {
        let request = CreateManifestRequest {
            user_id: &manifest.user_id,
            org_id: &manifest.org_id,
            dataset_id: &manifest.dataset_id,
            local_manifest_id: manifest.id,
        };

        let response = self
            .authorized(self.client.post(manifest_url(&self.base_url)))
            .json(&request)
            .send()
            .await?;
        let created: CreateManifestResponse = Self::check(response).await?.json().await?;

        tracing::info!(manifest_id = manifest.id, node_id = %created.node_id, "Remote manifest created");
        Ok(created.node_id)
    }

    async fn sync_files(
        &self,
        node_id: &str,
        files: &[FileRegistration],
    ) -> PlatformResult<SyncResponse> {
        let response = self
            .authorized(self.client.post(manifest_files_url(&self.base_url, node_id)))
            .json(&SyncFilesRequest { files })
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn files_by_status(
        &self,
        node_id: &str,
        status: RemoteFileStatus,
        continuation_token: Option<&str>,
    ) -> PlatformResult<FilePage> {
        let mut query = vec![("status", status.as_str())];
        if let Some(token) = continuation_token {
            query.push(("continuation_token", token));
        }

        let response = self
            .authorized(self.client.get(manifest_files_url(&self.base_url, node_id)))
            .query(&query)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }
}
