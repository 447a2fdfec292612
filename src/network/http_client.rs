use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use url::Url;

use super::{ReachabilityProbe, RemoteError, RemoteFileStore, RemoteSyncClient};
use crate::config::RemoteConfig;
use crate::storage::{record_id, UploadKind};

/// REST adapter for a PostgREST-style backend with an attached object store.
///
/// Rows live under `/rest/v1/{table}` and are addressed with `id=eq.{id}`
/// filters; files go to `/storage/v1/object/{bucket}/{path}`. Both `http`
/// and `https` base URLs are accepted.
pub struct HttpRemoteClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    auth_token: Option<String>,
    raw_bucket: String,
    processed_bucket: String,
    health_path: String,
}

impl HttpRemoteClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            RemoteError::InvalidRequest(format!("bad base url '{}': {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::InvalidRequest(format!(
                "'{}' cannot be used as a base url",
                config.base_url
            )));
        }

        let client = Client::builder().use_rustls_tls().build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            auth_token: config.auth_token.clone(),
            raw_bucket: config.raw_bucket.clone(),
            processed_bucket: config.processed_bucket.clone(),
            health_path: config.health_path.clone(),
        })
    }

    /// Base URL with `segments` appended, each percent-encoded on its own.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn rows_url(&self, table: &str) -> Url {
        self.url(["rest", "v1", table])
    }

    fn row_url(&self, table: &str, id: &str) -> Url {
        let mut url = self.rows_url(table);
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        url
    }

    fn bucket(&self, kind: UploadKind) -> &str {
        match kind {
            UploadKind::Raw => &self.raw_bucket,
            UploadKind::Processed => &self.processed_bucket,
        }
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            builder = builder.header("apikey", key.as_str());
        }
        if let Some(token) = self.auth_token.as_ref().or(self.api_key.as_ref()) {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, RemoteError> {
        let response = request.send().await?;
        let status = response.status();
        let url = response.url().clone();
        let body = response.bytes().await?;

        if status.is_success() {
            log::debug!("{} -> {}", url, status);
            Ok(body.to_vec())
        } else {
            log::debug!("{} failed with {}", url, status);
            Err(status_error(status, &body))
        }
    }

    async fn write_rows(
        &self,
        method: Method,
        url: Url,
        prefer: &str,
        data: &Value,
    ) -> Result<(), RemoteError> {
        let request = self.request(method, url).header("Prefer", prefer).json(data);
        self.send(request).await?;
        Ok(())
    }

    async fn select_rows(&self, table: &str, id: &str, columns: &str) -> Result<Vec<Value>, RemoteError> {
        let mut url = self.row_url(table, id);
        url.query_pairs_mut().append_pair("select", columns);
        let body = self.send(self.request(Method::GET, url)).await?;
        serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteSyncClient for HttpRemoteClient {
    async fn create_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        self.write_rows(Method::POST, self.rows_url(table), "return=minimal", data)
            .await
    }

    async fn update_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        let id = record_id(data)
            .ok_or_else(|| RemoteError::InvalidRequest(format!("update on {table} without id")))?;
        self.write_rows(Method::PATCH, self.row_url(table, &id), "return=minimal", data)
            .await
    }

    async fn delete_remote(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.send(self.request(Method::DELETE, self.row_url(table, id)))
            .await?;
        Ok(())
    }

    async fn upsert_remote(&self, table: &str, data: &Value) -> Result<(), RemoteError> {
        self.write_rows(
            Method::POST,
            self.rows_url(table),
            "resolution=merge-duplicates,return=minimal",
            data,
        )
        .await
    }

    async fn verify_sync(&self, table: &str, id: &str) -> Result<bool, RemoteError> {
        Ok(!self.select_rows(table, id, "id").await?.is_empty())
    }

    async fn fetch_remote(&self, table: &str, id: &str) -> Result<Option<Value>, RemoteError> {
        Ok(self.select_rows(table, id, "*").await?.into_iter().next())
    }
}

#[async_trait]
impl RemoteFileStore for HttpRemoteClient {
    async fn upload_file(
        &self,
        kind: UploadKind,
        path: &str,
        payload: &[u8],
    ) -> Result<(), RemoteError> {
        let url = self.url(
            ["storage", "v1", "object", self.bucket(kind)]
                .into_iter()
                .chain(path.split('/').filter(|s| !s.is_empty())),
        );

        let request = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header("x-upsert", "true")
            .body(payload.to_vec());
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl ReachabilityProbe for HttpRemoteClient {
    async fn probe(&self) -> Result<(), RemoteError> {
        // A trailing slash survives as an empty last segment.
        let url = self.url(self.health_path.trim_start_matches('/').split('/'));
        self.send(self.request(Method::GET, url)).await?;
        Ok(())
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> RemoteError {
    let message: String = String::from_utf8_lossy(body).chars().take(200).collect();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RemoteError::Transient(format!("{status}: {message}"))
    } else {
        RemoteError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}
