use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use objloader_types::BaseId;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{DownloadError, DownloadResult};
use crate::service::{ByteStream, ObjectService};

/// Where the object service lives and how to authenticate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub server_url: String,
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl ServiceEndpoint {
    pub fn new(server_url: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            stream_id: stream_id.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn batch_url(&self) -> String {
        format!(
            "{}/api/getobjects/{}",
            self.server_url.trim_end_matches('/'),
            self.stream_id
        )
    }

    pub fn single_url(&self, id: &BaseId) -> String {
        format!(
            "{}/objects/{}/{}/single",
            self.server_url.trim_end_matches('/'),
            self.stream_id,
            id
        )
    }
}

/// Object service reached over HTTP with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpObjectService {
    client: Client,
    endpoint: ServiceEndpoint,
}

impl HttpObjectService {
    pub fn new(endpoint: ServiceEndpoint) -> DownloadResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DownloadError::Config(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DownloadError::Config(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));

        let client = Client::builder()
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| DownloadError::Config(e.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map non-success statuses onto the error taxonomy.
fn check_status(response: Response, id: Option<&BaseId>) -> DownloadResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match (status, id) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => Err(DownloadError::Unauthorized),
        (StatusCode::NOT_FOUND, Some(id)) => Err(DownloadError::NotFound(id.clone())),
        _ => Err(DownloadError::Status {
            code: status.as_u16(),
            message: status.canonical_reason().unwrap_or("unknown").to_string(),
        }),
    }
}

#[async_trait]
impl ObjectService for HttpObjectService {
    async fn fetch_batch(&self, ids: &[BaseId]) -> DownloadResult<ByteStream> {
        let objects =
            serde_json::to_string(ids).map_err(|e| DownloadError::Parse(e.to_string()))?;
        let request = self
            .client
            .post(self.endpoint.batch_url())
            .json(&json!({ "objects": objects }));
        let response = self.authorize(request).send().await?;
        let response = check_status(response, None)?;
        debug!(ids = ids.len(), status = %response.status(), "batch response streaming");

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DownloadError::from))
            .boxed())
    }

    async fn fetch_single(&self, id: &BaseId) -> DownloadResult<Bytes> {
        let request = self.client.get(self.endpoint.single_url(id));
        let response = self.authorize(request).send().await?;
        let response = check_status(response, Some(id))?;
        Ok(response.bytes().await?)
    }
}
