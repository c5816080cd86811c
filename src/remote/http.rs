//! reqwest implementation of the remote endpoints.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    AbortChunkedRequest, ByteCounter, ChunkedSession, ChunkedSessionRequest,
    CompleteChunkedRequest, ConfirmRequest, InlineUpload, Payload, PutReceipt, RemoteObject,
    RemoteStore, UploadTarget, UploadTargetRequest,
};
use crate::core::auth::Credentials;
use crate::core::error::TransferError;

/// Longest slice of an error body kept in a failure message.
const MAX_ERROR_BODY: usize = 200;

/// Remote store reached over HTTP(S).
///
/// Control-plane calls carry the bearer token; direct-to-target PUTs do not,
/// since the target URL embeds its own short-lived credential.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

#[derive(Serialize)]
struct WirePart<'a> {
    part_number: usize,
    etag: &'a str,
}

#[derive(Serialize)]
struct WireComplete<'a> {
    upload_id: &'a str,
    key: &'a str,
    parts: Vec<WirePart<'a>>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, credentials: Credentials) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("shuttle/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, base_url, credentials))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.bearer() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransferError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, TransferError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!(url = %url, "POST");
        let request = self.authorize(self.client.post(url).json(body));
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| TransferError::Protocol(format!("invalid response body: {}", e)))
    }

    async fn body_for(
        payload: &Payload,
        progress: ByteCounter,
    ) -> Result<reqwest::Body, TransferError> {
        let stream = payload.stream(progress).await?;
        Ok(reqwest::Body::wrap_stream(stream))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn upload_inline(
        &self,
        upload: InlineUpload,
        progress: ByteCounter,
    ) -> Result<RemoteObject, TransferError> {
        let url = self.endpoint(&format!("upload/{}", upload.category));
        debug!(url = %url, bytes = upload.payload.len, "Inline upload");

        let body = Self::body_for(&upload.payload, progress).await?;
        let request = self.authorize(
            self.client
                .post(url)
                .query(&[("filename", upload.file_name.as_str())])
                .header(CONTENT_TYPE, upload.payload.content_type.as_str())
                .header(CONTENT_LENGTH, upload.payload.len)
                .body(body),
        );

        let response = self.send(request).await?;
        response
            .json::<RemoteObject>()
            .await
            .map_err(|e| TransferError::Protocol(format!("invalid response body: {}", e)))
    }

    async fn request_upload_target(
        &self,
        request: &UploadTargetRequest,
    ) -> Result<UploadTarget, TransferError> {
        self.post_json("uploads/presign", request).await
    }

    async fn put_to_target(
        &self,
        url: &str,
        payload: Payload,
        progress: ByteCounter,
    ) -> Result<PutReceipt, TransferError> {
        debug!(bytes = payload.len, offset = payload.offset, "PUT to write target");
        let body = Self::body_for(&payload, progress).await?;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, payload.content_type.as_str())
            .header(CONTENT_LENGTH, payload.len)
            .body(body);

        let response = self.send(request).await?;
        let token = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(PutReceipt { token })
    }

    async fn confirm_upload(
        &self,
        request: &ConfirmRequest,
    ) -> Result<RemoteObject, TransferError> {
        self.post_json("uploads/confirm", request).await
    }

    async fn initiate_chunked(
        &self,
        request: &ChunkedSessionRequest,
    ) -> Result<ChunkedSession, TransferError> {
        self.post_json("uploads/multipart/initiate", request).await
    }

    async fn complete_chunked(
        &self,
        request: &CompleteChunkedRequest,
    ) -> Result<RemoteObject, TransferError> {
        let wire = WireComplete {
            upload_id: &request.upload_id,
            key: &request.key,
            parts: request
                .parts
                .iter()
                .map(|part| WirePart {
                    part_number: part.index + 1,
                    etag: &part.token,
                })
                .collect(),
        };
        self.post_json("uploads/multipart/complete", &wire).await
    }

    async fn abort_chunked(&self, request: &AbortChunkedRequest) -> Result<(), TransferError> {
        let url = self.endpoint("uploads/multipart/abort");
        let http_request = self.authorize(self.client.post(url).json(request));
        self.send(http_request).await?;
        Ok(())
    }
}

/// Map a non-2xx status onto the error taxonomy.
pub fn status_error(status: u16, body: &str) -> TransferError {
    match status {
        401 | 403 => TransferError::Unauthorized { status },
        _ => TransferError::Remote {
            status,
            message: summarize_body(body),
        },
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no response body".to_string();
    }
    match trimmed.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransferError {
    if err.is_decode() {
        TransferError::Protocol(err.to_string())
    } else {
        TransferError::Network(err.to_string())
    }
}
