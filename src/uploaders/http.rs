use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Body, Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use crate::core::{
    FileInput, MediaRecord, MediaRegistrar, ProgressFn, RegistrationContext, Transfer,
    TransferError, TransferResponse,
};

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const FILENAME_HEADER: &str = "upload-filename";

pin_project! {
    /// Reports bytes handed to the HTTP body as they are polled.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        loaded: u64,
        total: u64,
        on_progress: ProgressFn,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total: u64, on_progress: ProgressFn) -> Self {
        Self {
            inner,
            loaded: 0,
            total,
            on_progress,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.loaded += chunk.len() as u64;
                    (this.on_progress)(*this.loaded, *this.total);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Splits a payload into cheap `Bytes` views.
fn chunked(data: Bytes, chunk_size: usize) -> Vec<std::io::Result<Bytes>> {
    let chunk_size = chunk_size.max(1);
    (0..data.len())
        .step_by(chunk_size)
        .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
        .collect()
}

fn auth_headers(token: Option<&str>) -> Result<HeaderMap, TransferError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|err| TransferError::Validation(format!("Invalid token: {}", err)))?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Turns a non-success response into a classified error, keeping the body as message.
async fn error_for_status(response: Response) -> TransferError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };

    TransferError::from_status(status.as_u16(), message)
}

async fn json_body(response: Response) -> Result<serde_json::Value, TransferError> {
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }

    serde_json::from_slice(&bytes).map_err(|err| TransferError::other(format!("Invalid response body: {}", err)))
}

/// Single-request streaming upload of one file.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
    endpoint: Url,
    token: Option<String>,
    chunk_size: usize,
}

impl HttpTransfer {
    pub fn new(endpoint: &str) -> Result<Self, TransferError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| TransferError::Validation(format!("Invalid endpoint {}: {}", endpoint, err)))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn upload(
        &self,
        file: &FileInput,
        cancel: CancellationToken,
        on_progress: ProgressFn,
    ) -> Result<TransferResponse, TransferError> {
        let total = file.size();
        let stream = ProgressStream::new(
            futures::stream::iter(chunked(file.data.clone(), self.chunk_size)),
            total,
            on_progress,
        );

        let mut headers = auth_headers(self.token.as_deref())?;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
        if let Ok(mime_type) = HeaderValue::from_str(&file.mime_type) {
            headers.insert(CONTENT_TYPE, mime_type);
        }
        // header values must be ASCII
        let encoded_filename = BASE64_STANDARD.encode(&file.filename);
        if let Ok(filename) = HeaderValue::from_str(&encoded_filename) {
            headers.insert(FILENAME_HEADER, filename);
        }

        let request = self
            .client
            .post(self.endpoint.clone())
            .headers(headers)
            .body(Body::wrap_stream(stream))
            .send();

        let response = tokio::select! {
            response = request => response?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let data = tokio::select! {
            data = json_body(response) => data?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };
        debug!(filename = %file.filename, size = total, "transfer finished");

        Ok(TransferResponse { data })
    }
}

/// Registers uploaded files as media of a context over a JSON API:
/// `POST {api_base}/{context_type}/{context_id}/media`.
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: Client,
    api_base: Url,
    context_type: String,
    token: Option<String>,
}

impl HttpRegistrar {
    pub fn new(api_base: &str, context_type: impl Into<String>) -> Result<Self, TransferError> {
        // join() drops the last segment without a trailing slash
        let mut base = api_base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let api_base = Url::parse(&base)
            .map_err(|err| TransferError::Validation(format!("Invalid API base {}: {}", api_base, err)))?;
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            api_base,
            context_type: context_type.into(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn media_url(&self, context_id: &str) -> Result<Url, TransferError> {
        self.api_base
            .join(&format!("{}/{}/media", self.context_type, context_id))
            .map_err(|err| TransferError::Validation(format!("Invalid context id {}: {}", context_id, err)))
    }
}

#[async_trait]
impl MediaRegistrar for HttpRegistrar {
    async fn register(
        &self,
        response: &TransferResponse,
        file: &FileInput,
        context: &RegistrationContext,
    ) -> Result<MediaRecord, TransferError> {
        let payload = serde_json::json!({
            "fileId": response.file_id(),
            "upload": response.data,
            "filename": file.filename,
            "mimeType": file.mime_type,
            "size": file.size(),
            "setId": context.set_id,
            "mediaData": context.media_data,
        });

        let reply = self
            .client
            .post(self.media_url(&context.context_id)?)
            .headers(auth_headers(self.token.as_deref())?)
            .json(&payload)
            .send()
            .await?;

        if !reply.status().is_success() {
            return Err(error_for_status(reply).await);
        }

        Ok(MediaRecord::from_value(json_body(reply).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use futures::StreamExt;
    use crate::core::ErrorCategory;
    use crate::utils::classify;
    use super::*;

    #[tokio::test]
    async fn test_progress_stream_reports_every_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_progress: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |loaded, total| seen.lock().unwrap().push((loaded, total)))
        };

        let data = Bytes::from(vec![1u8; 10]);
        let stream = ProgressStream::new(futures::stream::iter(chunked(data, 4)), 10, on_progress);
        let chunks: Vec<_> = stream.collect().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![(4, 10), (8, 10), (10, 10)]);
    }

    #[test]
    fn test_chunked_sizes() {
        let chunks = chunked(Bytes::from_static(b"abcdefg"), 3);
        let sizes: Vec<usize> = chunks.iter().map(|chunk| chunk.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert!(chunked(Bytes::new(), 3).is_empty());
    }

    #[test]
    fn test_registrar_url() {
        let registrar = HttpRegistrar::new("https://api.example.com/v1", "collection").unwrap();
        assert_eq!(
            registrar.media_url("col-1").unwrap().as_str(),
            "https://api.example.com/v1/collection/col-1/media"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        let error = HttpTransfer::new("not a url").unwrap_err();
        assert_eq!(classify(&error), ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_refused_connection_is_network() {
        let transfer = HttpTransfer::new("http://127.0.0.1:1/upload").unwrap();
        let file = FileInput::new("a.jpg", "image/jpeg", vec![0u8; 8]);
        let on_progress: ProgressFn = Arc::new(|_, _| {});

        let error = transfer
            .upload(&file, CancellationToken::new(), on_progress)
            .await
            .unwrap_err();
        assert_eq!(classify(&error), ErrorCategory::Network);
    }
}
