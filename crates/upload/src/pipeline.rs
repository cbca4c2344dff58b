use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, TryStreamExt, stream};
use oasis_xmpp::stanza::IqType;
use oasis_xmpp::{StanzaLink, StanzaTransport};
use reqwest::header::CONTENT_LENGTH;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, field, info, info_span, warn};

use crate::disco::UploadService;
use crate::error::UploadError;
use crate::progress::{ProgressSink, UploadProgress};
use crate::slot::{SlotRequest, UploadSlot};

/// Obtains an upload slot from the upload component.
pub trait SlotNegotiator: Send + Sync {
    fn request_slot(
        &self,
        service: &UploadService,
        request: &SlotRequest,
        timeout: Duration,
    ) -> impl Future<Output = Result<UploadSlot, UploadError>> + Send;
}

impl<T: StanzaTransport> SlotNegotiator for StanzaLink<T> {
    async fn request_slot(
        &self,
        service: &UploadService,
        request: &SlotRequest,
        timeout: Duration,
    ) -> Result<UploadSlot, UploadError> {
        let payload = self
            .query(Some(&service.jid), IqType::Get, request.to_element(), timeout)
            .await?;
        Ok(UploadSlot::from_payload(payload)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub filename: String,
    pub source: UploadSource,
    pub content_type: Option<String>,
}

impl UploadJob {
    pub fn from_bytes(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            source: UploadSource::Bytes(data.into()),
            content_type: None,
        }
    }

    /// Upload a file from disk under its own file name.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        Self {
            filename,
            source: UploadSource::File(path),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Last path component of the requested name; servers only ever see that.
    fn validated_filename(&self) -> Result<String, UploadError> {
        Path::new(&self.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| UploadError::Validation("filename must not be empty".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    SlotRequested,
    Uploading,
    Succeeded,
    Failed,
}

fn enter(stage: Stage) {
    debug!(?stage, "upload stage");
}

enum OpenedSource {
    Bytes(Bytes),
    File(tokio::fs::File),
}

impl OpenedSource {
    async fn open(source: UploadSource) -> Result<(Self, u64), UploadError> {
        match source {
            UploadSource::Bytes(data) => {
                let size = data.len() as u64;
                Ok((Self::Bytes(data), size))
            }
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| UploadError::Io(format!("{}: {e}", path.display())))?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| UploadError::Io(format!("{}: {e}", path.display())))?
                    .len();
                Ok((Self::File(file), size))
            }
        }
    }

    fn into_body(self, chunk_size: usize, sink: ProgressSink) -> reqwest::Body {
        match self {
            Self::Bytes(data) => {
                let chunks: Vec<Bytes> = (0..data.len())
                    .step_by(chunk_size)
                    .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
                    .collect();
                tracked(stream::iter(chunks.into_iter().map(Ok::<Bytes, io::Error>)), sink)
            }
            Self::File(file) => tracked(ReaderStream::with_capacity(file, chunk_size), sink),
        }
    }
}

/// Report every chunk as it is handed to the HTTP client.
fn tracked<S>(chunks: S, sink: ProgressSink) -> reqwest::Body
where
    S: Stream<Item = io::Result<Bytes>> + Send + Sync + 'static,
{
    reqwest::Body::wrap_stream(chunks.inspect_ok(move |chunk| sink.advance(chunk.len() as u64)))
}

/// Drives one upload from slot negotiation to the terminal progress event.
#[derive(Clone)]
pub struct UploadPipeline {
    http: reqwest::Client,
    chunk_size: usize,
    slot_timeout: Duration,
}

impl UploadPipeline {
    pub fn new(http: reqwest::Client, chunk_size: usize, slot_timeout: Duration) -> Self {
        Self {
            http,
            chunk_size: chunk_size.max(1),
            slot_timeout,
        }
    }

    /// Upload `job` and return its retrieval URL.
    ///
    /// Whatever the outcome, `progress` receives exactly one terminal event
    /// and is then closed. Firing `cancel` aborts slot negotiation or the
    /// transfer with [`UploadError::Cancelled`].
    pub async fn upload<N: SlotNegotiator>(
        &self,
        negotiator: &N,
        service: Option<&UploadService>,
        job: UploadJob,
        progress: Option<mpsc::Sender<UploadProgress>>,
        cancel: CancellationToken,
    ) -> Result<String, UploadError> {
        let span = info_span!("upload", filename = %job.filename, size = field::Empty);
        let sink = ProgressSink::new(progress);

        let outcome = self
            .attempt(negotiator, service, job, &sink, &cancel)
            .instrument(span.clone())
            .await;

        span.in_scope(|| match &outcome {
            Ok(url) => {
                enter(Stage::Succeeded);
                info!(url = %url, "upload finished");
            }
            Err(e) => {
                enter(Stage::Failed);
                warn!(error = %e, "upload failed");
            }
        });

        sink.finish(&outcome).instrument(span).await;
        outcome
    }

    async fn attempt<N: SlotNegotiator>(
        &self,
        negotiator: &N,
        service: Option<&UploadService>,
        job: UploadJob,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        enter(Stage::Idle);
        let filename = job.validated_filename()?;
        let service = service.ok_or(UploadError::ServiceUnavailable)?;

        let (source, size) = OpenedSource::open(job.source).await?;
        if size == 0 {
            return Err(UploadError::Validation("upload source is empty".to_string()));
        }
        Span::current().record("size", size);
        sink.set_total(size);

        match service.max_file_size {
            Some(max) if size > max => return Err(UploadError::TooLarge { size, max }),
            _ => {}
        }

        enter(Stage::SlotRequested);
        let request = SlotRequest {
            filename,
            size,
            content_type: job.content_type,
        };
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            slot = negotiator.request_slot(service, &request, self.slot_timeout) => slot?,
        };

        enter(Stage::Uploading);
        let mut put = self.http.put(&slot.put_url).header(CONTENT_LENGTH, size);
        for (name, value) in &slot.headers {
            put = put.header(name.as_str(), value.as_str());
        }
        let body = source.into_body(self.chunk_size, sink.clone());

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            response = put.body(body).send() => {
                response.map_err(|e| UploadError::Transfer(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::Status(status.as_u16()));
        }
        Ok(slot.get_url)
    }
}
