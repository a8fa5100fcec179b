//! The uploader seam: one implementation per wire protocol the collector
//! can speak to. A [`Bucket`](crate::bucket::Bucket) only ever asks its
//! uploader two things — how to frame a batch of records, and how to ship
//! (or discard) a staged file — so swapping SaaS for on-cluster delivery
//! never touches bucket, staging or recovery code.

pub mod on_cluster;
pub mod saas;

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::record::Record;

/// A file that has been staged and is ready for an upload attempt.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub tenant: String,
    pub file_name: String,
    pub path: PathBuf,
    /// Remote path component computed once, at stage time, from the
    /// configured clock — so retries always target the same remote location
    /// regardless of how long the upload takes to succeed.
    pub remote_relative_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("signed url exchange failed: {0}")]
    SignedUrl(#[source] reqwest::Error),
    #[error("upload request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("upload rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(String),
}

impl UploadError {
    /// True for the three response classes the collector treats as
    /// permanently unretryable within the current drain pass: an
    /// authentication failure, a missing resource, or a server-side (5xx)
    /// error. Anything else is assumed transient and goes through backoff.
    pub fn is_short_circuit(&self) -> bool {
        match self {
            UploadError::Rejected { status, .. } => {
                *status == 401 || *status == 404 || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

/// How a bucket's open temp file is framed and shipped. Implementations are
/// stateless aside from whatever client/credentials they were built with, so
/// one instance is shared (via `Arc`) across every tenant's bucket.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Whether a bucket should wrap its temp file in a gzip encoder before
    /// handing writes to [`Uploader::write`].
    fn is_gzipped(&self) -> bool;

    /// The extension used for temp/staging file names.
    fn file_extension(&self) -> &'static str;

    /// Serializes one batch of records into `writer`. Called once per
    /// `send_records` call while the bucket's consumer task is draining its
    /// channel; never called again once the bucket has closed its writer.
    fn write(&self, records: &[Record], writer: &mut dyn Write) -> Result<(), UploadError>;

    /// Ships `file`, or — when `cancelled` is true — deletes it without
    /// attempting the network at all. Implementations must honor
    /// `cancelled` unconditionally; it is how the overflow drain and
    /// shutdown paths discard work without ever calling out over the wire.
    async fn upload_or_delete(&self, file: &StagedFile, cancelled: bool) -> Result<(), UploadError>;
}
