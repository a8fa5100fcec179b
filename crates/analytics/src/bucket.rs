//! A tenant's single open temp file plus the consumer task draining it.
//!
//! A [`Bucket`] owns exactly one writer for its tenant: gzip-wrapped for
//! uploaders that want compression, plain otherwise. Writes arrive over an
//! mpsc channel; the consumer task serializes each batch with the uploader
//! and exits (staging the file) once every sender has been dropped, which
//! happens naturally once the manager's sweep removes the tenant from its
//! bucket map and any in-flight `send_records` calls finish.

use std::io::Write;
use std::sync::Arc;

use file_store::{File as TempFile, FileStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::Record;
use crate::uploader::{saas, StagedFile, Uploader};

enum BucketWriter {
    Gzip(flate2::write::GzEncoder<TempFile>),
    Plain(TempFile),
}

impl Write for BucketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            BucketWriter::Gzip(w) => w.write(buf),
            BucketWriter::Plain(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            BucketWriter::Gzip(w) => w.flush(),
            BucketWriter::Plain(w) => w.flush(),
        }
    }
}

impl BucketWriter {
    fn finish(self) -> std::io::Result<TempFile> {
        match self {
            BucketWriter::Gzip(w) => w.finish(),
            BucketWriter::Plain(w) => Ok(w),
        }
    }
}

pub struct BucketHandle {
    tx: mpsc::Sender<Vec<Record>>,
    join: JoinHandle<Option<StagedFile>>,
}

impl BucketHandle {
    /// Clones the sender half so a caller can enqueue a batch without
    /// holding the bucket-map lock across the send. The channel only closes
    /// once every clone (including this one's original, dropped when the
    /// tenant is removed from the map at sweep time) has been dropped.
    pub fn clone_sender(&self) -> mpsc::Sender<Vec<Record>> {
        self.tx.clone()
    }

    /// Drops this handle's sender and returns the join handle alone. The
    /// channel only fully closes once every clone handed out by
    /// [`BucketHandle::clone_sender`] is also dropped, so the consumer task
    /// may still finish draining in-flight sends after this returns.
    pub fn close_sender(self) -> JoinHandle<Option<StagedFile>> {
        drop(self.tx);
        self.join
    }
}

/// Opens a new temp file for `tenant`, wraps it per the uploader's framing
/// choice, and spawns the consumer task. Returns immediately; the returned
/// handle's `join` resolves once the bucket has drained and staged its file.
pub fn spawn(
    tenant: String,
    file_store: FileStore,
    uploader: Arc<dyn Uploader>,
    send_channel_size: usize,
    now_unix_secs: u64,
) -> Result<BucketHandle, file_store::Error> {
    let temp = file_store.new_temp_file(&tenant, now_unix_secs, uploader.file_extension())?;
    let writer = if uploader.is_gzipped() {
        BucketWriter::Gzip(flate2::write::GzEncoder::new(temp, flate2::Compression::default()))
    } else {
        BucketWriter::Plain(temp)
    };

    let (tx, rx) = mpsc::channel(send_channel_size.max(1));
    let join = tokio::spawn(consume(tenant, file_store, uploader, writer, rx, now_unix_secs));

    Ok(BucketHandle { tx, join })
}

async fn consume(
    tenant: String,
    file_store: FileStore,
    uploader: Arc<dyn Uploader>,
    mut writer: BucketWriter,
    mut rx: mpsc::Receiver<Vec<Record>>,
    now_unix_secs: u64,
) -> Option<StagedFile> {
    while let Some(batch) = rx.recv().await {
        if let Err(e) = uploader.write(&batch, &mut writer) {
            tracing::error!(%tenant, error = %e, "failed to serialize batch into bucket writer");
        }
    }

    let file = match writer.finish() {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(%tenant, error = %e, "failed to finish bucket writer, dropping temp file");
            return None;
        }
    };

    let file_name = file.file_name().to_owned();
    let staged_path = match file.stage(&file_store) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(%tenant, error = %e, "failed to stage bucket temp file");
            return None;
        }
    };

    let remote_relative_path = saas::remote_relative_path(now_unix_secs as i64, &file_name);
    Some(StagedFile { tenant, file_name, path: staged_path, remote_relative_path })
}
