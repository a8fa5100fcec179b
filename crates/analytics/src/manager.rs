//! The public entry point: accepts records per tenant, periodically sweeps
//! open buckets into staging, and hands staged files to the upload pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use file_store::FileStore;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::auth::AuthContext;
use crate::bucket::{self, BucketHandle};
use crate::clock::Clock;
use crate::error::{ConfigError, SendError};
use crate::pool::Pool;
use crate::record::Record;
use crate::staging;
use crate::uploader::Uploader;

pub struct ManagerOptions {
    /// Out of scope: selects a direct synchronous POST variant this
    /// collector does not implement.
    pub legacy_endpoint: bool,
    pub buffer_path: PathBuf,
    pub staging_file_limit: usize,
    pub base_url: Option<String>,
    pub key: Option<String>,
    pub secret: Option<String>,
    pub client: reqwest::Client,
    pub send_channel_size: usize,
    pub hybrid_config_file: Option<PathBuf>,
    pub collection_interval: Duration,
    pub clock: Arc<dyn Clock>,
}

pub struct Manager {
    file_store: FileStore,
    uploader: Arc<dyn Uploader>,
    clock: Arc<dyn Clock>,
    staging_file_limit: usize,
    send_channel_size: usize,
    collection_interval: Duration,
    buckets: RwLock<HashMap<String, BucketHandle>>,
    pool: tokio::sync::Mutex<Option<Pool>>,
    closed: AtomicBool,
    sweep_stop: tokio::sync::Notify,
    sweep_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Validates `opts`, opens the buffer directory, recovers anything left
    /// behind by a previous crash, and returns a manager ready for
    /// [`Manager::start`].
    pub fn new(opts: ManagerOptions) -> Result<Arc<Manager>, ConfigError> {
        if opts.legacy_endpoint {
            return Err(ConfigError::LegacyEndpointUnsupported);
        }
        if opts.buffer_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingBufferPath);
        }
        if opts.staging_file_limit == 0 {
            return Err(ConfigError::InvalidStagingFileLimit);
        }
        if opts.collection_interval.is_zero() {
            return Err(ConfigError::InvalidCollectionInterval);
        }

        let uploader: Arc<dyn Uploader> = if let Some(hybrid_config_file) = &opts.hybrid_config_file {
            let config = crate::uploader::on_cluster::OnClusterConfig::from_properties_file(hybrid_config_file)?;
            Arc::new(crate::uploader::on_cluster::OnClusterUploader::new(config)?)
        } else {
            let (base_url, key, secret) = match (&opts.base_url, &opts.key, &opts.secret) {
                (Some(b), Some(k), Some(s)) if !b.is_empty() && !k.is_empty() && !s.is_empty() => {
                    (b.clone(), k.clone(), s.clone())
                }
                _ => return Err(ConfigError::MissingSaasCredentials),
            };
            Arc::new(crate::uploader::saas::SaasUploader::new(opts.client.clone(), base_url, key, secret))
        };

        let file_store = FileStore::new(&opts.buffer_path)?;
        let now = opts.clock.now_unix_secs();
        let (recovered, errors) = crate::recovery::recover(&file_store, &*uploader, now);
        for e in &errors {
            tracing::error!(error = %e, "crash recovery error");
        }

        let reservoir_capacity = opts.staging_file_limit.saturating_sub(crate::pool::NUM_UPLOADERS).max(1);
        let pool = Pool::spawn(uploader.clone(), reservoir_capacity);
        for file in recovered {
            pool.push(file);
        }
        let pool = tokio::sync::Mutex::new(Some(pool));

        Ok(Arc::new(Manager {
            file_store,
            uploader,
            clock: opts.clock,
            staging_file_limit: opts.staging_file_limit,
            send_channel_size: opts.send_channel_size,
            collection_interval: opts.collection_interval,
            buckets: RwLock::new(HashMap::new()),
            pool,
            closed: AtomicBool::new(false),
            sweep_stop: tokio::sync::Notify::new(),
            sweep_task: tokio::sync::Mutex::new(None),
        }))
    }

    /// Starts the periodic staging sweep. Call once after [`Manager::new`].
    pub async fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let interval = self.collection_interval;
        let mut task_guard = self.sweep_task.lock().await;
        *task_guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep().await,
                    _ = manager.sweep_stop.notified() => break,
                }
            }
        }));
    }

    /// Validates and enriches each record, then enqueues them on the calling
    /// tenant's bucket, creating one if this is its first record since the
    /// last sweep.
    pub async fn send_records(&self, auth: &dyn AuthContext, records: Vec<Record>) -> Result<(), SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }

        let now = self.clock.now_unix_millis();
        let mut enriched = Vec::with_capacity(records.len());
        for record in records {
            let record = record.ensure_fields(auth);
            record.validate(now)?;
            enriched.push(record);
        }
        if enriched.is_empty() {
            return Ok(());
        }

        let tenant = auth.tenant();
        let sender = self.bucket_sender(&tenant).await?;
        sender.write(enriched).await;
        Ok(())
    }

    async fn bucket_sender(&self, tenant: &str) -> Result<BucketSender, SendError> {
        {
            let buckets = self.buckets.read().await;
            if let Some(handle) = buckets.get(tenant) {
                return Ok(BucketSender(handle.clone_sender()));
            }
        }

        let mut buckets = self.buckets.write().await;
        if let Some(handle) = buckets.get(tenant) {
            return Ok(BucketSender(handle.clone_sender()));
        }

        let now = self.clock.now_unix_secs();
        let handle = bucket::spawn(tenant.to_owned(), self.file_store.clone(), self.uploader.clone(), self.send_channel_size, now)?;
        let sender = BucketSender(handle.clone_sender());
        buckets.insert(tenant.to_owned(), handle);
        Ok(sender)
    }

    /// Drains every open bucket into staging, evicts the oldest staged files
    /// if the sweep pushed staging over its limit, then hands the newly
    /// staged files to the upload pool. At most one sweep runs at a time.
    async fn sweep(&self) {
        let removed: HashMap<String, BucketHandle> = {
            let mut buckets = self.buckets.write().await;
            std::mem::take(&mut *buckets)
        };
        if removed.is_empty() {
            return;
        }

        let mut staged = Vec::new();
        for (tenant, handle) in removed {
            match handle.close_sender().await {
                Ok(Some(file)) => staged.push(file),
                Ok(None) => {}
                Err(e) => tracing::error!(%tenant, error = %e, "bucket consumer task panicked"),
            }
        }
        if staged.is_empty() {
            return;
        }

        if let Err(e) = staging::ensure_space(&self.file_store, self.staging_file_limit, staged.len()) {
            tracing::error!(error = %e, "staging eviction failed");
        }

        let pool = self.pool.lock().await;
        if let Some(pool) = pool.as_ref() {
            for file in staged {
                pool.push(file);
            }
        }
    }

    /// Idempotent. Stops the sweep loop, performs one final sweep, and waits
    /// for every in-flight upload to either finish or be abandoned for a
    /// future recovery pass.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.sweep_stop.notify_one();
        if let Some(task) = self.sweep_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sweep task panicked");
            }
        }
        self.sweep().await;

        if let Some(pool) = self.pool.lock().await.take() {
            pool.shutdown().await;
        }
    }
}

/// A cloned channel half for one bucket, obtained under the bucket-map lock
/// and used to send outside of it.
struct BucketSender(tokio::sync::mpsc::Sender<Vec<Record>>);

impl BucketSender {
    async fn write(self, records: Vec<Record>) {
        if self.0.send(records).await.is_err() {
            tracing::warn!("bucket consumer task exited before batch could be enqueued");
        }
    }
}
