//! Manager-facing error types.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer_path must not be empty")]
    MissingBufferPath,
    #[error("staging_file_limit must be greater than zero")]
    InvalidStagingFileLimit,
    #[error("collection_interval must be greater than zero")]
    InvalidCollectionInterval,
    #[error("base_url, key and secret are required when hybrid_config_file is not set")]
    MissingSaasCredentials,
    #[error("legacy_endpoint is not supported by this collector")]
    LegacyEndpointUnsupported,
    #[error(transparent)]
    FileStore(#[from] file_store::Error),
    #[error(transparent)]
    OnCluster(#[from] crate::uploader::on_cluster::ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("manager is closed")]
    Closed,
    #[error(transparent)]
    Validation(#[from] crate::record::ValidationError),
    #[error(transparent)]
    FileStore(#[from] file_store::Error),
}
