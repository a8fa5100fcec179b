//! The on-cluster uploader: fluentd-forward textual framing, shipped over a
//! mutually-authenticated TLS connection to the in-mesh collector.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{StagedFile, UploadError, Uploader};
use crate::record::Record;

/// Parsed `conf_datadispatcher_*`-style properties file describing how to
/// reach the in-mesh collector.
#[derive(Debug, Clone)]
pub struct OnClusterConfig {
    pub destination_batch: String,
    pub ca_pem: PathBuf,
    pub certificate_pem: PathBuf,
    pub key_pem: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("missing required property {0}")]
    MissingProperty(&'static str),
}

impl OnClusterConfig {
    /// Parses a Java-properties-style `key=value` file, ignoring blank lines
    /// and `#`-prefixed comments.
    pub fn from_properties_file(path: &Path) -> Result<OnClusterConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut values = std::collections::HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }

        let required = |key: &'static str| values.remove(key).ok_or(ConfigError::MissingProperty(key));
        Ok(OnClusterConfig {
            destination_batch: required("conf_datadispatcher_destination.batch")?,
            ca_pem: required("conf_datadispatcher_ca.pem").map(PathBuf::from)?,
            certificate_pem: required("conf_datadispatcher_certificate.pem").map(PathBuf::from)?,
            key_pem: required("conf_datadispatcher_key.pem").map(PathBuf::from)?,
        })
    }
}

pub struct OnClusterUploader {
    config: OnClusterConfig,
    tls_config: Arc<rustls::ClientConfig>,
    client_id: Uuid,
}

impl OnClusterUploader {
    pub fn new(config: OnClusterConfig) -> Result<OnClusterUploader, ConfigError> {
        let tls_config = build_tls_config(&config)?;
        Ok(OnClusterUploader { config, tls_config: Arc::new(tls_config), client_id: Uuid::new_v4() })
    }

    fn tag(&self, tenant: &str) -> String {
        let (org, env) = tenant.split_once('~').unwrap_or((tenant, ""));
        format!("api.{org}.{env}.{}", self.client_id)
    }
}

fn build_tls_config(config: &OnClusterConfig) -> Result<rustls::ClientConfig, ConfigError> {
    let ca_bytes = std::fs::read(&config.ca_pem)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_bytes.as_slice()) {
        roots.add(cert?).map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    }

    let cert_bytes = std::fs::read(&config.certificate_pem)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice()).collect::<Result<_, _>>()?;
    let key_bytes = std::fs::read(&config.key_pem)?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
        .ok_or_else(|| ConfigError::Io(std::io::Error::other("no private key found in key pem file")))?;

    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))
}

#[async_trait]
impl Uploader for OnClusterUploader {
    fn is_gzipped(&self) -> bool {
        false
    }

    fn file_extension(&self) -> &'static str {
        "txt"
    }

    fn write(&self, records: &[Record], writer: &mut dyn Write) -> Result<(), UploadError> {
        for record in records {
            let json = serde_json::to_string(record).map_err(std::io::Error::from)?;
            // The timestamp in the fluentd-forward frame reflects when the
            // batch was serialized, not any per-record timestamp.
            let ts = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            writeln!(writer, "[\"{}\", {ts}, {json}]", self.tag(&record.organization_environment_tag()))?;
        }
        Ok(())
    }

    async fn upload_or_delete(&self, file: &StagedFile, cancelled: bool) -> Result<(), UploadError> {
        if cancelled {
            tokio::fs::remove_file(&file.path).await.ok();
            return Ok(());
        }

        let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
        let tcp = tokio::net::TcpStream::connect(&self.config.destination_batch).await?;
        let server_name = server_name_from_addr(&self.config.destination_batch)
            .map_err(|e| UploadError::Tls(e.to_string()))?;
        let mut stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| UploadError::Tls(e.to_string()))?;

        let mut body = tokio::fs::File::open(&file.path).await?;
        tokio::io::copy(&mut body, &mut stream).await?;
        stream.shutdown().await?;

        tokio::fs::remove_file(&file.path).await?;
        Ok(())
    }
}

fn server_name_from_addr(addr: &str) -> Result<rustls::pki_types::ServerName<'static>, rustls::pki_types::InvalidDnsNameError> {
    let host = addr.split(':').next().unwrap_or(addr);
    rustls::pki_types::ServerName::try_from(host.to_owned())
}

impl Record {
    fn organization_environment_tag(&self) -> String {
        format!("{}~{}", self.organization, self.environment)
    }
}
