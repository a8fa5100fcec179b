//! The hosted-collector uploader: exchange a signed URL over HTTP Basic auth,
//! then `PUT` the gzipped batch straight to object storage.

use std::io::Write;

use async_trait::async_trait;
use serde::Deserialize;

use super::{StagedFile, UploadError, Uploader};
use crate::record::Record;

pub struct SaasUploader {
    client: reqwest::Client,
    base_url: String,
    key: String,
    secret: String,
}

impl SaasUploader {
    pub fn new(client: reqwest::Client, base_url: String, key: String, secret: String) -> SaasUploader {
        SaasUploader { client, base_url, key, secret }
    }

    fn signed_url_request(&self, file: &StagedFile) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/analytics/organization/{}/environment/{}",
            self.base_url.trim_end_matches('/'),
            tenant_org(&file.tenant),
            tenant_env(&file.tenant),
        );
        self.client
            .get(url)
            .basic_auth(&self.key, Some(&self.secret))
            .query(&[
                ("tenant", file.tenant.as_str()),
                ("relative_file_path", file.remote_relative_path.as_str()),
                ("file_content_type", "application/x-gzip"),
                ("encrypt", "true"),
            ])
    }
}

fn tenant_org(tenant: &str) -> &str {
    tenant.split('~').next().unwrap_or(tenant)
}

fn tenant_env(tenant: &str) -> &str {
    tenant.split('~').nth(1).unwrap_or("")
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    url: String,
}

#[async_trait]
impl Uploader for SaasUploader {
    fn is_gzipped(&self) -> bool {
        true
    }

    fn file_extension(&self) -> &'static str {
        "gz"
    }

    fn write(&self, records: &[Record], writer: &mut dyn Write) -> Result<(), UploadError> {
        for record in records {
            serde_json::to_writer(&mut *writer, record).map_err(std::io::Error::from)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    async fn upload_or_delete(&self, file: &StagedFile, cancelled: bool) -> Result<(), UploadError> {
        if cancelled {
            tokio::fs::remove_file(&file.path).await.ok();
            return Ok(());
        }

        let signed = self
            .signed_url_request(file)
            .send()
            .await
            .map_err(UploadError::SignedUrl)?;
        if !signed.status().is_success() {
            let status = signed.status().as_u16();
            let body = signed.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, body });
        }
        let signed: SignedUrlResponse = signed.json().await.map_err(UploadError::SignedUrl)?;

        let bytes = tokio::fs::read(&file.path).await?;
        let len = bytes.len();
        let response = self
            .client
            .put(&signed.url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-gzip")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .header("x-amz-server-side-encryption", "AES256")
            .header(reqwest::header::EXPECT, "100-continue")
            .body(bytes)
            .send()
            .await
            .map_err(UploadError::Request)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, body });
        }

        tokio::fs::remove_file(&file.path).await?;
        Ok(())
    }
}

/// Formats `date=YYYY-MM-DD/time=HH-MM-00/<basename>` from the stage-time
/// clock. Called once per file, at the moment it is staged.
pub fn remote_relative_path(now_unix_secs: i64, basename: &str) -> String {
    let dt = time::OffsetDateTime::from_unix_timestamp(now_unix_secs).unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    format!(
        "date={:04}-{:02}-{:02}/time={:02}-{:02}-00/{basename}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_relative_path_zeros_seconds() {
        let path = remote_relative_path(1_521_221_450, "file.gz");
        assert!(path.starts_with("date="));
        assert!(path.ends_with("-00/file.gz"));
        assert!(path.contains("/file.gz"));
    }

    #[test]
    fn tenant_org_and_env_split_on_tilde() {
        assert_eq!(tenant_org("acme~prod"), "acme");
        assert_eq!(tenant_env("acme~prod"), "prod");
    }
}
