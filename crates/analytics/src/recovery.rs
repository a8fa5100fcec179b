//! Crash recovery: files left behind in `temp/` by a process that died
//! mid-batch are validated (and, for gzip uploaders, repaired if truncated or
//! trailing-corrupted) and moved into staging, where they rejoin the normal
//! upload path.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use file_store::FileStore;

use crate::uploader::{saas, StagedFile, Uploader};

const REPAIR_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("{path}: gzip stream failed validation and was repaired")]
    GzipRepaired { path: PathBuf },
    #[error("{path}: gzip stream is not valid or repairable, left in place")]
    GzipUnrecoverable { path: PathBuf },
    #[error(transparent)]
    FileStore(#[from] file_store::Error),
}

/// Walks every tenant's temp directory, validates/repairs gzip files left
/// behind by a crash, stages what it can, and returns every already-staged
/// file (old and newly recovered) ready for the upload pool. Recovery
/// failures are accumulated and returned alongside whatever did succeed —
/// one bad file never blocks the rest of startup.
pub fn recover(
    file_store: &FileStore,
    uploader: &dyn Uploader,
    now_unix_secs: u64,
) -> (Vec<StagedFile>, Vec<RecoveryError>) {
    let mut errors = Vec::new();

    let tenants = match file_store.tenants_with_temp_files() {
        Ok(tenants) => tenants,
        Err(e) => {
            errors.push(RecoveryError::FileStore(e));
            Vec::new()
        }
    };

    for tenant in &tenants {
        let temp_files = match file_store.list_temp(tenant) {
            Ok(files) => files,
            Err(e) => {
                errors.push(RecoveryError::FileStore(e));
                continue;
            }
        };

        for path in temp_files {
            if uploader.is_gzipped() {
                match ensure_valid_gzip(&path) {
                    Ok(GzipStatus::Valid) => {}
                    Ok(GzipStatus::Repaired) => {
                        errors.push(RecoveryError::GzipRepaired { path: path.clone() });
                    }
                    Ok(GzipStatus::Unrecoverable) => {
                        errors.push(RecoveryError::GzipUnrecoverable { path });
                        continue;
                    }
                    Err(e) => {
                        errors.push(RecoveryError::Io { path: path.clone(), source: e });
                        continue;
                    }
                }
            }

            if let Err(e) = file_store.stage_path(tenant, &path) {
                errors.push(RecoveryError::FileStore(e));
            }
        }
    }

    let mut staged = Vec::new();
    match file_store.list_all_staged() {
        Ok(paths) => {
            for path in paths {
                let tenant = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_owned();
                let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_owned();
                let remote_relative_path = saas::remote_relative_path(now_unix_secs as i64, &file_name);
                staged.push(StagedFile { tenant, file_name, path, remote_relative_path });
            }
        }
        Err(e) => errors.push(RecoveryError::FileStore(e)),
    }

    (staged, errors)
}

enum GzipStatus {
    Valid,
    /// Validation failed but a repair pass recovered a non-empty prefix; the
    /// original temp file was replaced in place.
    Repaired,
    Unrecoverable,
}

/// Reads `path` end-to-end as a single-member gzip stream and confirms there
/// is no trailing data after the footer. On any failure, attempts a repair:
/// re-decoding from the start and re-encoding whatever decodes cleanly before
/// it hits the corruption.
fn ensure_valid_gzip(path: &Path) -> Result<GzipStatus, std::io::Error> {
    if fully_valid(path)? {
        return Ok(GzipStatus::Valid);
    }
    repair(path)
}

fn fully_valid(path: &Path) -> Result<bool, std::io::Error> {
    let file = std::fs::File::open(path)?;
    let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
    if std::io::copy(&mut decoder, &mut std::io::sink()).is_err() {
        return Ok(false);
    }
    let mut remainder = decoder.into_inner();
    let mut probe = [0u8; 1];
    Ok(remainder.read(&mut probe)? == 0)
}

fn repair(path: &Path) -> Result<GzipStatus, std::io::Error> {
    let file = std::fs::File::open(path)?;
    let mut decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));

    let repaired_path = path.with_extension("repair");
    let mut encoder =
        flate2::write::GzEncoder::new(std::fs::File::create(&repaired_path)?, flate2::Compression::default());

    let mut buf = vec![0u8; REPAIR_BUFFER_SIZE];
    let mut decoded_any = false;
    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                encoder.write_all(&buf[..n])?;
                decoded_any = true;
            }
            Err(e) if is_tolerated(&e) => break,
            Err(_) => {
                std::fs::remove_file(&repaired_path).ok();
                return Ok(GzipStatus::Unrecoverable);
            }
        }
    }

    if !decoded_any {
        std::fs::remove_file(&repaired_path).ok();
        return Ok(GzipStatus::Unrecoverable);
    }

    encoder.finish()?;
    std::fs::rename(&repaired_path, path)?;
    Ok(GzipStatus::Repaired)
}

fn is_tolerated(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        return true;
    }
    if e.kind() == std::io::ErrorKind::InvalidData {
        let msg = e.to_string();
        return msg.contains("invalid header") || msg.contains("invalid gzip header");
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn write_valid_gzip(path: &Path, content: &[u8]) {
        let mut encoder = flate2::write::GzEncoder::new(std::fs::File::create(path).unwrap(), flate2::Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn valid_gzip_file_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("good.gz");
        write_valid_gzip(&path, b"{\"a\":1}\n");

        assert!(matches!(ensure_valid_gzip(&path).unwrap(), GzipStatus::Valid));
    }

    #[test]
    fn gzip_with_trailing_garbage_is_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broke.gz");
        write_valid_gzip(&path, b"{\"a\":1}\n");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not gzip garbage").unwrap();

        let status = ensure_valid_gzip(&path).unwrap();
        assert!(matches!(status, GzipStatus::Repaired));

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(std::fs::File::open(&path).unwrap())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, b"{\"a\":1}\n");
    }

    #[test]
    fn non_gzip_file_is_unrecoverable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broke.gz");
        std::fs::write(&path, b"this is not a json record").unwrap();

        assert!(matches!(ensure_valid_gzip(&path).unwrap(), GzipStatus::Unrecoverable));
        assert!(path.exists());
    }

    #[test]
    fn recover_stages_valid_and_repaired_files_with_one_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.ensure_tenant_dirs("hi~test").unwrap();

        write_valid_gzip(&store.temp_dir("hi~test").join("1-good.gz"), b"{\"a\":1}\n");
        write_valid_gzip(&store.temp_dir("hi~test").join("2-broke.gz"), b"{\"b\":2}\n");
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(store.temp_dir("hi~test").join("2-broke.gz"))
            .unwrap();
        file.write_all(b"trailing garbage").unwrap();

        struct GzipUploader;
        #[async_trait::async_trait]
        impl Uploader for GzipUploader {
            fn is_gzipped(&self) -> bool {
                true
            }
            fn file_extension(&self) -> &'static str {
                "gz"
            }
            fn write(&self, _: &[crate::record::Record], _: &mut dyn std::io::Write) -> Result<(), crate::uploader::UploadError> {
                Ok(())
            }
            async fn upload_or_delete(&self, _: &StagedFile, _: bool) -> Result<(), crate::uploader::UploadError> {
                Ok(())
            }
        }

        let (staged, errors) = recover(&store, &GzipUploader, 1_700_000_000);
        assert_eq!(staged.len(), 2);
        assert_eq!(errors.len(), 1);
    }
}
