//! Per-tenant temp and staging directory primitives.
//!
//! A [`FileStore`] owns two directory roots, `temp/` and `staging/`, each
//! holding one subdirectory per tenant. Callers open a [`File`] under a
//! tenant's temp directory, write to it, and eventually either [`File::stage`]
//! it into the matching staging subdirectory (a rename) or drop it, leaving
//! nothing behind but a half-written temp file for a future recovery pass.

use std::fs::File as StdFile;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    PersistError(#[from] tempfile::PersistError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
const TENANT_DIR_MODE: u32 = 0o700;

#[derive(Clone, Debug)]
pub struct FileStore {
    temp_root: PathBuf,
    staging_root: PathBuf,
}

impl FileStore {
    pub fn new(buffer_path: impl AsRef<Path>) -> Result<FileStore> {
        let buffer_path = buffer_path.as_ref();
        let temp_root = buffer_path.join("temp");
        let staging_root = buffer_path.join("staging");
        std::fs::create_dir_all(&temp_root)?;
        std::fs::create_dir_all(&staging_root)?;
        Ok(FileStore { temp_root, staging_root })
    }

    /// Ensures `temp/<tenant>` and `staging/<tenant>` exist with mode 0700.
    pub fn ensure_tenant_dirs(&self, tenant: &str) -> Result<()> {
        create_tenant_dir(&self.temp_root, tenant)?;
        create_tenant_dir(&self.staging_root, tenant)?;
        Ok(())
    }

    pub fn temp_dir(&self, tenant: &str) -> PathBuf {
        self.temp_root.join(tenant)
    }

    pub fn staging_dir(&self, tenant: &str) -> PathBuf {
        self.staging_root.join(tenant)
    }

    /// Opens a new temp file for `tenant` named `<unix-seconds>-<random>.<extension>`.
    /// The returned [`File`] must be staged or it disappears with the process.
    pub fn new_temp_file(&self, tenant: &str, now_unix_secs: u64, extension: &str) -> Result<File> {
        self.ensure_tenant_dirs(tenant)?;
        let dir = self.temp_dir(tenant);
        let file = NamedTempFile::new_in(&dir)?;
        let file_name = format!("{now_unix_secs}-{}.{extension}", random_component());
        let temp_path = dir.join(&file_name);
        Ok(File { inner: file, temp_path, file_name, tenant: tenant.to_owned() })
    }

    /// Renames an already-created temp file (e.g. one found during recovery)
    /// into the tenant's staging directory and returns the final path.
    pub fn stage_path(&self, tenant: &str, temp_path: &Path) -> Result<PathBuf> {
        self.ensure_tenant_dirs(tenant)?;
        let file_name = temp_path
            .file_name()
            .expect("temp file path always has a file name")
            .to_owned();
        let dest = self.staging_dir(tenant).join(&file_name);
        std::fs::rename(temp_path, &dest)?;
        Ok(dest)
    }

    /// Lists every tenant subdirectory under `temp/`.
    pub fn tenants_with_temp_files(&self) -> Result<Vec<String>> {
        list_subdirectory_names(&self.temp_root)
    }

    /// Lists the files under `temp/<tenant>`, in no particular order.
    pub fn list_temp(&self, tenant: &str) -> Result<Vec<PathBuf>> {
        list_files(&self.temp_dir(tenant))
    }

    /// Lists every tenant subdirectory under `staging/`.
    pub fn tenants_with_staged_files(&self) -> Result<Vec<String>> {
        list_subdirectory_names(&self.staging_root)
    }

    /// Lists the files under `staging/<tenant>`, in no particular order.
    pub fn list_staged(&self, tenant: &str) -> Result<Vec<PathBuf>> {
        list_files(&self.staging_dir(tenant))
    }

    /// Lists every staged file across every tenant.
    pub fn list_all_staged(&self) -> Result<Vec<PathBuf>> {
        let mut all = Vec::new();
        for tenant in self.tenants_with_staged_files()? {
            all.extend(self.list_staged(&tenant)?);
        }
        Ok(all)
    }

    pub fn delete_staged(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn create_tenant_dir(root: &Path, tenant: &str) -> Result<()> {
    let dir = root.join(tenant);
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(TENANT_DIR_MODE))?;
    }
    Ok(())
}

fn list_subdirectory_names(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
    }
    Ok(names)
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn random_component() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A tenant's open temp file. Drop without staging to abandon it; a future
/// recovery pass will find it still sitting in `temp/<tenant>/`.
pub struct File {
    inner: NamedTempFile,
    temp_path: PathBuf,
    file_name: String,
    tenant: String,
}

impl File {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Flushes, closes and renames the underlying temp file into
    /// `staging/<tenant>/<file_name>`, returning the final path.
    pub fn stage(self, store: &FileStore) -> Result<PathBuf> {
        store.ensure_tenant_dirs(&self.tenant)?;
        let dest = store.staging_dir(&self.tenant).join(&self.file_name);
        self.inner.persist(&dest)?;
        Ok(dest)
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Opens a plain [`StdFile`] handle for reading a path already on disk.
/// Used by recovery to read files left behind by a crashed process.
pub fn open_for_read(path: &Path) -> Result<StdFile> {
    Ok(StdFile::open(path)?)
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn new_temp_file_then_stage_moves_into_staging() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.new_temp_file("org~env", 1_700_000_000, "gz").unwrap();
        file.write_all(b"hello").unwrap();
        let file_name = file.file_name().to_owned();
        let staged_path = file.stage(&store).unwrap();

        assert_eq!(staged_path, store.staging_dir("org~env").join(&file_name));
        assert!(!store.temp_dir("org~env").join(&file_name).exists());

        let mut content = Vec::new();
        open_for_read(&staged_path).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    fn file_name_is_sortable_chronologically() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let older = store.new_temp_file("t", 1_000, "gz").unwrap();
        let newer = store.new_temp_file("t", 2_000, "gz").unwrap();

        assert!(older.file_name() < newer.file_name());
    }

    #[test]
    fn ensure_tenant_dirs_creates_both_roots() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.ensure_tenant_dirs("hi~test").unwrap();

        assert!(store.temp_dir("hi~test").is_dir());
        assert!(store.staging_dir("hi~test").is_dir());
    }

    #[test]
    fn list_all_staged_spans_tenants() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store.new_temp_file("a", 1, "gz").unwrap().stage(&store).unwrap();
        store.new_temp_file("b", 2, "gz").unwrap().stage(&store).unwrap();

        let all = store.list_all_staged().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn delete_staged_is_idempotent_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let missing = store.staging_dir("t").join("nope.gz");
        store.delete_staged(&missing).unwrap();
    }

    #[test]
    fn stage_path_moves_a_recovered_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.ensure_tenant_dirs("t").unwrap();
        let temp_path = store.temp_dir("t").join("123-abc.gz");
        std::fs::write(&temp_path, b"data").unwrap();

        let staged = store.stage_path("t", &temp_path).unwrap();
        assert_eq!(staged, store.staging_dir("t").join("123-abc.gz"));
        assert!(!temp_path.exists());
    }
}
