//! Oldest-first eviction of staged files, keeping the staging area under its
//! configured limit as new files land.

use file_store::FileStore;

/// Ensures there is room for `incoming` more staged files under
/// `staging_file_limit`, deleting the oldest staged files (by filename, which
/// sorts chronologically) across every tenant if not. Errors deleting an
/// individual file are logged and do not stop eviction of the rest.
pub fn ensure_space(file_store: &FileStore, staging_file_limit: usize, incoming: usize) -> Result<(), file_store::Error> {
    let mut staged = file_store.list_all_staged()?;
    let current = staged.len();
    let need = (current + incoming).saturating_sub(staging_file_limit);
    if need == 0 {
        return Ok(());
    }

    staged.sort_by(|a, b| {
        let a_name = a.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let b_name = b.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        a_name.cmp(b_name)
    });

    for path in staged.into_iter().take(need) {
        if let Err(e) = file_store.delete_staged(&path) {
            tracing::error!(path = %path.display(), error = %e, "failed to evict staged file");
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn evicts_oldest_files_first_when_over_limit() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        for (tenant, secs) in [("a", 1), ("a", 2), ("b", 3)] {
            store.new_temp_file(tenant, secs, "gz").unwrap().stage(&store).unwrap();
        }

        ensure_space(&store, 2, 0).unwrap();

        let remaining = store.list_all_staged().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| {
            let name = p.file_name().unwrap().to_str().unwrap();
            !name.starts_with("1-")
        }));
    }

    #[test]
    fn no_eviction_when_under_limit() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.new_temp_file("a", 1, "gz").unwrap().stage(&store).unwrap();

        ensure_space(&store, 10, 1).unwrap();

        assert_eq!(store.list_all_staged().unwrap().len(), 1);
    }
}
