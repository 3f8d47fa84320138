//! Artifact retention.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// Removes regular files in `dir` older than `max_age`. Returns the number
/// of files deleted. Subdirectories are left untouched.
pub fn purge_artifacts(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    if dir.as_os_str().is_empty() || max_age.is_zero() {
        return Ok(0);
    }
    let cutoff = SystemTime::now() - max_age;
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        if modified > cutoff {
            continue;
        }
        if std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.cost.json");
        let fresh = dir.path().join("fresh.cost.json");
        std::fs::write(&old, b"{}").unwrap();
        std::fs::write(&fresh, b"{}").unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        let file = std::fs::File::open(&old).unwrap();
        file.set_modified(past).unwrap();

        let removed = purge_artifacts(dir.path(), Duration::from_secs(60)).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn zero_age_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let removed = purge_artifacts(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, 0);
    }
}
