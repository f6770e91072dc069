// ============================================================
// Layer 6: Atomic File Writes
// ============================================================
// Final artifacts (checkpoints, results files, store manifests)
// are never written in place. The bytes go to a sibling temp
// file first, which is flushed and then renamed over the target.
// A reader therefore sees either the old file or the new one,
// never a half-written mix.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::error::{Result, RunnerError};

/// Sibling path used while `path` is being written.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `path` through a temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
    }

    let tmp = temp_sibling(path);
    {
        let mut f = File::create(&tmp).map_err(|e| RunnerError::io(&tmp, e))?;
        f.write_all(bytes).map_err(|e| RunnerError::io(&tmp, e))?;
        f.sync_all().map_err(|e| RunnerError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| RunnerError::io(path, e))?;

    tracing::debug!("Wrote {} bytes to '{}'", bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn test_temp_sibling_keeps_directory() {
        let p = Path::new("/a/b/model.ckpt");
        assert_eq!(temp_sibling(p), PathBuf::from("/a/b/model.ckpt.tmp"));
    }
}
