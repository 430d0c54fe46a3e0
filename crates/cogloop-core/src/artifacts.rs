//! Script artifact layout and checksums.
//!
//! Archived artifacts live at
//! `<archive_root>/<task_id>/<basename>_<unix_timestamp>.<ext>`, one file per
//! execution. Ephemeral artifacts are temp files owned by the script runner.

use crate::types::{Id, Interpreter};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// A materialized source file produced for execution or archival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptArtifact {
    pub source: String,
    pub path: PathBuf,
    pub task_id: Option<Id>,
    pub interpreter: Interpreter,
    /// False for ephemeral artifacts, which are gone once execution returns.
    pub persistent: bool,
}

/// Per-task archive directory.
///
/// `None` unless the task id is a single plain path component, so an id can
/// never resolve outside `archive_root`.
pub fn archive_dir(archive_root: &Path, task_id: &Id) -> Option<PathBuf> {
    let id = Path::new(task_id.as_ref());
    let mut components = id.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(archive_root.join(id)),
        _ => None,
    }
}

/// File name for an archived artifact.
///
/// `code.py` at 1700000000 becomes `code_1700000000.py`. A non-zero `collision`
/// counter is appended after the timestamp (`code_1700000000_1.py`) so two
/// archives written within the same second never share a name.
pub fn archive_file_name(file_name: &str, timestamp: i64, collision: u32) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map_or_else(|| "code".to_string(), |s| s.to_string_lossy().to_string());
    let suffix = if collision == 0 {
        format!("{timestamp}")
    } else {
        format!("{timestamp}_{collision}")
    };
    match path.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    }
}

/// SHA256 of an in-memory buffer, hex encoded.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// SHA256 of a file's contents, hex encoded.
pub fn compute_checksum(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn archive_dir_is_per_task() {
        let dir = archive_dir(Path::new("/srv/archive"), &Id::from_string("t-9"));
        assert_eq!(dir, Some(PathBuf::from("/srv/archive/t-9")));
    }

    #[test]
    fn archive_dir_rejects_ids_that_leave_the_root() {
        let root = Path::new("/srv/archive");
        for id in ["../../escaped", "a/b", "/abs", "..", ".", ""] {
            assert_eq!(archive_dir(root, &Id::from_string(id)), None, "{id}");
        }
    }

    #[test]
    fn archive_file_name_inserts_timestamp_before_extension() {
        assert_eq!(archive_file_name("code.py", 1_700_000_000, 0), "code_1700000000.py");
        assert_eq!(archive_file_name("build.sh", 42, 0), "build_42.sh");
        assert_eq!(archive_file_name("Makefile", 42, 0), "Makefile_42");
    }

    #[test]
    fn archive_file_name_appends_collision_counter() {
        assert_eq!(archive_file_name("code.py", 42, 2), "code_42_2.py");
    }

    #[test]
    fn checksum_matches_for_file_and_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.py");
        fs::write(&path, b"print('hi')\n").unwrap();

        let from_file = compute_checksum(&path).unwrap();
        assert_eq!(from_file, checksum_bytes(b"print('hi')\n"));
        assert_eq!(from_file.len(), 64);
    }
}
