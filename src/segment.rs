//! Segment directory layout: naming, preparation, and the id scan.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::frame::FILE_EXTENSION;

pub fn segment_filename(id: u64) -> String {
    format!("{id}.{FILE_EXTENSION}")
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

/// Ensures `path` exists and is a directory, creating it when missing.
pub(crate) fn prepare_dir(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        if path.is_dir() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Config(format!(
            "journal path is not a directory: {}",
            path.display()
        )));
    }
    fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

/// Scans `root` for segment files and returns the inclusive id range, or
/// `None` when the directory holds no segments.
///
/// Only regular files named `<decimal>.journal` count; anything else is
/// ignored. Two spellings of one id (`1` and `01`) and gaps inside the
/// range are both fatal: recovery depends on a dense id sequence.
pub(crate) fn scan_segments(root: &Path) -> Result<Option<(u64, u64)>> {
    let mut ids = BTreeSet::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if stem.is_empty() || !stem.bytes().all(|byte| byte.is_ascii_digit()) {
            continue;
        }
        let Ok(id) = stem.parse::<u64>() else {
            continue;
        };
        if !ids.insert(id) {
            return Err(Error::Config(format!(
                "duplicate segment id {id} in {}",
                root.display()
            )));
        }
    }
    let (Some(&first), Some(&last)) = (ids.first(), ids.last()) else {
        return Ok(None);
    };
    if last - first != ids.len() as u64 - 1 {
        return Err(Error::Config(format!(
            "missing segment id in range [{first}, {last}] in {}",
            root.display()
        )));
    }
    Ok(Some((first, last)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(root: &Path, name: &str) {
        fs::write(root.join(name), b"").expect("touch");
    }

    #[test]
    fn empty_directory_scans_to_none() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(scan_segments(dir.path()).expect("scan"), None);
    }

    #[test]
    fn contiguous_range_is_reported() {
        let dir = tempdir().expect("tempdir");
        for id in 3..=6 {
            touch(dir.path(), &segment_filename(id));
        }
        assert_eq!(scan_segments(dir.path()).expect("scan"), Some((3, 6)));
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "0.journal");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "10.snapshot");
        touch(dir.path(), "abc.journal");
        touch(dir.path(), "1x.journal");
        assert_eq!(scan_segments(dir.path()).expect("scan"), Some((0, 0)));
    }

    #[test]
    fn gap_in_range_is_rejected() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "0.journal");
        touch(dir.path(), "2.journal");
        let err = scan_segments(dir.path()).expect_err("gap");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn duplicate_id_spellings_are_rejected() {
        let dir = tempdir().expect("tempdir");
        touch(dir.path(), "1.journal");
        touch(dir.path(), "01.journal");
        let err = scan_segments(dir.path()).expect_err("duplicate");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn prepare_dir_rejects_files() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("plain");
        fs::write(&file, b"x").expect("write");
        let err = prepare_dir(&file).expect_err("not a directory");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn prepare_dir_creates_missing_directories() {
        let dir = tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        let prepared = prepare_dir(&nested).expect("prepare");
        assert!(prepared.is_dir());
    }
}
