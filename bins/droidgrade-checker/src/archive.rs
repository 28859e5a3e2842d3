//! Submission archive extraction.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive is not a valid zip container: {0}")]
    Invalid(#[from] zip::result::ZipError),
    #[error("archive entry {0:?} escapes the extraction directory")]
    UnsafePath(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// Whether the failure is the submitter's archive rather than ours.
    pub fn is_validation(&self) -> bool {
        !matches!(self, ArchiveError::Io(_))
    }
}

/// Extract a zip archive, stripping the common leading path prefix first.
///
/// Students zip their project either bare or wrapped in an enclosing
/// folder. The shallowest non-empty file entry decides how many leading
/// segments every entry loses, so `project/app/...` and `app/...` land at
/// identical relative paths.
pub fn extract_normalized(data: &[u8], dest: &Path) -> Result<(), ArchiveError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let mut strip = usize::MAX;
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_file() && entry.size() > 0 {
            strip = strip.min(entry.name().matches('/').count());
        }
    }
    if strip == usize::MAX {
        strip = 0;
    }

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().to_string();
        let Some(relative) = stripped_path(&raw_name, strip)? else {
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out_path)?;
        io::copy(&mut entry, &mut file)?;
    }

    Ok(())
}

fn stripped_path(name: &str, strip: usize) -> Result<Option<PathBuf>, ArchiveError> {
    let mut path = PathBuf::new();
    for segment in name.split('/').skip(strip) {
        match segment {
            "" | "." => continue,
            ".." => return Err(ArchiveError::UnsafePath(name.to_string())),
            segment if segment.contains('\\') || segment.contains(':') => {
                return Err(ArchiveError::UnsafePath(name.to_string()))
            }
            segment => path.push(segment),
        }
    }
    if path.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;
    use zip::write::FileOptions;

    use super::*;

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            if name.ends_with('/') {
                writer
                    .add_directory(name.trim_end_matches('/'), FileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn strips_single_enclosing_folder() {
        let data = zip_bytes(&[
            ("project/", ""),
            ("project/gradlew", "#!/bin/sh\n"),
            ("project/app/src/Main.kt", "fun main() {}\n"),
        ]);

        let dest = TempDir::new().unwrap();
        extract_normalized(&data, dest.path()).unwrap();

        assert!(dest.path().join("gradlew").is_file());
        assert!(dest.path().join("app/src/Main.kt").is_file());
        assert!(!dest.path().join("project").exists());
    }

    #[test]
    fn leaves_bare_archives_alone() {
        let data = zip_bytes(&[
            ("gradlew", "#!/bin/sh\n"),
            ("app/build.gradle", "plugins {}\n"),
        ]);

        let dest = TempDir::new().unwrap();
        extract_normalized(&data, dest.path()).unwrap();

        assert!(dest.path().join("gradlew").is_file());
        assert!(dest.path().join("app/build.gradle").is_file());
    }

    #[test]
    fn strip_depth_follows_the_shallowest_file() {
        // One file sits at depth 1, the rest deeper; only one level goes.
        let data = zip_bytes(&[
            ("wrap/gradlew", "#!/bin/sh\n"),
            ("wrap/app/src/deep/Main.kt", "fun main() {}\n"),
        ]);

        let dest = TempDir::new().unwrap();
        extract_normalized(&data, dest.path()).unwrap();

        assert!(dest.path().join("gradlew").is_file());
        assert!(dest.path().join("app/src/deep/Main.kt").is_file());
    }

    #[test]
    fn rejects_invalid_containers() {
        let dest = TempDir::new().unwrap();
        let err = extract_normalized(b"definitely not a zip", dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Invalid(_)));
        assert!(err.is_validation());
    }

    #[test]
    fn rejects_parent_traversal_entries() {
        let data = zip_bytes(&[("../evil.sh", "rm -rf /\n")]);

        let dest = TempDir::new().unwrap();
        let err = extract_normalized(&data, dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
        assert!(!dest.path().join("../evil.sh").exists());
    }
}
