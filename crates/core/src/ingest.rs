use crate::error::RagError;
use crate::extractor::is_supported_source;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MAX_DOCUMENT_ID_LEN: usize = 128;

/// Source files under `folder` that an extractor can read, recursively and sorted.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_supported_source(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, RagError> {
    let bytes = fs::read(path)
        .map_err(|error| RagError::Extraction(format!("{}: {error}", path.display())))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Document id derived from the file stem, with characters outside `[A-Za-z0-9_-]`
/// replaced by `_`. Stems with nothing usable fall back to a digest of the path.
pub fn document_id_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();

    let id: String = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_DOCUMENT_ID_LEN)
        .collect();

    if id.chars().any(|ch| ch.is_ascii_alphanumeric()) {
        id
    } else {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{digest_file, discover_documents, document_id_from_path};
    use crate::models::validate_document_id;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn discovery_is_recursive_and_filters_types() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        fs::write(base.join("a.pdf"), b"%PDF-1.4\n%fake")?;
        fs::write(nested.join("b.TXT"), b"plain")?;
        fs::write(base.join("c.docx"), b"ignored")?;

        let files = discover_documents(base);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|file| file.extension().is_some()));
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        assert!(digest_file(&dir.path().join("missing.pdf")).is_err());
        Ok(())
    }

    #[test]
    fn ids_from_paths_are_valid() {
        let cases = [
            ("/books/Database Systems (3rd ed).pdf", "Database_Systems__3rd_ed_"),
            ("/books/42.pdf", "42"),
        ];
        for (path, expected) in cases {
            assert_eq!(document_id_from_path(Path::new(path)), expected);
        }

        let fallback = document_id_from_path(Path::new("/books/...pdf"));
        assert_eq!(fallback.len(), 16);
        assert!(validate_document_id(&fallback).is_ok());
    }
}
