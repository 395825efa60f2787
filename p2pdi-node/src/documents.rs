//! Where a peer's starting documents come from.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use p2pdi_core::DocumentId;

/// Loads document content by id.
pub trait DocumentSource: Send + Sync {
    /// `Ok(None)` if the source has no such document.
    fn load(&self, id: &str) -> io::Result<Option<String>>;
}

impl DocumentSource for BTreeMap<DocumentId, String> {
    fn load(&self, id: &str) -> io::Result<Option<String>> {
        Ok(self.get(id).cloned())
    }
}

/// Documents stored as files in one directory. A file belongs to id `8451`
/// when its stem is `8451` or `rfc8451` (case-insensitive prefix); the
/// extension is ignored.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every document id present in the directory.
    pub fn ids(&self) -> io::Result<BTreeSet<DocumentId>> {
        Ok(self.scan()?.into_keys().collect())
    }

    fn scan(&self) -> io::Result<BTreeMap<DocumentId, PathBuf>> {
        let mut found = BTreeMap::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if let Some(id) = document_id(&path) {
                found.entry(id).or_insert(path);
            }
        }
        Ok(found)
    }
}

impl DocumentSource for DirectorySource {
    fn load(&self, id: &str) -> io::Result<Option<String>> {
        match self.scan()?.get(id) {
            Some(path) => fs::read_to_string(path).map(Some),
            None => Ok(None),
        }
    }
}

fn document_id(path: &Path) -> Option<DocumentId> {
    let stem = path.file_stem()?.to_str()?;
    let id = match stem.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("rfc") => &stem[3..],
        _ => stem,
    };
    (!id.is_empty()).then(|| id.to_string())
}
