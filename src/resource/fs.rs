use std::fs;
use std::io::ErrorKind;
use std::time::UNIX_EPOCH;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::core::{ArcStr, Hash32};
use crate::resource::{Content, ResourceKey, Resolver, Stamp};

/// How an [`FsResolver`] fingerprints files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StampKind {
    /// Modification time and length. Cheap, but touching a file without
    /// changing it counts as a change.
    #[default]
    Modified,
    /// BLAKE3 hash of the content.
    Hash,
}

/// Resolves `qualifier:id` to the file `<root>/<id>`.
///
/// Identifiers are relative paths; identifiers that would escape the root
/// (absolute paths, `..`) are never claimed.
#[derive(Debug, Clone)]
pub struct FsResolver {
    qualifier: ArcStr,
    root: Utf8PathBuf,
    stamping: StampKind,
}

impl FsResolver {
    pub fn new(qualifier: impl Into<ArcStr>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            qualifier: qualifier.into(),
            root: root.into(),
            stamping: StampKind::default(),
        }
    }

    pub fn stamping(mut self, stamping: StampKind) -> Self {
        self.stamping = stamping;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn key(&self, id: impl Into<ArcStr>) -> ResourceKey {
        ResourceKey::new(self.qualifier.clone(), id)
    }

    /// Maps a key to its path on disk, if this resolver claims it.
    pub fn path_of(&self, key: &ResourceKey) -> Option<Utf8PathBuf> {
        if key.qualifier() != &*self.qualifier {
            return None;
        }

        let id = Utf8Path::new(key.id());
        let contained = id
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir));

        if !contained || key.id().is_empty() {
            return None;
        }

        Some(self.root.join(id))
    }
}

impl Resolver for FsResolver {
    fn resolve(&self, key: &ResourceKey) -> std::io::Result<Option<Content>> {
        let Some(path) = self.path_of(key) else {
            return Ok(None);
        };

        // Directories are left to later resolvers.
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes.into())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn stamp(&self, key: &ResourceKey) -> std::io::Result<Option<Stamp>> {
        let Some(path) = self.path_of(key) else {
            return Ok(None);
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let stamp = match self.stamping {
            StampKind::Modified => {
                let nanos = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|since| since.as_nanos())
                    .unwrap_or_default();

                Stamp::Modified {
                    nanos,
                    len: meta.len(),
                }
            }
            StampKind::Hash => Stamp::Hash(Hash32::hash_file(&path)?),
        };

        Ok(Some(stamp))
    }
}
