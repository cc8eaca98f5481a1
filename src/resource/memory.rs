use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::core::{ArcStr, Hash32};
use crate::resource::{Content, ResourceKey, Resolver, Stamp};

/// Keeps resources in memory, stamped by content hash.
///
/// Useful for generated inputs and for tests. Changes made through
/// [`insert`](Self::insert) and [`remove`](Self::remove) are visible to every
/// chain the resolver takes part in.
pub struct MemoryResolver {
    qualifier: ArcStr,
    entries: RwLock<BTreeMap<ArcStr, (Content, Hash32)>>,
}

impl MemoryResolver {
    pub fn new(qualifier: impl Into<ArcStr>) -> Self {
        Self {
            qualifier: qualifier.into(),
            entries: RwLock::default(),
        }
    }

    pub fn with(self, id: impl Into<ArcStr>, content: impl Into<Content>) -> Self {
        self.insert(id, content);
        self
    }

    pub fn insert(&self, id: impl Into<ArcStr>, content: impl Into<Content>) {
        let content = content.into();
        let hash = Hash32::hash(content.as_bytes());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(id.into(), (content, hash));
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(id).is_some()
    }

    pub fn key(&self, id: impl Into<ArcStr>) -> ResourceKey {
        ResourceKey::new(self.qualifier.clone(), id)
    }

    fn get(&self, key: &ResourceKey) -> Option<(Content, Hash32)> {
        if key.qualifier() != &*self.qualifier {
            return None;
        }

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key.id()).cloned()
    }
}

impl Resolver for MemoryResolver {
    fn resolve(&self, key: &ResourceKey) -> std::io::Result<Option<Content>> {
        Ok(self.get(key).map(|(content, _)| content))
    }

    fn stamp(&self, key: &ResourceKey) -> std::io::Result<Option<Stamp>> {
        Ok(self.get(key).map(|(_, hash)| Stamp::Hash(hash)))
    }
}
