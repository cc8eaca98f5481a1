//! Logical resources and the resolvers that turn them into bytes.
//!
//! Tasks never touch the file system directly. They read through a
//! [`ResolverChain`], which asks its sub-resolvers in order until one of them
//! claims the [`ResourceKey`]. Every read is recorded together with the
//! resource's [`Stamp`], so that a later evaluation can tell whether the task
//! observed something that has since changed.

mod chain;
mod fs;
mod memory;

use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32};

pub use crate::resource::chain::{ResolverChain, ResolverChainBuilder};
pub use crate::resource::fs::{FsResolver, StampKind};
pub use crate::resource::memory::MemoryResolver;

/// A logical resource name: a qualifier selecting the family of resolvers
/// that understand it, and an identifier within that family.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    qualifier: ArcStr,
    id: ArcStr,
}

impl ResourceKey {
    pub fn new(qualifier: impl Into<ArcStr>, id: impl Into<ArcStr>) -> Self {
        Self {
            qualifier: qualifier.into(),
            id: id.into(),
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.qualifier, self.id)
    }
}

impl Debug for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceKey({self})")
    }
}

/// A cheap, comparable summary of a resource's current state.
///
/// Stamps are only ever compared with stamps produced by the same resolver
/// for the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stamp {
    /// No resolver claimed the key.
    Missing,
    /// Content hash.
    Hash(Hash32),
    /// Modification marker: time since the epoch and length in bytes.
    Modified { nanos: u128, len: u64 },
}

/// The bytes of a resolved resource.
#[derive(Clone, PartialEq, Eq)]
pub struct Content(Arc<[u8]>);

impl Content {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0)
    }
}

impl Deref for Content {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Arc<[u8]>> for Content {
    fn from(value: Arc<[u8]>) -> Self {
        Content(value)
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Content(value.into())
    }
}

impl From<&[u8]> for Content {
    fn from(value: &[u8]) -> Self {
        Content(value.into())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content(value.into_bytes().into())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content(value.as_bytes().into())
    }
}

impl Debug for Content {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Content({} bytes)", self.0.len())
    }
}

/// A source of resource content.
///
/// Both methods return `Ok(None)` when the resolver does not claim the key,
/// which lets the surrounding [`ResolverChain`] move on to the next resolver.
/// `Err` is reserved for keys the resolver does claim but failed to read.
pub trait Resolver: Send + Sync {
    fn resolve(&self, key: &ResourceKey) -> std::io::Result<Option<Content>>;

    fn stamp(&self, key: &ResourceKey) -> std::io::Result<Option<Stamp>>;
}

impl<R> Resolver for Arc<R>
where
    R: Resolver + ?Sized,
{
    fn resolve(&self, key: &ResourceKey) -> std::io::Result<Option<Content>> {
        (**self).resolve(key)
    }

    fn stamp(&self, key: &ResourceKey) -> std::io::Result<Option<Stamp>> {
        (**self).stamp(key)
    }
}
