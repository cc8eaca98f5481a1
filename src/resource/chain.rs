use std::collections::HashSet;
use std::sync::Arc;

use crate::core::ArcStr;
use crate::error::{Error, Result};
use crate::resource::{Content, ResourceKey, Resolver, Stamp};

type ResolverPtr = Arc<dyn Resolver>;

/// An ordered, composable list of named resolvers.
///
/// A chain is built from its own local resolvers followed by the chains of
/// its parents, in declared order, so the nearest scope wins. Building a
/// chain never mutates its parents, and parents are shared rather than
/// copied: a [`MemoryResolver`](crate::MemoryResolver) updated through a
/// parent chain is seen by every child.
///
/// # Example
///
/// ```rust
/// use tsumiki::{MemoryResolver, ResolverChain, ResourceKey};
///
/// let platform = ResolverChain::builder()
///     .resolver("platform", MemoryResolver::new("lib").with("std.str", "module std"))
///     .build();
///
/// let compiler = ResolverChain::builder()
///     .resolver("stratego", MemoryResolver::new("str").with("main.str", "module main"))
///     .parent(platform)
///     .build();
///
/// assert!(compiler.resolve(&ResourceKey::new("lib", "std.str")).is_ok());
/// assert_eq!(compiler.names(), vec!["stratego", "platform"]);
/// ```
#[derive(Clone, Default)]
pub struct ResolverChain {
    /// Flattened consultation order, deduplicated by identity.
    flat: Arc<[(ArcStr, ResolverPtr)]>,
}

impl ResolverChain {
    pub fn builder() -> ResolverChainBuilder {
        ResolverChainBuilder::default()
    }

    /// An empty chain which claims nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Composes `locals` on top of `parents`.
    pub fn compose(
        parents: impl IntoIterator<Item = ResolverChain>,
        locals: impl IntoIterator<Item = (ArcStr, ResolverPtr)>,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut flat = Vec::new();

        let parents: Vec<_> = parents.into_iter().collect();
        let inherited = parents.iter().flat_map(|parent| parent.flat.iter().cloned());

        for (name, resolver) in locals.into_iter().chain(inherited) {
            // A resolver reached through two parents is consulted once, at
            // its first position.
            let identity = Arc::as_ptr(&resolver) as *const () as usize;
            if seen.insert(identity) {
                flat.push((name, resolver));
            }
        }

        Self { flat: flat.into() }
    }

    /// Returns the content from the first resolver that claims `key`.
    pub fn resolve(&self, key: &ResourceKey) -> Result<Content> {
        self.try_resolve(key)?
            .ok_or_else(|| Error::UnresolvedResource(key.clone()))
    }

    /// Like [`resolve`](Self::resolve), but an unclaimed key is `Ok(None)`.
    pub fn try_resolve(&self, key: &ResourceKey) -> Result<Option<Content>> {
        for (_, resolver) in self.flat.iter() {
            let content = resolver.resolve(key).map_err(|source| Error::Resource {
                key: key.clone(),
                source,
            })?;

            if content.is_some() {
                return Ok(content);
            }
        }

        Ok(None)
    }

    /// Stamp from the first resolver that claims `key`, or [`Stamp::Missing`].
    pub fn stamp(&self, key: &ResourceKey) -> Result<Stamp> {
        for (_, resolver) in self.flat.iter() {
            let stamp = resolver.stamp(key).map_err(|source| Error::Resource {
                key: key.clone(),
                source,
            })?;

            if let Some(stamp) = stamp {
                return Ok(stamp);
            }
        }

        Ok(Stamp::Missing)
    }

    /// Names of the resolvers in consultation order.
    pub fn names(&self) -> Vec<&str> {
        self.flat.iter().map(|(name, _)| name.as_ref()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.flat.is_empty()
    }
}

impl std::fmt::Debug for ResolverChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResolverChain").field(&self.names()).finish()
    }
}

/// Builder for [`ResolverChain`].
#[derive(Default)]
pub struct ResolverChainBuilder {
    locals: Vec<(ArcStr, ResolverPtr)>,
    parents: Vec<ResolverChain>,
}

impl ResolverChainBuilder {
    /// Adds a local resolver. Locals are consulted in the order they were added.
    pub fn resolver(mut self, name: impl Into<ArcStr>, resolver: impl Resolver + 'static) -> Self {
        self.locals.push((name.into(), Arc::new(resolver)));
        self
    }

    /// Adds an already shared resolver, keeping its identity.
    pub fn shared(mut self, name: impl Into<ArcStr>, resolver: Arc<dyn Resolver>) -> Self {
        self.locals.push((name.into(), resolver));
        self
    }

    /// Adds a parent chain, consulted after all locals and earlier parents.
    pub fn parent(mut self, parent: ResolverChain) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn build(self) -> ResolverChain {
        ResolverChain::compose(self.parents, self.locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryResolver;

    #[test]
    fn test_nearest_scope_wins() {
        let parent = ResolverChain::builder()
            .resolver("parent", MemoryResolver::new("str").with("a.str", "parent"))
            .build();

        let child = ResolverChain::builder()
            .resolver("child", MemoryResolver::new("str").with("a.str", "child"))
            .parent(parent.clone())
            .build();

        let key = ResourceKey::new("str", "a.str");
        assert_eq!(child.resolve(&key).unwrap().to_str().unwrap(), "child");
        assert_eq!(parent.resolve(&key).unwrap().to_str().unwrap(), "parent");
    }

    #[test]
    fn test_falls_back_to_parents_in_order() {
        let sdf3 = ResolverChain::builder()
            .resolver("sdf3", MemoryResolver::new("sdf3").with("start.sdf3", "sdf3"))
            .build();
        let stratego = ResolverChain::builder()
            .resolver("stratego", MemoryResolver::new("str").with("main.str", "str"))
            .build();

        let compiler = ResolverChain::compose([sdf3, stratego], []);

        assert_eq!(compiler.names(), vec!["sdf3", "stratego"]);
        assert!(compiler.resolve(&ResourceKey::new("str", "main.str")).is_ok());
        assert!(compiler.resolve(&ResourceKey::new("sdf3", "start.sdf3")).is_ok());
    }

    #[test]
    fn test_unresolved() {
        let chain = ResolverChain::builder()
            .resolver("memory", MemoryResolver::new("str"))
            .build();

        let key = ResourceKey::new("str", "nope.str");
        assert!(matches!(
            chain.resolve(&key),
            Err(Error::UnresolvedResource(k)) if k == key
        ));
        assert_eq!(chain.try_resolve(&key).unwrap(), None);
        assert_eq!(chain.stamp(&key).unwrap(), Stamp::Missing);
    }

    #[test]
    fn test_diamond_deduplicated() {
        let shared: Arc<dyn Resolver> = Arc::new(MemoryResolver::new("lib"));
        let base = ResolverChain::builder().shared("base", shared).build();

        let left = ResolverChain::builder().parent(base.clone()).build();
        let right = ResolverChain::builder().parent(base).build();
        let top = ResolverChain::compose([left, right], []);

        assert_eq!(top.names(), vec!["base"]);
    }

    #[test]
    fn test_shared_resolver_updates_visible() {
        let memory = Arc::new(MemoryResolver::new("str"));
        let parent = ResolverChain::builder()
            .shared("memory", memory.clone())
            .build();
        let child = ResolverChain::builder().parent(parent).build();

        let key = memory.key("late.str");
        assert_eq!(child.stamp(&key).unwrap(), Stamp::Missing);

        memory.insert("late.str", "now here");
        assert!(matches!(child.stamp(&key).unwrap(), Stamp::Hash(_)));
    }
}
