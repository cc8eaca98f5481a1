use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::ArcStr;
use crate::engine::ExecContext;
use crate::error::{Error, Result};
use crate::task::{ErasedTaskDef, FnTask, TaskDef, Typed};

pub(crate) type TaskDefPtr = Arc<dyn ErasedTaskDef>;

/// Maps task kinds to their definitions.
///
/// A registry is filled once at startup and then handed over to an
/// [`EngineBuilder`](crate::EngineBuilder), after which it can no longer
/// change. Registering a kind twice fails with [`Error::DuplicateTaskKind`];
/// conflicts with kinds owned by parent engines are caught when the engine is
/// composed.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    defs: BTreeMap<ArcStr, TaskDefPtr>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed definition.
    pub fn register<D>(&mut self, def: D) -> Result<&mut Self>
    where
        D: TaskDef,
    {
        self.insert(Arc::new(Typed(def)))
    }

    /// Registers a closure under a runtime-chosen kind.
    pub fn register_fn<A, O, F>(&mut self, kind: impl Into<ArcStr>, callback: F) -> Result<&mut Self>
    where
        A: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(&mut ExecContext<'_>, A) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        self.insert(Arc::new(FnTask::new(kind, callback)))
    }

    /// Registers a prepared [`FnTask`], e.g. one with a custom version.
    pub fn register_task<A, O, F>(&mut self, task: FnTask<A, O, F>) -> Result<&mut Self>
    where
        A: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(&mut ExecContext<'_>, A) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        self.insert(Arc::new(task))
    }

    fn insert(&mut self, def: TaskDefPtr) -> Result<&mut Self> {
        let kind: ArcStr = def.kind().into();

        if self.defs.contains_key(&kind) {
            return Err(Error::duplicate(vec![kind.to_string()]));
        }

        self.defs.insert(kind, def);
        Ok(self)
    }

    pub(crate) fn lookup(&self, kind: &str) -> Option<&TaskDefPtr> {
        self.defs.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.defs.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.defs
                    .iter()
                    .map(|(kind, def)| (kind, def.output_type_name())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Square;

    impl TaskDef for Square {
        const KIND: &'static str = "square";
        type Args = u64;
        type Output = u64;

        fn execute(&self, _: &mut ExecContext<'_>, x: u64) -> anyhow::Result<u64> {
            Ok(x * x)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry
            .register(Square)
            .unwrap()
            .register_fn("greet", |_, name: String| Ok(format!("hi {name}")))
            .unwrap();

        assert!(registry.contains("square"));
        assert!(registry.lookup("greet").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["greet", "square"]);
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = TaskRegistry::new();
        registry.register(Square).unwrap();

        let err = registry
            .register_fn("square", |_, x: u64| Ok(x))
            .unwrap_err();

        match err {
            Error::DuplicateTaskKind { kinds } => assert_eq!(kinds, vec!["square"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_versioned_fn_task() {
        let mut registry = TaskRegistry::new();
        registry
            .register_task(
                FnTask::new("double", |_: &mut ExecContext<'_>, x: u64| Ok(x * 2)).version(3),
            )
            .unwrap();

        assert_eq!(registry.lookup("double").unwrap().version(), 3);
    }
}
